//! The two relay directions.
//!
//! [`OutboundRelay`] turns proxy events into Discord messages;
//! [`InboundRelay`] turns Discord messages into proxy chat broadcasts.
//!
//! Outbound sends are fire-and-forget: handlers run synchronously on the
//! host's dispatch thread and only enqueue onto an unbounded channel. A
//! delivery task owned by the session drains the queue and performs the
//! actual HTTP calls, logging and dropping failures. No relay error ever
//! reaches the host dispatcher.

use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::SharedConfig;
use crate::http::SharedHttp;
use crate::proxy::ProxyApi;
use crate::types::Message;

// ---------------------------------------------------------------------------
// Outbound queue
// ---------------------------------------------------------------------------

/// One formatted message awaiting delivery to Discord.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub channel_id: String,
    pub content: String,
}

pub type OutboundSender = mpsc::UnboundedSender<OutboundMessage>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<OutboundMessage>;

pub fn outbound_queue() -> (OutboundSender, OutboundReceiver) {
    mpsc::unbounded_channel()
}

/// Drain the outbound queue, delivering each message over REST.
///
/// Delivery failures are logged and swallowed — the event is dropped, no
/// retry beyond what the HTTP client does internally for 429s. Runs until
/// every sender is gone. The client is re-read per message so a credential
/// change on reload takes effect immediately.
pub async fn deliver(mut rx: OutboundReceiver, http: SharedHttp) {
    while let Some(msg) = rx.recv().await {
        let client = http.get();
        match client.send_message(&msg.channel_id, &msg.content).await {
            Ok(_) => debug!(channel = %msg.channel_id, "relayed message to Discord"),
            Err(e) => warn!(channel = %msg.channel_id, error = %e, "failed to send to Discord"),
        }
    }
    debug!("outbound queue closed, delivery task ending");
}

// ---------------------------------------------------------------------------
// Bot identity (for echo prevention)
// ---------------------------------------------------------------------------

/// The bot's own user id, learned from the READY event.
///
/// Written once per session by the session loop, read on every inbound
/// message.
#[derive(Clone, Default)]
pub struct BotIdentity(Arc<RwLock<Option<String>>>);

impl BotIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, user_id: String) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = Some(user_id);
    }

    pub fn is_self(&self, user_id: &str) -> bool {
        self.0
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_deref()
            == Some(user_id)
    }
}

// ---------------------------------------------------------------------------
// Outbound relay (proxy → Discord)
// ---------------------------------------------------------------------------

/// Forwards proxy events to the configured Discord channel.
///
/// Every handler performs exactly one enqueue per invocation. Handlers are
/// synchronous and cheap — safe to call from the host's dispatch thread.
#[derive(Clone)]
pub struct OutboundRelay {
    config: SharedConfig,
    proxy: Arc<dyn ProxyApi>,
    tx: OutboundSender,
}

impl OutboundRelay {
    pub fn new(config: SharedConfig, proxy: Arc<dyn ProxyApi>, tx: OutboundSender) -> Self {
        Self { config, proxy, tx }
    }

    pub fn on_chat(&self, player: &str, text: &str) {
        let cfg = self.config.snapshot();
        let content = cfg.templates.render_chat(player, text);
        self.enqueue(cfg.channel.clone(), content);
    }

    pub fn on_join(&self, player: &str) {
        let cfg = self.config.snapshot();
        let content = cfg.templates.render_join(player);
        self.enqueue(cfg.channel.clone(), content);
    }

    pub fn on_leave(&self, player: &str) {
        let cfg = self.config.snapshot();
        let content = cfg.templates.render_leave(player);
        self.enqueue(cfg.channel.clone(), content);
    }

    /// Answer a playerlist request in the channel it came from.
    pub fn on_playerlist(&self, requester_channel: &str) {
        let cfg = self.config.snapshot();
        let players = self.proxy.online_players();
        let content = cfg.templates.render_playerlist(&players);
        self.enqueue(requester_channel.to_string(), content);
    }

    fn enqueue(&self, channel_id: String, content: String) {
        let msg = OutboundMessage {
            channel_id,
            content,
        };
        if self.tx.send(msg).is_err() {
            // Delivery task gone — session is down. Event is dropped.
            warn!("outbound queue closed, dropping relay message");
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound relay (Discord → proxy)
// ---------------------------------------------------------------------------

/// Forwards Discord messages into proxy chat.
#[derive(Clone)]
pub struct InboundRelay {
    config: SharedConfig,
    proxy: Arc<dyn ProxyApi>,
    identity: BotIdentity,
    outbound: OutboundRelay,
}

impl InboundRelay {
    pub fn new(
        config: SharedConfig,
        proxy: Arc<dyn ProxyApi>,
        identity: BotIdentity,
        outbound: OutboundRelay,
    ) -> Self {
        Self {
            config,
            proxy,
            identity,
            outbound,
        }
    }

    /// Handle a MESSAGE_CREATE from the gateway.
    ///
    /// Messages outside the bridged channel and the bot's own messages are
    /// ignored (the latter prevents echo loops). The configured command
    /// prefix triggers the playerlist reply instead of a broadcast.
    pub fn on_message(&self, msg: &Message) {
        let cfg = self.config.snapshot();

        if msg.channel_id != cfg.channel {
            return;
        }
        if self.identity.is_self(&msg.author.id) {
            return;
        }

        if msg.content.trim() == cfg.command_prefix {
            self.outbound.on_playerlist(&msg.channel_id);
            return;
        }

        // Strip chat formatting codes so Discord users can't inject colour
        // or style codes into proxy chat.
        let body = sanitize_chat_codes(&msg.content);
        if body.trim().is_empty() {
            // Attachment-only or formatting-only message — nothing to relay.
            return;
        }

        let line = cfg
            .templates
            .render_discord_chat(msg.author.display_name(), &body);
        self.proxy.broadcast(&line);
    }
}

// ---------------------------------------------------------------------------
// Sanitisation
// ---------------------------------------------------------------------------

/// Remove Minecraft chat formatting sequences from `text`.
///
/// Both the section-sign form (`§c`, `§l`, `§x`) and the ampersand form
/// (`&c`, `&l`) are stripped when followed by a valid formatting character.
/// A lone `&` (e.g. "fish & chips") is left alone.
pub fn sanitize_chat_codes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\u{a7}' || c == '&' {
            let followed_by_code = chars
                .peek()
                .map(|&next| is_format_code(next))
                .unwrap_or(false);
            if followed_by_code {
                chars.next();
                continue;
            }
            if c == '\u{a7}' {
                // A bare section sign has no business in chat either.
                continue;
            }
        }
        out.push(c);
    }

    out
}

fn is_format_code(c: char) -> bool {
    matches!(c,
        '0'..='9' | 'a'..='f' | 'A'..='F' | 'k'..='o' | 'K'..='O' | 'r' | 'R' | 'x' | 'X')
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::User;
    use std::sync::Mutex;

    // -- Test doubles ------------------------------------------------------

    #[derive(Default)]
    struct FakeProxy {
        players: Vec<String>,
        broadcasts: Mutex<Vec<String>>,
    }

    impl FakeProxy {
        fn with_players(players: &[&str]) -> Self {
            Self {
                players: players.iter().map(|s| s.to_string()).collect(),
                broadcasts: Mutex::new(Vec::new()),
            }
        }

        fn broadcasts(&self) -> Vec<String> {
            self.broadcasts.lock().unwrap().clone()
        }
    }

    impl ProxyApi for FakeProxy {
        fn broadcast(&self, message: &str) {
            self.broadcasts.lock().unwrap().push(message.to_string());
        }

        fn online_players(&self) -> Vec<String> {
            self.players.clone()
        }
    }

    fn test_config() -> SharedConfig {
        SharedConfig::new(
            Config::from_str("token: \"tok\"\nchannel: \"100\"\n").unwrap(),
        )
    }

    fn setup() -> (
        OutboundRelay,
        InboundRelay,
        Arc<FakeProxy>,
        OutboundReceiver,
        BotIdentity,
    ) {
        setup_with_players(&[])
    }

    fn setup_with_players(
        players: &[&str],
    ) -> (
        OutboundRelay,
        InboundRelay,
        Arc<FakeProxy>,
        OutboundReceiver,
        BotIdentity,
    ) {
        let config = test_config();
        let proxy = Arc::new(FakeProxy::with_players(players));
        let (tx, rx) = outbound_queue();
        let identity = BotIdentity::new();
        identity.set("900".to_string());

        let outbound = OutboundRelay::new(
            config.clone(),
            proxy.clone() as Arc<dyn ProxyApi>,
            tx,
        );
        let inbound = InboundRelay::new(
            config,
            proxy.clone() as Arc<dyn ProxyApi>,
            identity.clone(),
            outbound.clone(),
        );
        (outbound, inbound, proxy, rx, identity)
    }

    fn discord_message(channel_id: &str, author_id: &str, content: &str) -> Message {
        Message {
            id: "1".into(),
            channel_id: channel_id.into(),
            author: User {
                id: author_id.into(),
                username: "dave".into(),
                bot: false,
                global_name: Some("Dave".into()),
            },
            content: content.into(),
        }
    }

    // -- Outbound ----------------------------------------------------------

    #[test]
    fn chat_event_enqueues_exactly_one_send() {
        let (outbound, _, _, mut rx, _) = setup();
        outbound.on_chat("Alice", "hello world");

        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.channel_id, "100");
        assert!(msg.content.contains("Alice"));
        assert!(msg.content.contains("hello world"));
        assert!(rx.try_recv().is_err(), "expected exactly one send");
    }

    #[test]
    fn join_and_leave_use_their_templates() {
        let (outbound, _, _, mut rx, _) = setup();
        outbound.on_join("Bob");
        outbound.on_leave("Bob");

        assert_eq!(rx.try_recv().unwrap().content, "**Bob** joined the network");
        assert_eq!(rx.try_recv().unwrap().content, "**Bob** left the network");
    }

    #[test]
    fn playerlist_with_players_is_arrival_ordered() {
        let (outbound, _, _, mut rx, _) = setup_with_players(&["Alice", "Bob"]);
        outbound.on_playerlist("777");

        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.channel_id, "777", "reply goes to the requester channel");
        assert_eq!(msg.content, "**Online (2):** Alice, Bob");
    }

    #[test]
    fn playerlist_with_no_players_uses_empty_template() {
        let (outbound, _, _, mut rx, _) = setup();
        outbound.on_playerlist("777");
        assert_eq!(
            rx.try_recv().unwrap().content,
            "No players are currently online."
        );
    }

    #[test]
    fn enqueue_after_queue_closed_is_swallowed() {
        let (outbound, _, _, rx, _) = setup();
        drop(rx);
        // Must not panic or propagate.
        outbound.on_chat("Alice", "into the void");
    }

    // -- Inbound -----------------------------------------------------------

    #[test]
    fn inbound_message_broadcasts_with_template() {
        let (_, inbound, proxy, _rx, _) = setup();
        inbound.on_message(&discord_message("100", "42", "hi folks"));

        let broadcasts = proxy.broadcasts();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0], "&7[&bDiscord&7] &fDave&7: &fhi folks");
    }

    #[test]
    fn own_messages_never_echo() {
        let (_, inbound, proxy, _rx, _) = setup();
        // Author id 900 is the bot itself (see setup).
        inbound.on_message(&discord_message("100", "900", "relayed line"));
        assert!(proxy.broadcasts().is_empty());
    }

    #[test]
    fn wrong_channel_is_ignored() {
        let (_, inbound, proxy, _rx, _) = setup();
        inbound.on_message(&discord_message("200", "42", "other channel"));
        assert!(proxy.broadcasts().is_empty());
    }

    #[test]
    fn command_prefix_triggers_playerlist_not_broadcast() {
        let (_, inbound, proxy, mut rx, _) = setup_with_players(&["Alice"]);
        inbound.on_message(&discord_message("100", "42", "!playerlist"));

        assert!(proxy.broadcasts().is_empty());
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.channel_id, "100");
        assert_eq!(reply.content, "**Online (1):** Alice");
    }

    #[test]
    fn formatting_codes_are_stripped_before_broadcast() {
        let (_, inbound, proxy, _rx, _) = setup();
        inbound.on_message(&discord_message("100", "42", "&4&lred §kstuff"));

        let broadcasts = proxy.broadcasts();
        assert_eq!(broadcasts.len(), 1);
        assert!(broadcasts[0].ends_with("&fred stuff"));
    }

    #[test]
    fn formatting_only_message_is_dropped() {
        let (_, inbound, proxy, _rx, _) = setup();
        inbound.on_message(&discord_message("100", "42", "§c§l"));
        assert!(proxy.broadcasts().is_empty());
    }

    #[test]
    fn identity_unset_never_matches() {
        let identity = BotIdentity::new();
        assert!(!identity.is_self("900"));
    }

    // -- Sanitiser ---------------------------------------------------------

    #[test]
    fn sanitize_strips_section_codes() {
        assert_eq!(sanitize_chat_codes("§chello§r"), "hello");
    }

    #[test]
    fn sanitize_strips_ampersand_codes() {
        assert_eq!(sanitize_chat_codes("&bhello &oworld"), "hello world");
    }

    #[test]
    fn sanitize_keeps_plain_ampersands() {
        assert_eq!(sanitize_chat_codes("fish & chips"), "fish & chips");
        assert_eq!(sanitize_chat_codes("tom&jerry"), "tom&jerry");
    }

    #[test]
    fn sanitize_drops_bare_section_sign() {
        assert_eq!(sanitize_chat_codes("weird§"), "weird");
        assert_eq!(sanitize_chat_codes("a§zb"), "azb");
    }

    #[test]
    fn sanitize_passes_clean_text_through() {
        assert_eq!(sanitize_chat_codes("perfectly normal"), "perfectly normal");
    }
}
