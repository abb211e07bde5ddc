//! The bridge controller.
//!
//! Composes config, relays, and the Discord session into one unit with an
//! explicit lifecycle: construct, `start`, optionally `reload`, `shutdown`.
//! The controller owns the single live session and the shared config
//! snapshot; both are replaced, never mutated.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{Config, SharedConfig};
use crate::error::{Error, Result};
use crate::http::{DiscordHttpClient, SharedHttp};
use crate::proxy::{EventDispatcher, EventKind, ProxyApi, ProxyEvent};
use crate::relay::{self, outbound_queue, BotIdentity, InboundRelay, OutboundRelay, OutboundReceiver};
use crate::session::{Connector, DiscordConnector, Session};

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

pub struct Bridge {
    config_path: PathBuf,
    config: SharedConfig,
    proxy: Arc<dyn ProxyApi>,
    outbound: OutboundRelay,
    http: SharedHttp,
    connector: Arc<dyn Connector>,
    /// At most one live session. The lock is held across a stop/connect
    /// pair so a reload can never observe two sessions.
    session: Mutex<Option<Box<dyn Session>>>,
    stopped: AtomicBool,
}

impl Bridge {
    /// Load config from `config_path` and assemble the bridge.
    ///
    /// Fails with a config error when the file is missing/invalid — fatal
    /// at startup, so no session is ever created from a bad config. Must be
    /// called within a tokio runtime (the delivery task is spawned here).
    pub fn new(config_path: PathBuf, proxy: Arc<dyn ProxyApi>) -> Result<Self> {
        let (bridge, rx) = Self::assemble(config_path, proxy, |inbound, identity, http| {
            Arc::new(DiscordConnector::new(inbound, identity, http))
        })?;
        tokio::spawn(relay::deliver(rx, bridge.http.clone()));
        Ok(bridge)
    }

    fn assemble<F>(
        config_path: PathBuf,
        proxy: Arc<dyn ProxyApi>,
        make_connector: F,
    ) -> Result<(Self, OutboundReceiver)>
    where
        F: FnOnce(InboundRelay, BotIdentity, SharedHttp) -> Arc<dyn Connector>,
    {
        let config = Config::load(&config_path)?;
        let shared = SharedConfig::new(config);

        let identity = BotIdentity::new();
        let http = SharedHttp::new(DiscordHttpClient::new(&shared.snapshot().token));
        let (tx, rx) = outbound_queue();

        let outbound = OutboundRelay::new(shared.clone(), Arc::clone(&proxy), tx);
        let inbound = InboundRelay::new(
            shared.clone(),
            Arc::clone(&proxy),
            identity.clone(),
            outbound.clone(),
        );
        let connector = make_connector(inbound, identity, http.clone());

        let bridge = Self {
            config_path,
            config: shared,
            proxy,
            outbound,
            http,
            connector,
            session: Mutex::new(None),
            stopped: AtomicBool::new(false),
        };
        Ok((bridge, rx))
    }

    /// Current config snapshot.
    pub fn config(&self) -> Arc<Config> {
        self.config.snapshot()
    }

    /// Register the bridge's handlers on the host's event dispatcher.
    ///
    /// If the host advertises an alternate presence source, an extra
    /// join/leave listener is registered there. The two sources are
    /// expected to be mutually exclusive in any single deployment.
    pub fn attach(&self, dispatcher: &mut EventDispatcher) {
        let relay = self.outbound.clone();
        dispatcher.subscribe(
            EventKind::Chat,
            Box::new(move |event| {
                if let ProxyEvent::Chat { player, text } = event {
                    relay.on_chat(player, text);
                }
            }),
        );

        let relay = self.outbound.clone();
        dispatcher.subscribe(
            EventKind::Join,
            Box::new(move |event| {
                if let ProxyEvent::Join { player } = event {
                    relay.on_join(player);
                }
            }),
        );

        let relay = self.outbound.clone();
        dispatcher.subscribe(
            EventKind::Leave,
            Box::new(move |event| {
                if let ProxyEvent::Leave { player } = event {
                    relay.on_leave(player);
                }
            }),
        );

        if let Some(alt) = self.proxy.alt_presence_source() {
            info!("alternate presence source detected, registering bridge listener");
            let relay = self.outbound.clone();
            alt.register(Box::new(move |event| match event {
                ProxyEvent::Join { player } => relay.on_join(player),
                ProxyEvent::Leave { player } => relay.on_leave(player),
                ProxyEvent::Chat { .. } => {}
            }));
        }
    }

    /// Open the Discord session. An existing session is stopped first, so
    /// the one-live-session invariant holds across restarts. Fails once the
    /// bridge has been shut down: shutdown is final, a reload must not
    /// resurrect a session.
    pub async fn start(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Connection("bridge is shut down".into()));
        }
        if let Some(old) = guard.take() {
            old.stop().await;
        }
        let session = self.connector.connect(self.config.snapshot()).await?;
        *guard = Some(session);
        Ok(())
    }

    /// Re-read the config file. Returns `false` (keeping the previous
    /// config) when loading fails. The session is restarted only when the
    /// token changed; channel and template changes apply on the next event.
    pub async fn reload(&self) -> bool {
        info!("reloading config");

        let new = match Config::load(&self.config_path) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "config reload failed, keeping previous config");
                return false;
            }
        };

        let restart = new.requires_restart(&self.config.snapshot());
        self.config.store(new);

        if restart {
            info!("bot login details changed, restarting the session");
            if let Err(e) = self.start().await {
                warn!(error = %e, "failed to restart session after reload");
            }
        }

        info!("config reloaded");
        true
    }

    /// Disconnect and stop. Idempotent: only the first call performs the
    /// disconnect; calling with no live session is a no-op.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down bridge");
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.stop().await;
        }
        info!("bridge stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
