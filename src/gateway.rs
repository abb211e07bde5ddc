//! Gateway (WebSocket) transport for the Discord API.
//!
//! This module owns the WebSocket connection lifecycle:
//!   - connect → receive HELLO → send IDENTIFY
//!   - background heartbeat task
//!   - sequence number + session_id tracking
//!   - automatic reconnect + RESUME on connection loss
//!   - gateway send rate limiting (120 events / 60s)
//!
//! Connection loss never surfaces as a terminal state: the driver moves to
//! [`ConnectionState::Reconnecting`] and resumes (or re-identifies) on its
//! own. The only paths to [`ConnectionState::Disconnected`] are an explicit
//! [`GatewayHandle::close`], a fatal close code (bad token, bad intents), or
//! the consumer dropping its event receiver.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::events::GatewayEvent;
use crate::types::GatewayPayload;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

/// Discord allows at most 120 gateway sends per 60 seconds.
const SEND_BUDGET_MAX: usize = 120;
const SEND_BUDGET_WINDOW: Duration = Duration::from_secs(60);

/// Gateway intents: GUILDS(1) | GUILD_MESSAGES(512) | MESSAGE_CONTENT(32768).
///
/// MESSAGE_CONTENT is required — without it inbound message bodies arrive
/// empty and the relay has nothing to forward.
pub const INTENTS: u32 = 1 | 512 | 32768;

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

/// Observable lifecycle state of the gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Gateway send rate limiter
// ---------------------------------------------------------------------------

/// Sliding-window rate limiter for outbound gateway messages.
struct SendRateLimiter {
    timestamps: VecDeque<Instant>,
    budget: usize,
    window: Duration,
}

impl SendRateLimiter {
    fn new(budget: usize, window: Duration) -> Self {
        Self {
            timestamps: VecDeque::with_capacity(budget),
            budget,
            window,
        }
    }

    /// How long the caller should wait before sending, or `None` if it can
    /// send immediately. Does not record the send — call [`record`] after
    /// actually sending.
    fn delay(&mut self) -> Option<Duration> {
        let now = Instant::now();
        while let Some(&oldest) = self.timestamps.front() {
            if now.duration_since(oldest) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }

        if self.timestamps.len() < self.budget {
            return None;
        }

        self.timestamps
            .front()
            .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
    }

    fn record(&mut self) {
        self.timestamps.push_back(Instant::now());
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Options for connecting to the Discord gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub token: String,
    /// Gateway intents bitmask.
    pub intents: u32,
}

// ---------------------------------------------------------------------------
// Internal session state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct SessionState {
    /// From the READY event.
    session_id: Option<String>,
    /// Resume URL provided by Discord in the READY event.
    resume_gateway_url: Option<String>,
    /// Monotonically increasing sequence counter.
    sequence: Option<u64>,
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    tokio_tungstenite::tungstenite::Message,
>;

type WsStream = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Handle to a running gateway driver.
pub struct GatewayHandle {
    /// Receive typed events.
    pub events: mpsc::Receiver<GatewayEvent>,
    /// Observe connection state transitions.
    pub state: watch::Receiver<ConnectionState>,
    close_tx: mpsc::Sender<()>,
    driver_handle: tokio::task::JoinHandle<()>,
}

impl GatewayHandle {
    /// Ask the driver to close the connection and stop.
    ///
    /// Safe to call more than once; waits for the driver task to finish so
    /// the Close frame has a chance to go out before process exit.
    pub async fn close(&mut self) {
        let _ = self.close_tx.send(()).await;
        // The driver may already be gone - either way the session is down.
        if let Err(e) = (&mut self.driver_handle).await {
            if !e.is_cancelled() {
                warn!(error = %e, "gateway driver task ended abnormally");
            }
        }
    }
}

/// Connect to the Discord gateway, returning a [`GatewayHandle`].
///
/// Spawns a background driver that owns the WebSocket, heartbeats at the
/// interval Discord dictates, and reconnects with RESUME after drops.
pub async fn connect(config: GatewayConfig) -> Result<GatewayHandle, Error> {
    if config.token.trim().is_empty() {
        return Err(Error::Connection("empty token".into()));
    }

    let (event_tx, event_rx) = mpsc::channel::<GatewayEvent>(256);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
    let (close_tx, close_rx) = mpsc::channel::<()>(1);

    let driver_handle = tokio::spawn(gateway_driver(config, event_tx, state_tx, close_rx));

    Ok(GatewayHandle {
        events: event_rx,
        state: state_rx,
        close_tx,
        driver_handle,
    })
}

// ---------------------------------------------------------------------------
// The main driver loop (runs in a spawned task)
// ---------------------------------------------------------------------------

async fn gateway_driver(
    config: GatewayConfig,
    event_tx: mpsc::Sender<GatewayEvent>,
    state_tx: watch::Sender<ConnectionState>,
    mut close_rx: mpsc::Receiver<()>,
) {
    let mut session = SessionState::default();
    let mut reconnect_attempts: u32 = 0;

    loop {
        let url = session
            .resume_gateway_url
            .clone()
            .map(|u| {
                if u.contains("v=10") {
                    u
                } else if u.contains('?') {
                    format!("{}&v=10&encoding=json", u)
                } else {
                    format!("{}?v=10&encoding=json", u)
                }
            })
            .unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string());

        info!(url = %url, "connecting to Discord gateway");

        let connect_result = tokio::select! {
            r = tokio_tungstenite::connect_async(&url) => r,
            _ = close_rx.recv() => {
                info!("close requested during connect");
                let _ = state_tx.send(ConnectionState::Disconnected);
                return;
            }
        };

        let ws_stream = match connect_result {
            Ok((stream, _)) => stream,
            Err(e) => {
                error!(error = %e, "failed to connect to gateway");
                let _ = state_tx.send(ConnectionState::Reconnecting);
                reconnect_attempts += 1;
                if wait_backoff(reconnect_attempts, &mut close_rx).await {
                    let _ = state_tx.send(ConnectionState::Disconnected);
                    return;
                }
                continue;
            }
        };

        let (ws_write, mut ws_read) = ws_stream.split();
        let ws_write = Arc::new(Mutex::new(ws_write));
        let rate_limiter = Arc::new(Mutex::new(SendRateLimiter::new(
            SEND_BUDGET_MAX,
            SEND_BUDGET_WINDOW,
        )));

        // 1. Read HELLO and extract heartbeat_interval.
        let heartbeat_interval = match read_hello(&mut ws_read).await {
            Ok(interval) => interval,
            Err(e) => {
                error!(error = %e, "failed to read HELLO from gateway");
                let _ = state_tx.send(ConnectionState::Reconnecting);
                reconnect_attempts += 1;
                if wait_backoff(reconnect_attempts, &mut close_rx).await {
                    let _ = state_tx.send(ConnectionState::Disconnected);
                    return;
                }
                continue;
            }
        };

        debug!(interval_ms = heartbeat_interval, "received HELLO");

        // 2. Send IDENTIFY or RESUME.
        let handshake = if let (Some(session_id), Some(seq)) =
            (session.session_id.as_ref(), session.sequence)
        {
            info!(session_id = %session_id, seq, "resuming gateway session");
            json!({
                "op": 6,
                "d": {
                    "token": config.token,
                    "session_id": session_id,
                    "seq": seq,
                }
            })
        } else {
            json!({
                "op": 2,
                "d": {
                    "token": config.token,
                    "properties": {
                        "os": std::env::consts::OS,
                        "browser": "chatlink",
                        "device": "chatlink"
                    },
                    "intents": config.intents,
                }
            })
        };

        if let Err(e) = rate_limited_send(&ws_write, &rate_limiter, &handshake).await {
            error!(error = %e, "failed to send gateway handshake");
            let _ = state_tx.send(ConnectionState::Reconnecting);
            reconnect_attempts += 1;
            if wait_backoff(reconnect_attempts, &mut close_rx).await {
                let _ = state_tx.send(ConnectionState::Disconnected);
                return;
            }
            continue;
        }

        let _ = state_tx.send(ConnectionState::Connected);
        info!("connected to Discord");
        // Handshake went through: future drops start the backoff curve over.
        reconnect_attempts = 0;

        // 3. Spawn heartbeat task.
        let hb_write = Arc::clone(&ws_write);
        let hb_rate_limiter = Arc::clone(&rate_limiter);
        let (seq_tx, seq_rx) = watch::channel(session.sequence);
        let heartbeat_handle =
            tokio::spawn(heartbeat_loop(heartbeat_interval, hb_write, hb_rate_limiter, seq_rx));

        // 4. Main read loop.
        let reason = read_loop(
            &mut ws_read,
            &ws_write,
            &rate_limiter,
            &event_tx,
            &mut session,
            &seq_tx,
            &mut close_rx,
        )
        .await;

        // 5. Cleanup: stop heartbeating, close the socket.
        heartbeat_handle.abort();
        {
            let mut w = ws_write.lock().await;
            let _ = w
                .send(tokio_tungstenite::tungstenite::Message::Close(None))
                .await;
        }

        match reason {
            DisconnectReason::ShouldResume => {
                warn!("connection to Discord lost, will resume");
                let _ = state_tx.send(ConnectionState::Reconnecting);
            }
            DisconnectReason::ShouldReidentify => {
                warn!("session invalidated, will re-identify");
                session.session_id = None;
                session.sequence = None;
                let _ = state_tx.send(ConnectionState::Reconnecting);
            }
            DisconnectReason::Fatal => {
                error!("fatal gateway error, shutting down driver");
                let _ = state_tx.send(ConnectionState::Disconnected);
                return;
            }
            DisconnectReason::Closed => {
                info!("gateway closed on request");
                let _ = state_tx.send(ConnectionState::Disconnected);
                return;
            }
        }

        reconnect_attempts += 1;
        if wait_backoff(reconnect_attempts, &mut close_rx).await {
            let _ = state_tx.send(ConnectionState::Disconnected);
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Disconnect reason
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum DisconnectReason {
    ShouldResume,
    ShouldReidentify,
    Fatal,
    /// Explicit close request, or the consumer dropped its event receiver.
    Closed,
}

// ---------------------------------------------------------------------------
// Heartbeat task
// ---------------------------------------------------------------------------

async fn heartbeat_loop(
    interval_ms: u64,
    ws_write: Arc<Mutex<WsSink>>,
    rate_limiter: Arc<Mutex<SendRateLimiter>>,
    seq_rx: watch::Receiver<Option<u64>>,
) {
    // First heartbeat after `interval * jitter`, jitter in [0, 1).
    let jitter = rand::random::<f64>();
    tokio::time::sleep(Duration::from_millis((interval_ms as f64 * jitter) as u64)).await;

    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
    loop {
        interval.tick().await;
        let seq = *seq_rx.borrow();
        let heartbeat = json!({"op": 1, "d": seq});
        if let Err(e) = rate_limited_send(&ws_write, &rate_limiter, &heartbeat).await {
            warn!(error = %e, "heartbeat send failed, stopping heartbeat task");
            return;
        }
        debug!(?seq, "sent heartbeat");
    }
}

// ---------------------------------------------------------------------------
// Read loop
// ---------------------------------------------------------------------------

async fn read_loop(
    ws_read: &mut WsStream,
    ws_write: &Arc<Mutex<WsSink>>,
    rate_limiter: &Arc<Mutex<SendRateLimiter>>,
    event_tx: &mpsc::Sender<GatewayEvent>,
    session: &mut SessionState,
    seq_tx: &watch::Sender<Option<u64>>,
    close_rx: &mut mpsc::Receiver<()>,
) -> DisconnectReason {
    loop {
        let msg = tokio::select! {
            biased;

            _ = close_rx.recv() => return DisconnectReason::Closed,

            msg = ws_read.next() => match msg {
                Some(Ok(m)) => m,
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket read error");
                    return DisconnectReason::ShouldResume;
                }
                None => {
                    info!("WebSocket stream ended");
                    return DisconnectReason::ShouldResume;
                }
            },
        };

        match msg {
            tokio_tungstenite::tungstenite::Message::Text(text) => {
                let payload: GatewayPayload = match serde_json::from_str(&text) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "failed to parse gateway payload");
                        continue;
                    }
                };

                if let Some(s) = payload.s {
                    session.sequence = Some(s);
                    let _ = seq_tx.send(Some(s));
                }

                let event = GatewayEvent::from_payload(payload);

                match &event {
                    GatewayEvent::Ready(ready) => {
                        session.session_id = Some(ready.session_id.clone());
                        session.resume_gateway_url = Some(ready.resume_gateway_url.clone());
                        info!(
                            session_id = %ready.session_id,
                            user = %ready.user.username,
                            "gateway READY"
                        );
                    }

                    GatewayEvent::Resumed => {
                        info!("gateway session resumed");
                    }

                    GatewayEvent::HeartbeatRequest => {
                        let heartbeat = json!({"op": 1, "d": session.sequence});
                        if let Err(e) =
                            rate_limited_send(ws_write, rate_limiter, &heartbeat).await
                        {
                            warn!(error = %e, "failed to send requested heartbeat");
                        }
                        // Internal plumbing, not forwarded.
                        continue;
                    }

                    GatewayEvent::HeartbeatAck => {
                        debug!("heartbeat acknowledged");
                        continue;
                    }

                    GatewayEvent::Reconnect => {
                        info!("gateway requested reconnect (op 7)");
                        return DisconnectReason::ShouldResume;
                    }

                    GatewayEvent::InvalidSession(resumable) => {
                        warn!(resumable, "session invalidated (op 9)");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        return if *resumable {
                            DisconnectReason::ShouldResume
                        } else {
                            DisconnectReason::ShouldReidentify
                        };
                    }

                    _ => {}
                }

                if event_tx.send(event).await.is_err() {
                    info!("event channel closed by consumer");
                    return DisconnectReason::Closed;
                }
            }

            tokio_tungstenite::tungstenite::Message::Close(frame) => {
                let code: Option<u16> = frame.as_ref().map(|f| f.code.into());
                warn!(close_code = ?code, "WebSocket closed by server");
                return match code {
                    // Authentication failed / bad intents / bad API version:
                    // retrying with the same credentials cannot succeed.
                    Some(4004) | Some(4010) | Some(4011) | Some(4012) | Some(4013)
                    | Some(4014) => DisconnectReason::Fatal,
                    // Invalid seq or session timed out.
                    Some(4007) | Some(4009) => DisconnectReason::ShouldReidentify,
                    _ => DisconnectReason::ShouldResume,
                };
            }

            // Ping/Pong/Binary - ignore.
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Read the HELLO payload from an already-split stream reference.
async fn read_hello(stream: &mut WsStream) -> Result<u64, Error> {
    let msg = tokio::time::timeout(Duration::from_secs(30), stream.next())
        .await
        .map_err(|_| Error::Connection("timed out waiting for HELLO".into()))?
        .ok_or_else(|| Error::Connection("stream ended before HELLO".into()))?
        .map_err(|e| Error::Connection(format!("WS error reading HELLO: {}", e)))?;

    let text = match msg {
        tokio_tungstenite::tungstenite::Message::Text(t) => t,
        other => {
            return Err(Error::Connection(format!(
                "expected text message for HELLO, got {:?}",
                other
            )))
        }
    };

    let payload: GatewayPayload = serde_json::from_str(&text)
        .map_err(|e| Error::Connection(format!("failed to parse HELLO: {}", e)))?;

    if payload.op != 10 {
        return Err(Error::Connection(format!(
            "expected op 10 (HELLO), got op {}",
            payload.op
        )));
    }

    payload
        .d
        .as_ref()
        .and_then(|d| d.get("heartbeat_interval"))
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::Connection("HELLO missing heartbeat_interval".into()))
}

/// Send a JSON payload on the WebSocket, respecting the send rate limiter.
async fn rate_limited_send(
    ws_write: &Arc<Mutex<WsSink>>,
    rate_limiter: &Arc<Mutex<SendRateLimiter>>,
    payload: &serde_json::Value,
) -> Result<(), Error> {
    loop {
        let delay = {
            let mut rl = rate_limiter.lock().await;
            rl.delay()
        };
        match delay {
            Some(d) if !d.is_zero() => {
                debug!(delay_ms = d.as_millis() as u64, "gateway send rate-limited");
                tokio::time::sleep(d).await;
            }
            _ => break,
        }
    }

    {
        let mut rl = rate_limiter.lock().await;
        rl.record();
    }

    let text = serde_json::to_string(payload).map_err(|e| Error::Connection(e.to_string()))?;
    let mut w = ws_write.lock().await;
    w.send(tokio_tungstenite::tungstenite::Message::Text(text))
        .await
        .map_err(|e| Error::Connection(format!("WS send error: {}", e)))
}

/// Sleep through the backoff delay for `attempt`, returning `true` if a close
/// request arrived during the wait.
async fn wait_backoff(attempt: u32, close_rx: &mut mpsc::Receiver<()>) -> bool {
    let delay = backoff_delay(attempt);
    warn!(
        delay_ms = delay.as_millis() as u64,
        attempt, "backing off before reconnect"
    );
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = close_rx.recv() => true,
    }
}

/// Exponential backoff with jitter, capped at 60s.
fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 1000u64 * 2u64.saturating_pow(attempt.min(6));
    let jitter = (rand::random::<f64>() * 0.5 + 0.75) * base_ms as f64;
    Duration::from_millis(jitter.min(60_000.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_allows_sends_under_budget() {
        let mut rl = SendRateLimiter::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(rl.delay().is_none());
            rl.record();
        }
    }

    #[test]
    fn rate_limiter_delays_over_budget() {
        let mut rl = SendRateLimiter::new(2, Duration::from_secs(60));
        rl.record();
        rl.record();
        let delay = rl.delay().expect("should be rate limited");
        assert!(delay <= Duration::from_secs(60));
    }

    #[test]
    fn rate_limiter_prunes_expired_entries() {
        let mut rl = SendRateLimiter::new(1, Duration::from_millis(0));
        rl.record();
        // Window of zero: the previous send has already expired.
        assert!(rl.delay().is_none());
    }

    #[test]
    fn backoff_grows_with_attempts_and_caps() {
        let early = backoff_delay(1);
        assert!(early >= Duration::from_millis(1500));
        assert!(early <= Duration::from_millis(2500));

        let late = backoff_delay(20);
        assert!(late <= Duration::from_secs(60));
    }

    #[test]
    fn backoff_stays_capped_for_arbitrarily_long_outages() {
        // The driver retries indefinitely; the per-attempt wait must not
        // keep growing with the attempt count.
        for attempt in [50, 500, u32::MAX] {
            assert!(backoff_delay(attempt) <= Duration::from_secs(60));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_wait_finishes_when_no_close_arrives() {
        let (_tx, mut close_rx) = mpsc::channel::<()>(1);
        assert!(!wait_backoff(5, &mut close_rx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_wait_is_interrupted_by_close() {
        let (tx, mut close_rx) = mpsc::channel::<()>(1);
        tx.send(()).await.unwrap();
        // A pending close request must win against even the longest wait.
        assert!(wait_backoff(u32::MAX, &mut close_rx).await);
    }

    #[test]
    fn intents_include_message_content() {
        assert_ne!(INTENTS & 32768, 0, "missing MESSAGE_CONTENT");
        assert_ne!(INTENTS & 512, 0, "missing GUILD_MESSAGES");
    }

    #[tokio::test]
    async fn connect_rejects_empty_token() {
        let result = connect(GatewayConfig {
            token: "  ".into(),
            intents: INTENTS,
        })
        .await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }

    #[test]
    fn connection_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
    }
}
