//! Discord session lifecycle.
//!
//! A [`Session`] is one live authenticated connection: the gateway driver
//! plus the pump task that feeds gateway events into the inbound relay.
//! Reconnect-on-loss is the gateway driver's job; this module only creates
//! and tears down whole sessions.
//!
//! Session creation goes through the [`Connector`] trait so the bridge
//! controller's restart logic can be exercised without a network.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::Error;
use crate::events::GatewayEvent;
use crate::gateway::{self, GatewayConfig};
use crate::http::{DiscordHttpClient, SharedHttp};
use crate::relay::{BotIdentity, InboundRelay};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A live session that can be stopped.
pub trait Session: Send {
    /// Disconnect and release the session. Consumes the handle — there is
    /// no way to stop a session twice.
    fn stop(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Creates sessions from a config snapshot.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        config: Arc<Config>,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Session>, Error>> + Send>>;
}

// ---------------------------------------------------------------------------
// The real connector
// ---------------------------------------------------------------------------

/// Connects real gateway sessions and wires them to the inbound relay.
pub struct DiscordConnector {
    inbound: InboundRelay,
    identity: BotIdentity,
    http: SharedHttp,
}

impl DiscordConnector {
    pub fn new(inbound: InboundRelay, identity: BotIdentity, http: SharedHttp) -> Self {
        Self {
            inbound,
            identity,
            http,
        }
    }
}

impl Connector for DiscordConnector {
    fn connect(
        &self,
        config: Arc<Config>,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Session>, Error>> + Send>> {
        let inbound = self.inbound.clone();
        let identity = self.identity.clone();
        let http = self.http.clone();

        Box::pin(async move {
            // Swap in a client for the (possibly new) token before the
            // gateway comes up, so early sends use the right credentials.
            http.store(DiscordHttpClient::new(&config.token));

            let mut handle = gateway::connect(GatewayConfig {
                token: config.token.clone(),
                intents: gateway::INTENTS,
            })
            .await?;

            let events = std::mem::replace(
                &mut handle.events,
                tokio::sync::mpsc::channel::<GatewayEvent>(1).1,
            );
            let pump = tokio::spawn(pump_events(events, inbound, identity));

            Ok(Box::new(DiscordSession {
                gateway: handle,
                pump,
            }) as Box<dyn Session>)
        })
    }
}

/// Feed gateway events into the relay until the driver goes away.
async fn pump_events(
    mut events: tokio::sync::mpsc::Receiver<GatewayEvent>,
    inbound: InboundRelay,
    identity: BotIdentity,
) {
    while let Some(event) = events.recv().await {
        match event {
            GatewayEvent::Ready(ready) => {
                identity.set(ready.user.id.clone());
                info!(user = %ready.user.username, "bridge bot is ready");
            }
            GatewayEvent::MessageCreate(msg) => {
                inbound.on_message(&msg);
            }
            GatewayEvent::Resumed => {
                // Already logged by the driver; nothing to replay.
            }
            GatewayEvent::Unknown {
                event_name: Some(ref name),
                ..
            } => {
                trace!(event = %name, "unhandled gateway event");
            }
            _ => {}
        }
    }
    debug!("gateway event stream ended");
}

struct DiscordSession {
    gateway: gateway::GatewayHandle,
    pump: tokio::task::JoinHandle<()>,
}

impl Session for DiscordSession {
    fn stop(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            info!("shutting down Discord session");
            self.gateway.close().await;
            // The driver dropped its event sender; the pump drains and ends.
            if let Err(e) = self.pump.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "event pump ended abnormally");
                }
            }
            info!("Discord session disconnected");
        })
    }
}
