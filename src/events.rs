//! Typed gateway events.
//!
//! Instead of matching on raw `(op, t, serde_json::Value)` tuples everywhere,
//! the gateway module deserialises dispatch payloads into this enum so the
//! bridge can pattern-match on strongly-typed data.

use tracing::warn;

use crate::types::{GatewayPayload, Message, ReadyEvent};

// ---------------------------------------------------------------------------
// The top-level event enum
// ---------------------------------------------------------------------------

/// A fully-parsed event coming off the Discord gateway.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// We've successfully identified — session is live.
    Ready(ReadyEvent),

    /// A message was created in a channel we can see.
    MessageCreate(Message),

    /// The gateway accepted our RESUME after a dropped connection.
    Resumed,

    /// Heartbeat ACK from the gateway (op 11).
    HeartbeatAck,

    /// The gateway is asking us to heartbeat immediately (op 1).
    HeartbeatRequest,

    /// Gateway told us to reconnect (op 7).
    Reconnect,

    /// Session has been invalidated (op 9). The inner bool indicates whether
    /// the session is resumable (`true`) or we must re-identify (`false`).
    InvalidSession(bool),

    /// An event we received but don't have a typed variant for.
    Unknown {
        event_name: Option<String>,
        op: u8,
    },
}

// ---------------------------------------------------------------------------
// Parsing from a raw GatewayPayload
// ---------------------------------------------------------------------------

impl GatewayEvent {
    /// Convert a raw [`GatewayPayload`] into a typed event.
    ///
    /// This never fails — unrecognised events become [`GatewayEvent::Unknown`].
    pub fn from_payload(payload: GatewayPayload) -> Self {
        match payload.op {
            0 => Self::parse_dispatch(payload.t.as_deref(), payload.d),
            1 => GatewayEvent::HeartbeatRequest,
            7 => GatewayEvent::Reconnect,
            9 => {
                let resumable = payload
                    .d
                    .as_ref()
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                GatewayEvent::InvalidSession(resumable)
            }
            11 => GatewayEvent::HeartbeatAck,
            _ => GatewayEvent::Unknown {
                event_name: payload.t,
                op: payload.op,
            },
        }
    }

    /// Parse an op-0 DISPATCH event by its `t` name.
    fn parse_dispatch(event_name: Option<&str>, data: Option<serde_json::Value>) -> Self {
        let Some(name) = event_name else {
            return GatewayEvent::Unknown {
                event_name: None,
                op: 0,
            };
        };

        match (name, data) {
            ("READY", Some(d)) => match serde_json::from_value::<ReadyEvent>(d) {
                Ok(ready) => GatewayEvent::Ready(ready),
                Err(e) => {
                    warn!(event = name, error = %e, "failed to parse READY payload");
                    GatewayEvent::Unknown {
                        event_name: Some(name.to_string()),
                        op: 0,
                    }
                }
            },

            ("MESSAGE_CREATE", Some(d)) => match serde_json::from_value::<Message>(d) {
                Ok(msg) => GatewayEvent::MessageCreate(msg),
                Err(e) => {
                    warn!(event = name, error = %e, "failed to parse MESSAGE_CREATE payload");
                    GatewayEvent::Unknown {
                        event_name: Some(name.to_string()),
                        op: 0,
                    }
                }
            },

            ("RESUMED", _) => GatewayEvent::Resumed,

            (_, _) => GatewayEvent::Unknown {
                event_name: Some(name.to_string()),
                op: 0,
            },
        }
    }
}
