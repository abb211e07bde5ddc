//! Discord chat bridge for Minecraft proxy networks.
//!
//! All low-level gateway, HTTP, and event-parsing details live in their
//! respective modules. The [`bridge::Bridge`] controller composes them:
//! host proxies implement [`proxy::ProxyApi`], attach the bridge to their
//! event dispatcher, and drive its lifecycle (start, reload, shutdown).

pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod http;
pub mod proxy;
pub mod relay;
pub mod session;
pub mod types;

pub use bridge::Bridge;
pub use config::Config;
pub use error::{Error, Result};
pub use proxy::{EventDispatcher, EventKind, ProxyApi, ProxyEvent};
pub use types::Message;
