//! Error taxonomy for the bridge.
//!
//! Three failure classes matter operationally: the config file being
//! missing/invalid, the Discord connection failing, and an individual
//! message failing to send. None of them is allowed to propagate into the
//! host proxy's event dispatch — callers at the relay boundary log and drop.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Config file missing, unreadable, malformed, or failing validation.
    ///
    /// Fatal at startup; non-fatal at reload (the previous config stays
    /// active).
    #[error("config error: {0}")]
    Config(String),

    /// Auth or network failure while establishing / driving the gateway
    /// session.
    #[error("connection error: {0}")]
    Connection(String),

    /// A single outbound message could not be delivered. Logged and
    /// dropped — no retry at the relay level.
    #[error("send error: {0}")]
    Send(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl Error {
    /// True for errors that should abort startup entirely rather than be
    /// retried.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_fatal_at_startup() {
        assert!(Error::Config("missing token".into()).is_fatal_at_startup());
        assert!(!Error::Connection("auth failed".into()).is_fatal_at_startup());
        assert!(!Error::Send("429".into()).is_fatal_at_startup());
    }

    #[test]
    fn io_errors_map_to_config() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: Error = io.into();
        assert!(matches!(err, Error::Config(_)));
    }
}
