//! Standalone bridge entry point.
//!
//! Runs the bridge against a console proxy: inbound Discord chat is printed
//! to stdout and the player roster is empty. Real deployments embed the
//! library in a proxy host instead; this binary exists for configuration
//! and connectivity checks.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chatlink::proxy::ProxyApi;
use chatlink::Bridge;

// ---------------------------------------------------------------------------
// Console proxy
// ---------------------------------------------------------------------------

/// Host stand-in with no players. Broadcasts land on stdout.
struct ConsoleProxy;

impl ProxyApi for ConsoleProxy {
    fn broadcast(&self, message: &str) {
        println!("{message}");
    }

    fn online_players(&self) -> Vec<String> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    // Token/channel may come from .env via CHATLINK_TOKEN / CHATLINK_CHANNEL.
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.yml"));

    let bridge = match Bridge::new(config_path, Arc::new(ConsoleProxy)) {
        Ok(bridge) => bridge,
        Err(e) => {
            error!(error = %e, "failed to load config, not starting");
            std::process::exit(1);
        }
    };

    if let Err(e) = bridge.start().await {
        error!(error = %e, "failed to open Discord session");
        std::process::exit(1);
    }
    info!("bridge running, press ctrl-c to stop");

    wait_for_signals(&bridge).await;

    bridge.shutdown().await;
}

/// Block until ctrl-c. On unix, SIGHUP triggers a config reload instead of
/// stopping.
#[cfg(unix)]
async fn wait_for_signals(bridge: &Bridge) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "SIGHUP handler unavailable, reload disabled");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            return;
        }
    };

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "failed to listen for ctrl-c");
                }
                return;
            }
            _ = hangup.recv() => {
                if !bridge.reload().await {
                    warn!("reload failed, previous config still active");
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(_bridge: &Bridge) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
    }
}
