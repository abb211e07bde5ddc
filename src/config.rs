//! YAML-backed bridge configuration.
//!
//! The config is an immutable snapshot: loaded once at startup, replaced
//! wholesale on reload, never mutated in place. The bridge controller holds
//! it behind an `Arc` so every event handler reads a consistent copy.
//!
//! On first run the bundled default file is written into the data directory
//! so operators have something to edit, mirroring the usual plugin
//! data-directory convention.

use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Contents of the default config written on first run.
const DEFAULT_CONFIG: &str = include_str!("../config.default.yml");

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Discord bot token.
    pub token: String,
    /// ID of the bridged Discord channel.
    pub channel: String,
    /// Message content that triggers the playerlist command from Discord.
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    /// Per-event message templates.
    #[serde(default)]
    pub templates: Templates,
}

fn default_command_prefix() -> String {
    "!playerlist".to_string()
}

impl Config {
    /// Load the config from `path`.
    ///
    /// If the file does not exist, the bundled default is copied into place
    /// first (creating the parent directory if needed). The default config
    /// has an empty token, so a first run still fails validation — with a
    /// file on disk for the operator to fill in.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, DEFAULT_CONFIG)?;
            info!(path = %path.display(), "wrote default config");
        }

        let contents = std::fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    /// Parse a config from a YAML string. Applies env overrides and
    /// validates.
    pub fn from_str(yaml: &str) -> Result<Self> {
        let mut config: Config =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `CHATLINK_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CHATLINK_TOKEN") {
            if !val.is_empty() {
                debug!("overriding token from CHATLINK_TOKEN");
                self.token = val;
            }
        }
        if let Ok(val) = std::env::var("CHATLINK_CHANNEL") {
            if !val.is_empty() {
                debug!("overriding channel from CHATLINK_CHANNEL");
                self.channel = val;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.token.trim().is_empty() {
            return Err(Error::Config("missing required field: token".into()));
        }
        if self.channel.trim().is_empty() {
            return Err(Error::Config("missing required field: channel".into()));
        }
        Ok(())
    }

    /// Whether replacing `old` with `self` requires a session restart.
    ///
    /// Only the token matters: channel and template changes take effect on
    /// the next event without touching the live connection.
    pub fn requires_restart(&self, old: &Config) -> bool {
        self.token != old.token
    }
}

// ---------------------------------------------------------------------------
// Shared snapshot holder
// ---------------------------------------------------------------------------

/// Read-mostly handle to the current [`Config`] snapshot.
///
/// Reads clone an `Arc` out; a reload swaps the whole snapshot in one write.
/// Event handlers therefore always see a consistent config, never a
/// half-updated one.
#[derive(Clone)]
pub struct SharedConfig(Arc<RwLock<Arc<Config>>>);

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(config))))
    }

    /// Current snapshot. Callers hold the `Arc`, not the lock.
    pub fn snapshot(&self) -> Arc<Config> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the snapshot wholesale.
    pub fn store(&self, config: Config) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
    }
}

impl std::fmt::Debug for SharedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConfig")
            .field("channel", &self.snapshot().channel)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Message templates with `%player%` / `%message%` placeholders.
///
/// Every field has a default so a config that omits the whole `templates`
/// block (or any single key) still works.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Templates {
    #[serde(default = "default_chat")]
    pub chat: String,
    #[serde(default = "default_join")]
    pub join: String,
    #[serde(default = "default_leave")]
    pub leave: String,
    /// Inbound template: Discord message rebroadcast into proxy chat.
    #[serde(default = "default_discord_chat")]
    pub discord_chat: String,
    #[serde(default = "default_playerlist")]
    pub playerlist: String,
    #[serde(default = "default_playerlist_empty")]
    pub playerlist_empty: String,
}

fn default_chat() -> String {
    "**%player%**: %message%".to_string()
}
fn default_join() -> String {
    "**%player%** joined the network".to_string()
}
fn default_leave() -> String {
    "**%player%** left the network".to_string()
}
fn default_discord_chat() -> String {
    "&7[&bDiscord&7] &f%player%&7: &f%message%".to_string()
}
fn default_playerlist() -> String {
    "**Online (%count%):** %players%".to_string()
}
fn default_playerlist_empty() -> String {
    "No players are currently online.".to_string()
}

impl Default for Templates {
    fn default() -> Self {
        Self {
            chat: default_chat(),
            join: default_join(),
            leave: default_leave(),
            discord_chat: default_discord_chat(),
            playerlist: default_playerlist(),
            playerlist_empty: default_playerlist_empty(),
        }
    }
}

impl Templates {
    pub fn render_chat(&self, player: &str, message: &str) -> String {
        render(&self.chat, player, message)
    }

    pub fn render_join(&self, player: &str) -> String {
        render(&self.join, player, "")
    }

    pub fn render_leave(&self, player: &str) -> String {
        render(&self.leave, player, "")
    }

    pub fn render_discord_chat(&self, author: &str, message: &str) -> String {
        render(&self.discord_chat, author, message)
    }

    /// Roster in arrival order, comma-joined. An empty roster uses the
    /// dedicated empty template rather than producing a blank list.
    pub fn render_playerlist(&self, players: &[String]) -> String {
        if players.is_empty() {
            return self.playerlist_empty.clone();
        }
        self.playerlist
            .replace("%players%", &players.join(", "))
            .replace("%count%", &players.len().to_string())
    }
}

fn render(template: &str, player: &str, message: &str) -> String {
    template
        .replace("%player%", player)
        .replace("%message%", message)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        "token: \"abc123\"\nchannel: \"555\"\n"
    }

    // -- Loading / validation ---------------------------------------------

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = Config::from_str(minimal_yaml()).unwrap();
        assert_eq!(config.token, "abc123");
        assert_eq!(config.channel, "555");
        assert_eq!(config.command_prefix, "!playerlist");
        assert_eq!(config.templates.chat, "**%player%**: %message%");
    }

    #[test]
    fn missing_token_is_a_config_error() {
        let err = Config::from_str("channel: \"555\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn empty_token_is_a_config_error() {
        let err = Config::from_str("token: \"\"\nchannel: \"555\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_channel_is_a_config_error() {
        let err = Config::from_str("token: \"abc\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn malformed_yaml_is_a_config_error() {
        let err = Config::from_str("token: [unclosed\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn load_writes_default_file_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("config.yml");

        // First load writes the bundled default, which has an empty token
        // and therefore fails validation.
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(path.exists());

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("command-prefix"));
    }

    #[test]
    fn load_reads_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, minimal_yaml()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.token, "abc123");
    }

    // -- Restart decision --------------------------------------------------

    #[test]
    fn token_change_requires_restart() {
        let old = Config::from_str(minimal_yaml()).unwrap();
        let new = Config::from_str("token: \"other\"\nchannel: \"555\"\n").unwrap();
        assert!(new.requires_restart(&old));
    }

    #[test]
    fn channel_change_does_not_require_restart() {
        let old = Config::from_str(minimal_yaml()).unwrap();
        let new = Config::from_str("token: \"abc123\"\nchannel: \"999\"\n").unwrap();
        assert!(!new.requires_restart(&old));
    }

    // -- Templates ---------------------------------------------------------

    #[test]
    fn chat_template_substitutes_player_and_message() {
        let templates = Templates::default();
        let out = templates.render_chat("Alice", "hello there");
        assert!(out.contains("Alice"));
        assert!(out.contains("hello there"));
    }

    #[test]
    fn chat_template_keeps_message_verbatim() {
        let templates = Templates::default();
        let out = templates.render_chat("Bob", "50% off %message% deals");
        // Substitution is template-driven; the message body itself is not
        // re-scanned for placeholders.
        assert_eq!(out, "**Bob**: 50% off %message% deals");
    }

    #[test]
    fn playerlist_joins_in_arrival_order() {
        let templates = Templates::default();
        let players = vec!["Alice".to_string(), "Bob".to_string()];
        let out = templates.render_playerlist(&players);
        assert_eq!(out, "**Online (2):** Alice, Bob");
    }

    #[test]
    fn playerlist_empty_uses_empty_template() {
        let templates = Templates::default();
        let out = templates.render_playerlist(&[]);
        assert_eq!(out, "No players are currently online.");
    }

    // -- SharedConfig ------------------------------------------------------

    #[test]
    fn shared_config_swaps_whole_snapshot() {
        let shared = SharedConfig::new(Config::from_str(minimal_yaml()).unwrap());
        let before = shared.snapshot();

        shared.store(Config::from_str("token: \"abc123\"\nchannel: \"999\"\n").unwrap());

        // The old snapshot is unchanged; new reads see the replacement.
        assert_eq!(before.channel, "555");
        assert_eq!(shared.snapshot().channel, "999");
    }

    #[test]
    fn custom_templates_override_defaults() {
        let yaml = "token: \"t\"\nchannel: \"c\"\ntemplates:\n  join: \">>> %player% is here\"\n";
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.templates.render_join("Eve"), ">>> Eve is here");
        // Untouched keys keep their defaults.
        assert_eq!(config.templates.leave, default_leave());
    }
}
