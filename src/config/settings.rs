//! Server settings file
//!
//! Loads optional server settings from a TOML file. A missing file yields the
//! defaults; command-line flags are layered on top by the caller.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::presence::StatsPolicy;

/// Default bind address
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Default listen port
pub const DEFAULT_PORT: u16 = 9000;
/// Default websocket handshake timeout
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
/// Default time open connections get to close on shutdown
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Server section of the settings file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on (0 picks a free port)
    pub port: u16,
    /// Delivery policy for `server_stats` responses
    pub policy: StatsPolicy,
    /// Announce the count on every connect and disconnect
    pub push_on_change: bool,
    /// Seconds allowed for the websocket handshake
    pub handshake_timeout_secs: u64,
    /// Seconds open connections get to close on shutdown before being aborted
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            policy: StatsPolicy::default(),
            push_on_change: false,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
        }
    }
}

impl ServerSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Root settings file
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
}

impl Settings {
    /// Load settings from a TOML file, falling back to defaults if it is absent
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse settings from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load(&dir.path().join("presence.toml")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.server.port, DEFAULT_PORT);
        assert_eq!(settings.server.policy, StatsPolicy::Reply);
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("presence.toml");
        std::fs::write(
            &path,
            r#"
[server]
bind = "0.0.0.0"
port = 8080
policy = "broadcast"
push_on_change = true
shutdown_grace_secs = 2
"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.server.bind, "0.0.0.0");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.policy, StatsPolicy::Broadcast);
        assert!(settings.server.push_on_change);
        assert_eq!(
            settings.server.handshake_timeout(),
            Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS)
        );
        assert_eq!(settings.server.shutdown_grace(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let settings = Settings::from_toml("[server]\nport = 0\n").unwrap();
        assert_eq!(settings.server.port, 0);
        assert_eq!(settings.server.bind, DEFAULT_BIND);
        assert!(!settings.server.push_on_change);
        assert_eq!(settings.server.shutdown_grace_secs, DEFAULT_SHUTDOWN_GRACE_SECS);
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let result = Settings::from_toml("[server]\npolicy = \"sometimes\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
