//! Configuration types for video sessions

use crate::lifecycle::ReconnectionPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for a room session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Signaling server base URL (ws:// or wss://)
    pub signaling_url: String,

    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Capture devices requested on join
    pub media: MediaConstraints,

    /// Signaling connect timeout in milliseconds (default: 10000)
    pub connect_timeout_ms: u64,

    /// Signaling reconnection policy
    pub reconnect: ReconnectionPolicy,

    /// Retry policy for room status updates
    pub status_sync: ReconnectionPolicy,

    /// How long leaving waits for the `ended` status update (default: 3000)
    pub status_flush_timeout_ms: u64,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Which capture devices to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    /// Open a microphone
    pub audio: bool,
    /// Open a camera
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8002".to_string(),
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_servers: Vec::new(),
            media: MediaConstraints::default(),
            connect_timeout_ms: 10_000,
            reconnect: ReconnectionPolicy::default(),
            status_sync: ReconnectionPolicy::status_sync(),
            status_flush_timeout_ms: 3_000,
        }
    }
}

impl SessionConfig {
    /// Parse a TOML document; missing fields take their defaults
    ///
    /// # Example
    ///
    /// ```
    /// use teleconsult_webrtc::config::SessionConfig;
    ///
    /// let config = SessionConfig::from_toml_str(r#"
    ///     signaling_url = "wss://clinic.example.com"
    ///
    ///     [reconnect]
    ///     max_retries = 3
    /// "#).unwrap();
    /// assert_eq!(config.reconnect.max_retries, 3);
    /// assert_eq!(config.stun_servers.len(), 2);
    /// ```
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `signaling_url` is not a ws:// or wss:// URL
    /// - `stun_servers` is empty or holds a non-`stun:` URL
    /// - a TURN URL is not `turn:`/`turns:`
    /// - a timeout is zero
    /// - a backoff multiplier is below 1.0
    pub fn validate(&self) -> Result<()> {
        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        if let Some(bad) = self
            .stun_servers
            .iter()
            .find(|url| !url.starts_with("stun:") && !url.starts_with("stuns:"))
        {
            return Err(Error::InvalidConfig(format!(
                "STUN server must start with stun: or stuns:, got {}",
                bad
            )));
        }

        if let Some(bad) = self
            .turn_servers
            .iter()
            .find(|turn| !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:"))
        {
            return Err(Error::InvalidConfig(format!(
                "TURN server must start with turn: or turns:, got {}",
                bad.url
            )));
        }

        if self.connect_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "connect_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.status_flush_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "status_flush_timeout_ms must be greater than zero".to_string(),
            ));
        }

        self.reconnect.validate("reconnect")?;
        self.status_sync.validate("status_sync")?;

        Ok(())
    }

    /// Signaling connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Status flush timeout on leave
    pub fn status_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.status_flush_timeout_ms)
    }

    /// Replace the signaling URL
    pub fn with_signaling_url(mut self, url: impl Into<String>) -> Self {
        self.signaling_url = url.into();
        self
    }

    /// Add TURN servers
    pub fn with_turn_servers(mut self, servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers.extend(servers);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.signaling_url, "ws://localhost:8002");
        assert_eq!(config.reconnect.max_retries, 5);
        assert!(config.media.audio && config.media.video);
    }

    #[test]
    fn test_rejects_http_signaling_url() {
        let config = SessionConfig::default().with_signaling_url("http://localhost:8002");
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_empty_stun_list() {
        let config = SessionConfig {
            stun_servers: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_timeouts() {
        let config = SessionConfig {
            connect_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_turn_url() {
        let config = SessionConfig::default().with_turn_servers(vec![TurnServerConfig {
            url: "stun:turn.example.com".to_string(),
            username: "u".to_string(),
            credential: "c".to_string(),
        }]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_overrides() {
        let config = SessionConfig::from_toml_str(
            r#"
            signaling_url = "wss://clinic.example.com"
            connect_timeout_ms = 2500

            [media]
            video = false

            [[turn_servers]]
            url = "turn:turn.example.com:3478"
            username = "user"
            credential = "pass"

            [status_sync]
            max_retries = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.signaling_url, "wss://clinic.example.com");
        assert_eq!(config.connect_timeout(), Duration::from_millis(2500));
        assert!(config.media.audio);
        assert!(!config.media.video);
        assert_eq!(config.turn_servers.len(), 1);
        assert_eq!(config.status_sync.max_retries, 1);
        assert_eq!(config.status_sync.backoff_initial_ms, 1000);
    }

    #[test]
    fn test_toml_validation_errors_surface() {
        let result = SessionConfig::from_toml_str(
            r#"
            [reconnect]
            backoff_multiplier = 0.5
            "#,
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
