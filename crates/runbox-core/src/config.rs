//! Client configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable overriding [`ClientConfig::broker_url`].
pub const BROKER_URL_ENV: &str = "RUNBOX_BROKER_URL";
/// Environment variable overriding [`ClientConfig::api_base_url`].
pub const API_URL_ENV: &str = "RUNBOX_API_URL";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Settings shared by the transport, fallback and orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// STOMP-over-WebSocket endpoint. Empty disables streaming.
    pub broker_url: String,
    /// Base URL of the HTTP API.
    pub api_base_url: String,
    /// Delay between reconnection attempts.
    pub reconnect_delay_ms: u64,
    /// Limit on a single WebSocket + STOMP handshake.
    pub connect_timeout_ms: u64,
    /// Limit on a synchronous execute call.
    pub request_timeout_ms: u64,
    /// Give up on a queued dispatch after this long. Unset means never.
    pub queue_timeout_ms: Option<u64>,
    /// Destination the execute command is published to.
    pub command_destination: String,
    /// Prefix of the per-session output topics.
    pub topic_prefix: String,
    /// Treat an `Error` frame as the end of a session.
    pub error_terminates: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker_url: "ws://localhost:8080/ws".to_string(),
            api_base_url: "http://localhost:8080".to_string(),
            reconnect_delay_ms: 3_000,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            queue_timeout_ms: None,
            command_destination: "/app/execute".to_string(),
            topic_prefix: "/topic/execution".to_string(),
            error_terminates: false,
        }
    }
}

impl ClientConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    ///
    /// # Errors
    /// Returns error if the document is not valid TOML for this shape.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Load a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Apply `RUNBOX_*` environment overrides.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(BROKER_URL_ENV) {
            self.broker_url = url;
        }
        if let Some(url) = lookup(API_URL_ENV) {
            self.api_base_url = url;
        }
        self
    }

    /// Whether a streaming transport should be built.
    #[must_use]
    pub fn streaming_enabled(&self) -> bool {
        !self.broker_url.trim().is_empty()
    }

    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn queue_timeout(&self) -> Option<Duration> {
        self.queue_timeout_ms.map(Duration::from_millis)
    }
}
