//! Handler configuration
//!
//! TOML-deserializable knobs for one connection. Durations accept
//! human-readable forms ("90s", "2m 30s"); every field has a default so a
//! partial table (or `HandlerConfig::default()`) is always valid.

use std::time::Duration;

use serde::Deserialize;

use crate::codec::DEFAULT_MAX_PACKET_SIZE;

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Parse(e) => write!(f, "parse error: {}", e),
            ConfigError::Validation(msg) => write!(f, "validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Per-connection protocol handler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HandlerConfig {
    /// Keepalive interval; `None` disables PINGREQ probing
    #[serde(with = "humantime_serde")]
    pub keep_alive: Option<Duration>,
    /// How long to wait for PINGRESP after a PINGREQ
    #[serde(with = "humantime_serde")]
    pub ping_timeout: Duration,
    /// Bound on one QoS handshake; `None` waits indefinitely
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Option<Duration>,
    /// Bound on the connection loop becoming ready at `start`
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Largest accepted or produced packet, in bytes
    pub max_packet_size: usize,
    /// Cap on simultaneously inflight outgoing messages
    pub max_inflight: u16,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            keep_alive: None,
            ping_timeout: Duration::from_secs(10),
            handshake_timeout: None,
            connect_timeout: Duration::from_secs(30),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_inflight: u16::MAX,
        }
    }
}

impl HandlerConfig {
    /// Parse a configuration from a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: HandlerConfig = toml::from_str(s).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_inflight == 0 {
            return Err(ConfigError::Validation(
                "max_inflight must be at least 1".to_string(),
            ));
        }
        if self.max_packet_size < 2 {
            return Err(ConfigError::Validation(
                "max_packet_size must cover at least a fixed header".to_string(),
            ));
        }
        Ok(())
    }
}
