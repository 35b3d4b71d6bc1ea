//! Handoff configuration.
//!
//! Parses the TOML configuration that defines listener bindings, the
//! runtime directory holding the four domain channel sockets, and the
//! wall-clock bounds on each handoff phase.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for a proxy instance.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HandoffConfig {
    /// Handoff/runtime settings.
    #[serde(default)]
    pub handoff: HandoffSettings,

    /// Listener definitions.
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

impl HandoffConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.handoff.grace_period.is_zero() {
            return Err(ConfigError::Validation(
                "grace_period must be non-zero".to_string(),
            ));
        }
        if self.handoff.channel_connect_attempts == 0 {
            return Err(ConfigError::Validation(
                "channel_connect_attempts must be at least 1".to_string(),
            ));
        }
        for listener in &self.listeners {
            if listener.protocol.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "listener {} has an empty protocol tag",
                    listener.address
                )));
            }
        }
        Ok(())
    }
}

/// Handoff timing and addressing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffSettings {
    /// Directory holding the four domain channel sockets and the session
    /// marker.
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,

    /// How long the old instance keeps serving existing connections after
    /// it stops accepting, before remaining connections are moved or
    /// force-closed.
    #[serde(default = "default_grace_period")]
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,

    /// Bound on the new instance's spawn plus first channel contact.
    #[serde(default = "default_first_contact_timeout")]
    #[serde(with = "humantime_serde")]
    pub first_contact_timeout: Duration,

    /// Per-listener handshake bound during listener transfer.
    #[serde(default = "default_listener_ack_timeout")]
    #[serde(with = "humantime_serde")]
    pub listener_ack_timeout: Duration,

    /// Per-connection handshake bound during connection transfer.
    #[serde(default = "default_connection_ack_timeout")]
    #[serde(with = "humantime_serde")]
    pub connection_ack_timeout: Duration,

    /// Bound on the stats request/response exchange.
    #[serde(default = "default_stats_timeout")]
    #[serde(with = "humantime_serde")]
    pub stats_timeout: Duration,

    /// Connect attempts per channel before the new instance gives up.
    #[serde(default = "default_channel_connect_attempts")]
    pub channel_connect_attempts: u32,

    /// Base backoff between channel connect attempts (grows linearly).
    #[serde(default = "default_channel_connect_backoff")]
    #[serde(with = "humantime_serde")]
    pub channel_connect_backoff: Duration,
}

fn default_runtime_dir() -> PathBuf {
    PathBuf::from("/tmp/molt")
}

const fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}

const fn default_first_contact_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_listener_ack_timeout() -> Duration {
    Duration::from_secs(3)
}

const fn default_connection_ack_timeout() -> Duration {
    Duration::from_secs(3)
}

const fn default_stats_timeout() -> Duration {
    Duration::from_secs(3)
}

const fn default_channel_connect_attempts() -> u32 {
    10
}

const fn default_channel_connect_backoff() -> Duration {
    Duration::from_millis(100)
}

impl Default for HandoffSettings {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            grace_period: default_grace_period(),
            first_contact_timeout: default_first_contact_timeout(),
            listener_ack_timeout: default_listener_ack_timeout(),
            connection_ack_timeout: default_connection_ack_timeout(),
            stats_timeout: default_stats_timeout(),
            channel_connect_attempts: default_channel_connect_attempts(),
            channel_connect_backoff: default_channel_connect_backoff(),
        }
    }
}

/// One listening endpoint the proxy serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Bind address, e.g. `127.0.0.1:12101`.
    pub address: std::net::SocketAddr,

    /// Protocol tag handed to the protocol layer, e.g. `echo`.
    pub protocol: String,
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse failure.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Semantic validation failure.
    #[error("invalid config: {0}")]
    Validation(String),
}
