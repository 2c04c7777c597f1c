//! # Configuration Management
//!
//! Structured configuration for servers and clients: listen/dial addresses,
//! timeouts, connection limits, and logging options.
//!
//! Configuration is an explicit value handed to constructors; there is no
//! process-wide mutable preferred-address state. Sources:
//! - TOML files via `from_file()`
//! - Environment-variable overrides via `from_env()`
//! - Direct instantiation with defaults

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Max allowed payload size for a single block (16 MB). Guards every
/// bounded read before allocation.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Default port of the chat service.
pub const DEFAULT_PORT: u16 = 4242;

/// Aggregate configuration for one process.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::Config(format!("failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::Config(format!("failed to parse TOML: {e}")))
    }

    /// Defaults overridden by environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("CHATWIRE_SERVER_ADDRESS") {
            config.server.address = addr;
        }
        if let Ok(addr) = std::env::var("CHATWIRE_CLIENT_ADDRESS") {
            config.client.address = addr;
        }
        if let Ok(timeout) = std::env::var("CHATWIRE_CONNECT_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse::<u64>() {
                config.client.connect_timeout = Duration::from_millis(ms);
            }
        }
        if let Ok(max) = std::env::var("CHATWIRE_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse::<usize>() {
                config.server.max_connections = n;
            }
        }

        config
    }

    /// Collect validation problems; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors
    }

    /// Validate and fail on the first set of problems.
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::Config(format!(
                "configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Server-specific configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:4242").
    pub address: String,

    /// Maximum number of concurrent connections; further sockets are
    /// refused at accept.
    pub max_connections: usize,

    /// How long a graceful shutdown waits for connections to drain.
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: format!("0.0.0.0:{DEFAULT_PORT}"),
            max_connections: 1000,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "invalid server address '{}' (expected e.g. '0.0.0.0:4242')",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("max connections must be greater than 0".to_string());
        }

        if self.shutdown_timeout.as_secs() > 60 {
            errors.push("shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Client-specific configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Target server address.
    pub address: String,

    /// Timeout for the initial socket connect. Advisory only: it never
    /// applies to in-flight exchanges.
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{DEFAULT_PORT}"),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("client address cannot be empty".to_string());
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("connect timeout too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// Logging configuration, consumed by `utils::logging::init`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs.
    pub app_name: String,

    /// Log level.
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to emit logs to the console at all.
    pub log_to_console: bool,

    /// Whether to use JSON formatting for logs.
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("chatwire"),
            log_level: Level::INFO,
            log_to_console: true,
            json_format: false,
        }
    }
}

/// Helper module for Duration serialization/deserialization (millis).
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization.
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        level.to_string().to_lowercase().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("invalid log level: {level_str}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(NetworkConfig::default().validate().is_empty());
    }

    #[test]
    fn toml_roundtrip() {
        let config = NetworkConfig::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed = NetworkConfig::from_toml(&rendered).unwrap();
        assert_eq!(parsed.server.address, config.server.address);
        assert_eq!(parsed.client.connect_timeout, config.client.connect_timeout);
        assert_eq!(parsed.logging.log_level, Level::INFO);
    }

    #[test]
    fn bad_address_flagged() {
        let mut config = NetworkConfig::default();
        config.server.address = "not-an-address".into();
        assert!(!config.validate().is_empty());
        assert!(config.validate_strict().is_err());
    }

    #[test]
    fn zero_max_connections_flagged() {
        let mut config = NetworkConfig::default();
        config.server.max_connections = 0;
        assert!(config
            .validate()
            .iter()
            .any(|e| e.contains("max connections")));
    }
}
