//! # Configuration Management
//!
//! Centralized configuration for the stream factory and its sessions.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! Durations are written as integer milliseconds.

use crate::core::handshake::SessionFormat;
use crate::core::opcodes::OpcodeWidth;
use crate::error::{ProtocolError, Result};
use crate::utils::compression::MAX_INFLATED_SIZE;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default listen address
pub const DEFAULT_ADDRESS: &str = "0.0.0.0:9000";

/// Largest datagram a session will emit
pub const DEFAULT_MAX_PACKET_SIZE: usize = 512;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Socket and loop settings
    #[serde(default)]
    pub factory: FactoryConfig,

    /// Per-session settings
    #[serde(default)]
    pub stream: StreamConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("EQSTREAM_ADDRESS") {
            config.factory.address = addr;
        }

        if let Ok(idle) = std::env::var("EQSTREAM_IDLE_TIMEOUT_MS") {
            let val = idle.parse::<u64>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid EQSTREAM_IDLE_TIMEOUT_MS: {e}"))
            })?;
            config.factory.idle_timeout = Duration::from_millis(val);
        }

        if let Ok(decay) = std::env::var("EQSTREAM_DECAY_INTERVAL_MS") {
            let val = decay.parse::<u64>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid EQSTREAM_DECAY_INTERVAL_MS: {e}"))
            })?;
            config.factory.decay_interval = Duration::from_millis(val);
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.factory.validate());
        errors.extend(self.stream.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Socket and execution-loop configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FactoryConfig {
    /// UDP listen address (e.g., "0.0.0.0:9000")
    pub address: String,

    /// Longest the reader waits on the socket before re-checking shutdown
    #[serde(with = "duration_serde")]
    pub poll_timeout: Duration,

    /// Writer pass interval while sessions exist
    #[serde(with = "duration_serde")]
    pub write_interval: Duration,

    /// Interval between rate-counter decay passes
    #[serde(with = "duration_serde")]
    pub decay_interval: Duration,

    /// Interval between reaper passes
    #[serde(with = "duration_serde")]
    pub reap_interval: Duration,

    /// Silence after which a session starts closing
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// Receive buffer for a single datagram
    pub recv_buffer_size: usize,

    /// Upper bound on live sessions; new endpoints are dropped beyond it
    pub max_sessions: usize,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            address: String::from(DEFAULT_ADDRESS),
            poll_timeout: Duration::from_secs(30),
            write_interval: Duration::from_millis(10),
            decay_interval: Duration::from_secs(20),
            reap_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            recv_buffer_size: 2048,
            max_sessions: 4096,
        }
    }
}

impl FactoryConfig {
    /// Validate factory configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Factory address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid factory address format: '{}' (expected format: '0.0.0.0:9000')",
                self.address
            ));
        }

        if self.poll_timeout.as_millis() < 10 {
            errors.push("Poll timeout too short (minimum: 10ms)".to_string());
        } else if self.poll_timeout.as_secs() > 300 {
            errors.push("Poll timeout too long (maximum: 300s)".to_string());
        }

        if self.write_interval.is_zero() {
            errors.push("Write interval must be greater than 0".to_string());
        } else if self.write_interval.as_secs() > 1 {
            errors.push("Write interval too long (maximum: 1s)".to_string());
        }

        if self.decay_interval.as_millis() < 100 {
            errors.push("Decay interval too short (minimum: 100ms)".to_string());
        }

        if self.reap_interval.as_millis() < 10 {
            errors.push("Reap interval too short (minimum: 10ms)".to_string());
        }

        if self.idle_timeout < self.reap_interval {
            errors.push("Idle timeout cannot be shorter than the reap interval".to_string());
        }

        if self.recv_buffer_size < 512 {
            errors.push("Receive buffer too small (minimum: 512 bytes)".to_string());
        } else if self.recv_buffer_size > 65_535 {
            errors.push("Receive buffer larger than any UDP datagram (maximum: 65535)".to_string());
        }

        if self.max_sessions == 0 {
            errors.push("Max sessions must be greater than 0".to_string());
        }

        errors
    }
}

/// Per-session configuration shared by every stream the factory creates
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    /// Largest datagram a session emits, announced in the handshake
    pub max_packet_size: usize,

    /// Application opcode width in bytes (1 or 2)
    pub app_opcode_size: u8,

    /// Offer compression in the session response
    pub compressed: bool,

    /// Offer the chat cipher in the session response
    pub encoded: bool,

    /// Bytes a session may write before it waits for the next decay
    pub rate_threshold: usize,

    /// Bytes removed from the rate counter on every decay pass
    pub decay_rate: usize,

    /// Cap on inflated frame size
    pub max_decompressed_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            app_opcode_size: 2,
            compressed: true,
            encoded: false,
            rate_threshold: 256 * 1024,
            decay_rate: 64 * 1024,
            max_decompressed_size: MAX_INFLATED_SIZE,
        }
    }
}

impl StreamConfig {
    /// Validate stream configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_packet_size < 64 {
            errors.push("Max packet size too small (minimum: 64 bytes)".to_string());
        } else if self.max_packet_size > 65_507 {
            errors.push("Max packet size exceeds the UDP payload limit (65507)".to_string());
        }

        if OpcodeWidth::from_size(self.app_opcode_size).is_none() {
            errors.push(format!(
                "Invalid application opcode size: {} (valid: 1 or 2)",
                self.app_opcode_size
            ));
        }

        if self.rate_threshold == 0 {
            errors.push("Rate threshold must be greater than 0".to_string());
        }

        if self.decay_rate == 0 {
            errors.push("Decay rate must be greater than 0".to_string());
        }

        if self.max_decompressed_size < self.max_packet_size {
            errors.push("Max decompressed size cannot be smaller than max packet size".to_string());
        }

        errors
    }

    /// Opcode width, falling back to two bytes for an invalid size
    pub fn opcode_width(&self) -> OpcodeWidth {
        OpcodeWidth::from_size(self.app_opcode_size).unwrap_or_default()
    }

    /// Format bits announced in the session response
    pub fn session_format(&self) -> SessionFormat {
        let mut format = SessionFormat::empty();
        format.set(SessionFormat::COMPRESSED, self.compressed);
        format.set(SessionFormat::ENCODED, self.encoded);
        format
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("eqstream"),
            log_level: Level::INFO,
            log_to_console: true,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.json_format && !self.log_to_console {
            errors.push("json_format has no effect unless log_to_console is true".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
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

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
