//! # Configuration Management
//!
//! Centralized configuration for reactors and connections.
//!
//! ## Configuration Sources
//! - TOML files via [`NetworkConfig::from_file`]
//! - Direct instantiation with defaults
//! - `MSGWIRE_*` environment overrides via [`NetworkConfig::from_env`]
//!
//! Durations are serialized as milliseconds.
//!
//! ## Derived timeouts
//! The negotiation and disconnect sub-timeout is a third of
//! [`TransportConfig::timeout`]; a keep-alive is sent after two thirds of it
//! passed without outbound traffic.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default connection timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default number of transmissions of a certified message
pub const DEFAULT_MAX_TRIES: u8 = 5;

/// Default wait for an acknowledgement before a retry
pub const DEFAULT_CERTIFICATION_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Default frame buffer size for stream transports (512 KiB)
pub const DEFAULT_SCRATCH_BUFFER_SIZE: usize = 512 * 1024;

/// Default initial receive buffer per connection (10 KiB)
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 10 * 1024;

/// Default datagram payload, below the common Ethernet MTU
pub const DEFAULT_DATAGRAM_PAYLOAD_SIZE: usize = 1400;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Socket and lifecycle settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Certification and queueing settings
    #[serde(default)]
    pub reliability: ReliabilityConfig,

    /// Buffer sizes
    #[serde(default)]
    pub buffers: BufferConfig,

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

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(val) = env_parse::<u64>("MSGWIRE_TIMEOUT_MS")? {
            config.transport.timeout = Duration::from_millis(val);
        }
        if let Some(val) = env_parse::<u64>("MSGWIRE_POLL_INTERVAL_MS")? {
            config.transport.poll_interval = Duration::from_millis(val);
        }
        if let Some(val) = env_parse::<usize>("MSGWIRE_MAX_CONNECTIONS")? {
            config.transport.max_connections = val;
        }
        if let Some(val) = env_parse::<u8>("MSGWIRE_MAX_TRIES")? {
            config.reliability.max_tries = val;
        }
        if let Some(val) = env_parse::<u64>("MSGWIRE_CERTIFICATION_TIMEOUT_MS")? {
            config.reliability.certification_timeout = Duration::from_millis(val);
        }
        if let Some(val) = env_parse::<usize>("MSGWIRE_QUEUE_CAPACITY")? {
            config.reliability.queue_capacity = val;
        }
        if let Some(val) = env_parse::<usize>("MSGWIRE_SCRATCH_BUFFER_SIZE")? {
            config.buffers.scratch_buffer_size = val;
        }
        if let Some(val) = env_parse::<usize>("MSGWIRE_RECEIVE_BUFFER_SIZE")? {
            config.buffers.receive_buffer_size = val;
        }
        if let Some(val) = env_parse::<usize>("MSGWIRE_DATAGRAM_PAYLOAD_SIZE")? {
            config.buffers.datagram_payload_size = val;
        }
        if let Ok(level) = std::env::var("MSGWIRE_LOG_LEVEL") {
            config.logging.log_level = level
                .parse::<Level>()
                .map_err(|_| ProtocolError::ConfigError(format!("Invalid log level: {level}")))?;
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
        errors.extend(self.transport.validate());
        errors.extend(self.reliability.validate());
        errors.extend(self.buffers.validate());
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

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ProtocolError::ConfigError(format!("Invalid value for {key}: '{raw}'"))),
        Err(_) => Ok(None),
    }
}

/// Socket and lifecycle configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Read timeout; also the base of the negotiation, disconnect and keep-alive timers
    #[serde(with = "duration_serde")]
    pub timeout: Duration,

    /// Longest wait of the reactor between two passes
    #[serde(with = "duration_serde")]
    pub poll_interval: Duration,

    /// Maximum number of concurrent connections per reactor
    pub max_connections: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            poll_interval: Duration::from_millis(5),
            max_connections: 1000,
        }
    }
}

impl TransportConfig {
    /// Negotiation and disconnect timeout
    pub fn sub_timeout(&self) -> Duration {
        self.timeout / 3
    }

    /// Outbound silence after which a keep-alive is sent
    pub fn keep_alive_after(&self) -> Duration {
        self.timeout * 2 / 3
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.timeout.as_millis() < 100 {
            errors.push("Timeout too short (minimum: 100ms)".to_string());
        } else if self.timeout.as_secs() > 3600 {
            errors.push("Timeout too long (maximum: 1 hour)".to_string());
        }

        if self.poll_interval.is_zero() {
            errors.push("Poll interval cannot be 0".to_string());
        } else if self.poll_interval >= self.sub_timeout() {
            errors.push("Poll interval must be shorter than a third of the timeout".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        errors
    }
}

/// Certification and queueing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReliabilityConfig {
    /// Transmissions of a certified message before it fails
    pub max_tries: u8,

    /// Wait for an acknowledgement before retransmitting
    #[serde(with = "duration_serde")]
    pub certification_timeout: Duration,

    /// Capacity of each connection's send queue
    pub queue_capacity: usize,

    /// Received certified ids remembered for duplicate suppression
    pub dedup_capacity: usize,

    /// How long a received certified id is remembered
    #[serde(with = "duration_serde")]
    pub dedup_ttl: Duration,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            max_tries: DEFAULT_MAX_TRIES,
            certification_timeout: DEFAULT_CERTIFICATION_TIMEOUT,
            queue_capacity: 10_000,
            dedup_capacity: 4096,
            dedup_ttl: Duration::from_secs(60),
        }
    }
}

impl ReliabilityConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_tries == 0 {
            errors.push("Max tries must be greater than 0".to_string());
        }

        if self.certification_timeout.as_millis() < 10 {
            errors.push("Certification timeout too short (minimum: 10ms)".to_string());
        }

        if self.queue_capacity == 0 {
            errors.push("Queue capacity must be greater than 0".to_string());
        } else if self.queue_capacity > 1_000_000 {
            errors.push(format!(
                "Queue capacity too large: {} (max recommended: 1,000,000)",
                self.queue_capacity
            ));
        }

        if self.dedup_capacity == 0 {
            errors.push("Dedup capacity must be greater than 0".to_string());
        }

        // Retries of one message must stay inside the duplicate window
        let retry_span = self.certification_timeout * u32::from(self.max_tries);
        if self.dedup_ttl < retry_span {
            errors.push(format!(
                "Dedup TTL ({}ms) shorter than the retry span ({}ms)",
                self.dedup_ttl.as_millis(),
                retry_span.as_millis()
            ));
        }

        errors
    }
}

/// Buffer sizes
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BufferConfig {
    /// Size of each pooled frame buffer for stream transports
    pub scratch_buffer_size: usize,

    /// Number of frame buffers kept in the pool
    pub pool_size: usize,

    /// Initial receive buffer capacity per connection
    pub receive_buffer_size: usize,

    /// Largest datagram written by the datagram transport
    pub datagram_payload_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            scratch_buffer_size: DEFAULT_SCRATCH_BUFFER_SIZE,
            pool_size: 4,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            datagram_payload_size: DEFAULT_DATAGRAM_PAYLOAD_SIZE,
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.scratch_buffer_size < 1024 {
            errors.push("Scratch buffer too small (minimum: 1 KB)".to_string());
        } else if self.scratch_buffer_size > i32::MAX as usize {
            errors.push("Scratch buffer larger than a frame length can express".to_string());
        }

        if self.pool_size == 0 {
            errors.push("Pool size must be greater than 0".to_string());
        }

        if self.receive_buffer_size < 64 {
            errors.push("Receive buffer too small (minimum: 64 bytes)".to_string());
        }

        if self.datagram_payload_size < 64 {
            errors.push("Datagram payload too small (minimum: 64 bytes)".to_string());
        } else if self.datagram_payload_size > 65_507 {
            errors.push(format!(
                "Datagram payload too large: {} (maximum: 65507)",
                self.datagram_payload_size
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level, overridden by `RUST_LOG` when set
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("msgwire"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
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
