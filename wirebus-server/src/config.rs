//! Broker configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via WIREBUS_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use wirebus_protocol::{DEFAULT_PORT, DEFAULT_QUEUE_CAPACITY, MAX_PAYLOAD_SIZE};

/// Default metrics port.
pub const DEFAULT_METRICS_PORT: u16 = 9420;

/// Broker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Payload and queue limits.
    pub limits: LimitsConfig,
    /// Channel lifecycle configuration.
    pub channels: ChannelConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("WIREBUS_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.limits.apply_env_overrides();
        self.channels.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks that the configuration describes a usable broker.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.keepalive_secs == 0 {
            return Err(ConfigError::ValidationError(
                "network.keepalive_secs must be greater than zero".to_string(),
            ));
        }
        if self.network.write_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "network.write_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.limits.channel_queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "limits.channel_queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.limits.connection_queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "limits.connection_queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.limits.max_payload_size as u64 > u32::MAX as u64 {
            return Err(ConfigError::ValidationError(format!(
                "limits.max_payload_size {} exceeds the wire maximum {}",
                self.limits.max_payload_size,
                u32::MAX
            )));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Read deadline extension granted by each PING or PONG, in seconds.
    pub keepalive_secs: u64,
    /// Per-frame write deadline, in seconds.
    pub write_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_connections: 10_000,
            keepalive_secs: 30,
            write_timeout_secs: 5,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("WIREBUS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(max) = std::env::var("WIREBUS_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(keepalive) = std::env::var("WIREBUS_KEEPALIVE") {
            if let Ok(secs) = keepalive.parse() {
                self.keepalive_secs = secs;
            }
        }

        if let Ok(timeout) = std::env::var("WIREBUS_WRITE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.write_timeout_secs = secs;
            }
        }
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// Payload and queue limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum payload size in bytes.
    pub max_payload_size: usize,
    /// Capacity of each channel's inbound queue.
    pub channel_queue_capacity: usize,
    /// Capacity of each connection's outbound queue.
    pub connection_queue_capacity: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD_SIZE,
            channel_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            connection_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl LimitsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(max) = std::env::var("WIREBUS_MAX_PAYLOAD") {
            if let Ok(n) = max.parse() {
                self.max_payload_size = n;
            }
        }

        if let Ok(cap) = std::env::var("WIREBUS_CHANNEL_QUEUE") {
            if let Ok(n) = cap.parse() {
                self.channel_queue_capacity = n;
            }
        }

        if let Ok(cap) = std::env::var("WIREBUS_CONNECTION_QUEUE") {
            if let Ok(n) = cap.parse() {
                self.connection_queue_capacity = n;
            }
        }
    }
}

/// What happens to a channel once its last subscriber leaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRetention {
    /// Channels live as long as the broker.
    #[default]
    Forever,
    /// Channels are removed when their subscriber set becomes empty.
    ReclaimWhenEmpty,
}

impl ChannelRetention {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "forever" => Some(ChannelRetention::Forever),
            "reclaim_when_empty" | "reclaim" => Some(ChannelRetention::ReclaimWhenEmpty),
            _ => None,
        }
    }
}

/// Channel lifecycle configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub retention: ChannelRetention,
}

impl ChannelConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(retention) = std::env::var("WIREBUS_CHANNEL_RETENTION") {
            if let Some(parsed) = ChannelRetention::parse(&retention) {
                self.retention = parsed;
            }
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_METRICS_PORT)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("WIREBUS_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Ok(addr) = std::env::var("WIREBUS_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
