//! Correlay Configuration System
//!
//! This crate provides TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub listener: ListenerConfig,
    pub recovery: RecoveryConfig,
    pub sweeper: SweeperConfig,
    pub http: HttpConfig,

    /// Instance identifier used as the recovery lock owner.
    /// Generated at startup when empty.
    pub instance_id: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            store: StoreConfig::default(),
            listener: ListenerConfig::default(),
            recovery: RecoveryConfig::default(),
            sweeper: SweeperConfig::default(),
            http: HttpConfig::default(),
            instance_id: String::new(),
        }
    }
}

/// Broker connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker mode: embedded (in-process, dev/test) or nats
    pub mode: String,
    /// NATS server URL
    pub url: String,
    /// JetStream stream holding request/response subjects
    pub stream_name: String,
    /// Subjects captured by the stream
    pub stream_subjects: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mode: "embedded".to_string(),
            url: "nats://localhost:4222".to_string(),
            stream_name: "CORRELAY".to_string(),
            stream_subjects: vec!["correlay.>".to_string()],
        }
    }
}

/// Request/lock store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database URL (sqlite:// or postgres://)
    pub url: String,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/correlay.db?mode=rwc".to_string(),
            max_connections: 10,
        }
    }
}

/// Listener and pull-subscription tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Messages pulled per fetch call
    pub batch_size: usize,
    /// How long one fetch call waits for its first message, in milliseconds
    pub max_wait_ms: u64,
    /// Sleep between batches, in milliseconds
    pub poll_interval_ms: u64,
    /// Broker-side acknowledgment deadline, in seconds
    pub ack_wait_secs: u64,
    /// Delivery attempts before the broker dead-letters a message
    pub max_deliver: i64,
    /// Maximum unacknowledged messages outstanding per consumer
    pub max_ack_pending: i64,
    /// Acknowledge responses that match no pending request.
    /// Protects queue health; disable to let orphans redeliver.
    pub ack_unmatched: bool,
    /// Default request timeout for tracked publishes, in milliseconds
    pub default_timeout_ms: i64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_wait_ms: 1000,
            poll_interval_ms: 100,
            ack_wait_secs: 30,
            max_deliver: 3,
            max_ack_pending: 1000,
            ack_unmatched: true,
            default_timeout_ms: 30_000,
        }
    }
}

/// Distributed recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Run the recovery pass at startup
    pub enabled: bool,
    /// Lock key shared by all instances
    pub lock_key: String,
    /// Lease TTL in seconds
    pub lock_ttl_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lock_key: "listener-recovery".to_string(),
            lock_ttl_secs: 30,
        }
    }
}

/// Request timeout sweeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub enabled: bool,
    /// Sweep interval in seconds
    pub check_interval_secs: u64,
    /// Requests examined per sweep
    pub batch_size: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: 10,
            batch_size: 100,
        }
    }
}

/// Health/metrics HTTP port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8090,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::new();
        loader.load()
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Correlay Configuration
# Environment variables override these settings

# Recovery lock owner id; auto-generated at startup when empty.
# Root-level key: must stay above the first [section] header.
instance_id = ""

[broker]
mode = "embedded"  # embedded or nats
url = "nats://localhost:4222"
stream_name = "CORRELAY"
stream_subjects = ["correlay.>"]

[store]
url = "sqlite://./data/correlay.db?mode=rwc"
max_connections = 10

[listener]
batch_size = 10
max_wait_ms = 1000
poll_interval_ms = 100
ack_wait_secs = 30
max_deliver = 3
max_ack_pending = 1000
ack_unmatched = true
default_timeout_ms = 30000

[recovery]
enabled = true
lock_key = "listener-recovery"
lock_ttl_secs = 30

[sweeper]
enabled = true
check_interval_secs = 10
batch_size = 100

[http]
port = 8090
host = "0.0.0.0"
"#
        .to_string()
    }
}
