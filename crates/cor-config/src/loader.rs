//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "correlay.toml",
    "./config/config.toml",
    "./config/correlay.toml",
    "/etc/correlay/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        // Start with defaults
        let mut config = AppConfig::default();

        // Try to load from file
        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        // Apply environment variable overrides
        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        // Check explicit path first
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        // Check CORRELAY_CONFIG env var
        if let Ok(path) = env::var("CORRELAY_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        // Search standard paths
        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // Broker
        if let Ok(val) = env::var("CORRELAY_BROKER_MODE") {
            config.broker.mode = val;
        }
        if let Ok(val) = env::var("CORRELAY_NATS_URL") {
            config.broker.url = val;
        }
        if let Ok(val) = env::var("CORRELAY_STREAM_NAME") {
            config.broker.stream_name = val;
        }
        if let Ok(val) = env::var("CORRELAY_STREAM_SUBJECTS") {
            config.broker.stream_subjects =
                val.split(',').map(|s| s.trim().to_string()).collect();
        }

        // Store
        if let Ok(val) = env::var("CORRELAY_DATABASE_URL") {
            config.store.url = val;
        }
        if let Ok(val) = env::var("CORRELAY_DATABASE_MAX_CONNECTIONS") {
            if let Ok(max) = val.parse() {
                config.store.max_connections = max;
            }
        }

        // Listener
        if let Ok(val) = env::var("CORRELAY_LISTENER_BATCH_SIZE") {
            if let Ok(size) = val.parse() {
                config.listener.batch_size = size;
            }
        }
        if let Ok(val) = env::var("CORRELAY_LISTENER_MAX_WAIT_MS") {
            if let Ok(wait) = val.parse() {
                config.listener.max_wait_ms = wait;
            }
        }
        if let Ok(val) = env::var("CORRELAY_LISTENER_POLL_INTERVAL_MS") {
            if let Ok(interval) = val.parse() {
                config.listener.poll_interval_ms = interval;
            }
        }
        if let Ok(val) = env::var("CORRELAY_LISTENER_ACK_WAIT_SECS") {
            if let Ok(wait) = val.parse() {
                config.listener.ack_wait_secs = wait;
            }
        }
        if let Ok(val) = env::var("CORRELAY_LISTENER_MAX_DELIVER") {
            if let Ok(max) = val.parse() {
                config.listener.max_deliver = max;
            }
        }
        if let Ok(val) = env::var("CORRELAY_LISTENER_MAX_ACK_PENDING") {
            if let Ok(max) = val.parse() {
                config.listener.max_ack_pending = max;
            }
        }
        if let Ok(val) = env::var("CORRELAY_LISTENER_ACK_UNMATCHED") {
            config.listener.ack_unmatched = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var("CORRELAY_DEFAULT_TIMEOUT_MS") {
            if let Ok(timeout) = val.parse() {
                config.listener.default_timeout_ms = timeout;
            }
        }

        // Recovery
        if let Ok(val) = env::var("CORRELAY_RECOVERY_ENABLED") {
            config.recovery.enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var("CORRELAY_RECOVERY_LOCK_KEY") {
            config.recovery.lock_key = val;
        }
        if let Ok(val) = env::var("CORRELAY_RECOVERY_LOCK_TTL_SECS") {
            if let Ok(ttl) = val.parse() {
                config.recovery.lock_ttl_secs = ttl;
            }
        }

        // Sweeper
        if let Ok(val) = env::var("CORRELAY_SWEEPER_ENABLED") {
            config.sweeper.enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var("CORRELAY_SWEEPER_INTERVAL_SECS") {
            if let Ok(interval) = val.parse() {
                config.sweeper.check_interval_secs = interval;
            }
        }
        if let Ok(val) = env::var("CORRELAY_SWEEPER_BATCH_SIZE") {
            if let Ok(size) = val.parse() {
                config.sweeper.batch_size = size;
            }
        }

        // HTTP
        if let Ok(val) = env::var("CORRELAY_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Ok(val) = env::var("CORRELAY_HTTP_HOST") {
            config.http.host = val;
        }

        // General
        if let Ok(val) = env::var("CORRELAY_INSTANCE_ID") {
            config.instance_id = val;
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
