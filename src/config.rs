//! Configuration for the millrace engine.
//!
//! Supports YAML file and environment variable overrides.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::processing::RetryPolicy;

/// Engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Stream processing configuration.
    pub processing: ProcessingConfig,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage type (sqlite, memory).
    #[serde(rename = "type")]
    pub storage_type: String,
    /// Path to database file.
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: "sqlite".to_string(),
            path: "./data/events.db".to_string(),
        }
    }
}

/// Stream processing configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Fallback poll interval in milliseconds while waiting for new events.
    pub poll_interval_ms: u64,
    /// Capacity of each per-stream wake-up broadcast channel.
    pub channel_capacity: usize,
    /// Minimum retry delay in milliseconds for failed processing.
    pub retry_min_delay_ms: u64,
    /// Maximum retry delay in milliseconds for failed processing.
    pub retry_max_delay_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            channel_capacity: 1024,
            retry_min_delay_ms: 1000,
            retry_max_delay_ms: 60_000,
        }
    }
}

impl ProcessingConfig {
    /// Poll interval for workers waiting on new events.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Retry policy built from the configured delay bounds.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_min_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("MILLRACE_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("STORAGE_PATH") {
            self.storage.path = path;
        }

        if let Ok(storage_type) = std::env::var("STORAGE_TYPE") {
            self.storage.storage_type = storage_type;
        }

        if let Ok(interval) = std::env::var("POLL_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                self.processing.poll_interval_ms = ms;
            }
        }

        if let Ok(delay) = std::env::var("RETRY_MIN_DELAY_MS") {
            if let Ok(ms) = delay.parse() {
                self.processing.retry_min_delay_ms = ms;
            }
        }

        if let Ok(delay) = std::env::var("RETRY_MAX_DELAY_MS") {
            if let Ok(ms) = delay.parse() {
                self.processing.retry_max_delay_ms = ms;
            }
        }

        if let Ok(capacity) = std::env::var("CHANNEL_CAPACITY") {
            if let Ok(size) = capacity.parse() {
                self.processing.channel_capacity = size;
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}
