//! # Configuration Management Module
//!
//! TOML configuration for the decryption engine and the `meshdecrypt` binary.
//!
//! ## Configuration File Format
//!
//! ```toml
//! [decryption]
//! key_cache_ttl_ms = 60000
//! reprocess_batch_size = 10000
//! progress_interval = 10
//! yield_interval = 100
//! event_buffer = 64
//!
//! [storage]
//! data_dir = "./data"
//!
//! [logging]
//! level = "info"
//! file = "meshdecrypt.log"
//! ```
//!
//! Every field has a default, so a partial file (or an empty one) loads fine.
//!
//! ```rust,no_run
//! use meshdecrypt::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     println!("Key cache TTL: {:?}", config.decryption.key_cache_ttl());
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::channel::DEFAULT_KEY_CACHE_TTL_MS;
use crate::reprocess::{
    ReprocessConfig, DEFAULT_BATCH_SIZE, DEFAULT_PROGRESS_INTERVAL, DEFAULT_YIELD_INTERVAL,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub decryption: DecryptionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptionConfig {
    /// How long the channel key list is trusted before it is reloaded (ms).
    #[serde(default = "default_key_cache_ttl_ms")]
    pub key_cache_ttl_ms: u64,
    /// Maximum records examined by one reprocessing sweep.
    #[serde(default = "default_batch_size")]
    pub reprocess_batch_size: usize,
    /// Progress snapshot cadence during a sweep (records).
    #[serde(default = "default_progress_interval")]
    pub progress_interval: usize,
    /// How often a sweep yields to other tasks (records).
    #[serde(default = "default_yield_interval")]
    pub yield_interval: usize,
    /// Capacity of the progress broadcast channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_key_cache_ttl_ms() -> u64 {
    DEFAULT_KEY_CACHE_TTL_MS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_progress_interval() -> usize {
    DEFAULT_PROGRESS_INTERVAL
}

fn default_yield_interval() -> usize {
    DEFAULT_YIELD_INTERVAL
}

fn default_event_buffer() -> usize {
    64
}

impl Default for DecryptionConfig {
    fn default() -> Self {
        Self {
            key_cache_ttl_ms: default_key_cache_ttl_ms(),
            reprocess_batch_size: default_batch_size(),
            progress_interval: default_progress_interval(),
            yield_interval: default_yield_interval(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl DecryptionConfig {
    pub fn key_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.key_cache_ttl_ms)
    }

    pub fn reprocess(&self) -> ReprocessConfig {
        ReprocessConfig {
            batch_size: self.reprocess_batch_size,
            progress_interval: self.progress_interval,
            yield_interval: self.yield_interval,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config {
            logging: LoggingConfig {
                level: default_log_level(),
                file: Some("meshdecrypt.log".to_string()),
            },
            ..Config::default()
        };
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject values that would stall or disable the engine.
    pub fn validate(&self) -> Result<()> {
        let d = &self.decryption;
        if d.reprocess_batch_size == 0 {
            return Err(anyhow!("decryption.reprocess_batch_size must be at least 1"));
        }
        if d.progress_interval == 0 || d.yield_interval == 0 {
            return Err(anyhow!(
                "decryption.progress_interval and decryption.yield_interval must be at least 1"
            ));
        }
        if d.event_buffer == 0 {
            return Err(anyhow!("decryption.event_buffer must be at least 1"));
        }
        if self.storage.data_dir.trim().is_empty() {
            return Err(anyhow!("storage.data_dir must not be empty"));
        }
        if self.logging.level.parse::<log::LevelFilter>().is_err() {
            return Err(anyhow!("logging.level '{}' is not a log level", self.logging.level));
        }
        Ok(())
    }
}
