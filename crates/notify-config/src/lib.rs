//! Configuration for notify-core stage processes: TOML file defaults
//! overridden by environment variables, following the search-path +
//! `apply_env_overrides` structure the rest of this codebase's ambient
//! stack uses.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),
}

/// Root configuration for any notify-core stage binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub ingestion: IngestionConfig,
    pub renderer: RendererConfig,
    pub worker: WorkerConfig,
    pub dedup_ttl_seconds: u64,
    pub rate_limit_per_hour: u32,
    pub max_retries: u32,
    pub metrics_port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            ingestion: IngestionConfig::default(),
            renderer: RendererConfig::default(),
            worker: WorkerConfig::default(),
            dedup_ttl_seconds: 3600,
            rate_limit_per_hour: 10,
            max_retries: 3,
            metrics_port: 9090,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// `sqlite::memory:`, a file path for the embedded dev broker, or a
    /// `nats://` URL for the production JetStream backend.
    pub url: String,
    pub ack_wait_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            ack_wait_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub url: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub batch_size: u32,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self { batch_size: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub batch_size: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self { batch_size: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub batch_size: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { batch_size: 5 }
    }
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_dev_friendly() {
        let config = AppConfig::default();
        assert_eq!(config.broker.url, "sqlite::memory:");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.rate_limit_per_hour, 10);
    }
}
