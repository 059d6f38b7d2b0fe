//! Configuration loader with file and environment variable support.

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "notify.toml",
    "./config/config.toml",
    "/etc/notify-core/config.toml",
];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("NOTIFY_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        if let Ok(val) = env::var("NOTIFY_BROKER_URL") {
            config.broker.url = val;
        }
        if let Ok(val) = env::var("NOTIFY_DATABASE_URL") {
            config.database.url = val;
        }
        if let Ok(val) = env::var("NOTIFY_REDIS_URL") {
            config.cache.url = val;
        }
        if let Ok(val) = env::var("NOTIFY_INGESTION_BATCH_SIZE") {
            if let Ok(n) = val.parse() {
                config.ingestion.batch_size = n;
            }
        }
        if let Ok(val) = env::var("NOTIFY_RENDERER_BATCH_SIZE") {
            if let Ok(n) = val.parse() {
                config.renderer.batch_size = n;
            }
        }
        if let Ok(val) = env::var("NOTIFY_WORKER_BATCH_SIZE") {
            if let Ok(n) = val.parse() {
                config.worker.batch_size = n;
            }
        }
        if let Ok(val) = env::var("NOTIFY_DEDUP_TTL_SECONDS") {
            if let Ok(n) = val.parse() {
                config.dedup_ttl_seconds = n;
            }
        }
        if let Ok(val) = env::var("NOTIFY_RATE_LIMIT_PER_HOUR") {
            if let Ok(n) = val.parse() {
                config.rate_limit_per_hour = n;
            }
        }
        if let Ok(val) = env::var("NOTIFY_MAX_RETRIES") {
            if let Ok(n) = val.parse() {
                config.max_retries = n;
            }
        }
        if let Ok(val) = env::var("NOTIFY_METRICS_PORT") {
            if let Ok(n) = val.parse() {
                config.metrics_port = n;
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_wins_over_file_default() {
        std::env::set_var("NOTIFY_MAX_RETRIES", "7");
        let config = ConfigLoader::new().load().unwrap();
        assert_eq!(config.max_retries, 7);
        std::env::remove_var("NOTIFY_MAX_RETRIES");
    }
}
