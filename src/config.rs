//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::StoreError;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    pub logging: LoggingConfig,
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
    /// Maximum pooled connections (default: 10)
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Seconds to wait for a pooled connection or the write lock (default: 5)
    #[serde(default = "default_acquire_timeout_seconds")]
    pub acquire_timeout_seconds: u64,
    /// SQLite busy handler timeout in milliseconds (default: 5000)
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    /// Database settings for `path` with every other value at its default.
    pub fn at(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            pool_size: default_pool_size(),
            acquire_timeout_seconds: default_acquire_timeout_seconds(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_pool_size() -> u32 {
    10
}

fn default_acquire_timeout_seconds() -> u64 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

/// Content rules
#[derive(Debug, Clone, Deserialize)]
pub struct ContentConfig {
    /// Versions kept per content item; 0 keeps every version
    pub version_retention: usize,
    pub max_title_length: usize,
    pub max_body_length: usize,
    pub max_excerpt_length: usize,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            version_retention: 50,
            max_title_length: 500,
            max_body_length: 500_000,
            max_excerpt_length: 2_000,
        }
    }
}

/// Periodic job configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Scheduled-publish sweep interval in seconds (default: 60)
    pub publish_interval_seconds: u64,
    /// Retention/aggregation job interval in seconds (default: 3600)
    pub maintenance_interval_seconds: u64,
    /// Rows handled per sweep transaction
    pub sweep_batch_size: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            publish_interval_seconds: 60,
            maintenance_interval_seconds: 3600,
            sweep_batch_size: 100,
        }
    }
}

/// Analytics retention windows
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyticsConfig {
    pub raw_event_retention_hours: u32,
    /// Completed hours re-aggregated on each run
    pub aggregation_lookback_hours: u32,
    pub hourly_retention_days: u32,
    /// 0 keeps daily roll-ups forever
    pub daily_retention_days: u32,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            raw_event_retention_hours: 48,
            aggregation_lookback_hours: 2,
            hourly_retention_days: 90,
            daily_retention_days: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (QUILLSTORE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, StoreError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("database.path", "data/quillstore.db")?
            .set_default("database.pool_size", 10)?
            .set_default("database.acquire_timeout_seconds", 5)?
            .set_default("database.busy_timeout_ms", 5000)?
            .set_default("content.version_retention", 50)?
            .set_default("content.max_title_length", 500)?
            .set_default("content.max_body_length", 500_000)?
            .set_default("content.max_excerpt_length", 2_000)?
            .set_default("scheduler.publish_interval_seconds", 60)?
            .set_default("scheduler.maintenance_interval_seconds", 3600)?
            .set_default("scheduler.sweep_batch_size", 100)?
            .set_default("analytics.raw_event_retention_hours", 48)?
            .set_default("analytics.aggregation_lookback_hours", 2)?
            .set_default("analytics.hourly_retention_days", 90)?
            .set_default("analytics.daily_retention_days", 0)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("QUILLSTORE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app_config: Self = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Configuration for a database at `path` with all defaults applied.
    pub fn for_database(path: impl AsRef<Path>) -> Self {
        Self {
            database: DatabaseConfig::at(path),
            content: ContentConfig::default(),
            scheduler: SchedulerConfig::default(),
            analytics: AnalyticsConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.database.pool_size == 0 {
            return Err(StoreError::Config(
                "database.pool_size must be greater than 0".to_string(),
            ));
        }

        if self.database.acquire_timeout_seconds == 0 {
            return Err(StoreError::Config(
                "database.acquire_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.scheduler.publish_interval_seconds == 0
            || self.scheduler.maintenance_interval_seconds == 0
        {
            return Err(StoreError::Config(
                "scheduler intervals must be greater than 0".to_string(),
            ));
        }

        if self.scheduler.sweep_batch_size == 0 {
            return Err(StoreError::Config(
                "scheduler.sweep_batch_size must be greater than 0".to_string(),
            ));
        }

        if self.analytics.aggregation_lookback_hours >= self.analytics.raw_event_retention_hours {
            return Err(StoreError::Config(
                "analytics.aggregation_lookback_hours must be shorter than analytics.raw_event_retention_hours"
                    .to_string(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(StoreError::Config(format!(
                "logging.format must be pretty or json, got {}",
                self.logging.format
            )));
        }

        if self.content.version_retention == 0 {
            tracing::warn!("content.version_retention=0 keeps every content version");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig::for_database("/tmp/quillstore-test.db")
    }

    #[test]
    fn validate_accepts_defaults() {
        let config = valid_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.database.pool_size, 10);
        assert_eq!(config.content.version_retention, 50);
        assert_eq!(config.scheduler.publish_interval_seconds, 60);
    }

    #[test]
    fn validate_rejects_empty_pool() {
        let mut config = valid_config();
        config.database.pool_size = 0;

        let error = config
            .validate()
            .expect_err("a zero-sized pool must fail");
        assert!(matches!(
            error,
            StoreError::Config(message) if message.contains("database.pool_size")
        ));
    }

    #[test]
    fn validate_rejects_lookback_beyond_raw_retention() {
        let mut config = valid_config();
        config.analytics.raw_event_retention_hours = 2;
        config.analytics.aggregation_lookback_hours = 2;

        let error = config
            .validate()
            .expect_err("lookback must not outlive raw events");
        assert!(matches!(
            error,
            StoreError::Config(message) if message.contains("aggregation_lookback_hours")
        ));
    }

    #[test]
    fn validate_rejects_unknown_log_format() {
        let mut config = valid_config();
        config.logging.format = "xml".to_string();

        assert!(config.validate().is_err());
    }
}
