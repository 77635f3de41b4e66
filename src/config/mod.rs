//! Configuration management for racesync
//!
//! Configuration is loaded from a TOML file, from `RACESYNC_*` environment
//! variables, or taken from defaults, then validated before anything opens.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::scheduler::TriggerConfig;
use crate::server::ServerConfig;
use crate::watchdog::WatchdogConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Tick loop and candidate window
    pub scheduler: TriggerConfig,

    /// Stuck job detection
    pub watchdog: WatchdogConfig,

    /// Operator HTTP API
    pub server: ServerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database path, shared by the scheduler and all workers
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/racesync.db"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RACESYNC_DB_PATH") {
            config.database.path = PathBuf::from(path);
        }

        if let Some(secs) = env_parse("RACESYNC_TICK_INTERVAL_SECS") {
            config.scheduler.tick_interval_secs = secs;
        }
        if let Some(minutes) = env_parse("RACESYNC_LOOKBACK_MINUTES") {
            config.scheduler.lookback_minutes = minutes;
        }
        if let Some(days) = env_parse("RACESYNC_LOOKAHEAD_DAYS") {
            config.scheduler.lookahead_days = days;
        }

        if let Some(enabled) = env_parse("RACESYNC_WATCHDOG_ENABLED") {
            config.watchdog.enabled = enabled;
        }
        if let Some(minutes) = env_parse("RACESYNC_STUCK_TIMEOUT_MINUTES") {
            config.watchdog.stuck_timeout_minutes = minutes;
        }
        if let Some(attempts) = env_parse("RACESYNC_MAX_ATTEMPTS") {
            config.watchdog.max_attempts = attempts;
        }

        if let Ok(addr) = std::env::var("RACESYNC_BIND") {
            config.server.bind_address = addr
                .parse()
                .with_context(|| format!("Invalid RACESYNC_BIND address: {addr}"))?;
        }

        if let Ok(level) = std::env::var("RACESYNC_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("RACESYNC_LOG_FORMAT") {
            config.logging.format = format;
        }

        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.database.path.as_os_str().is_empty() {
            anyhow::bail!("database.path must not be empty");
        }

        self.scheduler
            .validate()
            .map_err(|e| anyhow::anyhow!("scheduler: {e}"))?;

        self.watchdog.validate().map_err(anyhow::Error::msg)?;

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("logging.format must be 'text' or 'json'");
        }

        Ok(())
    }
}
