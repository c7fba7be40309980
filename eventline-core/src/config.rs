//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/eventline/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/eventline/` (~/.config/eventline/)
//! - Data: `$XDG_DATA_HOME/eventline/` (~/.local/share/eventline/)
//! - State/Logs: `$XDG_STATE_HOME/eventline/` (~/.local/state/eventline/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Event pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How aggressively event metadata is filtered before storage
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyMode {
    /// Metadata passes through unchanged
    Standard,
    /// Allow-list filtering plus identity-field stripping
    #[default]
    Enhanced,
}

impl PrivacyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivacyMode::Standard => "standard",
            PrivacyMode::Enhanced => "enhanced",
        }
    }
}

/// Event pipeline configuration
///
/// When `api_endpoint` is set, events are queued locally and delivered in
/// batches. Without it the pipeline runs in immediate mode and nothing is
/// queued.
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Database file name (without extension) under the data directory
    #[serde(default = "default_database_name")]
    pub database_name: String,

    /// Collector URL batches are POSTed to
    pub api_endpoint: Option<String>,

    /// Bearer token sent with each delivery (optional)
    pub api_key: Option<String>,

    /// Events per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seconds between sync ticks
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u64,

    /// Days a delivered batch record is kept
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Metadata filtering mode
    #[serde(default)]
    pub privacy_mode: PrivacyMode,

    /// Failed deliveries before a batch is marked failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay in seconds before a failed batch is retried
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Hours between retention sweeps
    #[serde(default = "default_retention_sweep_hours")]
    pub retention_sweep_hours: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_name: default_database_name(),
            api_endpoint: None,
            api_key: None,
            batch_size: default_batch_size(),
            sync_interval: default_sync_interval(),
            retention_days: default_retention_days(),
            privacy_mode: PrivacyMode::default(),
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff(),
            timeout_secs: default_timeout(),
            retention_sweep_hours: default_retention_sweep_hours(),
        }
    }
}

impl PipelineConfig {
    /// Whether events are queued and delivered in batches
    pub fn is_batched(&self) -> bool {
        self.api_endpoint.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.database_name.trim().is_empty() {
            return Err(Error::Config(
                "pipeline.database_name must not be empty".to_string(),
            ));
        }
        if self
            .database_name
            .contains(|c: char| c == '/' || c == '\\')
        {
            return Err(Error::Config(
                "pipeline.database_name must be a file name, not a path".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::Config(
                "pipeline.batch_size must be at least 1".to_string(),
            ));
        }
        if self.sync_interval == 0 {
            return Err(Error::Config(
                "pipeline.sync_interval must be at least 1 second".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(Error::Config(
                "pipeline.max_retries must be at least 1".to_string(),
            ));
        }
        if self.sync_interval > MAX_SYNC_INTERVAL_SECS {
            return Err(Error::Config(format!(
                "pipeline.sync_interval must be at most {} seconds",
                MAX_SYNC_INTERVAL_SECS
            )));
        }
        if !(1..=MAX_RETENTION_SWEEP_HOURS).contains(&self.retention_sweep_hours) {
            return Err(Error::Config(format!(
                "pipeline.retention_sweep_hours must be between 1 and {}",
                MAX_RETENTION_SWEEP_HOURS
            )));
        }
        if let Some(endpoint) = &self.api_endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(Error::Config(format!(
                    "pipeline.api_endpoint must be an http(s) URL, got {}",
                    endpoint
                )));
            }
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval)
    }

    pub fn retention_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention_sweep_hours.saturating_mul(3600))
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

/// One week
const MAX_SYNC_INTERVAL_SECS: u64 = 7 * 24 * 3600;

/// One year
const MAX_RETENTION_SWEEP_HOURS: u64 = 365 * 24;

fn default_database_name() -> String {
    "events".to_string()
}

fn default_batch_size() -> usize {
    20
}

fn default_sync_interval() -> u64 {
    60
}

fn default_retention_days() -> u32 {
    90
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    30
}

fn default_timeout() -> u64 {
    30
}

fn default_retention_sweep_hours() -> u64 {
    24
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.pipeline.validate()?;
        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/eventline/config.toml` (~/.config/eventline/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("eventline").join("config.toml")
    }

    /// Returns the data directory path (for SQLite databases)
    ///
    /// `$XDG_DATA_HOME/eventline/` (~/.local/share/eventline/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("eventline")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/eventline/` (~/.local/state/eventline/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("eventline")
    }

    /// Returns the database file path for the configured database name
    ///
    /// `$XDG_DATA_HOME/eventline/<database_name>.db`
    pub fn database_path(&self) -> PathBuf {
        Self::data_dir().join(format!("{}.db", self.pipeline.database_name))
    }
}
