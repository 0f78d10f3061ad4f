//! Configuration loading and management
//!
//! Application configuration is loaded from `~/.config/drivesync/config.toml`.
//! Tracker thresholds (speed limit, sensitivity, ...) are user settings and
//! live separately in `tracker.toml`, managed by [`crate::ConfigStore`].
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/drivesync/` (~/.config/drivesync/)
//! - Data: `$XDG_DATA_HOME/drivesync/` (~/.local/share/drivesync/)
//! - State/Logs: `$XDG_STATE_HOME/drivesync/` (~/.local/state/drivesync/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Largest position batch the remote API accepts.
pub const MAX_POSITION_BATCH: usize = 1000;

/// Largest event batch the remote API accepts.
pub const MAX_EVENT_BATCH: usize = 500;

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
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Remote API endpoint (optional until sync is used)
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Sync cadence and batch sizes
    #[serde(default)]
    pub sync: SyncConfig,

    /// How long local records are kept
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
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

/// Remote API configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    /// Base URL of the API, e.g. `https://fleet.example.com/api`
    pub base_url: Option<String>,

    /// Bearer token sent with every request
    pub api_token: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_token: None,
            timeout_secs: default_remote_timeout(),
        }
    }
}

impl RemoteConfig {
    /// Check if the remote endpoint is configured
    pub fn is_ready(&self) -> bool {
        self.base_url.as_deref().is_some_and(|url| !url.is_empty())
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::Config(format!(
                    "remote.base_url must start with http:// or https://, got {:?}",
                    url
                )));
            }
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "remote.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_remote_timeout() -> u64 {
    30
}

/// Sync engine configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Seconds between periodic sync cycles
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,

    /// Positions per request (max 1000)
    #[serde(default = "default_position_batch_size")]
    pub position_batch_size: usize,

    /// Events per request (max 500)
    #[serde(default = "default_event_batch_size")]
    pub event_batch_size: usize,

    /// Seconds between reachability checks of the remote in watch mode
    #[serde(default = "default_reachability_interval")]
    pub reachability_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
            position_batch_size: default_position_batch_size(),
            event_batch_size: default_event_batch_size(),
            reachability_secs: default_reachability_interval(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(Error::Config(
                "sync.interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.reachability_secs == 0 {
            return Err(Error::Config(
                "sync.reachability_secs must be greater than 0".to_string(),
            ));
        }
        if self.position_batch_size == 0 || self.position_batch_size > MAX_POSITION_BATCH {
            return Err(Error::Config(format!(
                "sync.position_batch_size must be between 1 and {}",
                MAX_POSITION_BATCH
            )));
        }
        if self.event_batch_size == 0 || self.event_batch_size > MAX_EVENT_BATCH {
            return Err(Error::Config(format!(
                "sync.event_batch_size must be between 1 and {}",
                MAX_EVENT_BATCH
            )));
        }
        Ok(())
    }
}

fn default_sync_interval() -> u64 {
    300
}

fn default_reachability_interval() -> u64 {
    30
}

fn default_position_batch_size() -> usize {
    MAX_POSITION_BATCH
}

fn default_event_batch_size() -> usize {
    MAX_EVENT_BATCH
}

/// Retention windows, in days
#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    #[serde(default = "default_position_days")]
    pub position_days: u32,

    #[serde(default = "default_event_days")]
    pub event_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            position_days: default_position_days(),
            event_days: default_event_days(),
        }
    }
}

impl RetentionConfig {
    pub fn position_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.position_days))
    }

    pub fn event_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.event_days))
    }
}

fn default_position_days() -> u32 {
    7
}

fn default_event_days() -> u32 {
    30
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

        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.remote.validate()?;
        self.sync.validate()?;
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/drivesync/config.toml` (~/.config/drivesync/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("drivesync").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database and tracker settings)
    ///
    /// `$XDG_DATA_HOME/drivesync/` (~/.local/share/drivesync/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("drivesync")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/drivesync/` (~/.local/state/drivesync/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("drivesync")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/drivesync/drivesync.db`
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("drivesync.db")
    }

    /// Returns the tracker settings path
    ///
    /// `$XDG_DATA_HOME/drivesync/tracker.toml`
    pub fn tracker_config_path() -> PathBuf {
        Self::data_dir().join("tracker.toml")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/drivesync/drivesync.log` (~/.local/state/drivesync/drivesync.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("drivesync.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
