//! Configuration loading
//!
//! Bootstrap configuration comes from a TOML file. Resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. Per-user then system-wide config file
//!
//! Tracking thresholds (pickup radius, sample timeout) have no compiled
//! defaults: a config without them is rejected.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "PAWTRAIL_CONFIG";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    /// SQLite database file; defaults to `<data dir>/pawtrail.db`
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Local status HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Account whose in-flight walks are restored on cold start
    #[serde(default)]
    pub account_id: Option<uuid::Uuid>,

    pub api: ApiConfig,

    pub tracking: TrackingConfig,

    #[serde(default)]
    pub uplink: UplinkConfig,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote walk API endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,

    #[serde(default = "default_api_timeout_secs")]
    pub timeout_secs: u64,

    /// Bearer token sent with every request
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Location sampling and lifecycle guards
#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// A sample within this distance of the pickup address confirms arrival
    pub pickup_radius_m: f64,

    /// An active session without samples for this long is flagged stale
    pub sample_timeout_secs: u64,

    #[serde(default = "default_foreground_interval_ms")]
    pub foreground_interval_ms: u64,

    #[serde(default = "default_background_interval_ms")]
    pub background_interval_ms: u64,

    /// Fixes closer than this to the previous committed sample are skipped (0 = off)
    #[serde(default)]
    pub min_distance_m: f64,

    /// Start the walk automatically once a pickup-confirming sample is acknowledged
    #[serde(default)]
    pub auto_start_on_pickup: bool,
}

impl TrackingConfig {
    pub fn sample_timeout(&self) -> Duration {
        Duration::from_secs(self.sample_timeout_secs)
    }

    pub fn foreground_interval(&self) -> Duration {
        Duration::from_millis(self.foreground_interval_ms)
    }

    pub fn background_interval(&self) -> Duration {
        Duration::from_millis(self.background_interval_ms)
    }
}

/// Uplink batching and backoff
#[derive(Debug, Clone, Deserialize)]
pub struct UplinkConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Jitter as a fraction of the computed delay (0.0 - 1.0)
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    /// Idle re-check interval when no new samples arrive
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter_ratio: default_jitter_ratio(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// What happens to unacknowledged samples when a walk is cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CancelPolicy {
    /// Keep them for a later forensic upload
    #[default]
    Retain,
    /// Delete them at cancellation time
    Purge,
}

/// Durable sample buffer limits
#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Total buffered samples across all sessions before enqueue fails
    #[serde(default = "default_max_samples")]
    pub max_samples: u64,
    #[serde(default)]
    pub cancel_policy: CancelPolicy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_samples: default_max_samples(),
            cancel_policy: CancelPolicy::default(),
        }
    }
}

/// Longest accepted terminal-session retention (one year)
pub const MAX_RETENTION_SECS: u64 = 365 * 24 * 60 * 60;

/// Terminal-session retention
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_port() -> u16 {
    5780
}
fn default_api_timeout_secs() -> u64 {
    30
}
fn default_foreground_interval_ms() -> u64 {
    5_000
}
fn default_background_interval_ms() -> u64 {
    30_000
}
fn default_batch_size() -> usize {
    50
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_jitter_ratio() -> f64 {
    0.2
}
fn default_poll_interval_ms() -> u64 {
    10_000
}
fn default_max_samples() -> u64 {
    100_000
}
fn default_retention_secs() -> u64 {
    300
}
fn default_reap_interval_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl TomlConfig {
    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TomlConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Reject values the tracker cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(Error::Config("api.base_url must not be empty".to_string()));
        }
        if !(self.tracking.pickup_radius_m.is_finite() && self.tracking.pickup_radius_m > 0.0) {
            return Err(Error::Config(
                "tracking.pickup_radius_m must be a positive number".to_string(),
            ));
        }
        if self.tracking.sample_timeout_secs == 0 {
            return Err(Error::Config(
                "tracking.sample_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.tracking.foreground_interval_ms == 0 || self.tracking.background_interval_ms == 0 {
            return Err(Error::Config(
                "tracking sample intervals must be greater than zero".to_string(),
            ));
        }
        if self.uplink.batch_size == 0 {
            return Err(Error::Config("uplink.batch_size must be greater than zero".to_string()));
        }
        if self.uplink.max_attempts == 0 {
            return Err(Error::Config("uplink.max_attempts must be greater than zero".to_string()));
        }
        if !(0.0..=1.0).contains(&self.uplink.jitter_ratio) {
            return Err(Error::Config("uplink.jitter_ratio must be within 0.0-1.0".to_string()));
        }
        if self.buffer.max_samples == 0 {
            return Err(Error::Config("buffer.max_samples must be greater than zero".to_string()));
        }
        if self.registry.retention_secs > MAX_RETENTION_SECS {
            return Err(Error::Config(format!(
                "registry.retention_secs must not exceed {}",
                MAX_RETENTION_SECS
            )));
        }
        Ok(())
    }

    /// Database path, falling back to the OS data directory
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("pawtrail.db"))
    }
}

/// Locate the config file
///
/// Priority: CLI argument → `PAWTRAIL_CONFIG` → user config dir → /etc (Linux).
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = cli_arg {
        return Ok(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    let user_config = dirs::config_dir().map(|d| d.join("pawtrail").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Ok(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/pawtrail/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }
    }

    Err(Error::Config("No config file found".to_string()))
}

/// OS-dependent default data directory
pub fn default_data_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("pawtrail"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/pawtrail"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("pawtrail"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/pawtrail"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("pawtrail"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\pawtrail"))
    } else {
        PathBuf::from("./pawtrail_data")
    }
}
