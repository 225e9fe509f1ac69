//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/courier/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/courier/` (~/.config/courier/)
//! - Data: `$XDG_DATA_HOME/courier/` (~/.local/share/courier/), offline envelopes
//! - State/Logs: `$XDG_STATE_HOME/courier/` (~/.local/state/courier/)
//!
//! Options carried in the DSN query string take precedence over the file.

use crate::dsn::Dsn;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
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
    /// Where envelopes are sent. Without a DSN the pipeline is disabled.
    #[serde(default)]
    pub dsn: Option<String>,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Offline buffer configuration
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Transport configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    /// Maximum number of outstanding requests
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Response read timeout in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Default timeout for `Pipeline::flush`
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,

    /// Grace period for in-flight requests on close
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Backoff applied to a 429 without rate limit headers
    #[serde(default = "default_retry_after_secs")]
    pub default_retry_after_secs: u64,

    /// Client name reported in the auth header
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// Extra headers sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            flush_timeout_ms: default_flush_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            default_retry_after_secs: default_retry_after_secs(),
            client_name: default_client_name(),
            headers: BTreeMap::new(),
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn default_retry_after(&self) -> Duration {
        Duration::from_secs(self.default_retry_after_secs)
    }

    /// `<client_name>/<crate version>`, as sent in `sentry_client`
    pub fn client_id(&self) -> String {
        format!("{}/{}", self.client_name, env!("CARGO_PKG_VERSION"))
    }
}

fn default_max_queue_size() -> usize {
    30
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_read_timeout_ms() -> u64 {
    5000
}

fn default_flush_timeout_ms() -> u64 {
    15000
}

fn default_shutdown_timeout_ms() -> u64 {
    1000
}

fn default_retry_after_secs() -> u64 {
    60
}

fn default_client_name() -> String {
    "courier.rust".to_string()
}

/// Offline buffer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BufferConfig {
    /// Store envelopes that could not be sent
    #[serde(default = "default_buffer_enabled")]
    pub enabled: bool,

    /// Directory for buffered envelopes (default: data dir)
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Maximum number of stored envelopes
    #[serde(default = "default_buffer_max_events")]
    pub max_events: usize,

    /// Seconds between flush attempts
    #[serde(default = "default_buffer_flush_interval")]
    pub flush_interval_secs: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            enabled: default_buffer_enabled(),
            dir: None,
            max_events: default_buffer_max_events(),
            flush_interval_secs: default_buffer_flush_interval(),
        }
    }
}

impl BufferConfig {
    /// Configured directory, or `$XDG_DATA_HOME/courier/envelopes`
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| Config::data_dir().join("envelopes"))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

fn default_buffer_enabled() -> bool {
    true
}

fn default_buffer_max_events() -> usize {
    10
}

fn default_buffer_flush_interval() -> u64 {
    60
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

        Ok(config)
    }

    /// Parse the configured DSN
    pub fn parsed_dsn(&self) -> Result<Dsn> {
        self.dsn
            .as_deref()
            .ok_or_else(|| Error::Config("dsn is required".to_string()))?
            .parse()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.transport.max_queue_size == 0 {
            return Err(Error::Config(
                "transport.max_queue_size must be at least 1".to_string(),
            ));
        }
        if self.buffer.flush_interval_secs == 0 {
            return Err(Error::Config(
                "buffer.flush_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.transport.client_name.is_empty() {
            return Err(Error::Config(
                "transport.client_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Override settings with options carried in the DSN query string.
    ///
    /// Recognised keys: `timeout` (ms), `async.queuesize`,
    /// `async.shutdowntimeout` (ms), `buffer.enabled`, `buffer.dir`,
    /// `buffer.size`, `buffer.flushtime` (ms). Unparseable values are
    /// ignored with a warning.
    pub fn apply_dsn_options(&mut self, dsn: &Dsn) {
        if let Some(ms) = dsn_option::<u64>(dsn, "timeout") {
            self.transport.connect_timeout_ms = ms;
            self.transport.read_timeout_ms = ms;
        }
        if let Some(size) = dsn_option::<usize>(dsn, "async.queuesize") {
            self.transport.max_queue_size = size;
        }
        if let Some(ms) = dsn_option::<u64>(dsn, "async.shutdowntimeout") {
            self.transport.shutdown_timeout_ms = ms;
        }
        if let Some(enabled) = dsn_option::<bool>(dsn, "buffer.enabled") {
            self.buffer.enabled = enabled;
        }
        if let Some(dir) = dsn.option("buffer.dir") {
            self.buffer.dir = Some(PathBuf::from(dir));
        }
        if let Some(size) = dsn_option::<usize>(dsn, "buffer.size") {
            self.buffer.max_events = size;
        }
        if let Some(ms) = dsn_option::<u64>(dsn, "buffer.flushtime") {
            self.buffer.flush_interval_secs = (ms / 1000).max(1);
        }
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/courier/config.toml` (~/.config/courier/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("courier").join("config.toml")
    }

    /// Returns the data directory path (for buffered envelopes)
    ///
    /// `$XDG_DATA_HOME/courier/` (~/.local/share/courier/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("courier")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/courier/` (~/.local/state/courier/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("courier")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/courier/courier.log` (~/.local/state/courier/courier.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("courier.log")
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

fn dsn_option<T: std::str::FromStr>(dsn: &Dsn, key: &str) -> Option<T> {
    let raw = dsn.option(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(option = key, value = raw, "Ignoring invalid DSN option");
            None
        }
    }
}
