//! Configuration management for aggcursor
//!
//! This module handles loading, parsing, and managing configuration from various sources:
//! - Configuration files (TOML format)
//! - Environment variables
//! - Command-line arguments (applied by the CLI)
//!
//! Configuration precedence (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file
//! 4. Default values

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::command::MAX_BATCH_SIZE;
use crate::cursor::CursorOptions;
use crate::error::{ConfigError, Result};

/// Prefix of environment variables read by [`Config::from_env`]
pub const ENV_PREFIX: &str = "AGGCURSOR_";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Connection configuration
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Cursor behavior configuration
    #[serde(default)]
    pub cursor: CursorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection-related configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Default MongoDB connection URI
    #[serde(default = "default_uri")]
    pub default_uri: String,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Maximum pool size
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,

    /// Minimum pool size
    #[serde(default = "default_min_pool_size")]
    pub min_pool_size: u32,

    /// Connection idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

/// Cursor-related configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorConfig {
    /// Batch size used when an aggregation does not set one
    #[serde(default)]
    pub default_batch_size: Option<u32>,

    /// Retry a `getMore` once after a transient network error
    #[serde(default = "default_true")]
    pub retry_get_more: bool,

    /// Send `killCursors` when an open cursor is closed
    #[serde(default = "default_true")]
    pub kill_on_close: bool,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// Enable timestamps in logs
    #[serde(default = "default_true")]
    pub timestamps: bool,
}

/// Log level options
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

// Default value functions
fn default_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_pool_size() -> u32 {
    10
}

fn default_min_pool_size() -> u32 {
    0
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_log_level() -> LogLevel {
    LogLevel::Warn
}

fn default_true() -> bool {
    true
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            default_uri: default_uri(),
            timeout: default_timeout(),
            max_pool_size: default_max_pool_size(),
            min_pool_size: default_min_pool_size(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            default_batch_size: None,
            retry_get_more: true,
            kill_on_close: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            timestamps: true,
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a file
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file (TOML format)
    ///
    /// # Returns
    /// * `Result<Config>` - Loaded configuration or error
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from all sources with proper precedence
    ///
    /// An explicit `path` must exist; the default path is optional.
    ///
    /// # Returns
    /// * `Result<Config>` - Merged and validated configuration or error
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Self::default_path();
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables are prefixed with `AGGCURSOR_`:
    /// `AGGCURSOR_URI`, `AGGCURSOR_CONNECTION_TIMEOUT`, `AGGCURSOR_BATCH_SIZE`,
    /// `AGGCURSOR_RETRY_GET_MORE`, `AGGCURSOR_LOG_LEVEL`
    ///
    /// # Returns
    /// * `Result<Config>` - Defaults overridden by the environment
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(uri) = var("URI") {
            self.connection.default_uri = uri;
        }
        if let Some(timeout) = var("CONNECTION_TIMEOUT") {
            self.connection.timeout = parse_field("connection.timeout", &timeout)?;
        }
        if let Some(batch_size) = var("BATCH_SIZE") {
            self.cursor.default_batch_size = Some(parse_field("cursor.default_batch_size", &batch_size)?);
        }
        if let Some(retry) = var("RETRY_GET_MORE") {
            self.cursor.retry_get_more = parse_field("cursor.retry_get_more", &retry)?;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.logging.level = parse_field("logging.level", &level)?;
        }

        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// # Returns
    /// * `PathBuf` - Path to default configuration file
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".aggcursor")
            .join("config.toml")
    }

    /// Save configuration to a file
    ///
    /// # Arguments
    /// * `path` - Path where to save the configuration
    ///
    /// # Returns
    /// * `Result<()>` - Success or error
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    ///
    /// # Returns
    /// * `Result<()>` - Ok if valid, error otherwise
    pub fn validate(&self) -> Result<()> {
        self.connection.validate_uri()?;

        if self.connection.timeout == 0 {
            return Err(invalid("connection.timeout", "0"));
        }

        if self.connection.min_pool_size > self.connection.max_pool_size {
            return Err(invalid(
                "connection.min_pool_size",
                &self.connection.min_pool_size.to_string(),
            ));
        }

        if let Some(batch_size) = self.cursor.default_batch_size {
            if batch_size == 0 || batch_size > MAX_BATCH_SIZE {
                return Err(invalid(
                    "cursor.default_batch_size",
                    &batch_size.to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Get connection timeout as Duration
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.timeout)
    }

    /// Get idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.idle_timeout)
    }
}

impl ConnectionConfig {
    /// Check the URI scheme
    ///
    /// # Returns
    /// * `Result<()>` - Ok if URI is valid, error otherwise
    pub fn validate_uri(&self) -> Result<()> {
        let uri = self.default_uri.as_str();
        if uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://") {
            Ok(())
        } else {
            Err(invalid("connection.default_uri", uri))
        }
    }
}

impl CursorConfig {
    /// Cursor settings with this configuration's defaults
    pub fn cursor_options(&self) -> CursorOptions {
        CursorOptions {
            batch_size: self.default_batch_size,
            max_await_time: None,
            retry_get_more: self.retry_get_more,
            kill_on_close: self.kill_on_close,
        }
    }
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

fn parse_field<T: FromStr>(field: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| invalid(field, value))
}

fn invalid(field: &str, value: &str) -> crate::error::AggError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}
