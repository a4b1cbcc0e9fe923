//! Configuration loading, validation, and management for Parley.
//!
//! Two layers live here:
//! - [`AppConfig`], the host configuration loaded from
//!   `~/.parley/config.toml` with environment variable overrides
//! - [`SettingsRegistry`], the typed per-extension settings store that
//!   extensions declare into at load time

pub mod settings;

pub use settings::{SettingEntry, SettingSchema, SettingsRegistry, WatchHandle, Watcher};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.parley/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Bot profile
    #[serde(default)]
    pub profile: ProfileConfig,

    /// Extension discovery
    #[serde(default)]
    pub extensions: ExtensionsConfig,

    /// Entity and settings persistence
    #[serde(default)]
    pub storage: StorageConfig,

    /// Event dispatch limits
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Name the bot answers to
    #[serde(default = "default_profile_name")]
    pub name: String,

    /// Root for persistent data (database, per-extension directories).
    /// Defaults to `<config_dir>/data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

fn default_profile_name() -> String {
    "parley".into()
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            name: default_profile_name(),
            data_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtensionsConfig {
    /// Directory scanned for `<name>/manifest.toml`.
    /// Defaults to `<config_dir>/extensions`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Extensions to load. Empty = everything discovered.
    #[serde(default)]
    pub enabled: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "sqlite" or "memory"
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// SQLite database file. Defaults to `<data_dir>/parley.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_storage_backend() -> String {
    "sqlite".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Per-handler timeout; a trigger or action running longer is abandoned
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_secs: u64,

    /// Hard-stop deadline for draining queued events on shutdown
    #[serde(default = "default_shutdown_deadline")]
    pub shutdown_deadline_secs: u64,

    /// Capacity of the handler-failure broadcast channel
    #[serde(default = "default_failure_buffer")]
    pub failure_buffer: usize,

    /// A source's worker exits after this long without events
    #[serde(default = "default_source_idle")]
    pub source_idle_secs: u64,
}

fn default_handler_timeout() -> u64 {
    30
}
fn default_shutdown_deadline() -> u64 {
    5
}
fn default_failure_buffer() -> usize {
    256
}
fn default_source_idle() -> u64 {
    300
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            handler_timeout_secs: default_handler_timeout(),
            shutdown_deadline_secs: default_shutdown_deadline(),
            failure_buffer: default_failure_buffer(),
            source_idle_secs: default_source_idle(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when neither `RUST_LOG` nor `--verbose` is given
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

const STORAGE_BACKENDS: &[&str] = &["sqlite", "memory"];
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

impl AppConfig {
    /// Load configuration from the default path (~/.parley/config.toml).
    ///
    /// Environment variables override the file:
    /// - `PARLEY_EXTENSION_ROOT`
    /// - `PARLEY_DATA_DIR`
    /// - `PARLEY_STORAGE_BACKEND`
    /// - `PARLEY_LOG`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();
        let mut config = Self::load_from(&config_path)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(root) = std::env::var("PARLEY_EXTENSION_ROOT") {
            self.extensions.root = Some(PathBuf::from(root));
        }
        if let Ok(dir) = std::env::var("PARLEY_DATA_DIR") {
            self.profile.data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(backend) = std::env::var("PARLEY_STORAGE_BACKEND") {
            self.storage.backend = backend;
        }
        if let Ok(level) = std::env::var("PARLEY_LOG") {
            self.logging.level = level;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".parley")
    }

    /// Get the configuration file path.
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Resolved data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.profile
            .data_dir
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("data"))
    }

    /// Resolved extension root.
    pub fn extension_root(&self) -> PathBuf {
        self.extensions
            .root
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("extensions"))
    }

    /// Resolved SQLite database path.
    pub fn storage_path(&self) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir().join("parley.db"))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !STORAGE_BACKENDS.contains(&self.storage.backend.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "storage.backend must be one of {}, got '{}'",
                STORAGE_BACKENDS.join(", "),
                self.storage.backend
            )));
        }

        if self.dispatcher.handler_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "dispatcher.handler_timeout_secs must be > 0".into(),
            ));
        }

        if self.dispatcher.failure_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "dispatcher.failure_buffer must be > 0".into(),
            ));
        }

        if self.dispatcher.source_idle_secs == 0 {
            return Err(ConfigError::ValidationError(
                "dispatcher.source_idle_secs must be > 0".into(),
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logging.level must be one of {}, got '{}'",
                LOG_LEVELS.join(", "),
                self.logging.level
            )));
        }

        if self.profile.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "profile.name must not be empty".into(),
            ));
        }

        Ok(())
    }

    /// Whether `name` should be loaded under the `enabled` list.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.extensions.enabled.is_empty() || self.extensions.enabled.iter().any(|e| e == name)
    }

    /// Generate a default config TOML string (for `onboard` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.backend, "sqlite");
        assert_eq!(config.dispatcher.shutdown_deadline_secs, 5);
        assert!(config.is_enabled("anything"));
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.profile.name, config.profile.name);
        assert_eq!(
            parsed.dispatcher.handler_timeout_secs,
            config.dispatcher.handler_timeout_secs
        );
    }

    #[test]
    fn unknown_backend_rejected() {
        let config = AppConfig {
            storage: StorageConfig {
                backend: "postgres".into(),
                path: None,
            },
            ..AppConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("postgres"));
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut config = AppConfig::default();
        config.dispatcher.handler_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.dispatcher.source_idle_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.profile.name, "parley");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[extensions]
root = "/srv/parley/extensions"
enabled = ["console", "echo"]

[storage]
backend = "memory"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.extension_root(), PathBuf::from("/srv/parley/extensions"));
        assert!(config.is_enabled("echo"));
        assert!(!config.is_enabled("greeter"));
        assert_eq!(config.dispatcher.failure_buffer, 256);
        assert_eq!(config.dispatcher.source_idle_secs, 300);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[storage\nbackend = ").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn storage_path_follows_data_dir() {
        let mut config = AppConfig::default();
        config.profile.data_dir = Some(PathBuf::from("/var/lib/parley"));
        assert_eq!(config.storage_path(), PathBuf::from("/var/lib/parley/parley.db"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("[dispatcher]"));
        assert!(toml_str.contains("sqlite"));
    }
}
