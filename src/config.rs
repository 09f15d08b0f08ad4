//! Configuration module for docwatch.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file (`.docwatch/settings.toml`)
//! - Environment variable overrides
//! - CLI argument overrides (applied by the command layer)
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `DOCWATCH_` and use double
//! underscores to separate nested levels:
//! - `DOCWATCH_WATCH__DEBOUNCE_MS=500` sets `watch.debounce_ms`
//! - `DOCWATCH_WATCH__MAX_RETRY_ATTEMPTS=5` sets `watch.max_retry_attempts`
//! - `DOCWATCH_LOGGING__DEFAULT=debug` sets `logging.default`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const CONFIG_DIR: &str = ".docwatch";
const CONFIG_FILE: &str = "settings.toml";

/// Rejected configuration. Fatal at construction time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("debounce_ms must be positive, got {0}")]
    NonPositiveDebounce(i64),

    #[error("retry_delay_ms must be non-negative, got {0}")]
    NegativeRetryDelay(i64),

    #[error("max_retry_attempts must be non-negative, got {0}")]
    NegativeRetryAttempts(i64),

    #[error("max_history_size must be positive")]
    ZeroHistorySize,

    #[error("generation_timeout_ms must be positive when set, got {0}")]
    NonPositiveTimeout(i64),

    #[error("at least one include pattern must be specified")]
    NoIncludePatterns,

    #[error("invalid include pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("notifications.queue_capacity must be positive")]
    ZeroQueueCapacity,

    #[error("generator command is empty")]
    EmptyCommand,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Watch pipeline settings
    #[serde(default)]
    pub watch: WatchConfig,

    /// External generator settings
    #[serde(default)]
    pub generator: GeneratorConfig,

    /// Status notification settings
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Watch pipeline configuration.
///
/// Time values are signed so that a negative value in a file or environment
/// variable reaches [`WatchConfig::validate`] instead of failing to parse.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WatchConfig {
    /// Directory of source files to watch
    #[serde(default = "default_watch_root")]
    pub watch_root: PathBuf,

    /// Directory generated artifacts are written to
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,

    /// Quiet period before a burst of changes to one file is processed
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: i64,

    /// Additional attempts after the first failed generation
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: i64,

    /// Pause between failed attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: i64,

    /// Bound for the recent events and recent outcomes history
    #[serde(default = "default_max_history_size")]
    pub max_history_size: usize,

    /// Glob patterns a file must match (file name, or path relative to the
    /// watch root when the pattern contains a `/`)
    #[serde(default = "default_include_patterns")]
    pub include_patterns: Vec<String>,

    /// Exact file names that are never processed
    #[serde(default = "default_excluded_names")]
    pub excluded_names: Vec<String>,

    /// Watch subdirectories as well
    #[serde(default = "default_false")]
    pub recursive: bool,

    /// Queue every matching file for generation when the pipeline starts
    #[serde(default = "default_true")]
    pub rescan_on_start: bool,

    /// Hard limit for a single generator invocation (unset: no limit)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct GeneratorConfig {
    /// Command invoked as `<command...> <source path>`; stdout is the artifact
    #[serde(default)]
    pub command: Vec<String>,

    /// Extension of generated files
    #[serde(default = "default_extension")]
    pub extension: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct NotificationConfig {
    /// Per-subscriber queue bound; the oldest item is dropped on overflow
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Default level for all modules
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module level overrides
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_watch_root() -> PathBuf {
    PathBuf::from("apps")
}
fn default_output_root() -> PathBuf {
    PathBuf::from("docs")
}
fn default_debounce_ms() -> i64 {
    2000
}
fn default_max_retry_attempts() -> i64 {
    3
}
fn default_retry_delay_ms() -> i64 {
    1000
}
fn default_max_history_size() -> usize {
    100
}
fn default_include_patterns() -> Vec<String> {
    vec!["*.py".to_string()]
}
fn default_excluded_names() -> Vec<String> {
    [
        "const.py",
        "infra.py",
        "utils.py",
        "__init__.py",
        "apps.py",
        "configuration.py",
        "secrets.py",
    ]
    .iter()
    .map(|name| name.to_string())
    .collect()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_extension() -> String {
    "md".to_string()
}
fn default_queue_capacity() -> usize {
    100
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            watch: WatchConfig::default(),
            generator: GeneratorConfig::default(),
            notifications: NotificationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            watch_root: default_watch_root(),
            output_root: default_output_root(),
            debounce_ms: default_debounce_ms(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            max_history_size: default_max_history_size(),
            include_patterns: default_include_patterns(),
            excluded_names: default_excluded_names(),
            recursive: false,
            rescan_on_start: true,
            generation_timeout_ms: None,
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            extension: default_extension(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl WatchConfig {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.debounce_ms <= 0 {
            return Err(ConfigError::NonPositiveDebounce(self.debounce_ms));
        }
        if self.max_retry_attempts < 0 {
            return Err(ConfigError::NegativeRetryAttempts(self.max_retry_attempts));
        }
        if self.retry_delay_ms < 0 {
            return Err(ConfigError::NegativeRetryDelay(self.retry_delay_ms));
        }
        if self.max_history_size == 0 {
            return Err(ConfigError::ZeroHistorySize);
        }
        if let Some(timeout) = self.generation_timeout_ms {
            if timeout <= 0 {
                return Err(ConfigError::NonPositiveTimeout(timeout));
            }
        }
        if self.include_patterns.is_empty() {
            return Err(ConfigError::NoIncludePatterns);
        }
        for pattern in &self.include_patterns {
            glob::Pattern::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn debounce_delay(&self) -> Duration {
        millis(self.debounce_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        millis(self.retry_delay_ms)
    }

    pub fn max_retries(&self) -> u32 {
        u32::try_from(self.max_retry_attempts.max(0)).unwrap_or(u32::MAX)
    }

    pub fn generation_timeout(&self) -> Option<Duration> {
        self.generation_timeout_ms.map(millis)
    }
}

impl NotificationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        Ok(())
    }
}

fn millis(value: i64) -> Duration {
    Duration::from_millis(u64::try_from(value).unwrap_or(0))
}

impl Settings {
    /// Validate every section the watch command depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.watch.validate()?;
        self.notifications.validate()
    }

    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        // Try to find the workspace root by looking for .docwatch directory
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));

        Self::load_from(config_path)
    }

    /// Load configuration from a specific file, still honouring env overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            // Start with defaults
            .merge(Serialized::defaults(Settings::default()))
            // Layer in config file if it exists
            .merge(Toml::file(path.as_ref()))
            // Double underscore separates nested levels
            .merge(Env::prefixed("DOCWATCH_").split("__"))
            .extract()
            .map_err(Box::new)
    }

    /// Find the workspace config by looking for a .docwatch directory
    /// from the current directory up to the filesystem root
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        current
            .ancestors()
            .map(|ancestor| ancestor.join(CONFIG_DIR))
            .find(|dir| dir.is_dir())
            .map(|dir| dir.join(CONFIG_FILE))
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file in the current directory
    pub fn init_config_file(force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = PathBuf::from(CONFIG_DIR).join(CONFIG_FILE);

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        Settings::default().save(&config_path)?;
        Ok(config_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.version, 1);
        assert_eq!(settings.watch.debounce_ms, 2000);
        assert_eq!(settings.watch.max_retry_attempts, 3);
        assert_eq!(settings.watch.retry_delay_ms, 1000);
        assert_eq!(settings.watch.max_history_size, 100);
        assert_eq!(settings.watch.include_patterns, vec!["*.py"]);
        assert!(settings.watch.excluded_names.contains(&"__init__.py".to_string()));
        assert!(settings.watch.generation_timeout_ms.is_none());
        assert_eq!(settings.notifications.queue_capacity, 100);
        assert_eq!(settings.logging.default, "warn");
        assert!(settings.watch.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let base = WatchConfig::default();

        let config = WatchConfig {
            debounce_ms: -1,
            ..base.clone()
        };
        assert_eq!(config.validate(), Err(ConfigError::NonPositiveDebounce(-1)));

        let config = WatchConfig {
            debounce_ms: 0,
            ..base.clone()
        };
        assert_eq!(config.validate(), Err(ConfigError::NonPositiveDebounce(0)));

        let config = WatchConfig {
            max_history_size: 0,
            ..base.clone()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroHistorySize));

        let config = WatchConfig {
            retry_delay_ms: -5,
            ..base.clone()
        };
        assert_eq!(config.validate(), Err(ConfigError::NegativeRetryDelay(-5)));

        let config = WatchConfig {
            max_retry_attempts: -1,
            ..base.clone()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::NegativeRetryAttempts(-1))
        );

        let config = WatchConfig {
            include_patterns: Vec::new(),
            ..base.clone()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoIncludePatterns));

        let config = WatchConfig {
            include_patterns: vec!["[".to_string()],
            ..base.clone()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPattern { .. })
        ));

        let config = WatchConfig {
            generation_timeout_ms: Some(0),
            ..base
        };
        assert_eq!(config.validate(), Err(ConfigError::NonPositiveTimeout(0)));
    }

    #[test]
    fn test_zero_queue_capacity_is_rejected() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_ok());

        settings.notifications.queue_capacity = 0;
        assert_eq!(
            settings.notifications.validate(),
            Err(ConfigError::ZeroQueueCapacity)
        );
        assert_eq!(settings.validate(), Err(ConfigError::ZeroQueueCapacity));
    }

    #[test]
    fn test_zero_retries_and_zero_delay_are_valid() {
        let config = WatchConfig {
            max_retry_attempts: 0,
            retry_delay_ms: 0,
            ..WatchConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.max_retries(), 0);
        assert_eq!(config.retry_delay(), Duration::ZERO);
    }

    #[test]
    fn test_durations() {
        let config = WatchConfig {
            debounce_ms: 50,
            retry_delay_ms: 10,
            generation_timeout_ms: Some(250),
            ..WatchConfig::default()
        };
        assert_eq!(config.debounce_delay(), Duration::from_millis(50));
        assert_eq!(config.retry_delay(), Duration::from_millis(10));
        assert_eq!(config.generation_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        let toml_content = r#"
version = 2

[watch]
watch_root = "/srv/apps"
output_root = "/srv/docs"
debounce_ms = 250
max_retry_attempts = 1
include_patterns = ["*.py", "*.yaml"]
recursive = true

[generator]
command = ["python", "-m", "docgen"]

[notifications]
queue_capacity = 10

[logging]
default = "info"

[logging.modules]
watcher = "debug"
"#;

        fs::write(&config_path, toml_content).unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        assert_eq!(settings.version, 2);
        assert_eq!(settings.watch.watch_root, PathBuf::from("/srv/apps"));
        assert_eq!(settings.watch.output_root, PathBuf::from("/srv/docs"));
        assert_eq!(settings.watch.debounce_ms, 250);
        assert_eq!(settings.watch.max_retry_attempts, 1);
        assert_eq!(settings.watch.include_patterns, vec!["*.py", "*.yaml"]);
        assert!(settings.watch.recursive);
        assert_eq!(settings.generator.command, vec!["python", "-m", "docgen"]);
        assert_eq!(settings.generator.extension, "md");
        assert_eq!(settings.notifications.queue_capacity, 10);
        assert_eq!(settings.logging.default, "info");
        assert_eq!(settings.logging.modules["watcher"], "debug");
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        fs::write(&config_path, "[watch]\ndebounce_ms = 75\n").unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        assert_eq!(settings.watch.debounce_ms, 75);
        assert_eq!(settings.watch.retry_delay_ms, 1000);
        assert_eq!(settings.watch.max_history_size, 100);
        assert!(!settings.watch.excluded_names.is_empty());
    }

    #[test]
    fn test_negative_value_loads_then_fails_validation() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        fs::write(&config_path, "[watch]\ndebounce_ms = -1\n").unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        assert_eq!(
            settings.watch.validate(),
            Err(ConfigError::NonPositiveDebounce(-1))
        );
    }

    #[test]
    fn test_save_settings() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("settings.toml");

        let mut settings = Settings::default();
        settings.watch.debounce_ms = 300;
        settings.generator.command = vec!["cat".to_string()];

        settings.save(&config_path).unwrap();

        let loaded = Settings::load_from(&config_path).unwrap();
        assert_eq!(loaded.watch.debounce_ms, 300);
        assert_eq!(loaded.generator.command, vec!["cat"]);
    }
}
