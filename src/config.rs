//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and `RINGSTORE_*` environment variable overrides.

use crate::storage::{RetentionPolicy, SeriesConfig, SyncMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageSection,

    #[serde(default)]
    pub series: SeriesSection,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where and how series persist
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default)]
    pub sync_mode: SyncMode,

    #[serde(default = "default_reframe")]
    pub reframe: bool,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("ringstore").to_string_lossy().to_string())
        .unwrap_or_else(|| "./ringstore_data".to_string())
}

fn default_reframe() -> bool {
    true
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sync_mode: SyncMode::default(),
            reframe: default_reframe(),
        }
    }
}

/// Which retention policy a series runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    #[default]
    Capacity,
    Time,
}

impl std::str::FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "capacity" => Ok(PolicyKind::Capacity),
            "time" => Ok(PolicyKind::Time),
            other => Err(format!("unknown retention policy: {}", other)),
        }
    }
}

/// Retention settings shared by the series the binary opens
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SeriesSection {
    #[serde(default)]
    pub policy: PolicyKind,

    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,

    #[serde(default = "default_max_elements")]
    pub max_elements_per_chunk: usize,

    #[serde(default = "default_max_bytes")]
    pub max_bytes_per_chunk: usize,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_trim_horizon")]
    pub trim_horizon_secs: u64,
}

fn default_max_chunks() -> usize {
    10
}

fn default_max_elements() -> usize {
    1000
}

fn default_max_bytes() -> usize {
    1024 * 1024 // 1 MB
}

fn default_flush_interval() -> u64 {
    5000 // 5 seconds
}

fn default_trim_horizon() -> u64 {
    3600
}

impl Default for SeriesSection {
    fn default() -> Self {
        Self {
            policy: PolicyKind::default(),
            max_chunks: default_max_chunks(),
            max_elements_per_chunk: default_max_elements(),
            max_bytes_per_chunk: default_max_bytes(),
            flush_interval_ms: default_flush_interval(),
            trim_horizon_secs: default_trim_horizon(),
        }
    }
}

impl SeriesSection {
    /// Build the retention policy these settings describe.
    pub fn retention_policy(&self) -> Result<RetentionPolicy, ConfigError> {
        let policy = match self.policy {
            PolicyKind::Capacity => RetentionPolicy::Capacity {
                max_chunks: self.max_chunks,
                max_elements_per_chunk: self.max_elements_per_chunk,
                max_bytes_per_chunk: self.max_bytes_per_chunk,
            },
            PolicyKind::Time => RetentionPolicy::Time {
                flush_interval: Duration::from_millis(self.flush_interval_ms),
                trim_horizon: Duration::from_secs(self.trim_horizon_secs),
            },
        };
        policy
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(policy)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("ringstore").join("config.toml")),
            Some(PathBuf::from("/etc/ringstore/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Per-series constructor settings, archived under `data_dir/<name>`.
    pub fn series_config(&self, name: &str) -> Result<SeriesConfig, ConfigError> {
        Ok(SeriesConfig::new(name)
            .policy(self.series.retention_policy()?)
            .archive(Path::new(&self.storage.data_dir).join(name))
            .sync_mode(self.storage.sync_mode)
            .reframe(self.storage.reframe))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(data_dir) = lookup("RINGSTORE_DATA_DIR") {
            self.storage.data_dir = data_dir;
        }

        if let Some(policy) = lookup("RINGSTORE_POLICY") {
            match policy.parse() {
                Ok(p) => self.series.policy = p,
                Err(e) => tracing::warn!("Ignoring RINGSTORE_POLICY: {}", e),
            }
        }
        if let Some(n) = lookup("RINGSTORE_MAX_CHUNKS").and_then(|v| v.parse().ok()) {
            self.series.max_chunks = n;
        }
        if let Some(ms) = lookup("RINGSTORE_FLUSH_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.series.flush_interval_ms = ms;
        }
        if let Some(secs) = lookup("RINGSTORE_TRIM_HORIZON_SECS").and_then(|v| v.parse().ok()) {
            self.series.trim_horizon_secs = secs;
        }

        if let Some(level) = lookup("RINGSTORE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("RINGSTORE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Ringstore Configuration
#
# Environment variables override these settings:
# - RINGSTORE_DATA_DIR
# - RINGSTORE_POLICY
# - RINGSTORE_MAX_CHUNKS
# - RINGSTORE_FLUSH_INTERVAL_MS
# - RINGSTORE_TRIM_HORIZON_SECS
# - RINGSTORE_LOG_LEVEL
# - RINGSTORE_LOG_FORMAT

[storage]
# Each series is archived in its own directory below this one
data_dir = "~/.local/share/ringstore"

# every_write: fsync each section after writing it; flush: leave it to the OS
sync_mode = "flush"

# Compact chunks into columnar frames before closing them
reframe = true

[series]
# capacity: close chunks by size and keep max_chunks of them
# time: close chunks every flush_interval_ms and keep trim_horizon_secs of data
policy = "capacity"

max_chunks = 10
max_elements_per_chunk = 1000
max_bytes_per_chunk = 1048576

flush_interval_ms = 5000
trim_horizon_secs = 3600

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"

# Optional log file path
# file = "/var/log/ringstore/ringstore.log"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_parses() {
        let config: Config = toml::from_str(&generate_default_config()).unwrap();
        assert_eq!(config.storage.sync_mode, SyncMode::Flush);
        assert!(config.storage.reframe);
        assert_eq!(config.series.policy, PolicyKind::Capacity);
        assert_eq!(config.series.max_chunks, 10);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config: Config = toml::from_str("[series]\npolicy = \"time\"\n").unwrap();
        assert_eq!(config.series.policy, PolicyKind::Time);
        assert_eq!(config.series.flush_interval_ms, 5000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[series\n").unwrap();
        match Config::load(&path) {
            Err(ConfigError::Parse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected parse error, got {:?}", other),
        }
        assert!(matches!(
            Config::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("RINGSTORE_DATA_DIR", "/tmp/rs"),
            ("RINGSTORE_POLICY", "time"),
            ("RINGSTORE_FLUSH_INTERVAL_MS", "250"),
            ("RINGSTORE_MAX_CHUNKS", "not a number"),
            ("RINGSTORE_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.storage.data_dir, "/tmp/rs");
        assert_eq!(config.series.policy, PolicyKind::Time);
        assert_eq!(config.series.flush_interval_ms, 250);
        assert_eq!(config.series.max_chunks, 10);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_retention_policy_conversion() {
        let mut section = SeriesSection {
            policy: PolicyKind::Time,
            flush_interval_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            section.retention_policy(),
            Err(ConfigError::Invalid(_))
        ));

        section.flush_interval_ms = 100;
        assert_eq!(
            section.retention_policy().unwrap(),
            RetentionPolicy::Time {
                flush_interval: Duration::from_millis(100),
                trim_horizon: Duration::from_secs(3600),
            }
        );
    }

    #[test]
    fn test_series_config_under_data_dir() {
        let mut config = Config::default();
        config.storage.data_dir = "/data".to_string();
        config.storage.sync_mode = SyncMode::EveryWrite;
        let series = config.series_config("station").unwrap();
        assert_eq!(series.name, "station");
        assert_eq!(series.archive_dir, Some(PathBuf::from("/data/station")));
        assert_eq!(series.sync_mode, SyncMode::EveryWrite);
    }
}
