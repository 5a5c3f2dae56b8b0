//! Pipeline Configuration - retry budget, timeouts, backoff and storage as TOML
//!
//! Each section implements `Default` from `config::defaults`, so a missing
//! file or a partial file behaves exactly like the built-in values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults;

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "parlance.toml";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error ({}): {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),
    #[error("config parse error ({}): {}", .0.display(), .1)]
    Parse(PathBuf, #[source] toml::de::Error),
    #[error("config serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("config validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration.
///
/// Load with `PipelineConfig::load(path)` which searches:
/// 1. The explicit path (`$PARLANCE_CONFIG` in the binary)
/// 2. `./parlance.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub publish: PublishConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl PipelineConfig {
    /// Load configuration using the standard search order.
    ///
    /// `explicit` is the path named by `$PARLANCE_CONFIG` (or `--config`);
    /// the binary resolves it so this crate never reads the environment.
    pub fn load(explicit: Option<&Path>) -> Self {
        if let Some(p) = explicit {
            if p.exists() {
                match Self::load_from_file(p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded pipeline config");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config, falling back");
                    }
                }
            } else {
                warn!(path = %p.display(), "Config path does not exist, falling back");
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded pipeline config from ./{}", LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG_FILE);
                }
            }
        }

        info!("No {} found, using built-in defaults", LOCAL_CONFIG_FILE);
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config = Self::from_toml_str(&contents)
            .map_err(|e| match e {
                TomlLoadError::Parse(err) => ConfigError::Parse(path.to_path_buf(), err),
                TomlLoadError::Invalid(errors) => ConfigError::Validation(errors),
            })?;
        Ok(config)
    }

    /// Parse and validate TOML text. Unknown keys are logged, not rejected.
    fn from_toml_str(contents: &str) -> Result<Self, TomlLoadError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }
        let config: Self = toml::from_str(contents).map_err(TomlLoadError::Parse)?;
        config.validate().map_err(|e| match e {
            ConfigError::Validation(errors) => TomlLoadError::Invalid(errors),
            other => TomlLoadError::Invalid(vec![other.to_string()]),
        })?;
        Ok(config)
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every value for a usable range, collecting all problems.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.publish.max_attempts == 0 {
            errors.push("publish.max_attempts must be at least 1".to_string());
        }
        if self.publish.base_delay_ms == 0 {
            errors.push("publish.base_delay_ms must be > 0".to_string());
        }
        if self.publish.max_delay_ms < self.publish.base_delay_ms {
            errors.push(format!(
                "publish.max_delay_ms ({}) must be >= publish.base_delay_ms ({})",
                self.publish.max_delay_ms, self.publish.base_delay_ms
            ));
        }
        if self.timeouts.stage_timeout_secs == 0 {
            errors.push("timeouts.stage_timeout_secs must be > 0".to_string());
        }
        if self.timeouts.sweep_interval_secs == 0 {
            errors.push("timeouts.sweep_interval_secs must be > 0".to_string());
        }
        if self.timeouts.sweep_interval_secs > self.timeouts.stage_timeout_secs {
            errors.push(format!(
                "timeouts.sweep_interval_secs ({}) should not exceed timeouts.stage_timeout_secs ({})",
                self.timeouts.sweep_interval_secs, self.timeouts.stage_timeout_secs
            ));
        }
        if self.bus.max_concurrent_handlers == 0 {
            errors.push("bus.max_concurrent_handlers must be at least 1".to_string());
        }
        if self.storage.max_cas_retries == 0 {
            errors.push("storage.max_cas_retries must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

enum TomlLoadError {
    Parse(toml::de::Error),
    Invalid(Vec<String>),
}

impl std::str::FromStr for PipelineConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_toml_str(s).map_err(|e| match e {
            TomlLoadError::Parse(err) => ConfigError::Parse(PathBuf::from("<inline>"), err),
            TomlLoadError::Invalid(errors) => ConfigError::Validation(errors),
        })
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Per-stage retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per stage, first dispatch included.
    #[serde(default = "default_stage_max_attempts")]
    pub max_attempts: u32,
}

fn default_stage_max_attempts() -> u32 {
    defaults::STAGE_MAX_ATTEMPTS
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_stage_max_attempts(),
        }
    }
}

/// Exponential backoff for transient publish failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(default = "default_publish_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_publish_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_publish_max_attempts")]
    pub max_attempts: u32,
}

fn default_publish_base_delay_ms() -> u64 {
    defaults::PUBLISH_BASE_DELAY_MS
}
fn default_publish_max_delay_ms() -> u64 {
    defaults::PUBLISH_MAX_DELAY_MS
}
fn default_publish_max_attempts() -> u32 {
    defaults::PUBLISH_MAX_ATTEMPTS
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_publish_base_delay_ms(),
            max_delay_ms: default_publish_max_delay_ms(),
            max_attempts: default_publish_max_attempts(),
        }
    }
}

/// Silence detection for dispatched stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_stage_timeout_secs() -> u64 {
    defaults::STAGE_TIMEOUT_SECS
}
fn default_sweep_interval_secs() -> u64 {
    defaults::SWEEP_INTERVAL_SECS
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: default_stage_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// In-process bus delivery tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_max_concurrent_handlers")]
    pub max_concurrent_handlers: usize,
    #[serde(default = "default_redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
}

fn default_max_concurrent_handlers() -> usize {
    defaults::MAX_CONCURRENT_HANDLERS
}
fn default_redelivery_delay_ms() -> u64 {
    defaults::REDELIVERY_DELAY_MS
}
fn default_max_redeliveries() -> u32 {
    defaults::MAX_REDELIVERIES
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: default_max_concurrent_handlers(),
            redelivery_delay_ms: default_redelivery_delay_ms(),
            max_redeliveries: default_max_redeliveries(),
        }
    }
}

/// Tracker location and housekeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_archive_retention_days")]
    pub archive_retention_days: u32,
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(defaults::DATA_DIR)
}
fn default_archive_retention_days() -> u32 {
    defaults::ARCHIVE_RETENTION_DAYS
}
fn default_max_cas_retries() -> u32 {
    defaults::MAX_CAS_RETRIES
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            archive_retention_days: default_archive_retention_days(),
            max_cas_retries: default_max_cas_retries(),
        }
    }
}

impl StorageConfig {
    /// Path of the sled tracker database.
    pub fn tracker_path(&self) -> PathBuf {
        self.data_dir.join(defaults::TRACKER_DB_NAME)
    }
}

// ============================================================================
// Tests
// ============================================================================
