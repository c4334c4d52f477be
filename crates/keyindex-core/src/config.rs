//! Configuration for the indexing engine.
//!
//! Settings are layered: defaults -> default config file -> `--config` file
//! -> `KEYINDEX_*` environment variables -> CLI flags (applied by the caller).

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::IndexError;

/// Tuning knobs for indexing runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Base number of recomputations dispatched between commits.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Delay before each window when a change schedules processing (ms).
    #[serde(default = "default_nice_ms")]
    pub default_nice_ms: u64,

    /// Delay used when recovery schedules catch-up work (ms).
    #[serde(default = "default_nice_ms")]
    pub catch_up_nice_ms: u64,

    /// Window multiplier at the start of a run.
    #[serde(default = "default_initial_cpu_factor")]
    pub initial_cpu_factor: f64,

    /// CPU time per window considered acceptable (µs).
    #[serde(default = "default_cpu_target_micros")]
    pub cpu_target_micros: f64,

    /// Offset added to measured CPU time to damp the feedback (µs).
    #[serde(default = "default_cpu_offset_micros")]
    pub cpu_offset_micros: f64,

    #[serde(default = "default_min_cpu_factor")]
    pub min_cpu_factor: f64,

    #[serde(default = "default_max_cpu_factor")]
    pub max_cpu_factor: f64,

    /// Attempts made to fetch a source value before giving up on it.
    #[serde(default = "default_value_fetch_attempts")]
    pub value_fetch_attempts: u32,

    /// Multiplier applied to index read sizes when reporting to the
    /// expiration strategy, so index values expire before entity values.
    #[serde(default = "default_index_cost_multiplier")]
    pub index_cost_multiplier: u64,

    /// Size assumed for a read that found nothing.
    #[serde(default = "default_entry_size")]
    pub default_entry_size: u64,

    /// Size counted for a reference entry with no stored value.
    #[serde(default = "default_missing_value_size")]
    pub missing_value_size: u64,

    /// Byte budget of the shared expiration strategy.
    #[serde(default = "default_cache_capacity_bytes")]
    pub cache_capacity_bytes: u64,

    /// Deletes per batch when recovery removes stale entries.
    #[serde(default = "default_recovery_batch_size")]
    pub recovery_batch_size: usize,
}

fn default_concurrency() -> usize {
    15
}

fn default_nice_ms() -> u64 {
    120
}

fn default_initial_cpu_factor() -> f64 {
    2.0
}

fn default_cpu_target_micros() -> f64 {
    40_000.0
}

fn default_cpu_offset_micros() -> f64 {
    10_000.0
}

fn default_min_cpu_factor() -> f64 {
    0.1
}

fn default_max_cpu_factor() -> f64 {
    8.0
}

fn default_value_fetch_attempts() -> u32 {
    2
}

fn default_index_cost_multiplier() -> u64 {
    10
}

fn default_entry_size() -> u64 {
    100
}

fn default_missing_value_size() -> u64 {
    10
}

fn default_cache_capacity_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_recovery_batch_size() -> usize {
    1000
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            default_nice_ms: default_nice_ms(),
            catch_up_nice_ms: default_nice_ms(),
            initial_cpu_factor: default_initial_cpu_factor(),
            cpu_target_micros: default_cpu_target_micros(),
            cpu_offset_micros: default_cpu_offset_micros(),
            min_cpu_factor: default_min_cpu_factor(),
            max_cpu_factor: default_max_cpu_factor(),
            value_fetch_attempts: default_value_fetch_attempts(),
            index_cost_multiplier: default_index_cost_multiplier(),
            default_entry_size: default_entry_size(),
            missing_value_size: default_missing_value_size(),
            cache_capacity_bytes: default_cache_capacity_bytes(),
            recovery_batch_size: default_recovery_batch_size(),
        }
    }
}

impl IndexingConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set both the default and the catch-up niceness.
    pub fn with_nice(mut self, nice: Duration) -> Self {
        self.default_nice_ms = nice.as_millis() as u64;
        self.catch_up_nice_ms = nice.as_millis() as u64;
        self
    }

    pub fn with_initial_cpu_factor(mut self, factor: f64) -> Self {
        self.initial_cpu_factor = factor;
        self
    }

    pub fn with_value_fetch_attempts(mut self, attempts: u32) -> Self {
        self.value_fetch_attempts = attempts;
        self
    }

    pub fn with_recovery_batch_size(mut self, size: usize) -> Self {
        self.recovery_batch_size = size;
        self
    }

    pub fn with_cache_capacity_bytes(mut self, bytes: u64) -> Self {
        self.cache_capacity_bytes = bytes;
        self
    }

    pub fn default_nice(&self) -> Duration {
        Duration::from_millis(self.default_nice_ms)
    }

    pub fn catch_up_nice(&self) -> Duration {
        Duration::from_millis(self.catch_up_nice_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency == 0 {
            return Err("concurrency must be > 0".to_string());
        }
        if self.value_fetch_attempts == 0 {
            return Err("value_fetch_attempts must be > 0".to_string());
        }
        if self.recovery_batch_size == 0 {
            return Err("recovery_batch_size must be > 0".to_string());
        }
        if !(self.min_cpu_factor > 0.0 && self.min_cpu_factor <= self.max_cpu_factor) {
            return Err(format!(
                "cpu factor bounds invalid: min {} max {}",
                self.min_cpu_factor, self.max_cpu_factor
            ));
        }
        if !(self.min_cpu_factor..=self.max_cpu_factor).contains(&self.initial_cpu_factor) {
            return Err(format!(
                "initial_cpu_factor must be within [{}, {}], got {}",
                self.min_cpu_factor, self.max_cpu_factor, self.initial_cpu_factor
            ));
        }
        if self.cpu_offset_micros <= 0.0 || self.cpu_target_micros <= 0.0 {
            return Err("cpu target and offset must be > 0".to_string());
        }
        Ok(())
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to RocksDB storage directory
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub indexing: IndexingConfig,
}

fn default_db_path() -> String {
    ProjectDirs::from("", "", "keyindex")
        .map(|p| p.data_local_dir().join("db"))
        .unwrap_or_else(|| PathBuf::from("./data"))
        .to_string_lossy()
        .to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: default_log_level(),
            indexing: IndexingConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file in the platform config dir (`keyindex/config.*`)
    /// 3. CLI-specified config file (optional)
    /// 4. Environment variables (`KEYINDEX_DB_PATH`, `KEYINDEX_INDEXING__CONCURRENCY`, ...)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, IndexError> {
        let config_dir = ProjectDirs::from("", "", "keyindex")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("db_path", default_db_path())?
            .set_default("log_level", default_log_level())?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("KEYINDEX")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.indexing.validate().map_err(IndexError::Config)?;
        Ok(settings)
    }

    /// Expand a leading `~/` in db_path
    pub fn expanded_db_path(&self) -> PathBuf {
        if let Some(rest) = self.db_path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                return PathBuf::from(home).join(rest);
            }
        }
        PathBuf::from(&self.db_path)
    }
}
