//! Engine configuration (TOML).
//!
//! Every field has a default, so an empty file is a valid config:
//!
//! ```toml
//! workers = 8
//! liveness_timeout_secs = 600
//! retry_cascade = "propagated"
//!
//! [storage]
//! database = "var/loom.db"
//! blobs = "var/blobs"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::{ReclaimPolicy, RetryCascade};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing TOML config from {path:?}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Concurrent task executors.
    pub workers: usize,

    /// Resolver sweep interval. Upper bound on how long a task waits after
    /// its last prerequisite succeeds before a worker can see it.
    pub sweep_interval_ms: u64,

    /// Ready ids fetched per sweep.
    pub batch_size: usize,

    pub heartbeat_interval_secs: u64,
    pub liveness_timeout_secs: u64,
    pub reaper_interval_secs: u64,

    pub max_attempts: u32,
    pub reclaim_backoff_secs: u64,
    pub reclaim_backoff_multiplier: f64,

    pub retry_cascade: RetryCascade,

    pub stats_interval_secs: u64,
    pub stats_window_secs: u64,
    pub top_error_types: usize,

    pub max_error_len: usize,
    pub max_log_len: usize,

    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// libsql database file.
    pub database: PathBuf,

    /// Root directory of the content store.
    pub blobs: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("loom.db"),
            blobs: PathBuf::from("blobs"),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            sweep_interval_ms: 1000,
            batch_size: 32,
            heartbeat_interval_secs: 15,
            liveness_timeout_secs: 300,
            reaper_interval_secs: 30,
            max_attempts: 5,
            reclaim_backoff_secs: 2,
            reclaim_backoff_multiplier: 2.0,
            retry_cascade: RetryCascade::None,
            stats_interval_secs: 60,
            stats_window_secs: 300,
            top_error_types: 20,
            max_error_len: 2000,
            max_log_len: 20_000,
            storage: StorageConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EngineConfig = toml::from_str(&contents).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("workers", self.workers as u64),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("batch_size", self.batch_size as u64),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("liveness_timeout_secs", self.liveness_timeout_secs),
            ("reaper_interval_secs", self.reaper_interval_secs),
            ("max_attempts", u64::from(self.max_attempts)),
            ("stats_interval_secs", self.stats_interval_secs),
            ("stats_window_secs", self.stats_window_secs),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be >= 1 (got 0)")));
            }
        }

        if self.heartbeat_interval_secs >= self.liveness_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_interval_secs ({}) must be below liveness_timeout_secs ({})",
                self.heartbeat_interval_secs, self.liveness_timeout_secs
            )));
        }

        if !self.reclaim_backoff_multiplier.is_finite() || self.reclaim_backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "reclaim_backoff_multiplier must be a finite number >= 1.0 (got {})",
                self.reclaim_backoff_multiplier
            )));
        }

        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn stats_window(&self) -> Duration {
        Duration::from_secs(self.stats_window_secs)
    }

    pub fn reclaim_policy(&self) -> ReclaimPolicy {
        ReclaimPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_secs(self.reclaim_backoff_secs),
            multiplier: self.reclaim_backoff_multiplier,
        }
    }
}
