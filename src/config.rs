//! Configuration schema, validation and loading.
//!
//! Pool and retry behavior are configured through [`WorkerManagerConfig`] and
//! [`RetryConfig`]. Both can be built programmatically or deserialized from a
//! TOML file via [`load_config`]. Validation is eager and atomic: an invalid
//! config is rejected before any worker is created, and a rejected
//! [`ConfigUpdate`] leaves the previous config untouched.
//!
//! # TOML structure
//!
//! ```toml
//! [pool]
//! max_workers = 8
//! min_workers = 2
//! memory_limit_mb = 1024
//! worker_timeout_ms = 30000
//! isolation = false
//!
//! [retry]
//! base_delay_ms = 500
//! multiplier = 2.0
//! max_delay_ms = 30000
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Lowest accepted memory limit, in MB.
pub const MIN_MEMORY_LIMIT_MB: u64 = 64;

/// Lowest accepted worker timeout, in milliseconds.
pub const MIN_WORKER_TIMEOUT_MS: u64 = 1000;

/// Errors raised by config validation.
///
/// Each violated invariant is a distinct variant so callers can tell exactly
/// which field was rejected.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("max_workers must be at least 1 (got {0})")]
    MaxWorkersTooLow(usize),

    #[error("min_workers must be at least 1 (got {0})")]
    MinWorkersTooLow(usize),

    #[error("min_workers ({min}) must not exceed max_workers ({max})")]
    MinExceedsMax { min: usize, max: usize },

    #[error("memory_limit_mb must be at least {MIN_MEMORY_LIMIT_MB} (got {0})")]
    MemoryLimitTooLow(u64),

    #[error("worker_timeout_ms must be at least {MIN_WORKER_TIMEOUT_MS} (got {0})")]
    WorkerTimeoutTooLow(u64),
}

/// Pool sizing, limits and scheduling policy.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `max_workers` | 4 |
/// | `min_workers` | 1 |
/// | `memory_limit_mb` | 512 |
/// | `worker_timeout_ms` | 30000 |
/// | `isolation` | false |
/// | `skip_dependents_on_failure` | false |
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkerManagerConfig {
    /// Concurrency ceiling: at most this many workers may be busy at once.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Workers created at construction; the pool never shrinks below this
    /// except on shutdown.
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,

    /// Advisory memory budget in MB. Exposed for external backpressure;
    /// the engine itself never rejects tasks based on it.
    #[serde(default = "default_memory_limit")]
    pub memory_limit_mb: u64,

    /// Advisory per-attempt timeout in milliseconds, passed through to the
    /// executor via [`WorkerManager::config`](crate::WorkerManager::config).
    /// The engine does not interrupt a running attempt.
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout_ms: u64,

    /// Pass-through isolation flag for the external executor. Not enforced
    /// by the engine.
    #[serde(default)]
    pub isolation: bool,

    /// If true, a task whose dependency fails terminally is resolved as
    /// failed without running, and the skip cascades to its own dependents.
    /// If false (default), dependents run once the dependency has any
    /// terminal result.
    #[serde(default)]
    pub skip_dependents_on_failure: bool,
}

fn default_max_workers() -> usize {
    4
}

fn default_min_workers() -> usize {
    1
}

fn default_memory_limit() -> u64 {
    512
}

fn default_worker_timeout() -> u64 {
    30_000
}

impl Default for WorkerManagerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            min_workers: default_min_workers(),
            memory_limit_mb: default_memory_limit(),
            worker_timeout_ms: default_worker_timeout(),
            isolation: false,
            skip_dependents_on_failure: false,
        }
    }
}

impl WorkerManagerConfig {
    /// Check every invariant, returning the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers < 1 {
            return Err(ConfigError::MaxWorkersTooLow(self.max_workers));
        }
        if self.min_workers < 1 {
            return Err(ConfigError::MinWorkersTooLow(self.min_workers));
        }
        if self.min_workers > self.max_workers {
            return Err(ConfigError::MinExceedsMax {
                min: self.min_workers,
                max: self.max_workers,
            });
        }
        if self.memory_limit_mb < MIN_MEMORY_LIMIT_MB {
            return Err(ConfigError::MemoryLimitTooLow(self.memory_limit_mb));
        }
        if self.worker_timeout_ms < MIN_WORKER_TIMEOUT_MS {
            return Err(ConfigError::WorkerTimeoutTooLow(self.worker_timeout_ms));
        }
        Ok(())
    }
}

/// Partial update applied to a [`WorkerManagerConfig`].
///
/// Unset fields keep their previous values. The merged config is validated
/// as a whole before any field is committed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    pub max_workers: Option<usize>,
    pub min_workers: Option<usize>,
    pub memory_limit_mb: Option<u64>,
    pub worker_timeout_ms: Option<u64>,
    pub isolation: Option<bool>,
    pub skip_dependents_on_failure: Option<bool>,
}

impl ConfigUpdate {
    /// Produce the config that would result from applying this update.
    pub fn merged_with(&self, current: &WorkerManagerConfig) -> WorkerManagerConfig {
        WorkerManagerConfig {
            max_workers: self.max_workers.unwrap_or(current.max_workers),
            min_workers: self.min_workers.unwrap_or(current.min_workers),
            memory_limit_mb: self.memory_limit_mb.unwrap_or(current.memory_limit_mb),
            worker_timeout_ms: self.worker_timeout_ms.unwrap_or(current.worker_timeout_ms),
            isolation: self.isolation.unwrap_or(current.isolation),
            skip_dependents_on_failure: self
                .skip_dependents_on_failure
                .unwrap_or(current.skip_dependents_on_failure),
        }
    }
}

/// Retry backoff shape and flakiness threshold.
///
/// The delay before attempt `n + 1` after a failed attempt `n` is
/// `min(base_delay_ms * multiplier^n, max_delay_ms)`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Growth factor applied per failed attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Ceiling on any single backoff delay, in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Minimum number of disagreeing attempt pairs before a task is
    /// classified flaky. 1 means a single pass/fail disagreement suffices.
    #[serde(default = "default_disagreement_threshold")]
    pub flaky_disagreement_threshold: u32,
}

fn default_base_delay() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_disagreement_threshold() -> u32 {
    1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay(),
            flaky_disagreement_threshold: default_disagreement_threshold(),
        }
    }
}

/// Root configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Pool settings.
    #[serde(default)]
    pub pool: WorkerManagerConfig,

    /// Retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    config.pool.validate()?;
    Ok(config)
}

/// Load configuration from a string.
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    config.pool.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(WorkerManagerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_max_workers_rejected() {
        let config = WorkerManagerConfig {
            max_workers: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MaxWorkersTooLow(0))
        ));
    }

    #[test]
    fn test_min_workers_rejected() {
        let config = WorkerManagerConfig {
            min_workers: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MinWorkersTooLow(0))
        ));
    }

    #[test]
    fn test_min_exceeding_max_rejected() {
        let config = WorkerManagerConfig {
            max_workers: 2,
            min_workers: 5,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MinExceedsMax { min: 5, max: 2 })
        ));
    }

    #[test]
    fn test_memory_limit_rejected() {
        let config = WorkerManagerConfig {
            memory_limit_mb: 63,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MemoryLimitTooLow(63))
        ));
    }

    #[test]
    fn test_worker_timeout_rejected() {
        let config = WorkerManagerConfig {
            worker_timeout_ms: 999,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::WorkerTimeoutTooLow(999))
        ));
    }

    #[test]
    fn test_update_merges_partial_fields() {
        let current = WorkerManagerConfig::default();
        let update = ConfigUpdate {
            max_workers: Some(16),
            isolation: Some(true),
            ..Default::default()
        };

        let merged = update.merged_with(&current);
        assert_eq!(merged.max_workers, 16);
        assert!(merged.isolation);
        assert_eq!(merged.min_workers, current.min_workers);
        assert_eq!(merged.memory_limit_mb, current.memory_limit_mb);
    }

    #[test]
    fn test_load_config_str_with_defaults() {
        let config = load_config_str(
            r#"
            [pool]
            max_workers = 8
            min_workers = 2
        "#,
        )
        .unwrap();

        assert_eq!(config.pool.max_workers, 8);
        assert_eq!(config.pool.min_workers, 2);
        assert_eq!(config.pool.memory_limit_mb, 512);
        assert_eq!(config.retry.base_delay_ms, 500);
    }

    #[test]
    fn test_load_config_str_rejects_invalid_pool() {
        let result = load_config_str(
            r#"
            [pool]
            max_workers = 2
            min_workers = 4
        "#,
        );
        assert!(result.is_err());
    }
}
