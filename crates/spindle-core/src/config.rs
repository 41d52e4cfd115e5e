//! Queue configuration.
//!
//! JSON, every field optional:
//!
//! ```json
//! { "default_attempts": 4, "backoff": { "type": "fixed", "delay_ms": 500 }, "concurrency": 2 }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::BackoffStrategy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Max attempts for jobs added without an override.
    pub default_attempts: u32,

    /// Queue-wide backoff. Jobs may override it.
    pub backoff: BackoffStrategy,

    /// Max simultaneously active jobs per worker.
    pub concurrency: usize,

    /// Lease duration. A lease not renewed within this time is stalled.
    pub stale_lease_timeout_ms: u64,

    /// Scheduler tick.
    pub stalled_interval_ms: u64,

    /// Stalls tolerated before the job is failed.
    pub max_stalled_count: u32,

    /// Idle wait between claims, and backoff when the store is unavailable.
    pub poll_interval_ms: u64,

    /// Default grace period for closing a worker.
    pub close_grace_ms: u64,

    /// Keep at most this many completed jobs. `None` keeps them all.
    pub remove_on_complete: Option<usize>,

    /// Keep at most this many failed jobs. `None` keeps them all.
    pub remove_on_fail: Option<usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_attempts: 1,
            backoff: BackoffStrategy::None,
            concurrency: 1,
            stale_lease_timeout_ms: 30_000,
            stalled_interval_ms: 30_000,
            max_stalled_count: 1,
            poll_interval_ms: 1_000,
            close_grace_ms: 5_000,
            remove_on_complete: None,
            remove_on_fail: None,
        }
    }
}

impl QueueConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "default_attempts",
                reason: "must be at least 1",
            });
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "concurrency",
                reason: "must be at least 1",
            });
        }
        if u32::try_from(self.concurrency).is_err() {
            return Err(ConfigError::Invalid {
                field: "concurrency",
                reason: "too large",
            });
        }
        if self.stale_lease_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "stale_lease_timeout_ms",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.stale_lease_timeout_ms)
    }

    pub fn stalled_interval(&self) -> Duration {
        Duration::from_millis(self.stalled_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_object_gives_defaults() {
        let config = QueueConfig::from_json_str("{}").unwrap();
        assert_eq!(config, QueueConfig::default());
        assert_eq!(config.lease_duration(), Duration::from_secs(30));
    }

    #[test]
    fn parses_backoff_and_overrides() {
        let config = QueueConfig::from_json_str(
            r#"{"default_attempts": 4, "backoff": {"type": "exponential", "delay_ms": 100}, "concurrency": 3}"#,
        )
        .unwrap();

        assert_eq!(config.default_attempts, 4);
        assert_eq!(config.backoff, BackoffStrategy::exponential(Duration::from_millis(100)));
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.poll_interval_ms, 1_000);
        assert_eq!(config.remove_on_complete, None);
    }

    #[test]
    fn parses_retention_limits() {
        let config =
            QueueConfig::from_json_str(r#"{"remove_on_complete": 10, "remove_on_fail": 10}"#)
                .unwrap();
        assert_eq!(config.remove_on_complete, Some(10));
        assert_eq!(config.remove_on_fail, Some(10));
    }

    #[rstest]
    #[case::zero_attempts(r#"{"default_attempts": 0}"#, "default_attempts")]
    #[case::zero_concurrency(r#"{"concurrency": 0}"#, "concurrency")]
    #[case::zero_lease(r#"{"stale_lease_timeout_ms": 0}"#, "stale_lease_timeout_ms")]
    fn rejects_invalid_values(#[case] json: &str, #[case] expected: &str) {
        let err = QueueConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field, .. } if field == expected));
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = QueueConfig::from_json_str(r#"{"attempts": 3}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = QueueConfig::from_path("/nonexistent/spindle.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
