//! Worker configuration
//!
//! This module provides `WorkerConfig` for configuring the job worker and
//! the publisher that re-enqueues its retries.

use crate::retry::DEFAULT_BACKOFF_UNIT;
use std::time::Duration;

/// Queue used when none is configured
pub const DEFAULT_QUEUE_NAME: &str = "jobs";

/// Upper bound on a single handler invocation
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Configuration for the job worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue to consume from (and re-publish retries to)
    pub queue_name: String,

    /// Exchange used for re-publishing; empty means the default exchange
    pub exchange: String,

    /// Number of consumption loops (always at least 1)
    pub concurrency: usize,

    /// Deadline for a single handler invocation
    pub handler_timeout: Duration,

    /// Backoff unit; a job that failed on attempt k waits k² units
    pub backoff_unit: Duration,
}

impl WorkerConfig {
    /// Create a config for `queue_name`; an empty name selects `"jobs"`
    pub fn new(queue_name: impl Into<String>) -> Self {
        let queue_name = queue_name.into();
        Self {
            queue_name: if queue_name.is_empty() {
                DEFAULT_QUEUE_NAME.to_string()
            } else {
                queue_name
            },
            ..Self::default()
        }
    }

    /// Set the exchange retries are published to
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Set the number of consumption loops (0 becomes 1)
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Re-apply the invariants after direct field edits
    pub(crate) fn normalized(mut self) -> Self {
        if self.queue_name.is_empty() {
            self.queue_name = DEFAULT_QUEUE_NAME.to_string();
        }
        self.concurrency = self.concurrency.max(1);
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            exchange: String::new(),
            concurrency: 1,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            backoff_unit: DEFAULT_BACKOFF_UNIT,
        }
    }
}

#[cfg(feature = "config")]
impl core_config::FromEnv for WorkerConfig {
    /// Reads from environment variables with defaults:
    /// - JOBS_QUEUE_NAME: defaults to "jobs"
    /// - JOBS_EXCHANGE: defaults to "" (default exchange)
    /// - JOBS_CONCURRENCY: defaults to 1, values <= 0 become 1
    /// - JOBS_HANDLER_TIMEOUT_SECS: defaults to 300
    fn from_env() -> Result<Self, core_config::ConfigError> {
        use core_config::{env_or_default, env_parse_or};

        let concurrency: i64 = env_parse_or("JOBS_CONCURRENCY", 1)?;
        let timeout_secs: u64 = env_parse_or(
            "JOBS_HANDLER_TIMEOUT_SECS",
            DEFAULT_HANDLER_TIMEOUT.as_secs(),
        )?;

        Ok(
            WorkerConfig::new(env_or_default("JOBS_QUEUE_NAME", DEFAULT_QUEUE_NAME))
                .with_exchange(env_or_default("JOBS_EXCHANGE", ""))
                .with_concurrency(usize::try_from(concurrency).unwrap_or(1))
                .with_handler_timeout(Duration::from_secs(timeout_secs)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.queue_name, "jobs");
        assert_eq!(config.exchange, "");
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.handler_timeout, Duration::from_secs(300));
        assert_eq!(config.backoff_unit, Duration::from_secs(1));
    }

    #[test]
    fn test_empty_queue_name_defaults() {
        assert_eq!(WorkerConfig::new("").queue_name, "jobs");
        assert_eq!(WorkerConfig::new("mail").queue_name, "mail");
    }

    #[test]
    fn test_concurrency_clamped() {
        assert_eq!(WorkerConfig::new("q").with_concurrency(0).concurrency, 1);
        assert_eq!(WorkerConfig::new("q").with_concurrency(8).concurrency, 8);
    }

    #[test]
    fn test_normalized_repairs_direct_edits() {
        let config = WorkerConfig {
            queue_name: String::new(),
            concurrency: 0,
            ..WorkerConfig::default()
        }
        .normalized();

        assert_eq!(config.queue_name, "jobs");
        assert_eq!(config.concurrency, 1);
    }

    #[cfg(feature = "config")]
    mod from_env {
        use super::*;
        use core_config::FromEnv;

        #[test]
        fn test_from_env_defaults() {
            temp_env::with_vars(
                [
                    ("JOBS_QUEUE_NAME", None::<&str>),
                    ("JOBS_EXCHANGE", None),
                    ("JOBS_CONCURRENCY", None),
                    ("JOBS_HANDLER_TIMEOUT_SECS", None),
                ],
                || {
                    let config = WorkerConfig::from_env().unwrap();
                    assert_eq!(config.queue_name, "jobs");
                    assert_eq!(config.exchange, "");
                    assert_eq!(config.concurrency, 1);
                    assert_eq!(config.handler_timeout, Duration::from_secs(300));
                },
            );
        }

        #[test]
        fn test_from_env_custom_values() {
            temp_env::with_vars(
                [
                    ("JOBS_QUEUE_NAME", Some("mail")),
                    ("JOBS_EXCHANGE", Some("app")),
                    ("JOBS_CONCURRENCY", Some("4")),
                    ("JOBS_HANDLER_TIMEOUT_SECS", Some("60")),
                ],
                || {
                    let config = WorkerConfig::from_env().unwrap();
                    assert_eq!(config.queue_name, "mail");
                    assert_eq!(config.exchange, "app");
                    assert_eq!(config.concurrency, 4);
                    assert_eq!(config.handler_timeout, Duration::from_secs(60));
                },
            );
        }

        #[test]
        fn test_from_env_non_positive_concurrency() {
            for value in ["0", "-3"] {
                temp_env::with_var("JOBS_CONCURRENCY", Some(value), || {
                    assert_eq!(WorkerConfig::from_env().unwrap().concurrency, 1);
                });
            }
        }

        #[test]
        fn test_from_env_invalid_concurrency() {
            temp_env::with_var("JOBS_CONCURRENCY", Some("lots"), || {
                assert!(WorkerConfig::from_env().is_err());
            });
        }
    }
}
