//! Service settings loaded from the environment

use core_config::database::DatabaseConfig;
use core_config::health::HealthServerConfig;
use core_config::redis::RedisConfig;
use core_config::{ConfigError, Environment, FromEnv, env_or_default, env_parse_or};
use job_worker::WorkerConfig;
use std::time::Duration;

const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Settings {
    pub environment: Environment,
    pub redis: RedisConfig,
    /// Audit cleanup is only registered when a database is configured
    pub database: Option<DatabaseConfig>,
    pub health: HealthServerConfig,
    pub worker: WorkerConfig,
    pub shutdown_timeout: Duration,
    /// Prefix for Redis consumer names, so pending entries can be traced to a pod
    pub consumer_prefix: String,
}

impl FromEnv for Settings {
    /// Reads from environment variables:
    /// - REDIS_URL (or REDIS_HOST): required
    /// - DATABASE_URL: optional
    /// - JOBS_*: worker and health server settings
    /// - JOBS_SHUTDOWN_TIMEOUT_SECS: defaults to 30
    /// - HOSTNAME: consumer name prefix, defaults to "jobs-worker"
    fn from_env() -> Result<Self, ConfigError> {
        let shutdown_secs = env_parse_or("JOBS_SHUTDOWN_TIMEOUT_SECS", DEFAULT_SHUTDOWN_TIMEOUT_SECS)?;

        Ok(Self {
            environment: Environment::from_env(),
            redis: RedisConfig::from_env()?,
            database: DatabaseConfig::optional_from_env(),
            health: HealthServerConfig::from_env()?,
            worker: WorkerConfig::from_env()?,
            shutdown_timeout: Duration::from_secs(shutdown_secs),
            consumer_prefix: env_or_default("HOSTNAME", "jobs-worker"),
        })
    }
}
