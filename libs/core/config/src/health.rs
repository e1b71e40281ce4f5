use crate::{ConfigError, FromEnv, env_or_default, env_parse_or};
use std::net::Ipv4Addr;

const DEFAULT_HEALTH_PORT: u16 = 8083;

/// Bind address for a worker's health and metrics endpoints
#[derive(Clone, Debug)]
pub struct HealthServerConfig {
    pub host: String,
    pub port: u16,
}

impl HealthServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Get the server address as "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromEnv for HealthServerConfig {
    /// Reads from environment variables with defaults:
    /// - JOBS_HEALTH_HOST: defaults to 0.0.0.0
    /// - JOBS_HEALTH_PORT: defaults to 8083
    fn from_env() -> Result<Self, ConfigError> {
        let host = env_or_default("JOBS_HEALTH_HOST", &Ipv4Addr::UNSPECIFIED.to_string());
        let port = env_parse_or("JOBS_HEALTH_PORT", DEFAULT_HEALTH_PORT)?;

        Ok(Self { host, port })
    }
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED.to_string(), DEFAULT_HEALTH_PORT)
    }
}
