use crate::{ConfigError, FromEnv, env_required};

/// Relational database configuration
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Load from `DATABASE_URL` when it is set.
    ///
    /// Services that can run without a database use this instead of `from_env`.
    pub fn optional_from_env() -> Option<Self> {
        Self::from_env().ok()
    }
}

impl FromEnv for DatabaseConfig {
    /// Requires DATABASE_URL to be set (no default)
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: env_required("DATABASE_URL")?,
        })
    }
}
