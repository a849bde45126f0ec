//! Server configuration loaded from the environment

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    /// Direct (non-pooled) URL used for migrations when set
    pub database_direct_url: Option<String>,
    pub bind_address: String,
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    /// Shared secret expected in the internal access header
    pub internal_access_secret: String,
    pub allowed_origins: Vec<String>,
    pub run_migrations: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("jwt_expiry_hours", &self.jwt_expiry_hours)
            .field("allowed_origins", &self.allowed_origins)
            .field("run_migrations", &self.run_migrations)
            .finish_non_exhaustive()
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn flag(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" | "" => Ok(false),
            _ => Err(ConfigError::Invalid { key, value: v }),
        },
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_expiry_hours = match std::env::var("JWT_EXPIRY_HOURS") {
            Err(_) => 24,
            Ok(v) => v.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "JWT_EXPIRY_HOURS",
                value: v,
            })?,
        };

        // Default to localhost for development; production should set ALLOWED_ORIGINS
        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            database_direct_url: std::env::var("DATABASE_DIRECT_URL").ok(),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            jwt_secret: required("JWT_SECRET")?,
            jwt_expiry_hours,
            internal_access_secret: required("INTERNAL_ACCESS_SECRET")?,
            allowed_origins,
            run_migrations: flag("RUN_MIGRATIONS", false)?,
        })
    }

    /// Configuration for router tests
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            database_url: "postgres://localhost/brewtrack_test".to_string(),
            database_direct_url: None,
            bind_address: "127.0.0.1:0".to_string(),
            jwt_secret: "test-jwt-secret-key-for-testing-only".to_string(),
            jwt_expiry_hours: 24,
            internal_access_secret: "test-internal-secret".to_string(),
            allowed_origins: vec![],
            run_migrations: false,
        }
    }
}
