//! Worker configuration

use std::time::Duration;

use thiserror::Error;

use crate::client::Sweep;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Six-field cron expressions (seconds first), all UTC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedules {
    pub expire_grace_period: String,
    pub activate_deferred: String,
    pub process_downgrades: String,
    pub release_checkouts: String,
    pub invariants: String,
}

impl Default for Schedules {
    fn default() -> Self {
        Self {
            expire_grace_period: "0 0 * * * *".to_string(),
            activate_deferred: "0 */15 * * * *".to_string(),
            process_downgrades: "0 */15 * * * *".to_string(),
            release_checkouts: "0 */30 * * * *".to_string(),
            invariants: "0 0 4 * * *".to_string(),
        }
    }
}

impl Schedules {
    pub fn for_sweep(&self, sweep: Sweep) -> &str {
        match sweep {
            Sweep::ExpireGracePeriod => &self.expire_grace_period,
            Sweep::ActivateDeferred => &self.activate_deferred,
            Sweep::ProcessDowngrades => &self.process_downgrades,
            Sweep::ReleaseCheckouts => &self.release_checkouts,
        }
    }
}

#[derive(Clone)]
pub struct WorkerConfig {
    pub api_base_url: String,
    pub internal_access_secret: String,
    pub request_timeout: Duration,
    pub schedules: Schedules,
}

impl std::fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("api_base_url", &self.api_base_url)
            .field("internal_access_secret", &"[REDACTED]")
            .field("request_timeout", &self.request_timeout)
            .field("schedules", &self.schedules)
            .finish()
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset and blank values fall back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let internal_access_secret =
            get("INTERNAL_ACCESS_SECRET").ok_or(ConfigError::Missing("INTERNAL_ACCESS_SECRET"))?;

        let api_base_url = get("API_BASE_URL")
            .unwrap_or_else(|| "http://localhost:8080".to_string())
            .trim_end_matches('/')
            .to_string();

        let request_timeout = match get("WORKER_REQUEST_TIMEOUT_SECS") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "WORKER_REQUEST_TIMEOUT_SECS",
                        value: raw,
                    })
                }
            },
            None => Duration::from_secs(120),
        };

        let defaults = Schedules::default();
        let schedules = Schedules {
            expire_grace_period: get("CRON_EXPIRE_GRACE_PERIOD")
                .unwrap_or(defaults.expire_grace_period),
            activate_deferred: get("CRON_ACTIVATE_DEFERRED").unwrap_or(defaults.activate_deferred),
            process_downgrades: get("CRON_PROCESS_DOWNGRADES")
                .unwrap_or(defaults.process_downgrades),
            release_checkouts: get("CRON_RELEASE_CHECKOUTS").unwrap_or(defaults.release_checkouts),
            invariants: get("CRON_INVARIANTS").unwrap_or(defaults.invariants),
        };

        Ok(Self {
            api_base_url,
            internal_access_secret,
            request_timeout,
            schedules,
        })
    }
}
