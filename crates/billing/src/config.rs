//! Billing configuration loaded from the environment

use std::time::Duration as StdDuration;
use time::Duration;

use crate::error::{BillingError, BillingResult};
use crate::subscriptions::GRACE_PERIOD_DAYS;

const SANDBOX_SNAP_URL: &str = "https://app.sandbox.midtrans.com";
const PRODUCTION_SNAP_URL: &str = "https://app.midtrans.com";
const SANDBOX_API_URL: &str = "https://api.sandbox.midtrans.com";
const PRODUCTION_API_URL: &str = "https://api.midtrans.com";

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> BillingResult<T> {
    match env_opt(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value", key))),
        None => Ok(default),
    }
}

/// Midtrans credentials and endpoints
#[derive(Clone)]
pub struct GatewayConfig {
    pub server_key: String,
    pub is_production: bool,
    pub snap_url: String,
    pub api_url: String,
    pub timeout: StdDuration,
    pub finish_url: Option<String>,
    pub error_url: Option<String>,
    pub pending_url: Option<String>,
    /// Lifetime of a hosted checkout page, in minutes
    pub checkout_expiry_minutes: u32,
}

// The server key must never reach the logs.
impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("server_key", &"[redacted]")
            .field("is_production", &self.is_production)
            .field("snap_url", &self.snap_url)
            .field("api_url", &self.api_url)
            .field("timeout", &self.timeout)
            .field("checkout_expiry_minutes", &self.checkout_expiry_minutes)
            .finish()
    }
}

impl GatewayConfig {
    pub fn sandbox(server_key: impl Into<String>) -> Self {
        Self {
            server_key: server_key.into(),
            is_production: false,
            snap_url: SANDBOX_SNAP_URL.to_string(),
            api_url: SANDBOX_API_URL.to_string(),
            timeout: StdDuration::from_secs(15),
            finish_url: None,
            error_url: None,
            pending_url: None,
            checkout_expiry_minutes: 1440,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        let server_key = env_opt("MIDTRANS_SERVER_KEY")
            .ok_or_else(|| BillingError::Config("MIDTRANS_SERVER_KEY is not set".to_string()))?;
        let is_production = env_parse("MIDTRANS_IS_PRODUCTION", false)?;

        let (default_snap, default_api) = if is_production {
            (PRODUCTION_SNAP_URL, PRODUCTION_API_URL)
        } else {
            (SANDBOX_SNAP_URL, SANDBOX_API_URL)
        };

        Ok(Self {
            server_key,
            is_production,
            snap_url: env_opt("MIDTRANS_SNAP_URL").unwrap_or_else(|| default_snap.to_string()),
            api_url: env_opt("MIDTRANS_API_URL").unwrap_or_else(|| default_api.to_string()),
            timeout: StdDuration::from_secs(env_parse("MIDTRANS_TIMEOUT_SECS", 15u64)?),
            finish_url: env_opt("PAYMENT_FINISH_URL"),
            error_url: env_opt("PAYMENT_ERROR_URL"),
            pending_url: env_opt("PAYMENT_PENDING_URL"),
            checkout_expiry_minutes: env_parse("CHECKOUT_EXPIRY_MINUTES", 1440u32)?,
        })
    }
}

/// Policy knobs of the billing core
#[derive(Debug, Clone)]
pub struct BillingSettings {
    pub grace_period: Duration,
    /// Age after which an unpaid checkout is reconciled and released
    pub checkout_expiry: Duration,
    pub currency: String,
    pub transaction_page_size: i64,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::days(GRACE_PERIOD_DAYS),
            checkout_expiry: Duration::minutes(1440),
            currency: "IDR".to_string(),
            transaction_page_size: 50,
        }
    }
}

impl BillingSettings {
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();
        let expiry_minutes: i64 = env_parse("CHECKOUT_EXPIRY_MINUTES", 1440)?;
        if expiry_minutes <= 0 {
            return Err(BillingError::Config(
                "CHECKOUT_EXPIRY_MINUTES must be positive".to_string(),
            ));
        }

        Ok(Self {
            checkout_expiry: Duration::minutes(expiry_minutes),
            currency: env_opt("BILLING_CURRENCY")
                .map(|c| c.to_ascii_uppercase())
                .unwrap_or(defaults.currency),
            ..defaults
        })
    }
}
