//! Application state

use brewtrack_billing::{BillingService, InvariantChecker};
use sqlx::PgPool;
use std::sync::Arc;

use crate::{
    auth::{AuthState, InternalAccess, JwtManager},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub billing: Arc<BillingService>,
    /// Read-only consistency checks; needs a database
    pub invariants: Option<InvariantChecker>,
}

impl AppState {
    /// Production wiring: Postgres store, Midtrans gateway, settings from env
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let billing = BillingService::from_env(pool.clone())?;
        tracing::info!(
            currency = %billing.settings().currency,
            checkout_expiry_minutes = billing.settings().checkout_expiry.whole_minutes(),
            "Billing service initialized"
        );

        Ok(Self::with_billing(
            config,
            billing,
            Some(InvariantChecker::new(pool)),
        ))
    }

    pub fn with_billing(
        config: Config,
        billing: BillingService,
        invariants: Option<InvariantChecker>,
    ) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        Self {
            config,
            jwt_manager,
            billing: Arc::new(billing),
            invariants,
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }

    pub fn internal_access(&self) -> InternalAccess {
        InternalAccess::new(&self.config.internal_access_secret)
    }
}
