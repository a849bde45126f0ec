// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError::StateConflict carries the status and message
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Brewtrack Billing Module
//!
//! Subscription billing for brewery and roastery tenants: plan catalog,
//! calendar-aware billing periods, proration, the subscription state machine,
//! hosted checkout through Midtrans Snap, payment confirmation and the
//! time-driven sweeps.
//!
//! ## Features
//!
//! - **Plan changes**: immediate (prorated) or deferred to the period end
//! - **Checkout**: renewal and outright purchase through a hosted payment page
//! - **Payment confirmation**: webhook push and poll-based reconcile, idempotent
//! - **Sweeps**: grace-period lapse, deferred activation, scheduled downgrades,
//!   release of abandoned checkouts
//! - **Invariants**: read-only consistency checks over the ledger

pub mod calendar;
pub mod checkout;
pub mod config;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod plans;
pub mod proration;
pub mod store;
pub mod subscriptions;
pub mod sweeps;
pub mod transactions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Calendar
pub use calendar::{add_calendar_months, add_calendar_years, compute_next_period_end, PlanInterval};

// Checkout
pub use checkout::{
    CheckoutInput, CheckoutService, CheckoutSession, EffectiveDate, PlanChangeOutcome,
    PlanChangePreview, PlanChangeRequest, PlanSummary, PreviewOptions,
};

// Config
pub use config::{BillingSettings, GatewayConfig};

// Error
pub use error::{BillingError, BillingResult};

// Gateway
pub use gateway::{
    map_status, CheckoutToken, GatewayError, GatewayNotification, GatewayStatusReport,
    MidtransGateway, PaymentGateway,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Plans
pub use plans::{ChangeType, SubscriptionPlan};

// Proration
pub use proration::{calculate_proration, ProrationBreakdown};

// Store
pub use store::{BillingStore, InMemoryBillingStore, PgBillingStore};

// Subscriptions
pub use subscriptions::{Subscription, SubscriptionService, SubscriptionStatus, GRACE_PERIOD_DAYS};

// Sweeps
pub use sweeps::{SweepFailure, SweepReport, SweepService};

// Transactions
pub use transactions::{Transaction, TransactionMetadata, TransactionStatus};

// Webhooks
pub use webhooks::{ReconcileOutcome, ReconciliationService};

use sqlx::PgPool;
use std::sync::Arc;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub checkout: CheckoutService,
    pub reconciliation: ReconciliationService,
    pub subscriptions: SubscriptionService,
    pub sweeps: SweepService,
    store: Arc<dyn BillingStore>,
    settings: BillingSettings,
}

/// Upper bound on one page of the transaction history
pub const MAX_TRANSACTION_PAGE: i64 = 200;

impl BillingService {
    /// Create a billing service backed by Postgres and Midtrans, configured
    /// from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let gateway = MidtransGateway::new(GatewayConfig::from_env()?)?;
        let settings = BillingSettings::from_env()?;
        Ok(Self::new(
            Arc::new(PgBillingStore::new(pool)),
            Arc::new(gateway),
            settings,
        ))
    }

    /// Create a billing service with explicit collaborators
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        settings: BillingSettings,
    ) -> Self {
        let reconciliation = ReconciliationService::new(store.clone(), gateway.clone());
        Self {
            checkout: CheckoutService::new(store.clone(), gateway, settings.clone()),
            sweeps: SweepService::new(store.clone(), reconciliation.clone(), settings.clone()),
            subscriptions: SubscriptionService::new(store.clone()),
            reconciliation,
            store,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn BillingStore> {
        &self.store
    }

    pub fn settings(&self) -> &BillingSettings {
        &self.settings
    }

    /// A tenant's ledger, newest first. `limit` defaults to the configured
    /// page size and is capped at [`MAX_TRANSACTION_PAGE`].
    pub async fn transactions(
        &self,
        tenant_id: uuid::Uuid,
        limit: Option<i64>,
    ) -> BillingResult<Vec<Transaction>> {
        let limit = limit
            .unwrap_or(self.settings.transaction_page_size)
            .clamp(1, MAX_TRANSACTION_PAGE);
        self.store.list_transactions(tenant_id, limit).await
    }
}
