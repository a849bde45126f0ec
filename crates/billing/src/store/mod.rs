//! Persistence boundary for plans, subscriptions and the transaction ledger
//!
//! Every state change goes through [`BillingStore::attempt_transition`]: a
//! guarded subscription update plus ledger writes that commit together or not
//! at all. Guards are re-checked under the row lock, so a caller that read
//! stale state loses the race cleanly (`Ok(false)`) instead of overwriting a
//! concurrent writer.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::plans::SubscriptionPlan;
use crate::subscriptions::{Subscription, SubscriptionStatus};
use crate::transactions::{Transaction, TransactionStatus};

pub mod memory;
pub mod pg;

pub use memory::InMemoryBillingStore;
pub use pg::PgBillingStore;

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<SubscriptionPlan>>;

    /// The active zero-price plan tenants fall back to on cancellation
    async fn get_free_plan(&self) -> BillingResult<Option<SubscriptionPlan>>;

    async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn get_subscription_by_tenant(
        &self,
        tenant_id: Uuid,
    ) -> BillingResult<Option<Subscription>>;

    async fn get_transaction(&self, transaction_id: Uuid) -> BillingResult<Option<Transaction>>;

    async fn get_transaction_by_gateway_id(
        &self,
        order_id: &str,
    ) -> BillingResult<Option<Transaction>>;

    /// Newest first
    async fn list_transactions(&self, tenant_id: Uuid, limit: i64)
        -> BillingResult<Vec<Transaction>>;

    /// Subscriptions past their period end that the grace rules may lapse.
    /// Excludes payment holds, scheduled cancellations and deferred changes,
    /// which other sweeps own.
    async fn list_grace_candidates(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>>;

    /// Subscriptions with a deferred plan change whose period has ended
    async fn list_due_deferred_changes(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>>;

    /// Subscriptions flagged `cancel_at_period_end` whose period has ended
    async fn list_due_cancellations(&self, now: OffsetDateTime)
        -> BillingResult<Vec<Subscription>>;

    /// Gateway checkouts still `PENDING` that were created before `cutoff`
    async fn list_stale_pending_transactions(
        &self,
        cutoff: OffsetDateTime,
    ) -> BillingResult<Vec<Transaction>>;

    /// `PENDING_CHECKOUT` subscriptions with no `PENDING` transaction left
    async fn list_orphaned_checkouts(&self) -> BillingResult<Vec<Subscription>>;

    /// Most recent gateway checkout for the tenant, whatever its status
    async fn latest_checkout(&self, tenant_id: Uuid) -> BillingResult<Option<Transaction>>;

    /// Apply `transition` atomically.
    ///
    /// Returns `Ok(false)` without writing anything when the subscription guard
    /// or any required ledger guard no longer holds.
    async fn attempt_transition(&self, transition: Transition) -> BillingResult<bool>;
}

/// Conditions the subscription row must still satisfy for a write to apply.
/// Unset fields are not checked.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionGuard {
    pub statuses: Option<Vec<SubscriptionStatus>>,
    pub excluded_status: Option<SubscriptionStatus>,
    pub plan_id: Option<Uuid>,
    pub intended_plan_id: Option<Option<Uuid>>,
    pub period_end: Option<Option<OffsetDateTime>>,
    pub cancel_at_period_end: Option<bool>,
    /// Reject when the tenant has any `PENDING` transaction
    pub no_pending_transactions: bool,
}

impl SubscriptionGuard {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn status_in(statuses: &[SubscriptionStatus]) -> Self {
        Self {
            statuses: Some(statuses.to_vec()),
            ..Self::default()
        }
    }

    pub fn not_status(mut self, status: SubscriptionStatus) -> Self {
        self.excluded_status = Some(status);
        self
    }

    pub fn plan(mut self, plan_id: Uuid) -> Self {
        self.plan_id = Some(plan_id);
        self
    }

    pub fn intended_plan(mut self, intended: Option<Uuid>) -> Self {
        self.intended_plan_id = Some(intended);
        self
    }

    pub fn period_end(mut self, end: Option<OffsetDateTime>) -> Self {
        self.period_end = Some(end);
        self
    }

    pub fn cancel_flag(mut self, flag: bool) -> Self {
        self.cancel_at_period_end = Some(flag);
        self
    }

    pub fn without_pending_transactions(mut self) -> Self {
        self.no_pending_transactions = true;
        self
    }

    /// Evaluate against a locked row. `has_pending` tells whether the tenant
    /// currently has a `PENDING` transaction.
    pub fn matches(&self, sub: &Subscription, has_pending: bool) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&sub.status) {
                return false;
            }
        }
        if self.excluded_status == Some(sub.status) {
            return false;
        }
        if self.plan_id.is_some_and(|plan| plan != sub.plan_id) {
            return false;
        }
        if self
            .intended_plan_id
            .is_some_and(|intended| intended != sub.intended_plan_id)
        {
            return false;
        }
        if self
            .period_end
            .is_some_and(|end| end != sub.current_period_end)
        {
            return false;
        }
        if self
            .cancel_at_period_end
            .is_some_and(|flag| flag != sub.cancel_at_period_end)
        {
            return false;
        }
        !(self.no_pending_transactions && has_pending)
    }
}

/// Subscription fields to overwrite. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPatch {
    pub status: Option<SubscriptionStatus>,
    pub plan_id: Option<Uuid>,
    /// New `(current_period_start, current_period_end)`
    pub period: Option<(OffsetDateTime, Option<OffsetDateTime>)>,
    pub intended_plan_id: Option<Option<Uuid>>,
    pub cancel_at_period_end: Option<bool>,
}

impl SubscriptionPatch {
    pub fn apply_to(&self, sub: &mut Subscription, at: OffsetDateTime) {
        if let Some(status) = self.status {
            sub.status = status;
        }
        if let Some(plan_id) = self.plan_id {
            sub.plan_id = plan_id;
        }
        if let Some((start, end)) = self.period {
            sub.current_period_start = start;
            sub.current_period_end = end;
        }
        if let Some(intended) = self.intended_plan_id {
            sub.intended_plan_id = intended;
        }
        if let Some(flag) = self.cancel_at_period_end {
            sub.cancel_at_period_end = flag;
        }
        sub.updated_at = at;
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionWrite {
    pub subscription_id: Uuid,
    pub guard: SubscriptionGuard,
    pub patch: SubscriptionPatch,
}

#[derive(Debug, Clone)]
pub enum LedgerWrite {
    /// Insert a new transaction
    Record(Transaction),
    /// Move one transaction out of one of `from`. Required: the whole
    /// transition is abandoned when its status is no longer in `from`.
    Settle {
        transaction_id: Uuid,
        from: Vec<TransactionStatus>,
        to: TransactionStatus,
        gateway_status: Option<String>,
    },
    /// Move every `SCHEDULED` transaction of the tenant to `to`. Matching
    /// zero rows is not an error.
    SettleScheduled {
        tenant_id: Uuid,
        to: TransactionStatus,
    },
}

/// One atomic unit of billing state change
#[derive(Debug, Clone)]
pub struct Transition {
    /// Short label used in logs
    pub reason: &'static str,
    pub at: OffsetDateTime,
    pub subscription: Option<SubscriptionWrite>,
    pub ledger: Vec<LedgerWrite>,
}

impl Transition {
    pub fn new(reason: &'static str, at: OffsetDateTime) -> Self {
        Self {
            reason,
            at,
            subscription: None,
            ledger: Vec::new(),
        }
    }

    pub fn subscription(
        mut self,
        subscription_id: Uuid,
        guard: SubscriptionGuard,
        patch: SubscriptionPatch,
    ) -> Self {
        self.subscription = Some(SubscriptionWrite {
            subscription_id,
            guard,
            patch,
        });
        self
    }

    pub fn ledger(mut self, write: LedgerWrite) -> Self {
        self.ledger.push(write);
        self
    }

    pub fn record(self, transaction: Transaction) -> Self {
        self.ledger(LedgerWrite::Record(transaction))
    }

    pub fn settle(
        self,
        transaction_id: Uuid,
        from: &[TransactionStatus],
        to: TransactionStatus,
        gateway_status: Option<String>,
    ) -> Self {
        self.ledger(LedgerWrite::Settle {
            transaction_id,
            from: from.to_vec(),
            to,
            gateway_status,
        })
    }
}
