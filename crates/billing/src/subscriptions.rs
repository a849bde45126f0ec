//! Subscription lifecycle
//!
//! One subscription per tenant. This module holds the status model, the rules
//! deciding which transitions a subscription may take, and the tenant-facing
//! operations that only touch the subscription row (cancel, resume, drop a
//! deferred change). Plan changes and payments live in `checkout` and
//! `webhooks`; time-driven transitions in `sweeps`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::{
    BillingStore, LedgerWrite, SubscriptionGuard, SubscriptionPatch, Transition,
};
use crate::transactions::TransactionStatus;

/// Days after `current_period_end` during which a subscription is `PAST_DUE`
pub const GRACE_PERIOD_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Expired,
    PendingCheckout,
    Cancelled,
    Trialing,
    Unpaid,
}

/// Statuses from which a plan change may be requested. A subscription waiting
/// on a checkout must resolve it first.
pub const PLAN_CHANGE_ALLOWED: &[SubscriptionStatus] = &[
    SubscriptionStatus::Active,
    SubscriptionStatus::PastDue,
    SubscriptionStatus::Cancelled,
    SubscriptionStatus::Unpaid,
    SubscriptionStatus::Trialing,
];

/// Statuses that the grace sweep may move to `PAST_DUE`
pub const LAPSE_TO_PAST_DUE: &[SubscriptionStatus] =
    &[SubscriptionStatus::Active, SubscriptionStatus::Trialing];

/// Statuses that the grace sweep may move to `EXPIRED`
pub const LAPSE_TO_EXPIRED: &[SubscriptionStatus] = &[
    SubscriptionStatus::Active,
    SubscriptionStatus::Trialing,
    SubscriptionStatus::PastDue,
];

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::PastDue => "PAST_DUE",
            SubscriptionStatus::Expired => "EXPIRED",
            SubscriptionStatus::PendingCheckout => "PENDING_CHECKOUT",
            SubscriptionStatus::Cancelled => "CANCELLED",
            SubscriptionStatus::Trialing => "TRIALING",
            SubscriptionStatus::Unpaid => "UNPAID",
        }
    }

    pub fn accepts_plan_change(&self) -> bool {
        PLAN_CHANGE_ALLOWED.contains(self)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ACTIVE" => SubscriptionStatus::Active,
            "PAST_DUE" => SubscriptionStatus::PastDue,
            "EXPIRED" => SubscriptionStatus::Expired,
            "PENDING_CHECKOUT" => SubscriptionStatus::PendingCheckout,
            "CANCELLED" => SubscriptionStatus::Cancelled,
            "TRIALING" => SubscriptionStatus::Trialing,
            "UNPAID" => SubscriptionStatus::Unpaid,
            other => return Err(format!("Unknown subscription status '{}'", other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    /// `None` only on the free plan, which never expires
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    /// Plan staged for activation: awaiting payment or the period boundary
    pub intended_plan_id: Option<Uuid>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Whether the current period has ended. Free subscriptions never lapse.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.current_period_end.is_some_and(|end| end <= now)
    }

    /// Status the grace rules assign at `now`, if it differs from the current one.
    ///
    /// `ACTIVE`/`TRIALING` within the grace window become `PAST_DUE`; once the
    /// window has elapsed any of `ACTIVE`/`TRIALING`/`PAST_DUE` become `EXPIRED`
    /// directly.
    pub fn lapse_status(&self, now: OffsetDateTime, grace: Duration) -> Option<SubscriptionStatus> {
        let end = self.current_period_end?;
        if end > now {
            return None;
        }

        if end <= now - grace {
            LAPSE_TO_EXPIRED
                .contains(&self.status)
                .then_some(SubscriptionStatus::Expired)
        } else {
            LAPSE_TO_PAST_DUE
                .contains(&self.status)
                .then_some(SubscriptionStatus::PastDue)
        }
    }

    /// Validate that a change to `new_plan_id` may be requested at `now`.
    ///
    /// Same-plan requests never go through the change path: while the period
    /// is live there is nothing to change, and after it lapsed the tenant must
    /// renew through checkout.
    pub fn ensure_plan_change_allowed(
        &self,
        new_plan_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        if !self.status.accepts_plan_change() {
            return Err(BillingError::state_conflict(
                self.status,
                "Plan changes are not possible until the pending checkout is resolved",
            ));
        }

        if new_plan_id == self.plan_id {
            let message = if self.is_expired(now) {
                "Subscription has expired; renew the current plan through checkout"
            } else {
                "Subscription is already on this plan"
            };
            return Err(BillingError::state_conflict(self.status, message));
        }

        Ok(())
    }
}

/// Tenant-facing subscription operations outside plan changes
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        self.store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Subscription {}", subscription_id)))
    }

    pub async fn get_for_tenant(&self, tenant_id: Uuid) -> BillingResult<Subscription> {
        self.store
            .get_subscription_by_tenant(tenant_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("Subscription for tenant {}", tenant_id))
            })
    }

    /// Schedule a downgrade to the free plan at the end of the current period.
    /// The subscription stays usable until then.
    pub async fn cancel_at_period_end(&self, tenant_id: Uuid) -> BillingResult<Subscription> {
        let sub = self.get_for_tenant(tenant_id).await?;
        let now = OffsetDateTime::now_utc();

        const CANCELLABLE: &[SubscriptionStatus] = &[
            SubscriptionStatus::Active,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::PastDue,
        ];
        if !CANCELLABLE.contains(&sub.status) {
            return Err(BillingError::state_conflict(
                sub.status,
                "Only active subscriptions can be cancelled",
            ));
        }
        if sub.current_period_end.is_none() {
            return Err(BillingError::state_conflict(
                sub.status,
                "The free plan has no period to cancel",
            ));
        }
        if sub.cancel_at_period_end {
            return Ok(sub);
        }

        // Cancellation supersedes any deferred plan change.
        let transition = Transition::new("cancel_at_period_end", now)
            .subscription(
                sub.id,
                SubscriptionGuard::status_in(CANCELLABLE).cancel_flag(false),
                SubscriptionPatch {
                    cancel_at_period_end: Some(true),
                    intended_plan_id: Some(None),
                    ..Default::default()
                },
            )
            .ledger(LedgerWrite::SettleScheduled {
                tenant_id,
                to: TransactionStatus::Cancelled,
            });
        self.apply(transition, &sub).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            period_end = ?sub.current_period_end,
            "Subscription scheduled to downgrade to free at period end"
        );
        self.get(sub.id).await
    }

    /// Undo `cancel_at_period_end` before the period ends
    pub async fn resume(&self, tenant_id: Uuid) -> BillingResult<Subscription> {
        let sub = self.get_for_tenant(tenant_id).await?;
        let now = OffsetDateTime::now_utc();

        if !sub.cancel_at_period_end {
            return Ok(sub);
        }
        if sub.is_expired(now) {
            return Err(BillingError::state_conflict(
                sub.status,
                "The period has already ended; the downgrade can no longer be undone",
            ));
        }

        let transition = Transition::new("resume", now).subscription(
            sub.id,
            SubscriptionGuard::any()
                .cancel_flag(true)
                .period_end(sub.current_period_end),
            SubscriptionPatch {
                cancel_at_period_end: Some(false),
                ..Default::default()
            },
        );
        self.apply(transition, &sub).await?;

        tracing::info!(tenant_id = %tenant_id, "Scheduled cancellation withdrawn");
        self.get(sub.id).await
    }

    /// Drop a plan change deferred to the period end. Payment holds
    /// (`PENDING_CHECKOUT`) are not affected; they resolve through the gateway.
    pub async fn cancel_scheduled_change(&self, tenant_id: Uuid) -> BillingResult<Subscription> {
        let sub = self.get_for_tenant(tenant_id).await?;
        let now = OffsetDateTime::now_utc();

        if sub.status == SubscriptionStatus::PendingCheckout {
            return Err(BillingError::state_conflict(
                sub.status,
                "A checkout is in progress; it cannot be withdrawn here",
            ));
        }
        let Some(intended) = sub.intended_plan_id else {
            return Ok(sub);
        };

        let transition = Transition::new("cancel_scheduled_change", now)
            .subscription(
                sub.id,
                SubscriptionGuard::any()
                    .intended_plan(Some(intended))
                    .not_status(SubscriptionStatus::PendingCheckout),
                SubscriptionPatch {
                    intended_plan_id: Some(None),
                    ..Default::default()
                },
            )
            .ledger(LedgerWrite::SettleScheduled {
                tenant_id,
                to: TransactionStatus::Cancelled,
            });
        self.apply(transition, &sub).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            intended_plan_id = %intended,
            "Deferred plan change withdrawn"
        );
        self.get(sub.id).await
    }

    async fn apply(&self, transition: Transition, sub: &Subscription) -> BillingResult<()> {
        if self.store.attempt_transition(transition).await? {
            return Ok(());
        }
        let current = self.get(sub.id).await?;
        Err(BillingError::ConcurrentModification(format!(
            "Subscription changed concurrently (now {})",
            current.status
        )))
    }
}
