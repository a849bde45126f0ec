//! Time-driven subscription transitions
//!
//! Each sweep lists its candidates, then applies one guarded transition per
//! item. Overlapping runs are harmless: an item another run already moved no
//! longer matches its guard and is counted as skipped. A failing item is
//! recorded and the batch carries on.

use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::calendar::compute_next_period_end;
use crate::config::BillingSettings;
use crate::error::{BillingError, BillingResult};
use crate::gateway::GatewayError;
use crate::store::{BillingStore, LedgerWrite, SubscriptionGuard, SubscriptionPatch, Transition};
use crate::subscriptions::{Subscription, SubscriptionStatus};
use crate::transactions::{
    NewTransaction, ScheduledDowngradeMeta, Transaction, TransactionMetadata, TransactionStatus,
};
use crate::webhooks::ReconciliationService;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepFailure {
    pub id: Uuid,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub sweep: &'static str,
    pub processed: usize,
    /// Candidates that no longer matched when their transition ran
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    fn new(sweep: &'static str) -> Self {
        Self {
            sweep,
            processed: 0,
            skipped: 0,
            failed: 0,
            failures: Vec::new(),
        }
    }

    fn record(&mut self, id: Uuid, result: BillingResult<bool>) {
        match result {
            Ok(true) => self.processed += 1,
            Ok(false) => self.skipped += 1,
            Err(e) => {
                tracing::error!(sweep = self.sweep, id = %id, error = %e, "Sweep item failed");
                self.failed += 1;
                self.failures.push(SweepFailure {
                    id,
                    error: e.to_string(),
                });
            }
        }
    }

    fn finish(self) -> Self {
        tracing::info!(
            sweep = self.sweep,
            processed = self.processed,
            skipped = self.skipped,
            failed = self.failed,
            "Sweep finished"
        );
        self
    }
}

#[derive(Clone)]
pub struct SweepService {
    store: Arc<dyn BillingStore>,
    reconciler: ReconciliationService,
    settings: BillingSettings,
}

impl SweepService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        reconciler: ReconciliationService,
        settings: BillingSettings,
    ) -> Self {
        Self {
            store,
            reconciler,
            settings,
        }
    }

    // =========================================================================
    // Grace period
    // =========================================================================

    pub async fn expire_grace_periods(&self) -> BillingResult<SweepReport> {
        self.expire_grace_periods_at(OffsetDateTime::now_utc()).await
    }

    /// `ACTIVE`/`TRIALING` past their period end become `PAST_DUE`; anything
    /// past the grace window becomes `EXPIRED`.
    pub async fn expire_grace_periods_at(&self, now: OffsetDateTime) -> BillingResult<SweepReport> {
        let mut report = SweepReport::new("expire_grace_period");

        for sub in self.store.list_grace_candidates(now).await? {
            let Some(target) = sub.lapse_status(now, self.settings.grace_period) else {
                continue;
            };
            let result = self.lapse(&sub, target, now).await;
            report.record(sub.id, result);
        }

        Ok(report.finish())
    }

    async fn lapse(
        &self,
        sub: &Subscription,
        target: SubscriptionStatus,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let transition = Transition::new("lapse_subscription", now).subscription(
            sub.id,
            SubscriptionGuard::status_in(&[sub.status])
                .period_end(sub.current_period_end)
                .cancel_flag(false)
                .intended_plan(None),
            SubscriptionPatch {
                status: Some(target),
                ..Default::default()
            },
        );

        let applied = self.store.attempt_transition(transition).await?;
        if applied {
            tracing::info!(
                tenant_id = %sub.tenant_id,
                from = %sub.status,
                to = %target,
                period_end = ?sub.current_period_end,
                "Subscription lapsed"
            );
        }
        Ok(applied)
    }

    // =========================================================================
    // Deferred plan changes
    // =========================================================================

    pub async fn activate_deferred_changes(&self) -> BillingResult<SweepReport> {
        self.activate_deferred_changes_at(OffsetDateTime::now_utc())
            .await
    }

    /// Promote staged plans whose period has ended. The new period starts at
    /// the old period end, however late the sweep runs.
    pub async fn activate_deferred_changes_at(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<SweepReport> {
        let mut report = SweepReport::new("activate_deferred_change");

        for sub in self.store.list_due_deferred_changes(now).await? {
            let result = self.activate_deferred(&sub, now).await;
            report.record(sub.id, result);
        }

        Ok(report.finish())
    }

    async fn activate_deferred(&self, sub: &Subscription, now: OffsetDateTime) -> BillingResult<bool> {
        let (Some(intended), Some(boundary)) = (sub.intended_plan_id, sub.current_period_end) else {
            return Ok(false);
        };
        let plan = self
            .store
            .get_plan(intended)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Plan {}", intended)))?;

        let next_end = if plan.is_free() {
            None
        } else {
            Some(compute_next_period_end(boundary, plan.interval))
        };

        let transition = Transition::new("activate_deferred_change", now)
            .subscription(
                sub.id,
                SubscriptionGuard::any()
                    .not_status(SubscriptionStatus::PendingCheckout)
                    .intended_plan(Some(intended))
                    .period_end(sub.current_period_end),
                SubscriptionPatch {
                    status: Some(SubscriptionStatus::Active),
                    plan_id: Some(plan.id),
                    period: Some((boundary, next_end)),
                    intended_plan_id: Some(None),
                    cancel_at_period_end: None,
                },
            )
            .ledger(LedgerWrite::SettleScheduled {
                tenant_id: sub.tenant_id,
                to: TransactionStatus::Paid,
            });

        let applied = self.store.attempt_transition(transition).await?;
        if applied {
            tracing::info!(
                tenant_id = %sub.tenant_id,
                plan = %plan.name,
                period_start = %boundary,
                period_end = ?next_end,
                "Deferred plan change activated"
            );
        }
        Ok(applied)
    }

    // =========================================================================
    // Scheduled downgrades
    // =========================================================================

    pub async fn process_scheduled_downgrades(&self) -> BillingResult<SweepReport> {
        self.process_scheduled_downgrades_at(OffsetDateTime::now_utc())
            .await
    }

    /// Move subscriptions flagged `cancel_at_period_end` onto the free plan
    pub async fn process_scheduled_downgrades_at(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<SweepReport> {
        let mut report = SweepReport::new("process_scheduled_downgrade");
        let due = self.store.list_due_cancellations(now).await?;
        if due.is_empty() {
            return Ok(report.finish());
        }

        let free_plan = self
            .store
            .get_free_plan()
            .await?
            .ok_or_else(|| BillingError::Config("no active free plan in the catalog".to_string()))?;

        for sub in due {
            let Some(period_end) = sub.current_period_end else {
                continue;
            };

            let audit = NewTransaction {
                tenant_id: sub.tenant_id,
                user_id: None,
                subscription_plan_id: free_plan.id,
                amount: rust_decimal::Decimal::ZERO,
                currency: self.settings.currency.clone(),
                billing_cycle: free_plan.interval,
                metadata: TransactionMetadata::ScheduledDowngrade(ScheduledDowngradeMeta {
                    from_plan_id: sub.plan_id,
                    to_plan_id: free_plan.id,
                    period_ended_at: period_end,
                }),
            }
            .completed(now);

            let transition = Transition::new("process_scheduled_downgrade", now)
                .subscription(
                    sub.id,
                    SubscriptionGuard::any()
                        .not_status(SubscriptionStatus::PendingCheckout)
                        .cancel_flag(true)
                        .period_end(sub.current_period_end),
                    SubscriptionPatch {
                        status: Some(SubscriptionStatus::Active),
                        plan_id: Some(free_plan.id),
                        period: Some((now, None)),
                        intended_plan_id: Some(None),
                        cancel_at_period_end: Some(false),
                    },
                )
                .record(audit);

            let result = self.store.attempt_transition(transition).await;
            if matches!(result, Ok(true)) {
                tracing::info!(
                    tenant_id = %sub.tenant_id,
                    from_plan_id = %sub.plan_id,
                    "Subscription downgraded to the free plan"
                );
            }
            report.record(sub.id, result);
        }

        Ok(report.finish())
    }

    // =========================================================================
    // Abandoned checkouts
    // =========================================================================

    pub async fn release_abandoned_checkouts(&self) -> BillingResult<SweepReport> {
        self.release_abandoned_checkouts_at(OffsetDateTime::now_utc())
            .await
    }

    /// Settle stale `PENDING` checkouts against the gateway, then lift the
    /// hold on subscriptions left in `PENDING_CHECKOUT` with nothing pending.
    pub async fn release_abandoned_checkouts_at(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<SweepReport> {
        let mut report = SweepReport::new("release_abandoned_checkout");
        let cutoff = now - self.settings.checkout_expiry;

        for tx in self.store.list_stale_pending_transactions(cutoff).await? {
            let result = self.settle_stale(tx.clone(), now).await;
            report.record(tx.id, result);
        }

        for sub in self.store.list_orphaned_checkouts().await? {
            let result = self.release_hold(&sub, now).await;
            report.record(sub.id, result);
        }

        Ok(report.finish())
    }

    async fn settle_stale(&self, tx: Transaction, now: OffsetDateTime) -> BillingResult<bool> {
        let Some(order_id) = tx.payment_gateway_id.clone() else {
            return Ok(false);
        };

        match self.reconciler.gateway().transaction_status(&order_id).await {
            Ok(report) => {
                let outcome = self.reconciler.apply_report(tx, &report, now).await?;
                Ok(outcome.applied)
            }
            Err(GatewayError::NotFound(_)) => {
                // The hosted checkout was never opened.
                let transition = Transition::new("expire_unused_checkout", now).settle(
                    tx.id,
                    &[TransactionStatus::Pending],
                    TransactionStatus::Expired,
                    Some("not_found".to_string()),
                );
                let applied = self.store.attempt_transition(transition).await?;
                if applied {
                    tracing::info!(
                        order_id = %order_id,
                        tenant_id = %tx.tenant_id,
                        "Unused checkout expired"
                    );
                }
                Ok(applied)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release_hold(&self, sub: &Subscription, now: OffsetDateTime) -> BillingResult<bool> {
        let checkout = self.store.latest_checkout(sub.tenant_id).await?;
        let restored = checkout
            .as_ref()
            .and_then(|tx| tx.metadata.previous_status())
            .filter(|status| *status != SubscriptionStatus::PendingCheckout)
            .unwrap_or(SubscriptionStatus::Active);
        let staged = checkout
            .as_ref()
            .and_then(|tx| tx.metadata.previous_intended_plan_id());

        let transition = Transition::new("release_checkout_hold", now).subscription(
            sub.id,
            SubscriptionGuard::status_in(&[SubscriptionStatus::PendingCheckout])
                .without_pending_transactions(),
            SubscriptionPatch {
                status: Some(restored),
                intended_plan_id: Some(staged),
                ..Default::default()
            },
        );

        let applied = self.store.attempt_transition(transition).await?;
        if applied {
            tracing::info!(
                tenant_id = %sub.tenant_id,
                restored = %restored,
                staged_plan_id = ?staged,
                cancel_at_period_end = sub.cancel_at_period_end,
                "Checkout hold released"
            );
        }
        Ok(applied)
    }
}
