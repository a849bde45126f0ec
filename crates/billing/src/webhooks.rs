//! Payment confirmation
//!
//! Gateway notifications (push) and on-demand reconciliation (poll) both end
//! in [`ReconciliationService::apply_report`], so the two paths have identical
//! effects. The transaction's own status is the idempotency guard: only a
//! transaction still `PENDING` can be settled, and activation is committed in
//! the same transition as the settlement. A replayed notification, or a poll
//! racing a push for the same order, finds the transaction terminal and
//! changes nothing.

use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::calendar::compute_next_period_end;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{GatewayNotification, GatewayStatusReport, PaymentGateway};
use crate::store::{BillingStore, LedgerWrite, SubscriptionGuard, SubscriptionPatch, Transition};
use crate::subscriptions::SubscriptionStatus;
use crate::transactions::{Transaction, TransactionStatus};

/// Result of applying a gateway status to the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub ok: bool,
    pub order_id: String,
    pub transaction_id: Uuid,
    /// Ledger status after this call
    pub status: TransactionStatus,
    /// Raw status reported by the gateway
    pub gateway_status: String,
    /// Whether this call changed the ledger
    pub applied: bool,
    pub subscription_activated: bool,
}

#[derive(Clone)]
pub struct ReconciliationService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl ReconciliationService {
    pub fn new(store: Arc<dyn BillingStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { store, gateway }
    }

    pub fn gateway(&self) -> &Arc<dyn PaymentGateway> {
        &self.gateway
    }

    async fn transaction_for_order(&self, order_id: &str) -> BillingResult<Transaction> {
        self.store
            .get_transaction_by_gateway_id(order_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Order {}", order_id)))
    }

    /// Handle a pushed notification. The signature is checked before anything
    /// is read or written.
    pub async fn handle_notification(
        &self,
        notification: &GatewayNotification,
    ) -> BillingResult<ReconcileOutcome> {
        if !self.gateway.verify_notification_signature(notification) {
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let tx = self.transaction_for_order(&notification.order_id).await?;

        tracing::info!(
            order_id = %notification.order_id,
            transaction_status = %notification.transaction_status,
            fraud_status = ?notification.fraud_status,
            "Gateway notification received"
        );

        self.apply_report(tx, &notification.status_report(), OffsetDateTime::now_utc())
            .await
    }

    /// Poll the gateway for `order_id` and apply what it reports
    pub async fn reconcile(&self, order_id: &str) -> BillingResult<ReconcileOutcome> {
        let tx = self.transaction_for_order(order_id).await?;
        let report = self.gateway.transaction_status(order_id).await?;
        self.apply_report(tx, &report, OffsetDateTime::now_utc())
            .await
    }

    /// Apply a gateway status to `tx` and, on payment, activate the tenant's
    /// subscription in the same transition.
    pub async fn apply_report(
        &self,
        tx: Transaction,
        report: &GatewayStatusReport,
        now: OffsetDateTime,
    ) -> BillingResult<ReconcileOutcome> {
        let mapped = report.mapped_status();
        let order_id = report.order_id.clone();

        let unchanged = |tx: &Transaction| ReconcileOutcome {
            ok: true,
            order_id: order_id.clone(),
            transaction_id: tx.id,
            status: tx.status,
            gateway_status: report.transaction_status.clone(),
            applied: false,
            subscription_activated: false,
        };

        if tx.status != TransactionStatus::Pending {
            if tx.status != mapped && mapped == TransactionStatus::Paid {
                tracing::error!(
                    order_id = %order_id,
                    ledger_status = %tx.status,
                    "Gateway reports payment for a transaction already closed; needs manual review"
                );
            } else {
                tracing::debug!(
                    order_id = %order_id,
                    status = %tx.status,
                    "Transaction already settled; nothing to apply"
                );
            }
            return Ok(unchanged(&tx));
        }

        let gateway_status = Some(report.transaction_status.clone());
        let transition = match mapped {
            TransactionStatus::Paid => self.activation(&tx, gateway_status, now).await?,
            // Keep the raw status current while the payment is still open.
            TransactionStatus::Pending => Transition::new("record_gateway_status", now).settle(
                tx.id,
                &[TransactionStatus::Pending],
                TransactionStatus::Pending,
                gateway_status,
            ),
            closed => Transition::new("close_checkout", now).settle(
                tx.id,
                &[TransactionStatus::Pending],
                closed,
                gateway_status,
            ),
        };

        if !self.store.attempt_transition(transition).await? {
            // Lost to a concurrent settlement of the same order.
            let current = self
                .store
                .get_transaction(tx.id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("Transaction {}", tx.id)))?;
            if current.status.is_terminal() {
                tracing::info!(
                    order_id = %order_id,
                    status = %current.status,
                    "Order settled concurrently; treating as duplicate"
                );
                return Ok(unchanged(&current));
            }
            return Err(BillingError::ConcurrentModification(format!(
                "Subscription for order {} changed during activation",
                order_id
            )));
        }

        let activated = mapped == TransactionStatus::Paid;
        match mapped {
            TransactionStatus::Paid => tracing::info!(
                order_id = %order_id,
                tenant_id = %tx.tenant_id,
                plan_id = %tx.subscription_plan_id,
                billing_cycle = %tx.billing_cycle,
                "Payment confirmed; subscription activated"
            ),
            TransactionStatus::Pending => tracing::debug!(
                order_id = %order_id,
                gateway_status = %report.transaction_status,
                "Payment still pending"
            ),
            other => tracing::info!(
                order_id = %order_id,
                tenant_id = %tx.tenant_id,
                status = %other,
                "Checkout closed without payment"
            ),
        }

        Ok(ReconcileOutcome {
            ok: true,
            order_id,
            transaction_id: tx.id,
            status: mapped,
            gateway_status: report.transaction_status.clone(),
            applied: mapped != TransactionStatus::Pending,
            subscription_activated: activated,
        })
    }

    /// Settlement plus activation: the paid plan starts now, for the paid cycle.
    /// Scheduled cancellation and staged changes are dropped only here, once
    /// money has moved.
    async fn activation(
        &self,
        tx: &Transaction,
        gateway_status: Option<String>,
        now: OffsetDateTime,
    ) -> BillingResult<Transition> {
        let sub = self
            .store
            .get_subscription_by_tenant(tx.tenant_id)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "paid order {} has no subscription for tenant {}",
                    tx.id, tx.tenant_id
                ))
            })?;
        let plan = self
            .store
            .get_plan(tx.subscription_plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Plan {}", tx.subscription_plan_id)))?;

        let period_end = if plan.is_free() {
            None
        } else {
            Some(compute_next_period_end(now, tx.billing_cycle))
        };

        Ok(Transition::new("activate_paid_plan", now)
            .subscription(
                sub.id,
                SubscriptionGuard::any(),
                SubscriptionPatch {
                    status: Some(SubscriptionStatus::Active),
                    plan_id: Some(plan.id),
                    period: Some((now, period_end)),
                    intended_plan_id: Some(None),
                    cancel_at_period_end: Some(false),
                },
            )
            // The paid plan supersedes any staged change.
            .ledger(LedgerWrite::SettleScheduled {
                tenant_id: tx.tenant_id,
                to: TransactionStatus::Cancelled,
            })
            .settle(
                tx.id,
                &[TransactionStatus::Pending],
                TransactionStatus::Paid,
                gateway_status,
            ))
    }
}
