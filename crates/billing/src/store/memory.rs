//! In-process store for tests and local development

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{BillingStore, LedgerWrite, Transition};
use crate::error::{BillingError, BillingResult};
use crate::plans::SubscriptionPlan;
use crate::subscriptions::{Subscription, SubscriptionStatus, LAPSE_TO_EXPIRED};
use crate::transactions::{Transaction, TransactionStatus};

#[derive(Default)]
struct State {
    plans: HashMap<Uuid, SubscriptionPlan>,
    subscriptions: HashMap<Uuid, Subscription>,
    transactions: HashMap<Uuid, Transaction>,
    subscription_writes: usize,
}

impl State {
    fn has_pending(&self, tenant_id: Uuid) -> bool {
        self.transactions
            .values()
            .any(|tx| tx.tenant_id == tenant_id && tx.status == TransactionStatus::Pending)
    }

    fn subscriptions_where(&self, keep: impl Fn(&Subscription) -> bool) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .subscriptions
            .values()
            .filter(|s| keep(s))
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.current_period_end);
        subs
    }
}

/// Mutex-backed [`BillingStore`]. A transition validates every guard before
/// touching anything, which gives the same all-or-nothing behaviour as the
/// Postgres store.
#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<State>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> BillingResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| BillingError::Internal("billing store lock poisoned".to_string()))
    }

    pub fn insert_plan(&self, plan: SubscriptionPlan) -> BillingResult<()> {
        self.lock()?.plans.insert(plan.id, plan);
        Ok(())
    }

    pub fn insert_subscription(&self, subscription: Subscription) -> BillingResult<()> {
        self.lock()?
            .subscriptions
            .insert(subscription.id, subscription);
        Ok(())
    }

    pub fn insert_transaction(&self, transaction: Transaction) -> BillingResult<()> {
        self.lock()?
            .transactions
            .insert(transaction.id, transaction);
        Ok(())
    }

    /// Number of subscription rows written through transitions so far
    pub fn subscription_writes(&self) -> BillingResult<usize> {
        Ok(self.lock()?.subscription_writes)
    }

    pub fn transactions_for(&self, tenant_id: Uuid) -> BillingResult<Vec<Transaction>> {
        let state = self.lock()?;
        let mut txs: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|tx| tx.tenant_id == tenant_id)
            .cloned()
            .collect();
        txs.sort_by_key(|tx| tx.created_at);
        Ok(txs)
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<SubscriptionPlan>> {
        Ok(self.lock()?.plans.get(&plan_id).cloned())
    }

    async fn get_free_plan(&self) -> BillingResult<Option<SubscriptionPlan>> {
        let state = self.lock()?;
        Ok(state
            .plans
            .values()
            .filter(|p| p.is_active && p.is_free())
            .min_by(|a, b| a.name.cmp(&b.name))
            .cloned())
    }

    async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.lock()?.subscriptions.get(&subscription_id).cloned())
    }

    async fn get_subscription_by_tenant(
        &self,
        tenant_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .lock()?
            .subscriptions
            .values()
            .find(|s| s.tenant_id == tenant_id)
            .cloned())
    }

    async fn get_transaction(&self, transaction_id: Uuid) -> BillingResult<Option<Transaction>> {
        Ok(self.lock()?.transactions.get(&transaction_id).cloned())
    }

    async fn get_transaction_by_gateway_id(
        &self,
        order_id: &str,
    ) -> BillingResult<Option<Transaction>> {
        Ok(self
            .lock()?
            .transactions
            .values()
            .find(|tx| tx.payment_gateway_id.as_deref() == Some(order_id))
            .cloned())
    }

    async fn list_transactions(
        &self,
        tenant_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<Transaction>> {
        let mut txs = self.transactions_for(tenant_id)?;
        txs.reverse();
        txs.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(txs)
    }

    async fn list_grace_candidates(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>> {
        Ok(self.lock()?.subscriptions_where(|s| {
            LAPSE_TO_EXPIRED.contains(&s.status)
                && s.current_period_end.is_some_and(|end| end <= now)
                && !s.cancel_at_period_end
                && s.intended_plan_id.is_none()
        }))
    }

    async fn list_due_deferred_changes(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        Ok(self.lock()?.subscriptions_where(|s| {
            s.intended_plan_id.is_some()
                && s.status != SubscriptionStatus::PendingCheckout
                && s.current_period_end.is_some_and(|end| end <= now)
        }))
    }

    async fn list_due_cancellations(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        Ok(self.lock()?.subscriptions_where(|s| {
            s.cancel_at_period_end
                && s.status != SubscriptionStatus::PendingCheckout
                && s.current_period_end.is_some_and(|end| end <= now)
        }))
    }

    async fn list_stale_pending_transactions(
        &self,
        cutoff: OffsetDateTime,
    ) -> BillingResult<Vec<Transaction>> {
        let state = self.lock()?;
        let mut txs: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|tx| {
                tx.status == TransactionStatus::Pending
                    && tx.created_at < cutoff
                    && tx.payment_gateway_id.is_some()
            })
            .cloned()
            .collect();
        txs.sort_by_key(|tx| tx.created_at);
        Ok(txs)
    }

    async fn list_orphaned_checkouts(&self) -> BillingResult<Vec<Subscription>> {
        let state = self.lock()?;
        Ok(state.subscriptions_where(|s| {
            s.status == SubscriptionStatus::PendingCheckout && !state.has_pending(s.tenant_id)
        }))
    }

    async fn latest_checkout(&self, tenant_id: Uuid) -> BillingResult<Option<Transaction>> {
        let state = self.lock()?;
        Ok(state
            .transactions
            .values()
            .filter(|tx| tx.tenant_id == tenant_id && tx.payment_gateway_id.is_some())
            .max_by_key(|tx| tx.created_at)
            .cloned())
    }

    async fn attempt_transition(&self, transition: Transition) -> BillingResult<bool> {
        let mut state = self.lock()?;

        if let Some(write) = &transition.subscription {
            let Some(sub) = state.subscriptions.get(&write.subscription_id) else {
                return Ok(false);
            };
            let has_pending = state.has_pending(sub.tenant_id);
            if !write.guard.matches(sub, has_pending) {
                return Ok(false);
            }
        }

        for write in &transition.ledger {
            match write {
                LedgerWrite::Record(tx) => {
                    if state.transactions.contains_key(&tx.id) {
                        return Err(BillingError::Internal(format!(
                            "transaction {} already recorded",
                            tx.id
                        )));
                    }
                }
                LedgerWrite::Settle {
                    transaction_id,
                    from,
                    ..
                } => {
                    let current = state.transactions.get(transaction_id).map(|tx| tx.status);
                    if !current.is_some_and(|status| from.contains(&status)) {
                        return Ok(false);
                    }
                }
                LedgerWrite::SettleScheduled { .. } => {}
            }
        }

        let at = transition.at;
        if let Some(write) = &transition.subscription {
            if let Some(sub) = state.subscriptions.get_mut(&write.subscription_id) {
                write.patch.apply_to(sub, at);
            }
            state.subscription_writes += 1;
        }

        for write in transition.ledger {
            match write {
                LedgerWrite::Record(tx) => {
                    state.transactions.insert(tx.id, tx);
                }
                LedgerWrite::Settle {
                    transaction_id,
                    to,
                    gateway_status,
                    ..
                } => {
                    if let Some(tx) = state.transactions.get_mut(&transaction_id) {
                        tx.status = to;
                        if gateway_status.is_some() {
                            tx.gateway_status = gateway_status;
                        }
                        tx.updated_at = at;
                    }
                }
                LedgerWrite::SettleScheduled { tenant_id, to } => {
                    for tx in state.transactions.values_mut().filter(|tx| {
                        tx.tenant_id == tenant_id && tx.status == TransactionStatus::Scheduled
                    }) {
                        tx.status = to;
                        tx.updated_at = at;
                    }
                }
            }
        }

        tracing::debug!(reason = transition.reason, "Billing transition applied");
        Ok(true)
    }
}
