//! Postgres-backed billing store

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{BillingStore, LedgerWrite, SubscriptionWrite, Transition};
use crate::error::{BillingError, BillingResult};
use crate::plans::SubscriptionPlan;
use crate::subscriptions::Subscription;
use crate::transactions::{Transaction, TransactionMetadata};

const PLAN_COLUMNS: &str = "id, name, price, \"interval\", is_active, max_users, \
                            max_batches_per_month, max_ingredients";

const SUBSCRIPTION_COLUMNS: &str = "id, tenant_id, plan_id, status, current_period_start, \
                                    current_period_end, intended_plan_id, cancel_at_period_end, \
                                    updated_at";

const TRANSACTION_COLUMNS: &str = "id, tenant_id, user_id, subscription_plan_id, amount, \
                                   currency, billing_cycle, status, payment_gateway_id, \
                                   gateway_status, metadata, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    name: String,
    price: Decimal,
    interval: String,
    is_active: bool,
    max_users: i32,
    max_batches_per_month: i32,
    max_ingredients: i32,
}

impl TryFrom<PlanRow> for SubscriptionPlan {
    type Error = BillingError;

    fn try_from(row: PlanRow) -> BillingResult<Self> {
        Ok(SubscriptionPlan {
            id: row.id,
            name: row.name,
            price: row.price,
            interval: row.interval.parse().map_err(BillingError::Database)?,
            is_active: row.is_active,
            max_users: row.max_users,
            max_batches_per_month: row.max_batches_per_month,
            max_ingredients: row.max_ingredients,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    tenant_id: Uuid,
    plan_id: Uuid,
    status: String,
    current_period_start: OffsetDateTime,
    current_period_end: Option<OffsetDateTime>,
    intended_plan_id: Option<Uuid>,
    cancel_at_period_end: bool,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        Ok(Subscription {
            id: row.id,
            tenant_id: row.tenant_id,
            plan_id: row.plan_id,
            status: row.status.parse().map_err(BillingError::Database)?,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            intended_plan_id: row.intended_plan_id,
            cancel_at_period_end: row.cancel_at_period_end,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    tenant_id: Uuid,
    user_id: Option<Uuid>,
    subscription_plan_id: Uuid,
    amount: Decimal,
    currency: String,
    billing_cycle: String,
    status: String,
    payment_gateway_id: Option<String>,
    gateway_status: Option<String>,
    metadata: Json<TransactionMetadata>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = BillingError;

    fn try_from(row: TransactionRow) -> BillingResult<Self> {
        Ok(Transaction {
            id: row.id,
            tenant_id: row.tenant_id,
            user_id: row.user_id,
            subscription_plan_id: row.subscription_plan_id,
            amount: row.amount,
            currency: row.currency,
            billing_cycle: row.billing_cycle.parse().map_err(BillingError::Database)?,
            status: row.status.parse().map_err(BillingError::Database)?,
            payment_gateway_id: row.payment_gateway_id,
            gateway_status: row.gateway_status,
            metadata: row.metadata.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> BillingResult<Vec<T>>
where
    T: TryFrom<R, Error = BillingError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn subscriptions_matching(
        &self,
        condition: &str,
        now: Option<OffsetDateTime>,
    ) -> BillingResult<Vec<Subscription>> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions s WHERE {condition} \
             ORDER BY current_period_end NULLS LAST"
        );
        let mut query = sqlx::query_as::<_, SubscriptionRow>(&sql);
        if let Some(now) = now {
            query = query.bind(now);
        }
        convert_all(query.fetch_all(&self.pool).await?)
    }

    /// Lock the subscription row, re-check the guard, write the patch.
    /// Returns `false` when the guard no longer holds.
    async fn write_subscription(
        conn: &mut sqlx::PgConnection,
        write: &SubscriptionWrite,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1 FOR UPDATE"
        ))
        .bind(write.subscription_id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            return Ok(false);
        };
        let mut sub = Subscription::try_from(row)?;

        let has_pending = if write.guard.no_pending_transactions {
            sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM payment_transactions \
                 WHERE tenant_id = $1 AND status = 'PENDING')",
            )
            .bind(sub.tenant_id)
            .fetch_one(&mut *conn)
            .await?
        } else {
            false
        };

        if !write.guard.matches(&sub, has_pending) {
            return Ok(false);
        }

        write.patch.apply_to(&mut sub, at);

        sqlx::query(
            r#"
            UPDATE subscriptions SET
                plan_id = $2,
                status = $3,
                current_period_start = $4,
                current_period_end = $5,
                intended_plan_id = $6,
                cancel_at_period_end = $7,
                updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(sub.id)
        .bind(sub.plan_id)
        .bind(sub.status.as_str())
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.intended_plan_id)
        .bind(sub.cancel_at_period_end)
        .bind(sub.updated_at)
        .execute(&mut *conn)
        .await?;

        Ok(true)
    }

    /// Returns `false` when a required ledger guard failed
    async fn write_ledger(
        conn: &mut sqlx::PgConnection,
        write: LedgerWrite,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        match write {
            LedgerWrite::Record(tx) => {
                sqlx::query(
                    r#"
                    INSERT INTO payment_transactions
                        (id, tenant_id, user_id, subscription_plan_id, amount, currency,
                         billing_cycle, status, payment_gateway_id, gateway_status, metadata,
                         created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                    "#,
                )
                .bind(tx.id)
                .bind(tx.tenant_id)
                .bind(tx.user_id)
                .bind(tx.subscription_plan_id)
                .bind(tx.amount)
                .bind(&tx.currency)
                .bind(tx.billing_cycle.as_str())
                .bind(tx.status.as_str())
                .bind(&tx.payment_gateway_id)
                .bind(&tx.gateway_status)
                .bind(Json(&tx.metadata))
                .bind(tx.created_at)
                .bind(tx.updated_at)
                .execute(&mut *conn)
                .await?;
                Ok(true)
            }
            LedgerWrite::Settle {
                transaction_id,
                from,
                to,
                gateway_status,
            } => {
                let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
                let result = sqlx::query(
                    r#"
                    UPDATE payment_transactions SET
                        status = $2,
                        gateway_status = COALESCE($3, gateway_status),
                        updated_at = $4
                    WHERE id = $1 AND status = ANY($5)
                    "#,
                )
                .bind(transaction_id)
                .bind(to.as_str())
                .bind(gateway_status)
                .bind(at)
                .bind(from)
                .execute(&mut *conn)
                .await?;
                Ok(result.rows_affected() == 1)
            }
            LedgerWrite::SettleScheduled { tenant_id, to } => {
                sqlx::query(
                    "UPDATE payment_transactions SET status = $2, updated_at = $3 \
                     WHERE tenant_id = $1 AND status = 'SCHEDULED'",
                )
                .bind(tenant_id)
                .bind(to.as_str())
                .bind(at)
                .execute(&mut *conn)
                .await?;
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<SubscriptionPlan>> {
        let row: Option<PlanRow> = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM subscription_plans WHERE id = $1"
        ))
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SubscriptionPlan::try_from).transpose()
    }

    async fn get_free_plan(&self) -> BillingResult<Option<SubscriptionPlan>> {
        let row: Option<PlanRow> = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM subscription_plans \
             WHERE price = 0 AND is_active ORDER BY name LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.map(SubscriptionPlan::try_from).transpose()
    }

    async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn get_subscription_by_tenant(
        &self,
        tenant_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE tenant_id = $1"
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn get_transaction(&self, transaction_id: Uuid) -> BillingResult<Option<Transaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions WHERE id = $1"
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Transaction::try_from).transpose()
    }

    async fn get_transaction_by_gateway_id(
        &self,
        order_id: &str,
    ) -> BillingResult<Option<Transaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions WHERE payment_gateway_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Transaction::try_from).transpose()
    }

    async fn list_transactions(
        &self,
        tenant_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<Transaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions \
             WHERE tenant_id = $1 ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(tenant_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn list_grace_candidates(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>> {
        self.subscriptions_matching(
            "status IN ('ACTIVE', 'TRIALING', 'PAST_DUE') \
             AND current_period_end <= $1 \
             AND NOT cancel_at_period_end \
             AND intended_plan_id IS NULL",
            Some(now),
        )
        .await
    }

    async fn list_due_deferred_changes(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        self.subscriptions_matching(
            "intended_plan_id IS NOT NULL \
             AND status <> 'PENDING_CHECKOUT' \
             AND current_period_end <= $1",
            Some(now),
        )
        .await
    }

    async fn list_due_cancellations(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        self.subscriptions_matching(
            "cancel_at_period_end \
             AND status <> 'PENDING_CHECKOUT' \
             AND current_period_end <= $1",
            Some(now),
        )
        .await
    }

    async fn list_stale_pending_transactions(
        &self,
        cutoff: OffsetDateTime,
    ) -> BillingResult<Vec<Transaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions \
             WHERE status = 'PENDING' AND payment_gateway_id IS NOT NULL AND created_at < $1 \
             ORDER BY created_at"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn list_orphaned_checkouts(&self) -> BillingResult<Vec<Subscription>> {
        self.subscriptions_matching(
            "status = 'PENDING_CHECKOUT' AND NOT EXISTS ( \
                 SELECT 1 FROM payment_transactions t \
                 WHERE t.tenant_id = s.tenant_id AND t.status = 'PENDING')",
            None,
        )
        .await
    }

    async fn latest_checkout(&self, tenant_id: Uuid) -> BillingResult<Option<Transaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions \
             WHERE tenant_id = $1 AND payment_gateway_id IS NOT NULL \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Transaction::try_from).transpose()
    }

    async fn attempt_transition(&self, transition: Transition) -> BillingResult<bool> {
        let Transition {
            reason,
            at,
            subscription,
            ledger,
        } = transition;

        let mut tx: sqlx::Transaction<'_, Postgres> = self.pool.begin().await?;

        if let Some(write) = &subscription {
            if !Self::write_subscription(&mut tx, write, at).await? {
                tx.rollback().await?;
                tracing::debug!(
                    reason,
                    subscription_id = %write.subscription_id,
                    "Transition guard no longer holds"
                );
                return Ok(false);
            }
        }

        for write in ledger {
            if !Self::write_ledger(&mut tx, write, at).await? {
                tx.rollback().await?;
                tracing::debug!(reason, "Ledger guard no longer holds");
                return Ok(false);
            }
        }

        tx.commit().await?;
        tracing::debug!(reason, "Billing transition committed");
        Ok(true)
    }
}
