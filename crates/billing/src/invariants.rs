//! Billing invariants
//!
//! Read-only consistency checks over subscriptions and the ledger. Each check
//! is one SQL query; violations carry enough context to investigate without
//! re-running anything.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvariantViolation {
    pub invariant: String,
    pub tenant_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationSeverity {
    /// Money taken without the matching entitlement, or vice versa
    Critical,
    High,
    /// Self-heals through a sweep; investigate if it persists
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checked_at: OffsetDateTime, violations: Vec<InvariantViolation>) -> Self {
        let checks_run = InvariantChecker::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateSubscriptionRow {
    tenant_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct OpenPeriodRow {
    tenant_id: Uuid,
    plan_name: String,
    price: Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct HoldWithoutPaymentRow {
    tenant_id: Uuid,
    intended_plan_id: Option<Uuid>,
    updated_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct UnresolvedTransactionsRow {
    tenant_id: Uuid,
    subscription_plan_id: Uuid,
    open_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct DanglingIntentRow {
    tenant_id: Uuid,
    intended_plan_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct UnappliedPaymentRow {
    tenant_id: Uuid,
    transaction_id: Uuid,
    paid_at: OffsetDateTime,
    current_period_start: OffsetDateTime,
}

#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for name in Self::available_checks() {
            violations.extend(self.run_check(name).await?);
        }

        let summary = InvariantCheckSummary::from_violations(now, violations);
        if summary.healthy {
            tracing::info!(checks = summary.checks_run, "Billing invariants hold");
        } else {
            tracing::warn!(
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Billing invariant violations found"
            );
        }
        Ok(summary)
    }

    /// One subscription row per tenant
    async fn check_single_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateSubscriptionRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, COUNT(*) AS sub_count
            FROM subscriptions
            GROUP BY tenant_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_subscription_per_tenant".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Tenant has {} subscriptions (expected 1)",
                    row.sub_count
                ),
                context: serde_json::json!({ "subscription_count": row.sub_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Only the free plan may run without a period end
    async fn check_open_period_only_on_free_plan(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OpenPeriodRow> = sqlx::query_as(
            r#"
            SELECT s.tenant_id, p.name AS plan_name, p.price
            FROM subscriptions s
            JOIN subscription_plans p ON p.id = s.plan_id
            WHERE s.current_period_end IS NULL
              AND p.price > 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "open_period_only_on_free_plan".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Paid plan '{}' has no period end and would never lapse",
                    row.plan_name
                ),
                context: serde_json::json!({
                    "plan_name": row.plan_name,
                    "price": row.price.to_string(),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// A payment hold always has a checkout waiting on the gateway
    async fn check_pending_checkout_has_payment(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<HoldWithoutPaymentRow> = sqlx::query_as(
            r#"
            SELECT s.tenant_id, s.intended_plan_id, s.updated_at
            FROM subscriptions s
            WHERE s.status = 'PENDING_CHECKOUT'
              AND NOT EXISTS (
                  SELECT 1 FROM payment_transactions t
                  WHERE t.tenant_id = s.tenant_id AND t.status = 'PENDING'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "pending_checkout_has_payment".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: "Subscription is held for a checkout that no longer exists"
                    .to_string(),
                context: serde_json::json!({
                    "intended_plan_id": row.intended_plan_id,
                    "held_since": row.updated_at.to_string(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// At most one open (`PENDING`/`SCHEDULED`) transaction per tenant and plan
    async fn check_single_open_transaction(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnresolvedTransactionsRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, subscription_plan_id, COUNT(*) AS open_count
            FROM payment_transactions
            WHERE status IN ('PENDING', 'SCHEDULED')
            GROUP BY tenant_id, subscription_plan_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_open_transaction_per_plan".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "{} unresolved transactions for the same plan",
                    row.open_count
                ),
                context: serde_json::json!({
                    "plan_id": row.subscription_plan_id,
                    "open_count": row.open_count,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_intended_plan_exists(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DanglingIntentRow> = sqlx::query_as(
            r#"
            SELECT s.tenant_id, s.intended_plan_id
            FROM subscriptions s
            LEFT JOIN subscription_plans p ON p.id = s.intended_plan_id
            WHERE s.intended_plan_id IS NOT NULL
              AND p.id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "intended_plan_exists".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: "Intended plan does not exist".to_string(),
                context: serde_json::json!({ "intended_plan_id": row.intended_plan_id }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// A paid checkout restarts the period when it settles, so no paid
    /// checkout can have settled after the current period began.
    async fn check_paid_checkout_activated(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnappliedPaymentRow> = sqlx::query_as(
            r#"
            SELECT
                t.tenant_id,
                t.id AS transaction_id,
                t.updated_at AS paid_at,
                s.current_period_start
            FROM payment_transactions t
            JOIN subscriptions s ON s.tenant_id = t.tenant_id
            WHERE t.status = 'PAID'
              AND t.payment_gateway_id IS NOT NULL
              AND t.updated_at > s.current_period_start
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_checkout_activated".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: "Payment settled but the subscription period was not restarted"
                    .to_string(),
                context: serde_json::json!({
                    "transaction_id": row.transaction_id,
                    "paid_at": row.paid_at.to_string(),
                    "current_period_start": row.current_period_start.to_string(),
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_subscription_per_tenant" => self.check_single_subscription().await,
            "open_period_only_on_free_plan" => self.check_open_period_only_on_free_plan().await,
            "pending_checkout_has_payment" => self.check_pending_checkout_has_payment().await,
            "single_open_transaction_per_plan" => self.check_single_open_transaction().await,
            "intended_plan_exists" => self.check_intended_plan_exists().await,
            "paid_checkout_activated" => self.check_paid_checkout_activated().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_subscription_per_tenant",
            "open_period_only_on_free_plan",
            "pending_checkout_has_payment",
            "single_open_transaction_per_plan",
            "intended_plan_exists",
            "paid_checkout_activated",
        ]
    }
}
