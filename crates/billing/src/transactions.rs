//! Payment transaction ledger
//!
//! Transactions are append-mostly: created `PENDING` (payment awaited),
//! `SCHEDULED` (deferred change) or directly `COMPLETED` (no payment due), and
//! settled exactly once into a terminal status.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::calendar::PlanInterval;
use crate::plans::ChangeType;
use crate::proration::ProrationBreakdown;
use crate::subscriptions::SubscriptionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Paid,
    Failed,
    Cancelled,
    Expired,
    Refunded,
    Scheduled,
    Completed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Paid => "PAID",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Cancelled => "CANCELLED",
            TransactionStatus::Expired => "EXPIRED",
            TransactionStatus::Refunded => "REFUNDED",
            TransactionStatus::Scheduled => "SCHEDULED",
            TransactionStatus::Completed => "COMPLETED",
        }
    }

    /// `PENDING` and `SCHEDULED` are the only statuses that may still change
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            TransactionStatus::Pending | TransactionStatus::Scheduled
        )
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "PENDING" => TransactionStatus::Pending,
            "PAID" => TransactionStatus::Paid,
            "FAILED" => TransactionStatus::Failed,
            "CANCELLED" => TransactionStatus::Cancelled,
            "EXPIRED" => TransactionStatus::Expired,
            "REFUNDED" => TransactionStatus::Refunded,
            "SCHEDULED" => TransactionStatus::Scheduled,
            "COMPLETED" => TransactionStatus::Completed,
            other => return Err(format!("Unknown transaction status '{}'", other)),
        })
    }
}

/// Immediate mid-period plan change (paid upgrade or credited downgrade)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanChangeMeta {
    pub from_plan_id: Uuid,
    pub to_plan_id: Uuid,
    pub change_type: ChangeType,
    pub proration: ProrationBreakdown,
    /// Credit carried to the next cycle when no payment was due
    pub credit: Decimal,
    pub previous_status: SubscriptionStatus,
    /// Deferred plan the checkout displaced; restored if the checkout lapses
    #[serde(default)]
    pub previous_intended_plan_id: Option<Uuid>,
}

/// Plan change after the period already lapsed: a fresh paid acquisition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiredPlanChangeMeta {
    pub from_plan_id: Uuid,
    pub to_plan_id: Uuid,
    #[serde(with = "time::serde::rfc3339::option")]
    pub lapsed_period_end: Option<OffsetDateTime>,
    pub previous_status: SubscriptionStatus,
    /// Deferred plan the checkout displaced; restored if the checkout lapses
    #[serde(default)]
    pub previous_intended_plan_id: Option<Uuid>,
}

/// Checkout for the current plan (renewal) or a plan bought outright
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalMeta {
    pub from_plan_id: Uuid,
    pub to_plan_id: Uuid,
    pub billing_cycle: PlanInterval,
    pub previous_status: SubscriptionStatus,
    /// Deferred plan the checkout displaced; restored if the checkout lapses
    #[serde(default)]
    pub previous_intended_plan_id: Option<Uuid>,
}

/// Plan change deferred to the end of the current period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledPlanChangeMeta {
    pub from_plan_id: Uuid,
    pub to_plan_id: Uuid,
    pub change_type: ChangeType,
    #[serde(with = "time::serde::rfc3339")]
    pub effective_at: OffsetDateTime,
    /// Proration as it would have applied immediately, for display only
    pub proration: Option<ProrationBreakdown>,
}

/// Audit record of a cancel-at-period-end downgrade to the free plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledDowngradeMeta {
    pub from_plan_id: Uuid,
    pub to_plan_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub period_ended_at: OffsetDateTime,
}

/// Typed operation record carried by every transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionMetadata {
    PlanChange(PlanChangeMeta),
    ExpiredPlanChange(ExpiredPlanChangeMeta),
    Renewal(RenewalMeta),
    ScheduledPlanChange(ScheduledPlanChangeMeta),
    ScheduledDowngrade(ScheduledDowngradeMeta),
}

impl TransactionMetadata {
    pub fn kind(&self) -> &'static str {
        match self {
            TransactionMetadata::PlanChange(_) => "plan_change",
            TransactionMetadata::ExpiredPlanChange(_) => "expired_plan_change",
            TransactionMetadata::Renewal(_) => "renewal",
            TransactionMetadata::ScheduledPlanChange(_) => "scheduled_plan_change",
            TransactionMetadata::ScheduledDowngrade(_) => "scheduled_downgrade",
        }
    }

    /// Status the subscription held before a checkout put it on hold
    pub fn previous_status(&self) -> Option<SubscriptionStatus> {
        match self {
            TransactionMetadata::PlanChange(m) => Some(m.previous_status),
            TransactionMetadata::ExpiredPlanChange(m) => Some(m.previous_status),
            TransactionMetadata::Renewal(m) => Some(m.previous_status),
            TransactionMetadata::ScheduledPlanChange(_)
            | TransactionMetadata::ScheduledDowngrade(_) => None,
        }
    }

    /// Staged plan the subscription held before a checkout replaced it
    pub fn previous_intended_plan_id(&self) -> Option<Uuid> {
        match self {
            TransactionMetadata::PlanChange(m) => m.previous_intended_plan_id,
            TransactionMetadata::ExpiredPlanChange(m) => m.previous_intended_plan_id,
            TransactionMetadata::Renewal(m) => m.previous_intended_plan_id,
            TransactionMetadata::ScheduledPlanChange(_)
            | TransactionMetadata::ScheduledDowngrade(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
    pub subscription_plan_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub billing_cycle: PlanInterval,
    pub status: TransactionStatus,
    /// Order id at the payment gateway (equal to `id` for gateway checkouts)
    pub payment_gateway_id: Option<String>,
    /// Last raw status string reported by the gateway
    pub gateway_status: Option<String>,
    pub metadata: TransactionMetadata,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Fields common to every new ledger entry
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
    pub subscription_plan_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub billing_cycle: PlanInterval,
    pub metadata: TransactionMetadata,
}

impl NewTransaction {
    /// Awaiting payment at the gateway; the id doubles as the order id
    pub fn pending(self, now: OffsetDateTime) -> Transaction {
        let id = Uuid::new_v4();
        self.build(id, TransactionStatus::Pending, Some(id.to_string()), now)
    }

    pub fn scheduled(self, now: OffsetDateTime) -> Transaction {
        self.build(Uuid::new_v4(), TransactionStatus::Scheduled, None, now)
    }

    /// Settled without a gateway round-trip
    pub fn completed(self, now: OffsetDateTime) -> Transaction {
        self.build(Uuid::new_v4(), TransactionStatus::Completed, None, now)
    }

    fn build(
        self,
        id: Uuid,
        status: TransactionStatus,
        payment_gateway_id: Option<String>,
        now: OffsetDateTime,
    ) -> Transaction {
        Transaction {
            id,
            tenant_id: self.tenant_id,
            user_id: self.user_id,
            subscription_plan_id: self.subscription_plan_id,
            amount: self.amount,
            currency: self.currency,
            billing_cycle: self.billing_cycle,
            status,
            payment_gateway_id,
            gateway_status: None,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
        }
    }
}
