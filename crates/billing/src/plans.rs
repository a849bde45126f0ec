//! Subscription plan catalog

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::calendar::PlanInterval;
use crate::error::{BillingError, BillingResult};

/// A catalog plan. Plans referenced by subscriptions or transactions are
/// deactivated rather than deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub name: String,
    /// Price per `interval`, in whole currency units
    pub price: Decimal,
    pub interval: PlanInterval,
    pub is_active: bool,
    pub max_users: i32,
    pub max_batches_per_month: i32,
    pub max_ingredients: i32,
}

/// Relative direction of a plan change, by price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Upgrade,
    Downgrade,
    Lateral,
}

impl ChangeType {
    pub fn between(current: &SubscriptionPlan, target: &SubscriptionPlan) -> Self {
        match target.price.cmp(&current.price) {
            std::cmp::Ordering::Greater => ChangeType::Upgrade,
            std::cmp::Ordering::Less => ChangeType::Downgrade,
            std::cmp::Ordering::Equal => ChangeType::Lateral,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Upgrade => "upgrade",
            ChangeType::Downgrade => "downgrade",
            ChangeType::Lateral => "lateral",
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SubscriptionPlan {
    /// Free plans never expire: their subscriptions carry no period end.
    pub fn is_free(&self) -> bool {
        self.price.is_zero()
    }

    /// Amount charged for one `cycle` of this plan.
    ///
    /// A monthly plan may be bought a year at a time; a yearly plan cannot be
    /// split into months.
    pub fn price_for_cycle(&self, cycle: PlanInterval) -> BillingResult<Decimal> {
        match (self.interval, cycle) {
            (PlanInterval::Monthly, PlanInterval::Monthly)
            | (PlanInterval::Yearly, PlanInterval::Yearly) => Ok(self.price),
            (PlanInterval::Monthly, PlanInterval::Yearly) => Ok(self.price * Decimal::from(12)),
            (PlanInterval::Yearly, PlanInterval::Monthly) => Err(BillingError::InvalidInput(
                format!("Plan '{}' is only sold yearly", self.name),
            )),
        }
    }

    /// Reject plans that can no longer be acquired
    pub fn ensure_purchasable(&self) -> BillingResult<()> {
        if self.is_active {
            Ok(())
        } else {
            Err(BillingError::InvalidInput(format!(
                "Plan '{}' is no longer available",
                self.name
            )))
        }
    }
}
