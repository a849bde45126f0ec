//! Proration for mid-period plan changes
//!
//! The breakdown is stored verbatim in the transaction metadata so a disputed
//! charge can be recomputed from the same four inputs.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const SECONDS_PER_DAY: i64 = 86_400;

/// Inputs and outputs of one proration calculation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProrationBreakdown {
    pub current_plan_price: Decimal,
    pub new_plan_price: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub calculated_at: OffsetDateTime,
    pub total_days_in_period: i64,
    pub remaining_days: i64,
    pub used_days: i64,
    /// Credit for the unused part of the current plan
    pub unused_amount: Decimal,
    /// Cost of the new plan for the remaining days
    pub new_plan_prorated: Decimal,
    /// Positive: owed now. Zero or negative: credit of `|net_amount|`.
    pub net_amount: Decimal,
}

impl ProrationBreakdown {
    pub fn requires_payment(&self) -> bool {
        self.net_amount > Decimal::ZERO
    }

    /// Credit carried to the next cycle (zero when payment is required)
    pub fn credit(&self) -> Decimal {
        if self.net_amount < Decimal::ZERO {
            -self.net_amount
        } else {
            Decimal::ZERO
        }
    }
}

/// Whole days between two instants, rounded up. Never negative.
fn ceil_days(from: OffsetDateTime, to: OffsetDateTime) -> i64 {
    let seconds = (to - from).whole_seconds();
    if seconds <= 0 {
        return 0;
    }
    (seconds + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY
}

fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Compute the proration of switching from `current_plan_price` to
/// `new_plan_price` at `now` within `[period_start, period_end)`.
///
/// Returns `None` for a degenerate period (end not after start), which callers
/// treat like an expired period.
pub fn calculate_proration(
    current_plan_price: Decimal,
    new_plan_price: Decimal,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    now: OffsetDateTime,
) -> Option<ProrationBreakdown> {
    let total_days = ceil_days(period_start, period_end);
    if total_days == 0 {
        return None;
    }

    let remaining_days = ceil_days(now, period_end).min(total_days);
    let total = Decimal::from(total_days);
    let remaining = Decimal::from(remaining_days);

    // Multiply before dividing so 10 / 30 * 10 yields 3.33 rather than
    // accumulating the error of a rounded daily rate.
    let unused_amount = round_money(current_plan_price * remaining / total);
    let new_plan_prorated = round_money(new_plan_price * remaining / total);

    Some(ProrationBreakdown {
        current_plan_price,
        new_plan_price,
        period_start,
        period_end,
        calculated_at: now,
        total_days_in_period: total_days,
        remaining_days,
        used_days: total_days - remaining_days,
        unused_amount,
        new_plan_prorated,
        net_amount: new_plan_prorated - unused_amount,
    })
}
