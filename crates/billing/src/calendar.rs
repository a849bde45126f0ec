//! Calendar-aware billing period arithmetic
//!
//! Every period end in the system is computed here. Adding months keeps the
//! day-of-month of the anchor date and clamps to the last day of the target
//! month when that day does not exist, so a subscription started on the 31st
//! keeps renewing at month-end instead of drifting to the 28th.

use serde::{Deserialize, Serialize};
use time::{util::days_in_year_month, Date, Month, OffsetDateTime};

/// Billing interval of a plan or checkout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanInterval {
    Monthly,
    Yearly,
}

impl PlanInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanInterval::Monthly => "MONTHLY",
            PlanInterval::Yearly => "YEARLY",
        }
    }
}

impl std::fmt::Display for PlanInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PlanInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MONTHLY" => Ok(PlanInterval::Monthly),
            "YEARLY" => Ok(PlanInterval::Yearly),
            other => Err(format!("Unknown billing interval '{}'", other)),
        }
    }
}

/// Add `n` calendar months, clamping the day to the target month's length.
///
/// Time of day and offset are preserved. Results outside the representable
/// date range saturate at `Date::MIN`/`Date::MAX`.
pub fn add_calendar_months(at: OffsetDateTime, n: i32) -> OffsetDateTime {
    let date = at.date();
    let month_index = i64::from(date.year()) * 12 + i64::from(u8::from(date.month())) - 1;
    let target = month_index + i64::from(n);

    let year = target.div_euclid(12);
    let month_number = (target.rem_euclid(12) + 1) as u8;

    let shifted = i32::try_from(year)
        .ok()
        .and_then(|year| {
            let month = Month::try_from(month_number).ok()?;
            let day = date.day().min(days_in_year_month(year, month));
            Date::from_calendar_date(year, month, day).ok()
        })
        .unwrap_or(if n >= 0 { Date::MAX } else { Date::MIN });

    at.replace_date(shifted)
}

/// Add `n` calendar years. Feb 29 lands on Feb 28 in a non-leap target year.
pub fn add_calendar_years(at: OffsetDateTime, n: i32) -> OffsetDateTime {
    add_calendar_months(at, n.saturating_mul(12))
}

/// End of the period that starts at `start` for the given interval.
pub fn compute_next_period_end(start: OffsetDateTime, interval: PlanInterval) -> OffsetDateTime {
    match interval {
        PlanInterval::Monthly => add_calendar_months(start, 1),
        PlanInterval::Yearly => add_calendar_years(start, 1),
    }
}
