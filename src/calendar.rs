// Copyright the metered-billing authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Billing-period arithmetic.
//!
//! Period math runs in the customer's timezone and produces UTC instants.
//! Month-based cadences snap the day-of-month to the billing anchor,
//! clamping when the target month is shorter, so a subscription anchored on
//! the 31st bills on Feb 28 (or 29) and returns to the 31st in March.

use chrono::{DateTime, Datelike, Duration, LocalResult, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A half-open interval `[start, end)` of UTC instants.
///
/// Periods order by start, then end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct Period {
    /// The inclusive start of the interval.
    pub start: DateTime<Utc>,
    /// The exclusive end of the interval.
    pub end: DateTime<Utc>,
}

impl Period {
    /// Creates a period, rejecting empty or inverted intervals.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Period, Error> {
        if start >= end {
            return Err(Error::validation(format!(
                "period start {start} must be before period end {end}"
            )));
        }
        Ok(Period { start, end })
    }

    /// Whether `instant` falls within the interval.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Whether `other` lies entirely within this interval.
    pub fn encloses(&self, other: &Period) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// The cadence at which a price or subscription bills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    /// Bills every `count` days.
    Daily,
    /// Bills every `count` weeks.
    Weekly,
    /// Bills every `count` months.
    Monthly,
    /// Bills every `count` quarters.
    Quarterly,
    /// Bills every `count` years.
    Annual,
}

impl BillingPeriod {
    /// The number of calendar months in one period, for month-based
    /// cadences.
    fn months(&self) -> Option<u32> {
        match self {
            BillingPeriod::Monthly => Some(1),
            BillingPeriod::Quarterly => Some(3),
            BillingPeriod::Annual => Some(12),
            BillingPeriod::Daily | BillingPeriod::Weekly => None,
        }
    }

    /// A nominal day count for one period, used only to order cadences by
    /// length. Never used in period arithmetic.
    pub(crate) fn approx_days(&self) -> u32 {
        match self {
            BillingPeriod::Daily => 1,
            BillingPeriod::Weekly => 7,
            BillingPeriod::Monthly => 30,
            BillingPeriod::Quarterly => 90,
            BillingPeriod::Annual => 365,
        }
    }
}

/// Computes the end of the period that starts at `start`.
///
/// For month-based cadences, adds `count` periods' worth of months in the
/// customer's timezone and snaps the day-of-month to `anchor_day`, clamping
/// to the end of shorter months. Daily and weekly cadences add calendar days
/// and weeks. The local time-of-day of `start` is preserved; the result is
/// returned in UTC. Periods are half-open, so the returned instant is both
/// this period's exclusive end and the next period's inclusive start.
pub fn next_period_end(
    start: DateTime<Utc>,
    anchor_day: u32,
    count: u32,
    period: BillingPeriod,
    tz: Tz,
) -> Result<DateTime<Utc>, Error> {
    if count == 0 {
        return Err(Error::validation("billing period count must be positive"));
    }
    let local = start.with_timezone(&tz);
    let date = local.date_naive();
    let end_date = match period.months() {
        None => {
            let days = match period {
                BillingPeriod::Daily => i64::from(count),
                BillingPeriod::Weekly => 7 * i64::from(count),
                _ => unreachable!("month-based cadences handled above"),
            };
            date.checked_add_signed(Duration::days(days))
                .ok_or_else(|| Error::validation(format!("period end out of range from {start}")))?
        }
        Some(months_per_period) => {
            if !(1..=31).contains(&anchor_day) {
                return Err(Error::validation(format!(
                    "billing anchor day {anchor_day} must be between 1 and 31"
                )));
            }
            let advanced = date
                .checked_add_months(Months::new(months_per_period * count))
                .ok_or_else(|| {
                    Error::validation(format!("period end out of range from {start}"))
                })?;
            let day = anchor_day.min(days_in_month(advanced.year(), advanced.month()));
            advanced
                .with_day(day)
                .expect("day clamped to length of month")
        }
    };
    let end = resolve_local(tz, NaiveDateTime::new(end_date, local.time()))?;
    Ok(end.with_timezone(&Utc))
}

/// Advances `start` through `n` consecutive periods, re-snapping to the
/// anchor at every boundary.
pub fn advance_periods(
    start: DateTime<Utc>,
    anchor_day: u32,
    count: u32,
    period: BillingPeriod,
    tz: Tz,
    n: u32,
) -> Result<DateTime<Utc>, Error> {
    let mut cursor = start;
    for _ in 0..n {
        cursor = next_period_end(cursor, anchor_day, count, period, tz)?;
    }
    Ok(cursor)
}

/// Partitions `period` into calendar-day windows in `tz`.
///
/// Boundaries fall on local midnight; the first and last windows may be
/// partial. Used for daily entitlement resets.
pub fn day_windows(period: &Period, tz: Tz) -> Result<Vec<Period>, Error> {
    partition(period, tz, |date| {
        date.checked_add_signed(Duration::days(1))
            .ok_or_else(|| Error::validation("day window out of range".to_string()))
    })
}

/// Partitions `period` into calendar-month windows in `tz`.
///
/// Boundaries fall on local midnight of the first of each month; the first
/// and last windows may be partial. Used for monthly entitlement resets.
pub fn month_windows(period: &Period, tz: Tz) -> Result<Vec<Period>, Error> {
    partition(period, tz, |date| {
        let first = date
            .with_day(1)
            .expect("first of month is a valid day");
        first
            .checked_add_months(Months::new(1))
            .ok_or_else(|| Error::validation("month window out of range".to_string()))
    })
}

fn partition(
    period: &Period,
    tz: Tz,
    next_boundary_date: impl Fn(NaiveDate) -> Result<NaiveDate, Error>,
) -> Result<Vec<Period>, Error> {
    let mut windows = Vec::new();
    let mut cursor = period.start;
    while cursor < period.end {
        let date = cursor.with_timezone(&tz).date_naive();
        let boundary_date = next_boundary_date(date)?;
        let boundary = resolve_local(tz, NaiveDateTime::new(boundary_date, NaiveTime::MIN))?
            .with_timezone(&Utc);
        let end = boundary.min(period.end);
        windows.push(Period::new(cursor, end)?);
        cursor = end;
    }
    Ok(windows)
}

/// The number of days in the given month.
pub(crate) fn days_in_month(year: i32, month: u32) -> u32 {
    let first = NaiveDate::from_ymd_opt(year, month, 1).expect("first of month is a valid day");
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .expect("first of month is a valid day");
    (next - first).num_days() as u32
}

/// Resolves a local wall-clock time in `tz`, taking the earlier instant of
/// a DST fold and shifting forward through a DST gap.
fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Result<DateTime<Tz>, Error> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Ok(dt),
        LocalResult::Ambiguous(earlier, _later) => Ok(earlier),
        LocalResult::None => {
            let shifted = naive + Duration::hours(1);
            tz.from_local_datetime(&shifted).earliest().ok_or_else(|| {
                Error::internal(format!("local time {naive} unresolvable in {tz}"))
            })
        }
    }
}
