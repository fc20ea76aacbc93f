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

//! Entitlement netting: subtracting feature allowances from raw usage
//! before pricing.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::calendar::{day_windows, month_windows, Period};
use crate::error::Error;
use crate::meter::{Meter, ResetUsage};
use crate::usage::{UsageQuantity, UsageQuery, UsageSource};

/// A feature allowance attached to a plan.
///
/// Only enabled entitlements affect billing. `is_soft_limit` governs
/// access-control systems outside this crate; overage is always charged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Entitlement {
    /// The unique identifier for the entitlement.
    pub id: String,
    /// The plan the entitlement belongs to.
    pub plan_id: String,
    /// The feature the entitlement grants.
    pub feature_id: String,
    /// The meter whose usage the allowance offsets.
    pub meter_id: String,
    /// Whether the entitlement is in effect.
    pub is_enabled: bool,
    /// The included allowance per reset window. `None` means unlimited: no
    /// usage on this meter is ever billable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_limit: Option<Decimal>,
    /// The window at which the allowance replenishes.
    pub usage_reset_period: UsageResetPeriod,
    /// Whether usage beyond the limit remains allowed. Ignored by billing.
    pub is_soft_limit: bool,
}

/// The window at which an entitlement's allowance replenishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageResetPeriod {
    /// The allowance replenishes every calendar day.
    Daily,
    /// The allowance replenishes every calendar month.
    Monthly,
    /// The allowance never replenishes: it covers lifetime usage.
    Never,
    /// The allowance replenishes at each billing period.
    BillingPeriod,
}

/// Computes the billable quantity for a usage line item after applying an
/// entitlement allowance.
///
/// `raw` is the aggregated usage for the service period of `query`;
/// `lifetime_start` is where cumulative usage starts counting for
/// never-reset allowances (the later of the subscription start and the line
/// item start). Calendar windows are taken in the customer's timezone `tz`.
///
/// A disabled or missing entitlement passes the raw quantity through
/// unchanged.
pub async fn billable_quantity(
    entitlement: Option<&Entitlement>,
    meter: &Meter,
    raw: &UsageQuantity,
    query: &UsageQuery,
    lifetime_start: DateTime<Utc>,
    tz: Tz,
    usage: &dyn UsageSource,
) -> Result<Decimal, Error> {
    let entitlement = match entitlement {
        Some(e) if e.is_enabled => e,
        _ => return Ok(raw.total()),
    };
    let limit = match entitlement.usage_limit {
        // Unlimited allowance: nothing is billable.
        None => return Ok(Decimal::ZERO),
        Some(limit) => limit,
    };
    if limit < Decimal::ZERO {
        return Err(Error::validation("usage limit must not be negative"));
    }

    match entitlement.usage_reset_period {
        UsageResetPeriod::BillingPeriod => Ok(overage(raw.total(), limit)),
        UsageResetPeriod::Daily => {
            windowed_overage(day_windows(&query.period, tz)?, limit, query, usage).await
        }
        UsageResetPeriod::Monthly => {
            windowed_overage(month_windows(&query.period, tz)?, limit, query, usage).await
        }
        UsageResetPeriod::Never => match meter.reset_usage {
            ResetUsage::Never => {
                // Lifetime overage: cumulative usage from the line item's
                // start through the end of this period, less the one-time
                // allowance.
                let lifetime = Period::new(lifetime_start, query.period.end)?;
                let total = usage.get_usage(&query.over(lifetime)).await?.total();
                Ok(overage(total, limit))
            }
            // A per-period meter cannot accumulate lifetime usage; the
            // allowance degenerates to per-period netting.
            ResetUsage::BillingPeriod => Ok(overage(raw.total(), limit)),
        },
    }
}

async fn windowed_overage(
    windows: Vec<Period>,
    limit: Decimal,
    query: &UsageQuery,
    usage: &dyn UsageSource,
) -> Result<Decimal, Error> {
    let mut billable = Decimal::ZERO;
    for window in windows {
        let quantity = usage.get_usage(&query.over(window)).await?.total();
        billable += overage(quantity, limit);
    }
    Ok(billable)
}

fn overage(quantity: Decimal, limit: Decimal) -> Decimal {
    (quantity - limit).max(Decimal::ZERO)
}
