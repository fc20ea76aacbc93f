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

use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use codes_iso_4217::CurrencyCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::calendar::{next_period_end, BillingPeriod, Period};
use crate::error::Error;
use crate::price::{InvoiceCadence, PriceKind};

/// A subscription: a customer's enrollment in a set of priced line items.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Subscription {
    /// The unique identifier for the subscription.
    pub id: String,
    /// The customer the subscription bills.
    pub customer_id: String,
    /// The plan the subscription was created from, when any. Entitlements
    /// attach at the plan level.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    /// The currency all of the subscription's charges are denominated in.
    pub currency: CurrencyCode,
    /// The subscription's own billing cadence.
    pub billing_period: BillingPeriod,
    /// The number of billing periods per subscription period.
    pub billing_period_count: u32,
    /// The day-of-month the subscription bills on. Months shorter than the
    /// anchor clamp to their last day.
    pub billing_anchor: u32,
    /// The inclusive start of the current billing period.
    pub current_period_start: DateTime<Utc>,
    /// The exclusive end of the current billing period.
    pub current_period_end: DateTime<Utc>,
    /// The date billing started.
    pub start_date: DateTime<Utc>,
    /// The status of the subscription.
    pub status: SubscriptionStatus,
    /// How partial-period fixed charges are handled.
    pub proration_behavior: ProrationBehavior,
    /// The customer's IANA timezone; all period arithmetic runs here.
    pub customer_timezone: Tz,
}

/// The status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// An active subscription.
    Active,
    /// A subscription cancelled by the customer. Terminal.
    Cancelled,
    /// A subscription that ran past its end date. Terminal.
    Expired,
}

/// How partial-period fixed charges are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProrationBehavior {
    /// Charges are always full period amounts.
    None,
    /// A proration calculator adjusts charges covering partial periods.
    CreateProrations,
}

impl Subscription {
    /// The current billing period as a half-open interval.
    pub fn current_period(&self) -> Result<Period, Error> {
        Period::new(self.current_period_start, self.current_period_end)
    }

    /// The billing period after the current one.
    pub fn next_period(&self) -> Result<Period, Error> {
        let end = next_period_end(
            self.current_period_end,
            self.billing_anchor,
            self.billing_period_count,
            self.billing_period,
            self.customer_timezone,
        )?;
        Period::new(self.current_period_end, end)
    }

    /// Advances the subscription into its next billing period.
    ///
    /// Periods advance monotonically; the new period end is snapped to the
    /// billing anchor.
    pub fn advance_period(&mut self) -> Result<(), Error> {
        if self.status != SubscriptionStatus::Active {
            return Err(Error::invalid_operation(format!(
                "cannot advance period of {:?} subscription {}",
                self.status, self.id
            )));
        }
        let next = self.next_period()?;
        self.current_period_start = next.start;
        self.current_period_end = next.end;
        Ok(())
    }

    /// Cancels the subscription.
    pub fn cancel(&mut self) -> Result<(), Error> {
        match self.status {
            SubscriptionStatus::Active => {
                self.status = SubscriptionStatus::Cancelled;
                Ok(())
            }
            status => Err(Error::invalid_operation(format!(
                "cannot cancel {status:?} subscription {}",
                self.id
            ))),
        }
    }
}

/// A priced component of a subscription.
///
/// Line items may be superseded by subscription changes: the old line item
/// is end-dated rather than deleted, so that usage recorded against it stays
/// attributable. A line item is active for a period when its activity window
/// overlaps that period.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct SubscriptionLineItem {
    /// The unique identifier for the line item.
    pub id: String,
    /// The subscription the line item belongs to.
    pub subscription_id: String,
    /// The price this line item charges.
    pub price_id: String,
    /// Whether the price is fixed or usage-based.
    pub price_kind: PriceKind,
    /// The meter usage is read from, for usage line items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_id: Option<String>,
    /// The quantity charged, for fixed line items.
    pub quantity: Decimal,
    /// The name shown on invoices.
    pub display_name: String,
    /// The line item's own billing cadence, which may differ from the
    /// subscription's.
    pub billing_period: BillingPeriod,
    /// The number of billing periods per invoice for this line item.
    pub billing_period_count: u32,
    /// Whether the line item bills in advance or in arrear.
    pub invoice_cadence: InvoiceCadence,
    /// When the line item becomes chargeable.
    pub start_date: DateTime<Utc>,
    /// When the line item stops being chargeable, if it was superseded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
}

impl SubscriptionLineItem {
    /// Whether this line item is chargeable for any part of `period`.
    pub fn active_for(&self, period: &Period) -> bool {
        self.start_date <= period.end
            && self.end_date.map_or(true, |end| end > period.start)
    }

    /// Whether the line item's own cadence is longer than the
    /// subscription's, which switches it to boundary-based inclusion.
    fn longer_than(&self, subscription: &Subscription) -> bool {
        let own = u64::from(self.billing_period_count) * u64::from(self.billing_period.approx_days());
        let subs = u64::from(subscription.billing_period_count)
            * u64::from(subscription.billing_period.approx_days());
        own > subs
    }

    /// Walks the line item's own billing periods from its start date,
    /// anchored on the start date's day-of-month, yielding each period that
    /// begins before `until`.
    fn own_periods(&self, tz: Tz, until: DateTime<Utc>) -> Result<Vec<Period>, Error> {
        let anchor = self.start_date.with_timezone(&tz).day();
        let mut periods = Vec::new();
        let mut start = self.start_date;
        while start < until {
            let end = next_period_end(
                start,
                anchor,
                self.billing_period_count,
                self.billing_period,
                tz,
            )?;
            periods.push(Period::new(start, end)?);
            start = end;
        }
        Ok(periods)
    }
}

/// The event that triggers invoice generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferencePoint {
    /// The start of a billing period: bill advance charges for the period
    /// that is beginning.
    PeriodStart,
    /// The end of a billing period: bill arrear charges for the period that
    /// elapsed and advance charges for the period that is beginning.
    PeriodEnd,
    /// A dry run over partial usage: project the arrear charges for the
    /// current period plus the upcoming advance charges, without writing
    /// anything.
    Preview,
}

/// A candidate charge: a line item paired with the service period the charge
/// covers.
///
/// For line items on the subscription's cadence the service period is the
/// subscription period itself; for longer-cadence line items it is the line
/// item's own period, which is what de-duplication keys on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct LineItemCharge {
    /// The line item being charged.
    pub line_item: SubscriptionLineItem,
    /// The interval the charge covers.
    pub service_period: Period,
}

/// A subscription's line items partitioned by cadence and period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassifiedLineItems {
    /// Advance charges whose service period is the current period.
    pub current_advance: Vec<LineItemCharge>,
    /// Arrear charges whose service period is (or ends in) the current
    /// period.
    pub current_arrear: Vec<LineItemCharge>,
    /// Advance charges whose service period is the next period.
    pub next_advance: Vec<LineItemCharge>,
    /// Arrear charges whose service period ends in the next period.
    pub next_arrear: Vec<LineItemCharge>,
    /// Whether any classified charge is usage-based.
    pub has_usage_charges: bool,
}

impl ClassifiedLineItems {
    /// The candidate charges an invoice at `reference_point` should carry.
    pub fn for_reference_point(&self, reference_point: ReferencePoint) -> Vec<LineItemCharge> {
        let buckets: Vec<&[LineItemCharge]> = match reference_point {
            ReferencePoint::PeriodStart => vec![&self.current_advance],
            ReferencePoint::PeriodEnd | ReferencePoint::Preview => {
                vec![&self.current_arrear, &self.next_advance]
            }
        };
        buckets.into_iter().flatten().cloned().collect()
    }
}

/// Partitions `items` into the four cadence/period buckets for the given
/// current and next subscription periods.
///
/// Line items whose own cadence is longer than the subscription's are
/// included only when one of their own billing-period boundaries falls
/// inside a window (the period start for advance items, the period end for
/// arrear items), and their service period is then the line-item period
/// rather than the subscription period. An arrear service period that
/// coincides with the window itself is included: for a daily subscription's
/// first invoice this emits the day's advance and arrear together.
pub fn classify_line_items(
    subscription: &Subscription,
    items: &[SubscriptionLineItem],
    current: Period,
    next: Period,
) -> Result<ClassifiedLineItems, Error> {
    let tz = subscription.customer_timezone;
    let mut classified = ClassifiedLineItems::default();

    for item in items {
        let windows = [
            (current, &mut classified.current_advance, &mut classified.current_arrear),
            (next, &mut classified.next_advance, &mut classified.next_arrear),
        ];
        for (window, advance, arrear) in windows {
            if !item.active_for(&window) {
                continue;
            }
            if item.longer_than(subscription) {
                for own in item.own_periods(tz, window.end)? {
                    let charge = LineItemCharge {
                        line_item: item.clone(),
                        service_period: own,
                    };
                    match item.invoice_cadence {
                        InvoiceCadence::Advance if window.contains(own.start) => {
                            advance.push(charge);
                        }
                        InvoiceCadence::Arrear if window.contains(own.end) => {
                            arrear.push(charge);
                        }
                        _ => {}
                    }
                }
            } else {
                let charge = LineItemCharge {
                    line_item: item.clone(),
                    service_period: window,
                };
                match item.invoice_cadence {
                    InvoiceCadence::Advance => advance.push(charge),
                    InvoiceCadence::Arrear => arrear.push(charge),
                }
            }
        }
    }

    classified.has_usage_charges = [
        &classified.current_advance,
        &classified.current_arrear,
        &classified.next_advance,
        &classified.next_arrear,
    ]
    .into_iter()
    .flatten()
    .any(|charge| charge.line_item.price_kind == PriceKind::Usage);

    Ok(classified)
}
