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

//! The charge calculators.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::calendar::Period;
use crate::engine::BillingEngine;
use crate::entitlement::{billable_quantity, Entitlement};
use crate::error::Error;
use crate::money::{round_to_currency, Money};
use crate::price::PriceKind;
use crate::subscription::{LineItemCharge, Subscription, SubscriptionLineItem};
use crate::usage::{UsageQuantity, UsageQuery, UsageSource};

/// One computed charge: the amount a line item owes for a service period.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Charge {
    /// The subscription line item the charge bills.
    pub subscription_line_item_id: String,
    /// The price that produced the charge.
    pub price_id: String,
    /// The name shown on invoices.
    pub display_name: String,
    /// The billed quantity: the fixed quantity, the netted billable
    /// quantity, or the sum of bucket quantities.
    pub quantity: Decimal,
    /// The charged amount, rounded to currency precision.
    pub amount: Money,
    /// The interval the charge covers.
    pub service_period: Period,
}

/// Aggregated usage attributed to one subscription line item.
///
/// Attribution is by line item, never by price: when a subscription change
/// supersedes a line item and the replacement reuses the same price, usage
/// recorded against the old line item must not bill the new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct LineItemUsage {
    /// The line item the usage was recorded against.
    pub subscription_line_item_id: String,
    /// The aggregated usage.
    pub quantity: UsageQuantity,
}

impl BillingEngine {
    /// Computes the fixed charges of `subscription` for the given service
    /// period.
    ///
    /// Covers every fixed line item active for the period, prorated through
    /// the configured calculator when the subscription asks for prorations
    /// and the line item covers only part of the period.
    pub async fn calculate_fixed_charges(
        &self,
        subscription: &Subscription,
        period: Period,
    ) -> Result<(Vec<Charge>, Money), Error> {
        let items = self.store.line_items(&subscription.id).await?;
        let mut charges = Vec::new();
        for item in items {
            if item.price_kind != PriceKind::Fixed || !item.active_for(&period) {
                continue;
            }
            let candidate = LineItemCharge {
                line_item: item,
                service_period: period,
            };
            charges.push(self.fixed_charge(subscription, &candidate).await?);
        }
        let total = total_of(&charges, subscription)?;
        Ok((charges, total))
    }

    /// Computes usage charges from pre-aggregated usage, without
    /// entitlement netting.
    ///
    /// Usage attributed to a line item that is not active for the period is
    /// skipped with a warning.
    pub async fn calculate_usage_charges(
        &self,
        subscription: &Subscription,
        usage: &[LineItemUsage],
        period: Period,
    ) -> Result<(Vec<Charge>, Money), Error> {
        self.usage_charges_from(subscription, usage, period, Netting::Skip)
            .await
    }

    /// Computes usage charges from pre-aggregated usage, netting each line
    /// item's usage against the entitlement its plan grants on the meter.
    ///
    /// `overrides` substitutes entitlements by meter ID, for callers that
    /// resolve entitlements themselves.
    pub async fn calculate_feature_usage_charges(
        &self,
        subscription: &Subscription,
        usage: &[LineItemUsage],
        period: Period,
        overrides: Option<&BTreeMap<String, Entitlement>>,
    ) -> Result<(Vec<Charge>, Money), Error> {
        self.usage_charges_from(subscription, usage, period, Netting::Apply(overrides))
            .await
    }

    /// Shared body of the two usage calculators.
    async fn usage_charges_from(
        &self,
        subscription: &Subscription,
        usage: &[LineItemUsage],
        period: Period,
        netting: Netting<'_>,
    ) -> Result<(Vec<Charge>, Money), Error> {
        let items = self.store.line_items(&subscription.id).await?;
        let mut charges = Vec::new();
        for record in usage {
            let Some(item) = items.iter().find(|item| {
                item.id == record.subscription_line_item_id
                    && item.price_kind == PriceKind::Usage
                    && item.active_for(&period)
            }) else {
                warn!(
                    subscription_line_item_id = %record.subscription_line_item_id,
                    "skipping usage for a line item outside the active set"
                );
                continue;
            };
            let candidate = LineItemCharge {
                line_item: item.clone(),
                service_period: period,
            };
            let entitlement = match netting {
                Netting::Skip => None,
                Netting::Apply(overrides) => {
                    self.resolve_entitlement(subscription, item, overrides)
                        .await?
                }
            };
            charges.push(
                self.usage_charge(subscription, &candidate, &record.quantity, entitlement.as_ref())
                    .await?,
            );
        }
        let total = total_of(&charges, subscription)?;
        Ok((charges, total))
    }

    pub(crate) async fn resolve_entitlement(
        &self,
        subscription: &Subscription,
        item: &SubscriptionLineItem,
        overrides: Option<&BTreeMap<String, Entitlement>>,
    ) -> Result<Option<Entitlement>, Error> {
        let Some(meter_id) = &item.meter_id else {
            return Ok(None);
        };
        if let Some(overridden) = overrides.and_then(|map| map.get(meter_id)) {
            return Ok(Some(overridden.clone()));
        }
        match &subscription.plan_id {
            Some(plan_id) => self.store.entitlement(plan_id, meter_id).await,
            None => Ok(None),
        }
    }

    /// Computes one fixed charge.
    pub(crate) async fn fixed_charge(
        &self,
        subscription: &Subscription,
        candidate: &LineItemCharge,
    ) -> Result<Charge, Error> {
        let item = &candidate.line_item;
        let price = self.store.price(&item.price_id).await?;
        if price.currency != subscription.currency {
            return Err(Error::validation(format!(
                "price {} is denominated in {} but subscription {} settles in {}",
                price.id, price.currency, subscription.id, subscription.currency
            )));
        }
        let amount = price.rate(item.quantity)?;
        let mut amount = Money::new(
            round_to_currency(amount, &price.currency),
            price.currency.clone(),
        );
        if self.covers_partial_period(subscription, candidate) {
            if let Some(proration) = &self.proration {
                amount = proration.adjust(subscription, candidate, amount).await?;
            }
        }
        Ok(Charge {
            subscription_line_item_id: item.id.clone(),
            price_id: price.id,
            display_name: item.display_name.clone(),
            quantity: item.quantity,
            amount,
            service_period: candidate.service_period,
        })
    }

    fn covers_partial_period(
        &self,
        subscription: &Subscription,
        candidate: &LineItemCharge,
    ) -> bool {
        if subscription.proration_behavior == crate::subscription::ProrationBehavior::None {
            return false;
        }
        let period = &candidate.service_period;
        let item = &candidate.line_item;
        item.start_date > period.start
            || item.end_date.map_or(false, |end| end < period.end)
    }

    /// Computes one usage charge from aggregated usage, netting against an
    /// entitlement when one applies.
    ///
    /// Without an applicable entitlement, bucketed usage is rated per
    /// bucket; a netted quantity is a scalar and is rated as one.
    pub(crate) async fn usage_charge(
        &self,
        subscription: &Subscription,
        candidate: &LineItemCharge,
        raw: &UsageQuantity,
        entitlement: Option<&Entitlement>,
    ) -> Result<Charge, Error> {
        let item = &candidate.line_item;
        let price = self.store.price(&item.price_id).await?;
        if price.currency != subscription.currency {
            return Err(Error::validation(format!(
                "price {} is denominated in {} but subscription {} settles in {}",
                price.id, price.currency, subscription.id, subscription.currency
            )));
        }
        let meter_id = item
            .meter_id
            .as_deref()
            .ok_or_else(|| Error::validation(format!("usage line item {} has no meter", item.id)))?;

        let netting = entitlement.filter(|e| e.is_enabled);
        let (quantity, amount) = match netting {
            None => (raw.total(), price.rate_usage(raw)?),
            Some(entitlement) => {
                let meter = self.store.meter(meter_id).await?;
                let query = UsageQuery {
                    meter_id: meter_id.to_string(),
                    customer_id: subscription.customer_id.clone(),
                    period: candidate.service_period,
                    filters: price.filters.clone(),
                };
                let lifetime_start = subscription.start_date.max(item.start_date);
                let billable = billable_quantity(
                    Some(entitlement),
                    &meter,
                    raw,
                    &query,
                    lifetime_start,
                    subscription.customer_timezone,
                    &self.usage,
                )
                .await?;
                (billable, price.rate(billable)?)
            }
        };

        Ok(Charge {
            subscription_line_item_id: item.id.clone(),
            price_id: price.id.clone(),
            display_name: item.display_name.clone(),
            quantity,
            amount: Money::new(
                round_to_currency(amount, &price.currency),
                price.currency,
            ),
            service_period: candidate.service_period,
        })
    }

    /// Fetches aggregated usage for one candidate charge through the
    /// deadline- and retry-guarded usage source.
    pub(crate) async fn fetch_usage(
        &self,
        subscription: &Subscription,
        candidate: &LineItemCharge,
        price_filters: &BTreeMap<String, Vec<String>>,
    ) -> Result<UsageQuantity, Error> {
        let meter_id = candidate.line_item.meter_id.as_deref().ok_or_else(|| {
            Error::validation(format!(
                "usage line item {} has no meter",
                candidate.line_item.id
            ))
        })?;
        let query = UsageQuery {
            meter_id: meter_id.to_string(),
            customer_id: subscription.customer_id.clone(),
            period: candidate.service_period,
            filters: price_filters.clone(),
        };
        self.usage.get_usage(&query).await
    }
}

/// Whether a usage calculator nets entitlements, and with which overrides.
#[derive(Clone, Copy)]
enum Netting<'a> {
    Skip,
    Apply(Option<&'a BTreeMap<String, Entitlement>>),
}

pub(crate) fn total_of(charges: &[Charge], subscription: &Subscription) -> Result<Money, Error> {
    let mut total = Money::zero(subscription.currency.clone());
    for charge in charges {
        total = total.checked_add(&charge.amount)?;
    }
    Ok(total)
}
