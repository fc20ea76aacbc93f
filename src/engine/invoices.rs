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

//! Invoice preparation.
//!
//! The pipeline: classify line items into candidate charges with their
//! service periods, drop candidates already billed by a non-void invoice
//! line, compute fixed and usage charges, and assemble a draft invoice.
//! Preparation only reads until the final draft insert, which the store
//! applies atomically with all line items; preview runs never write.

use async_trait::async_trait;
use codes_iso_4217::CurrencyCode;
use futures_util::future::try_join_all;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::calendar::{next_period_end, Period};
use crate::engine::charges::{total_of, Charge};
use crate::engine::BillingEngine;
use crate::error::Error;
use crate::invoice::{Invoice, InvoiceLineItem};
use crate::price::PriceKind;
use crate::subscription::{
    classify_line_items, ClassifiedLineItems, LineItemCharge, ReferencePoint, Subscription,
};
use crate::usage::UsageSource;
use crate::util::{check_cancelled, new_id};
use crate::wallet::UsagePreviewSource;

impl BillingEngine {
    /// Partitions a subscription's line items into the four cadence/period
    /// buckets for the given current and next periods.
    pub async fn classify_subscription(
        &self,
        subscription: &Subscription,
        current: Period,
        next: Period,
    ) -> Result<ClassifiedLineItems, Error> {
        let items = self.store.line_items(&subscription.id).await?;
        classify_line_items(subscription, &items, current, next)
    }

    /// Drops candidates already billed: a candidate is out when a non-void
    /// invoice line exists for its line item over exactly its service
    /// period. This is what makes invoice preparation safe to re-run.
    pub async fn filter_line_items_to_be_invoiced(
        &self,
        candidates: Vec<LineItemCharge>,
    ) -> Result<Vec<LineItemCharge>, Error> {
        let mut remaining = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let existing = self
                .store
                .existing_invoice_lines(&candidate.line_item.id, &candidate.service_period)
                .await?;
            if existing.is_empty() {
                remaining.push(candidate);
            } else {
                debug!(
                    line_item_id = %candidate.line_item.id,
                    service_period = %candidate.service_period,
                    "candidate already billed",
                );
            }
        }
        Ok(remaining)
    }

    /// Prepares the invoice for a subscription window.
    ///
    /// `period` is the invoice window; the reference point selects which
    /// cadence buckets are billed. Non-preview runs write the draft,
    /// including all line items, in one store transaction; preview runs
    /// write nothing.
    ///
    /// With `strict` unset, a usage aggregation failure skips that charge
    /// with a warning rather than failing the invoice; finalization flows
    /// pass `strict` to make such failures fatal.
    pub async fn prepare_invoice_request(
        &self,
        subscription: &Subscription,
        period: Period,
        reference_point: ReferencePoint,
        strict: bool,
        token: &CancellationToken,
    ) -> Result<Invoice, Error> {
        let next_end = next_period_end(
            period.end,
            subscription.billing_anchor,
            subscription.billing_period_count,
            subscription.billing_period,
            subscription.customer_timezone,
        )?;
        let next = Period::new(period.end, next_end)?;

        let classified = self.classify_subscription(subscription, period, next).await?;
        let candidates = classified.for_reference_point(reference_point);
        check_cancelled(token)?;

        let candidates = self.filter_line_items_to_be_invoiced(candidates).await?;
        check_cancelled(token)?;

        let (fixed, usage): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|c| c.line_item.price_kind == PriceKind::Fixed);

        let mut charges = Vec::new();
        for candidate in &fixed {
            charges.push(self.fixed_charge(subscription, candidate).await?);
        }
        check_cancelled(token)?;
        charges.extend(
            self.usage_charges_for(subscription, &usage, strict, token)
                .await?,
        );

        let invoice_id = new_id("inv");
        let mut invoice = Invoice::draft(
            invoice_id.clone(),
            Some(subscription.id.clone()),
            subscription.customer_id.clone(),
            subscription.currency.clone(),
            period,
            self.clock.now(),
        );
        for charge in charges {
            invoice.push_line(InvoiceLineItem {
                id: new_id("li"),
                invoice_id: invoice_id.clone(),
                price_id: Some(charge.price_id),
                subscription_line_item_id: Some(charge.subscription_line_item_id),
                display_name: charge.display_name,
                amount: charge.amount.amount,
                quantity: charge.quantity,
                period: charge.service_period,
            });
        }

        if reference_point != ReferencePoint::Preview {
            check_cancelled(token)?;
            self.store.insert_draft_invoice(invoice.clone()).await?;
        }
        Ok(invoice)
    }

    /// Computes the usage charges for a set of candidates, fetching and
    /// netting each one's usage.
    ///
    /// Candidates sharing a meter are disambiguated in a single
    /// filter-group query, with each result attributed by price. Aggregation
    /// failures fail the whole computation when `strict`, and skip the
    /// affected candidates with a warning otherwise.
    pub(crate) async fn usage_charges_for(
        &self,
        subscription: &Subscription,
        candidates: &[LineItemCharge],
        strict: bool,
        token: &CancellationToken,
    ) -> Result<Vec<Charge>, Error> {
        use std::collections::BTreeMap;

        use crate::usage::{FilterGroup, UsageQuantity, UsageQuery};

        // Group candidates that read the same meter over the same window so
        // shared meters resolve through one filter-group query.
        let mut groups: BTreeMap<(String, Period), Vec<&LineItemCharge>> = BTreeMap::new();
        for candidate in candidates {
            let Some(meter_id) = candidate.line_item.meter_id.clone() else {
                warn!(
                    line_item_id = %candidate.line_item.id,
                    "skipping usage line item with no meter"
                );
                continue;
            };
            groups
                .entry((meter_id, candidate.service_period))
                .or_default()
                .push(candidate);
        }

        let mut charges = Vec::new();
        for ((meter_id, service_period), group) in groups {
            check_cancelled(token)?;

            // (candidate, raw usage) pairs for this meter and window.
            let mut rated: Vec<(&LineItemCharge, UsageQuantity)> = Vec::new();
            let fetched: Result<(), Error> = async {
                if let [candidate] = group.as_slice() {
                    let price = self.store.price(&candidate.line_item.price_id).await?;
                    let raw = self
                        .fetch_usage(subscription, candidate, &price.filters)
                        .await?;
                    rated.push((*candidate, raw));
                } else {
                    let mut filter_groups = Vec::with_capacity(group.len());
                    for candidate in &group {
                        let price = self.store.price(&candidate.line_item.price_id).await?;
                        filter_groups.push(FilterGroup {
                            price_id: price.id,
                            filters: price.filters,
                        });
                    }
                    let query = UsageQuery {
                        meter_id: meter_id.clone(),
                        customer_id: subscription.customer_id.clone(),
                        period: service_period,
                        filters: BTreeMap::new(),
                    };
                    let results = self.usage.get_usage_with_filters(&query, &filter_groups).await?;
                    for candidate in &group {
                        let raw = results
                            .iter()
                            .find(|r| r.price_id == candidate.line_item.price_id)
                            .map(|r| r.quantity.clone())
                            .unwrap_or_else(UsageQuantity::zero);
                        rated.push((*candidate, raw));
                    }
                }
                Ok(())
            }
            .await;

            if let Err(e) = fetched {
                if strict || !matches!(e, Error::Integration { .. }) {
                    return Err(e);
                }
                warn!(
                    meter_id = %meter_id,
                    error = %e,
                    "skipping usage charges for meter after aggregation failure"
                );
                continue;
            }

            for (candidate, raw) in rated {
                let entitlement = self
                    .resolve_entitlement(subscription, &candidate.line_item, None)
                    .await?;
                match self
                    .usage_charge(subscription, candidate, &raw, entitlement.as_ref())
                    .await
                {
                    Ok(charge) => charges.push(charge),
                    Err(e @ Error::Integration { .. }) if !strict => {
                        warn!(
                            line_item_id = %candidate.line_item.id,
                            error = %e,
                            "skipping usage charge after aggregation failure"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(charges)
    }
}

impl BillingEngine {
    /// The usage charges a preview invoice would bill for one subscription's
    /// current period, as an amount.
    async fn pending_usage_for(
        &self,
        subscription: &Subscription,
        token: &CancellationToken,
    ) -> Result<Decimal, Error> {
        let current = subscription.current_period()?;
        let next = subscription.next_period()?;
        let classified = self
            .classify_subscription(subscription, current, next)
            .await?;
        let candidates: Vec<_> = classified
            .current_arrear
            .into_iter()
            .filter(|c| c.line_item.price_kind == PriceKind::Usage)
            .collect();
        let candidates = self.filter_line_items_to_be_invoiced(candidates).await?;
        let charges = self
            .usage_charges_for(subscription, &candidates, false, token)
            .await?;
        Ok(total_of(&charges, subscription)?.amount)
    }
}

#[async_trait]
impl UsagePreviewSource for BillingEngine {
    /// The total uninvoiced current-period usage for a customer: the usage
    /// charges a preview invoice would bill right now, across the
    /// customer's active same-currency subscriptions.
    async fn uninvoiced_amount(
        &self,
        customer_id: &str,
        currency: &CurrencyCode,
    ) -> Result<Decimal, Error> {
        let token = CancellationToken::new();
        let subscriptions = self.store.active_subscriptions(customer_id, currency).await?;
        let totals = try_join_all(
            subscriptions
                .iter()
                .map(|subscription| self.pending_usage_for(subscription, &token)),
        )
        .await?;
        Ok(totals.into_iter().sum())
    }
}
