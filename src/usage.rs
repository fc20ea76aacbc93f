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

//! The contract with the external usage-aggregation service.
//!
//! The aggregation service owns raw events; the billing core only ever sees
//! the rolled-up quantity for a `(meter, customer, window)` query, either as
//! a scalar or as a sequence of per-bucket quantities when the meter is
//! bucketed.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::calendar::Period;
use crate::error::Error;

pub mod http;

pub use http::{UsageHttpClient, UsageHttpClientBuilder, UsageHttpClientConfig};

/// A usage query for one meter, customer, and half-open time window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct UsageQuery {
    /// The meter whose events are aggregated.
    pub meter_id: String,
    /// The customer whose events are aggregated.
    pub customer_id: String,
    /// The half-open window events must fall in.
    #[serde(flatten)]
    pub period: Period,
    /// Additional event-property filters, intersected with the meter's own
    /// filters by the aggregation service.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, Vec<String>>,
}

impl UsageQuery {
    /// Creates a filterless query.
    pub fn new(meter_id: impl Into<String>, customer_id: impl Into<String>, period: Period) -> UsageQuery {
        UsageQuery {
            meter_id: meter_id.into(),
            customer_id: customer_id.into(),
            period,
            filters: BTreeMap::new(),
        }
    }

    /// Returns this query restricted to a different window.
    pub fn over(&self, period: Period) -> UsageQuery {
        UsageQuery {
            period,
            ..self.clone()
        }
    }
}

/// One bucket of a bucketed aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct UsageBucket {
    /// The inclusive start of the bucket's sub-window.
    pub bucket_start: DateTime<Utc>,
    /// The aggregated quantity for the bucket.
    pub quantity: Decimal,
}

/// The result of a usage query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(untagged)]
pub enum UsageQuantity {
    /// A single quantity for the whole window.
    Scalar {
        /// The aggregated quantity.
        quantity: Decimal,
    },
    /// One quantity per bucket. Prices are evaluated per bucket and the
    /// bucket amounts summed; the displayed quantity is the sum of bucket
    /// quantities.
    Bucketed {
        /// The per-bucket quantities, in bucket order.
        per_bucket: Vec<UsageBucket>,
    },
}

impl UsageQuantity {
    /// A scalar quantity.
    pub fn scalar(quantity: Decimal) -> UsageQuantity {
        UsageQuantity::Scalar { quantity }
    }

    /// A zero quantity.
    pub fn zero() -> UsageQuantity {
        UsageQuantity::Scalar {
            quantity: Decimal::ZERO,
        }
    }

    /// The total quantity across buckets (or the scalar itself).
    pub fn total(&self) -> Decimal {
        match self {
            UsageQuantity::Scalar { quantity } => *quantity,
            UsageQuantity::Bucketed { per_bucket } => {
                per_bucket.iter().map(|b| b.quantity).sum()
            }
        }
    }

    /// Whether no usage was recorded.
    pub fn is_zero(&self) -> bool {
        self.total().is_zero()
    }
}

/// A set of event filters attributed to one price.
///
/// Used when several prices share a meter and are told apart by event
/// properties (for example a storage meter priced differently for
/// `tier=archive` and `tier=standard`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct FilterGroup {
    /// The price the filtered usage belongs to.
    pub price_id: String,
    /// The event-property filters for this price.
    #[serde(default)]
    pub filters: BTreeMap<String, Vec<String>>,
}

impl FilterGroup {
    /// The specificity of this group: more constrained filter sets win ties
    /// when a single event matches several groups.
    ///
    /// A group constraining more keys is more specific; among groups
    /// constraining the same number of keys, fewer allowed values per key is
    /// more specific.
    pub fn specificity(&self) -> (usize, isize) {
        let keys = self.filters.len();
        let values: usize = self.filters.values().map(Vec::len).sum();
        (keys, -(values as isize))
    }
}

/// Usage attributed to one price by a filter-group query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct FilteredUsage {
    /// The price the quantity belongs to.
    pub price_id: String,
    /// The aggregated quantity for that price's filter group.
    #[serde(flatten)]
    pub quantity: UsageQuantity,
}

/// The aggregation service consumed by the billing engine.
///
/// [`UsageHttpClient`] implements this trait over the remote aggregation
/// API; tests and embedders with their own aggregation substitute scripted
/// implementations.
#[async_trait]
pub trait UsageSource: Send + Sync {
    /// Aggregates usage for one query.
    async fn get_usage(&self, query: &UsageQuery) -> Result<UsageQuantity, Error>;

    /// Aggregates usage for several filter groups sharing one meter in a
    /// single pass, attributing each event to the most specific matching
    /// group.
    async fn get_usage_with_filters(
        &self,
        query: &UsageQuery,
        groups: &[FilterGroup],
    ) -> Result<Vec<FilteredUsage>, Error>;
}
