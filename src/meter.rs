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

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::util::require_nonempty;

/// A meter: the definition of how raw events roll up into a billable
/// quantity.
///
/// The aggregation is immutable after first use; changing it would silently
/// reprice historical usage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Meter {
    /// The unique identifier for the meter.
    pub id: String,
    /// The name of the events this meter aggregates.
    pub event_name: String,
    /// How matching events reduce to a quantity.
    pub aggregation: Aggregation,
    /// Restricts which events contribute: an event matches when, for every
    /// key present here, its property value is one of the allowed values.
    #[serde(default)]
    pub filters: BTreeMap<String, Vec<String>>,
    /// Whether aggregated usage resets at each billing period boundary or
    /// accumulates for the lifetime of the subscription.
    pub reset_usage: ResetUsage,
}

impl Meter {
    /// Validates the meter definition.
    pub fn validate(&self) -> Result<(), Error> {
        require_nonempty(&self.id, "meter id")?;
        require_nonempty(&self.event_name, "meter event name")?;
        match self.aggregation.kind {
            AggregationKind::Count => Ok(()),
            kind => {
                if self.aggregation.field.as_deref().map_or(true, str::is_empty) {
                    Err(Error::validation(format!(
                        "aggregation {kind:?} requires a field"
                    )))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// The reduction a meter applies to matching events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Aggregation {
    /// The aggregation function.
    pub kind: AggregationKind,
    /// The event property the function is applied to. Unused for `count`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// When set, usage is aggregated per sub-window of this size and priced
    /// per bucket rather than over the whole query window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket_size: Option<BucketSize>,
}

/// An aggregation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    /// The number of matching events.
    Count,
    /// The sum of the field across matching events.
    Sum,
    /// The maximum of the field across matching events.
    Max,
    /// The minimum of the field across matching events.
    Min,
    /// The field of the latest matching event.
    Last,
}

/// The width of one aggregation bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketSize {
    /// One bucket per minute.
    Minute,
    /// One bucket per hour.
    Hour,
    /// One bucket per day.
    Day,
}

/// Whether a meter's usage resets per billing period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetUsage {
    /// Usage windows align with billing periods.
    BillingPeriod,
    /// Usage accumulates over the subscription lifetime.
    Never,
}
