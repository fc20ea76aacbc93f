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

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::debug;

use crate::config::BillingConfig;
use crate::error::Error;
use crate::money::Money;
use crate::store::BillingStore;
use crate::subscription::{LineItemCharge, Subscription};
use crate::usage::{FilterGroup, FilteredUsage, UsageQuantity, UsageQuery, UsageSource};
use crate::util::{Clock, SystemClock};

pub mod charges;
pub mod invoices;

/// The billing engine.
///
/// Holds the capabilities billing operations need (the store, the usage
/// aggregation source, a clock, and an optional proration calculator) and
/// exposes the charge calculators and invoice preparation as methods. The
/// engine keeps no mutable state of its own: it is designed to be wrapped
/// in an [`Arc`] and used from multiple threads simultaneously, with all
/// shared state living in the store.
pub struct BillingEngine {
    pub(crate) store: Arc<dyn BillingStore>,
    pub(crate) usage: GuardedUsage,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) proration: Option<Arc<dyn ProrationCalculator>>,
}

impl BillingEngine {
    /// Creates an engine with the default configuration, the system clock,
    /// and no proration calculator.
    pub fn new(store: Arc<dyn BillingStore>, usage: Arc<dyn UsageSource>) -> BillingEngine {
        BillingEngine::builder().build(store, usage)
    }

    /// Creates a builder for an engine that allows for customization of
    /// optional parameters.
    pub fn builder() -> BillingEngineBuilder {
        BillingEngineBuilder::default()
    }
}

/// A builder for a [`BillingEngine`].
pub struct BillingEngineBuilder {
    config: BillingConfig,
    clock: Arc<dyn Clock>,
    proration: Option<Arc<dyn ProrationCalculator>>,
}

impl Default for BillingEngineBuilder {
    fn default() -> BillingEngineBuilder {
        BillingEngineBuilder {
            config: BillingConfig::DEFAULT,
            clock: Arc::new(SystemClock),
            proration: None,
        }
    }
}

impl BillingEngineBuilder {
    /// Sets the billing configuration.
    pub fn config(mut self, config: BillingConfig) -> BillingEngineBuilder {
        self.config = config;
        self
    }

    /// Sets the clock, e.g. a pinned clock in tests.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> BillingEngineBuilder {
        self.clock = clock;
        self
    }

    /// Sets the proration calculator applied to partial-period fixed
    /// charges of subscriptions with proration enabled.
    pub fn proration(mut self, proration: Arc<dyn ProrationCalculator>) -> BillingEngineBuilder {
        self.proration = Some(proration);
        self
    }

    /// Creates a [`BillingEngine`] that incorporates the optional
    /// parameters configured on the builder and the specified required
    /// parameters.
    pub fn build(
        self,
        store: Arc<dyn BillingStore>,
        usage: Arc<dyn UsageSource>,
    ) -> BillingEngine {
        BillingEngine {
            store,
            usage: GuardedUsage {
                inner: usage,
                config: self.config,
            },
            clock: self.clock,
            proration: self.proration,
        }
    }
}

/// Adjusts charges that cover partial subscription periods.
///
/// The calculator itself is an external collaborator; when a subscription's
/// proration behavior is `none`, or no calculator is configured, charges are
/// full amounts.
#[async_trait]
pub trait ProrationCalculator: Send + Sync {
    /// Returns the adjusted amount for a charge whose line item covers only
    /// part of its service period.
    async fn adjust(
        &self,
        subscription: &Subscription,
        charge: &LineItemCharge,
        amount: Money,
    ) -> Result<Money, Error>;
}

/// A [`UsageSource`] wrapper applying the configured deadline to every
/// query and retrying transient failures with exponential backoff, per the
/// propagation policy for integration failures.
pub(crate) struct GuardedUsage {
    inner: Arc<dyn UsageSource>,
    config: BillingConfig,
}

impl GuardedUsage {
    async fn guarded<T, F, Fut>(&self, operation: F) -> Result<T, Error>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        let attempts = self.config.max_aggregation_attempts.max(1);
        let mut backoff = self.config.min_retry_backoff;
        for attempt in 1..=attempts {
            let result = match timeout(self.config.aggregation_deadline, operation()).await {
                Ok(result) => result,
                Err(_) => Err(Error::integration(
                    format!(
                        "aggregation query exceeded its {:?} deadline",
                        self.config.aggregation_deadline
                    ),
                    true,
                )),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    debug!(attempt, error = %e, "retrying aggregation query");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.max_retry_backoff);
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("loop returns on the final attempt")
    }
}

#[async_trait]
impl UsageSource for GuardedUsage {
    async fn get_usage(&self, query: &UsageQuery) -> Result<UsageQuantity, Error> {
        self.guarded(|| self.inner.get_usage(query)).await
    }

    async fn get_usage_with_filters(
        &self,
        query: &UsageQuery,
        groups: &[FilterGroup],
    ) -> Result<Vec<FilteredUsage>, Error> {
        self.guarded(|| self.inner.get_usage_with_filters(query, groups))
            .await
    }
}
