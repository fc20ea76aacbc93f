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

use std::time::Duration;

/// Configuration for a [`BillingEngine`].
///
/// [`BillingEngine`]: crate::BillingEngine
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub(crate) aggregation_deadline: Duration,
    pub(crate) max_aggregation_attempts: u32,
    pub(crate) min_retry_backoff: Duration,
    pub(crate) max_retry_backoff: Duration,
}

impl Default for BillingConfig {
    fn default() -> BillingConfig {
        BillingConfig::DEFAULT
    }
}

impl BillingConfig {
    /// The default billing configuration.
    ///
    /// Exposed as a constant for use in constant evaluation contexts.
    pub const DEFAULT: BillingConfig = BillingConfig {
        aggregation_deadline: Duration::from_secs(30),
        max_aggregation_attempts: 3,
        min_retry_backoff: Duration::from_millis(250),
        max_retry_backoff: Duration::from_secs(10),
    };

    /// Sets the deadline applied to each usage aggregation query.
    ///
    /// On expiry the charge is failed (strict mode) or skipped with a
    /// warning (non-strict mode).
    pub const fn aggregation_deadline(mut self, deadline: Duration) -> Self {
        self.aggregation_deadline = deadline;
        self
    }

    /// Sets the maximum number of attempts for a usage aggregation query
    /// that fails with a retryable error.
    ///
    /// Values below 1 are treated as 1.
    pub const fn max_aggregation_attempts(mut self, attempts: u32) -> Self {
        self.max_aggregation_attempts = attempts;
        self
    }

    /// Sets the bounds of the exponential backoff applied between
    /// aggregation attempts.
    pub const fn retry_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_retry_backoff = min;
        self.max_retry_backoff = max;
        self
    }
}
