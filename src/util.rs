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

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A source of the current time.
///
/// Injected into the engine and the wallet ledger so that tests can pin the
/// clock; production callers use [`SystemClock`].
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// A [`Clock`] backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Generates a prefixed identifier, e.g. `inv_6fbb38cbab8f4f52a7be3f2bc1b2e0fa`.
pub(crate) fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

pub(crate) fn require_nonempty(value: &str, what: &str) -> Result<(), crate::Error> {
    if value.trim().is_empty() {
        Err(crate::Error::validation(format!("{what} must not be empty")))
    } else {
        Ok(())
    }
}

/// Aborts an operation between I/O steps when its token has been cancelled.
pub(crate) fn check_cancelled(
    token: &tokio_util::sync::CancellationToken,
) -> Result<(), crate::Error> {
    if token.is_cancelled() {
        Err(crate::Error::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix() {
        let id = new_id("txn");
        assert!(id.starts_with("txn_"));
        assert_eq!(id.len(), "txn_".len() + 32);
    }
}
