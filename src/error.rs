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

use rust_decimal::Decimal;

/// An error returned by a billing or wallet operation.
///
/// Callers that need to branch on failures should match on [`Error::code`]
/// rather than on variants: codes are stable across releases, variant shapes
/// are not.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input: empty identifiers, negative amounts, inverted
    /// periods, unknown enum codes.
    #[error("validation error: {detail}")]
    Validation {
        /// A human-readable description of the rejected input.
        detail: String,
    },
    /// A referenced entity is absent.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity that was looked up.
        entity: &'static str,
        /// The identifier that failed to resolve.
        id: String,
    },
    /// A uniqueness constraint was violated.
    #[error("{entity} already exists: {detail}")]
    AlreadyExists {
        /// The kind of entity whose uniqueness was violated.
        entity: &'static str,
        /// A description of the conflicting key.
        detail: String,
    },
    /// Legal inputs applied to an illegal state, such as debiting a closed
    /// wallet or voiding an already-void invoice.
    #[error("invalid operation: {detail}")]
    InvalidOperation {
        /// A description of the rejected transition.
        detail: String,
    },
    /// A wallet debit exceeded the eligible credits.
    #[error("insufficient balance: requested {requested} credits but only {available} available")]
    InsufficientBalance {
        /// The credit units the debit asked for.
        requested: Decimal,
        /// The credit units eligible at the time of the debit.
        available: Decimal,
    },
    /// A downstream service (usage aggregation, payment provider) failed.
    #[error("integration failure: {detail}")]
    Integration {
        /// A description of the downstream failure.
        detail: String,
        /// Whether retrying the operation may succeed.
        retryable: bool,
    },
    /// The operation was aborted by its cancellation token between I/O
    /// steps.
    #[error("operation cancelled")]
    Cancelled,
    /// An internal invariant was violated. Details are logged, never
    /// surfaced to callers of the public API.
    #[error("internal error")]
    Internal {
        /// The violated invariant, for logs only.
        detail: String,
    },
}

impl Error {
    /// The stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation",
            Error::NotFound { .. } => "not_found",
            Error::AlreadyExists { .. } => "already_exists",
            Error::InvalidOperation { .. } => "invalid_operation",
            Error::InsufficientBalance { .. } => "insufficient_balance",
            Error::Integration { .. } => "integration_failure",
            Error::Cancelled => "cancelled",
            Error::Internal { .. } => "internal",
        }
    }

    /// Whether the operation that produced this error may be retried as-is.
    ///
    /// Wallet operations must be replayed with the same idempotency key
    /// instead; see the module documentation of [`crate::wallet`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Integration { retryable: true, .. })
    }

    pub(crate) fn validation(detail: impl Into<String>) -> Error {
        Error::Validation {
            detail: detail.into(),
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Error {
        Error::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn already_exists(entity: &'static str, detail: impl Into<String>) -> Error {
        Error::AlreadyExists {
            entity,
            detail: detail.into(),
        }
    }

    pub(crate) fn invalid_operation(detail: impl Into<String>) -> Error {
        Error::InvalidOperation {
            detail: detail.into(),
        }
    }

    pub(crate) fn integration(detail: impl Into<String>, retryable: bool) -> Error {
        Error::Integration {
            detail: detail.into(),
            retryable,
        }
    }

    pub(crate) fn internal(detail: impl Into<String>) -> Error {
        Error::Internal {
            detail: detail.into(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Error {
        // Connection-level failures are worth retrying; anything that made
        // it to response decoding is not.
        let retryable = e.is_timeout() || e.is_connect();
        Error::Integration {
            detail: e.to_string(),
            retryable,
        }
    }
}

impl From<reqwest_middleware::Error> for Error {
    fn from(e: reqwest_middleware::Error) -> Error {
        match e {
            reqwest_middleware::Error::Reqwest(e) => e.into(),
            reqwest_middleware::Error::Middleware(e) => Error::Integration {
                detail: e.to_string(),
                retryable: false,
            },
        }
    }
}
