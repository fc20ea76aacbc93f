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

//! The billing core of a usage-based metering and subscription billing
//! platform.
//!
//! Given a subscription with heterogeneous price components and aggregated
//! usage, this crate produces correct invoice line items, amounts, and
//! balances for any reference point in a subscription's lifecycle:
//!
//! * **Period arithmetic** ([`calendar`]): anchor-snapped billing periods
//!   computed in the customer's timezone, with end-of-month clamping.
//! * **Pricing** ([`price`]): flat-fee, package, and tiered (slab and
//!   volume) evaluation in exact decimal arithmetic, rounded once to
//!   currency precision, with bucketed aggregations rated per bucket.
//! * **Entitlements** ([`entitlement`]): feature allowances netted from
//!   raw usage with daily, monthly, billing-period, and lifetime reset
//!   semantics.
//! * **Invoice preparation** ([`engine`]): cadence classification across
//!   mixed billing periods, de-duplication against previously billed
//!   service periods, and draft assembly, exposed on [`BillingEngine`].
//! * **The wallet ledger** ([`wallet`]): prepaid credits consumed FIFO
//!   with priority and expiry, idempotent operations, and a real-time
//!   balance netting unpaid invoices and uninvoiced usage.
//!
//! Persistence and the upstream event-aggregation service are consumed
//! through traits ([`BillingStore`], [`WalletStore`], [`UsageSource`]); the
//! crate ships [`MemoryStore`] and the [`UsageHttpClient`] aggregation
//! client, and exposes no HTTP surface of its own. Capabilities (stores,
//! clocks, the aggregation source, the proration calculator) are injected
//! explicitly, so the core holds no global state.

#[warn(missing_debug_implementations, missing_docs)]
pub mod calendar;
pub mod config;
pub mod engine;
pub mod entitlement;
pub mod error;
pub mod invoice;
pub mod meter;
pub mod money;
pub mod price;
pub mod store;
pub mod subscription;
pub mod usage;
mod util;
pub mod wallet;

pub use calendar::{BillingPeriod, Period};
pub use config::BillingConfig;
pub use engine::charges::{Charge, LineItemUsage};
pub use engine::{BillingEngine, BillingEngineBuilder, ProrationCalculator};
pub use entitlement::{Entitlement, UsageResetPeriod};
pub use error::Error;
pub use invoice::{Invoice, InvoiceLineItem, InvoiceStatus, PaymentStatus};
pub use meter::{Aggregation, AggregationKind, BucketSize, Meter, ResetUsage};
pub use money::{currency_precision, round_to_currency, Money};
pub use price::{
    BillingModel, InvoiceCadence, Price, PriceKind, PriceTier, TierMode, Transform, TransformRound,
};
pub use store::memory::MemoryStore;
pub use store::{BillingStore, WalletStore, WalletWrite};
pub use subscription::{
    classify_line_items, ClassifiedLineItems, LineItemCharge, ProrationBehavior, ReferencePoint,
    Subscription, SubscriptionLineItem, SubscriptionStatus,
};
pub use usage::{
    FilterGroup, FilteredUsage, UsageBucket, UsageHttpClient, UsageHttpClientBuilder,
    UsageHttpClientConfig, UsageQuantity, UsageQuery, UsageSource,
};
pub use util::{Clock, SystemClock};
pub use wallet::{
    AutoTopupConfig, CreateWalletRequest, CreditRequest, DebitRequest, InvoiceSummarySource,
    ReferenceKind, TransactionReason, TransactionReference, TransactionStatus, TransactionType,
    UsagePreviewSource, Wallet, WalletLedger, WalletStatus, WalletTransaction, WalletType,
};
