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

//! The persistence contracts consumed by the billing engine and the wallet
//! ledger.
//!
//! The crate ships no database driver. Implementations are expected to make
//! each mutating call atomic: [`WalletStore::apply_wallet_write`] carries
//! the full row set of one ledger transaction precisely so that a
//! relational implementation can wrap it in a single transaction with the
//! wallet row locked. [`store::memory::MemoryStore`] serializes everything
//! on one mutex and backs the test suite.
//!
//! [`store::memory::MemoryStore`]: memory::MemoryStore

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codes_iso_4217::CurrencyCode;
use rust_decimal::Decimal;

use crate::calendar::Period;
use crate::entitlement::Entitlement;
use crate::error::Error;
use crate::invoice::{Invoice, InvoiceLineItem};
use crate::meter::Meter;
use crate::price::Price;
use crate::subscription::{Subscription, SubscriptionLineItem};
use crate::wallet::{Wallet, WalletTransaction, WalletType};

pub mod memory;

/// The repositories invoice preparation reads from and writes to.
#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Fetches a subscription by ID.
    async fn subscription(&self, id: &str) -> Result<Subscription, Error>;

    /// Fetches every line item of a subscription, including end-dated ones.
    async fn line_items(&self, subscription_id: &str)
        -> Result<Vec<SubscriptionLineItem>, Error>;

    /// Fetches a price by ID.
    async fn price(&self, id: &str) -> Result<Price, Error>;

    /// Fetches a meter by ID.
    async fn meter(&self, id: &str) -> Result<Meter, Error>;

    /// Fetches the entitlement a plan grants on a meter, if any.
    async fn entitlement(
        &self,
        plan_id: &str,
        meter_id: &str,
    ) -> Result<Option<Entitlement>, Error>;

    /// Fetches the non-void invoice lines already billed for a subscription
    /// line item over exactly the given service period.
    async fn existing_invoice_lines(
        &self,
        subscription_line_item_id: &str,
        service_period: &Period,
    ) -> Result<Vec<InvoiceLineItem>, Error>;

    /// Writes a draft invoice and all of its line items atomically.
    ///
    /// Fails with `already_exists` when a non-void line already covers one
    /// of the draft's `(subscription line item, service period)` pairs.
    async fn insert_draft_invoice(&self, invoice: Invoice) -> Result<(), Error>;

    /// Fetches the customer's active subscriptions in the given currency.
    async fn active_subscriptions(
        &self,
        customer_id: &str,
        currency: &CurrencyCode,
    ) -> Result<Vec<Subscription>, Error>;
}

/// The repository the wallet ledger operates on.
#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Fetches a wallet by ID.
    async fn wallet(&self, id: &str) -> Result<Wallet, Error>;

    /// Finds the customer's non-closed wallet of the given currency and
    /// type, if one exists.
    async fn find_wallet(
        &self,
        customer_id: &str,
        currency: &CurrencyCode,
        wallet_type: &WalletType,
    ) -> Result<Option<Wallet>, Error>;

    /// Inserts a wallet.
    ///
    /// Fails with `already_exists` when the customer already has a
    /// non-closed wallet of the same currency and type.
    async fn insert_wallet(&self, wallet: Wallet) -> Result<(), Error>;

    /// Replaces a wallet row.
    async fn update_wallet(&self, wallet: Wallet) -> Result<(), Error>;

    /// Fetches a ledger transaction by ID.
    async fn transaction(&self, id: &str) -> Result<WalletTransaction, Error>;

    /// Fetches the wallet's ledger history, oldest first.
    async fn transactions(&self, wallet_id: &str) -> Result<Vec<WalletTransaction>, Error>;

    /// Finds the transaction previously recorded under an idempotency key,
    /// if any.
    async fn find_by_idempotency_key(
        &self,
        wallet_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<WalletTransaction>, Error>;

    /// Fetches the credit rows a debit at `now` may consume (completed,
    /// unexpired, with credits remaining), ordered by
    /// `(priority, expiry date with nulls last, created at)`.
    async fn eligible_credits(
        &self,
        wallet_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<WalletTransaction>, Error>;

    /// Fetches the credit rows whose expiry has passed but which still have
    /// credits remaining.
    async fn expired_credits(
        &self,
        wallet_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<WalletTransaction>, Error>;

    /// Applies one ledger transaction atomically: appends the transaction
    /// row, applies the credit-row decrements, and replaces the wallet row.
    ///
    /// Implementations must hold an exclusive lock on the wallet row for
    /// the duration, so that concurrent debits on one wallet serialize, and
    /// must enforce uniqueness of `(wallet, idempotency key)`, failing with
    /// `already_exists` on a duplicate.
    async fn apply_wallet_write(&self, write: WalletWrite) -> Result<(), Error>;
}

/// The row set of one wallet ledger transaction.
#[derive(Debug, Clone)]
pub struct WalletWrite {
    /// The wallet row with updated balances.
    pub wallet: Wallet,
    /// The transaction row to append.
    pub transaction: WalletTransaction,
    /// `(transaction id, new credits_available)` decrements for the credit
    /// rows a debit consumed.
    pub credit_updates: Vec<(String, Decimal)>,
}
