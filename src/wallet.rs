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

//! The credit wallet ledger.
//!
//! A wallet holds prepaid credit units; its currency balance is always
//! `credit_balance × conversion_rate`. Credits arrive as append-only ledger
//! rows carrying a remaining `credits_available`; debits consume those rows
//! in `(priority, expiry date, age)` order, FIFO with a priority override.
//!
//! Every credit and debit carries an idempotency key. Replaying an
//! operation with a key the wallet has already seen returns the recorded
//! transaction without touching any state, so callers recover from
//! ambiguous failures by replaying with the same key; the ledger never
//! retries internally.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codes_iso_4217::CurrencyCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_enum_str::{Deserialize_enum_str, Serialize_enum_str};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Error;
use crate::money::Money;
use crate::store::{WalletStore, WalletWrite};
use crate::util::{check_cancelled, new_id, require_nonempty, Clock};

/// A customer's credit wallet.
///
/// At most one non-closed wallet exists per
/// `(customer, currency, wallet type)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Wallet {
    /// The unique identifier for the wallet.
    pub id: String,
    /// The customer the wallet belongs to.
    pub customer_id: String,
    /// The currency the wallet settles in.
    pub currency: CurrencyCode,
    /// The kind of wallet.
    pub wallet_type: WalletType,
    /// The status of the wallet.
    pub status: WalletStatus,
    /// The balance in currency units: `credit_balance × conversion_rate`.
    pub balance: Decimal,
    /// The balance in credit units: the sum of `credits_available` across
    /// the wallet's credit rows.
    pub credit_balance: Decimal,
    /// Currency units per credit unit.
    pub conversion_rate: Decimal,
    /// Automatic top-up configuration, if enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_topup: Option<AutoTopupConfig>,
    /// The time at which the wallet was created.
    pub created_at: DateTime<Utc>,
}

/// The kind of a wallet.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize_enum_str, Serialize_enum_str)]
#[serde(rename_all = "snake_case")]
pub enum WalletType {
    /// Credits the customer paid for.
    PrePaid,
    /// Credits granted by promotions; typically expiring.
    Promotional,
    /// An unknown wallet type.
    #[serde(other)]
    Other(String),
}

/// The status of a wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletStatus {
    /// The wallet accepts credits and debits.
    Active,
    /// The wallet is temporarily blocked.
    Frozen,
    /// The wallet is permanently closed. Terminal.
    Closed,
}

/// Automatic top-up configuration.
///
/// The ledger only reports when a top-up is needed (see
/// [`WalletLedger::needed_topup`]); issuing the purchase is the caller's
/// workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct AutoTopupConfig {
    /// Top up when the credit balance reaches this many credit units.
    pub threshold: Decimal,
    /// The credit units to purchase.
    pub amount: Decimal,
}

/// A ledger row.
///
/// Rows are append-only. Credit rows track their remaining
/// `credits_available`, which debits decrement; debit rows record the
/// consumed total.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct WalletTransaction {
    /// The unique identifier for the transaction.
    pub id: String,
    /// The wallet the transaction belongs to.
    pub wallet_id: String,
    /// Whether the transaction added or consumed credits.
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    /// The credit units moved.
    pub credit_amount: Decimal,
    /// The currency units moved: `credit_amount × conversion_rate` at the
    /// time of the transaction.
    pub amount: Decimal,
    /// What the transaction settles, when anything.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<TransactionReference>,
    /// Why the transaction happened.
    pub reason: TransactionReason,
    /// The status of the transaction.
    pub status: TransactionStatus,
    /// When the credits expire, for credit rows that do.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<DateTime<Utc>>,
    /// The credit units this row can still supply. Zero for debit rows.
    pub credits_available: Decimal,
    /// The wallet's credit balance before this transaction.
    pub credit_balance_before: Decimal,
    /// The wallet's credit balance after this transaction.
    pub credit_balance_after: Decimal,
    /// Consumption priority: lower values are consumed first, before expiry
    /// and age are considered.
    pub priority: i32,
    /// The caller-supplied idempotency key, unique per wallet.
    pub idempotency_key: String,
    /// The time at which the transaction was recorded.
    pub created_at: DateTime<Utc>,
}

/// Whether a transaction added or consumed credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Credits were added.
    Credit,
    /// Credits were consumed.
    Debit,
}

/// The status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// The transaction is committed to the ledger.
    Completed,
    /// The transaction failed and has no balance effect.
    Failed,
}

/// Why a transaction happened.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize_enum_str, Serialize_enum_str)]
#[serde(rename_all = "snake_case")]
pub enum TransactionReason {
    /// Credits the customer purchased.
    PurchasedCredit,
    /// Credits granted for free.
    FreeCredit,
    /// Credits consumed to settle an invoice.
    InvoicePayment,
    /// Credits removed because they expired.
    CreditExpired,
    /// Credits removed when the wallet was closed.
    WalletTermination,
    /// Another reason.
    #[serde(other)]
    Other(String),
}

/// What a transaction settles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TransactionReference {
    /// The kind of referenced entity.
    pub kind: ReferenceKind,
    /// The identifier of the referenced entity.
    pub id: String,
}

/// The kind of entity a transaction references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    /// An invoice.
    Invoice,
    /// A payment.
    Payment,
    /// An identifier in an external system.
    External,
}

/// The parameters of [`WalletLedger::create_wallet`].
#[derive(Debug, Clone)]
pub struct CreateWalletRequest {
    /// The customer the wallet belongs to.
    pub customer_id: String,
    /// The currency the wallet settles in.
    pub currency: CurrencyCode,
    /// The kind of wallet.
    pub wallet_type: WalletType,
    /// Currency units per credit unit. Must be positive.
    pub conversion_rate: Decimal,
    /// Automatic top-up configuration, if enabled.
    pub auto_topup: Option<AutoTopupConfig>,
}

/// The parameters of [`WalletLedger::credit`].
#[derive(Debug, Clone)]
pub struct CreditRequest {
    /// The wallet to credit.
    pub wallet_id: String,
    /// The credit units to add. Must be positive.
    pub credits: Decimal,
    /// Why the credits are granted.
    pub reason: TransactionReason,
    /// What the grant references, when anything.
    pub reference: Option<TransactionReference>,
    /// When the credits expire, if they do.
    pub expiry_date: Option<DateTime<Utc>>,
    /// Consumption priority: lower is consumed first.
    pub priority: i32,
    /// The idempotency key; unique per wallet.
    pub idempotency_key: String,
}

/// The parameters of [`WalletLedger::debit`].
#[derive(Debug, Clone)]
pub struct DebitRequest {
    /// The wallet to debit.
    pub wallet_id: String,
    /// The credit units to consume. Must be positive.
    pub credits: Decimal,
    /// Why the credits are consumed.
    pub reason: TransactionReason,
    /// What the debit settles, when anything.
    pub reference: Option<TransactionReference>,
    /// The idempotency key; unique per wallet.
    pub idempotency_key: String,
}

/// A summary of the outstanding invoices the wallet's real-time balance
/// nets out.
///
/// The wallet deliberately does not depend on the invoice service; the
/// caller passes this capability instead.
#[async_trait]
pub trait InvoiceSummarySource: Send + Sync {
    /// The total unpaid amount across the customer's finalized invoices in
    /// the given currency.
    async fn unpaid_amount(
        &self,
        customer_id: &str,
        currency: &CurrencyCode,
    ) -> Result<Decimal, Error>;
}

/// A projection of usage accrued in the current period but not yet
/// invoiced.
///
/// [`BillingEngine`] implements this by running invoice preparation in
/// preview mode over each of the customer's active same-currency
/// subscriptions.
///
/// [`BillingEngine`]: crate::BillingEngine
#[async_trait]
pub trait UsagePreviewSource: Send + Sync {
    /// The total uninvoiced current-period usage amount for the customer in
    /// the given currency.
    async fn uninvoiced_amount(
        &self,
        customer_id: &str,
        currency: &CurrencyCode,
    ) -> Result<Decimal, Error>;
}

/// The wallet ledger.
///
/// The ledger is designed to be wrapped in an [`Arc`] and used from
/// multiple threads simultaneously; concurrent operations on one wallet
/// serialize in the store.
pub struct WalletLedger {
    store: Arc<dyn WalletStore>,
    clock: Arc<dyn Clock>,
}

impl WalletLedger {
    /// Creates a ledger over the given store and clock.
    pub fn new(store: Arc<dyn WalletStore>, clock: Arc<dyn Clock>) -> WalletLedger {
        WalletLedger { store, clock }
    }

    /// Creates a wallet.
    ///
    /// Fails with `already_exists` when the customer already has a
    /// non-closed wallet of the same currency and type.
    pub async fn create_wallet(&self, request: CreateWalletRequest) -> Result<Wallet, Error> {
        require_nonempty(&request.customer_id, "customer id")?;
        if request.conversion_rate <= Decimal::ZERO {
            return Err(Error::validation("conversion rate must be positive"));
        }
        let wallet = Wallet {
            id: new_id("wallet"),
            customer_id: request.customer_id,
            currency: request.currency,
            wallet_type: request.wallet_type,
            status: WalletStatus::Active,
            balance: Decimal::ZERO,
            credit_balance: Decimal::ZERO,
            conversion_rate: request.conversion_rate,
            auto_topup: request.auto_topup,
            created_at: self.clock.now(),
        };
        self.store.insert_wallet(wallet.clone()).await?;
        Ok(wallet)
    }

    /// Returns the wallet's stored balances.
    pub async fn get_balance(&self, wallet_id: &str) -> Result<Wallet, Error> {
        self.store.wallet(wallet_id).await
    }

    /// The real-time balance: the stored balance net of unpaid invoices and
    /// uninvoiced current-period usage.
    ///
    /// Computed on read, never cached.
    pub async fn realtime_balance(
        &self,
        wallet_id: &str,
        invoices: &dyn InvoiceSummarySource,
        usage: &dyn UsagePreviewSource,
        token: &CancellationToken,
    ) -> Result<Money, Error> {
        let wallet = self.store.wallet(wallet_id).await?;
        check_cancelled(token)?;
        let unpaid = invoices
            .unpaid_amount(&wallet.customer_id, &wallet.currency)
            .await?;
        check_cancelled(token)?;
        let pending = usage
            .uninvoiced_amount(&wallet.customer_id, &wallet.currency)
            .await?;
        Ok(Money::new(
            wallet.balance - unpaid - pending,
            wallet.currency,
        ))
    }

    /// Adds credits to a wallet.
    ///
    /// Idempotent per `(wallet, idempotency key)`: a replay returns the
    /// recorded transaction without mutating state.
    pub async fn credit(
        &self,
        request: CreditRequest,
        token: &CancellationToken,
    ) -> Result<WalletTransaction, Error> {
        require_nonempty(&request.idempotency_key, "idempotency key")?;
        if request.credits <= Decimal::ZERO {
            return Err(Error::validation("credit amount must be positive"));
        }
        if let Some(recorded) = self
            .store
            .find_by_idempotency_key(&request.wallet_id, &request.idempotency_key)
            .await?
        {
            return Ok(recorded);
        }
        check_cancelled(token)?;

        let mut wallet = self.store.wallet(&request.wallet_id).await?;
        require_operable(&wallet, "credit")?;
        check_cancelled(token)?;

        let before = wallet.credit_balance;
        wallet.credit_balance += request.credits;
        wallet.balance = wallet.credit_balance * wallet.conversion_rate;
        let transaction = WalletTransaction {
            id: new_id("txn"),
            wallet_id: wallet.id.clone(),
            transaction_type: TransactionType::Credit,
            credit_amount: request.credits,
            amount: request.credits * wallet.conversion_rate,
            reference: request.reference,
            reason: request.reason,
            status: TransactionStatus::Completed,
            expiry_date: request.expiry_date,
            credits_available: request.credits,
            credit_balance_before: before,
            credit_balance_after: wallet.credit_balance,
            priority: request.priority,
            idempotency_key: request.idempotency_key.clone(),
            created_at: self.clock.now(),
        };

        self.commit(
            WalletWrite {
                wallet,
                transaction,
                credit_updates: Vec::new(),
            },
            &request.wallet_id,
            &request.idempotency_key,
        )
        .await
    }

    /// Adds purchased credits to a wallet.
    pub async fn top_up(
        &self,
        wallet_id: &str,
        credits: Decimal,
        idempotency_key: &str,
        token: &CancellationToken,
    ) -> Result<WalletTransaction, Error> {
        self.credit(
            CreditRequest {
                wallet_id: wallet_id.into(),
                credits,
                reason: TransactionReason::PurchasedCredit,
                reference: None,
                expiry_date: None,
                priority: 0,
                idempotency_key: idempotency_key.into(),
            },
            token,
        )
        .await
    }

    /// Consumes credits from a wallet.
    ///
    /// Eligible credit rows (completed, unexpired, with credits remaining)
    /// are consumed in `(priority, expiry date, age)` order, partially
    /// draining the final row when needed. Fails with `insufficient_balance`
    /// when the eligible total is short.
    ///
    /// Idempotent per `(wallet, idempotency key)`.
    pub async fn debit(
        &self,
        request: DebitRequest,
        token: &CancellationToken,
    ) -> Result<WalletTransaction, Error> {
        require_nonempty(&request.idempotency_key, "idempotency key")?;
        if request.credits <= Decimal::ZERO {
            return Err(Error::validation("debit amount must be positive"));
        }
        if let Some(recorded) = self
            .store
            .find_by_idempotency_key(&request.wallet_id, &request.idempotency_key)
            .await?
        {
            return Ok(recorded);
        }
        check_cancelled(token)?;

        let wallet = self.store.wallet(&request.wallet_id).await?;
        require_operable(&wallet, "debit")?;
        check_cancelled(token)?;

        let now = self.clock.now();
        let eligible = self.store.eligible_credits(&request.wallet_id, now).await?;
        self.consume(wallet, eligible, request, now).await
    }

    /// Expires the remaining balance of one credit transaction, issuing a
    /// synthetic debit with reason `credit_expired`.
    ///
    /// Fails with `invalid_operation` when the transaction is not a credit,
    /// has nothing left to expire, or has not reached its expiry date.
    pub async fn expire_credits(&self, transaction_id: &str) -> Result<WalletTransaction, Error> {
        let credit = self.store.transaction(transaction_id).await?;
        if credit.transaction_type != TransactionType::Credit {
            return Err(Error::invalid_operation(format!(
                "transaction {transaction_id} is not a credit"
            )));
        }
        if credit.credits_available <= Decimal::ZERO {
            return Err(Error::invalid_operation(format!(
                "credit {transaction_id} has no remaining balance"
            )));
        }
        let now = self.clock.now();
        match credit.expiry_date {
            Some(expiry) if expiry <= now => {}
            _ => {
                return Err(Error::invalid_operation(format!(
                    "credit {transaction_id} has not expired"
                )))
            }
        }

        let mut wallet = self.store.wallet(&credit.wallet_id).await?;
        let before = wallet.credit_balance;
        wallet.credit_balance -= credit.credits_available;
        wallet.balance = wallet.credit_balance * wallet.conversion_rate;
        let idempotency_key = format!("credit_expired:{transaction_id}");
        let transaction = WalletTransaction {
            id: new_id("txn"),
            wallet_id: wallet.id.clone(),
            transaction_type: TransactionType::Debit,
            credit_amount: credit.credits_available,
            amount: credit.credits_available * wallet.conversion_rate,
            reference: None,
            reason: TransactionReason::CreditExpired,
            status: TransactionStatus::Completed,
            expiry_date: None,
            credits_available: Decimal::ZERO,
            credit_balance_before: before,
            credit_balance_after: wallet.credit_balance,
            priority: 0,
            idempotency_key: idempotency_key.clone(),
            created_at: now,
        };
        debug!(
            transaction_id,
            credits = %credit.credits_available,
            "expiring credits"
        );

        let wallet_id = wallet.id.clone();
        self.commit(
            WalletWrite {
                wallet,
                transaction,
                credit_updates: vec![(credit.id.clone(), Decimal::ZERO)],
            },
            &wallet_id,
            &idempotency_key,
        )
        .await
    }

    /// Expires every overdue credit row in the wallet. Returns the debits
    /// issued.
    pub async fn sweep_expired(&self, wallet_id: &str) -> Result<Vec<WalletTransaction>, Error> {
        let now = self.clock.now();
        let overdue = self.store.expired_credits(wallet_id, now).await?;
        let mut debits = Vec::with_capacity(overdue.len());
        for credit in overdue {
            debits.push(self.expire_credits(&credit.id).await?);
        }
        Ok(debits)
    }

    /// Closes a wallet, debiting any remaining credits with reason
    /// `wallet_termination`.
    pub async fn terminate(
        &self,
        wallet_id: &str,
        token: &CancellationToken,
    ) -> Result<Wallet, Error> {
        let wallet = self.store.wallet(wallet_id).await?;
        if wallet.status == WalletStatus::Closed {
            return Err(Error::invalid_operation(format!(
                "wallet {wallet_id} is already closed"
            )));
        }
        self.sweep_expired(wallet_id).await?;
        check_cancelled(token)?;

        let wallet = self.store.wallet(wallet_id).await?;
        if wallet.credit_balance > Decimal::ZERO {
            self.debit(
                DebitRequest {
                    wallet_id: wallet_id.into(),
                    credits: wallet.credit_balance,
                    reason: TransactionReason::WalletTermination,
                    reference: None,
                    idempotency_key: format!("wallet_termination:{wallet_id}"),
                },
                token,
            )
            .await?;
        }

        let mut wallet = self.store.wallet(wallet_id).await?;
        wallet.status = WalletStatus::Closed;
        self.store.update_wallet(wallet.clone()).await?;
        Ok(wallet)
    }

    /// The credits to purchase when the wallet's auto top-up threshold has
    /// been reached, if it has.
    pub fn needed_topup(&self, wallet: &Wallet) -> Option<Decimal> {
        let config = wallet.auto_topup.as_ref()?;
        if wallet.status == WalletStatus::Active && wallet.credit_balance <= config.threshold {
            Some(config.amount)
        } else {
            None
        }
    }

    async fn consume(
        &self,
        mut wallet: Wallet,
        eligible: Vec<WalletTransaction>,
        request: DebitRequest,
        now: DateTime<Utc>,
    ) -> Result<WalletTransaction, Error> {
        let available: Decimal = eligible.iter().map(|c| c.credits_available).sum();
        if available < request.credits {
            return Err(Error::InsufficientBalance {
                requested: request.credits,
                available,
            });
        }

        let mut credit_updates = Vec::new();
        let mut remaining = request.credits;
        for credit in &eligible {
            if remaining <= Decimal::ZERO {
                break;
            }
            let consumed = remaining.min(credit.credits_available);
            credit_updates.push((credit.id.clone(), credit.credits_available - consumed));
            remaining -= consumed;
        }
        debug!(
            wallet_id = %wallet.id,
            credits = %request.credits,
            rows = credit_updates.len(),
            "consuming credits"
        );

        let before = wallet.credit_balance;
        wallet.credit_balance -= request.credits;
        wallet.balance = wallet.credit_balance * wallet.conversion_rate;
        let transaction = WalletTransaction {
            id: new_id("txn"),
            wallet_id: wallet.id.clone(),
            transaction_type: TransactionType::Debit,
            credit_amount: request.credits,
            amount: request.credits * wallet.conversion_rate,
            reference: request.reference,
            reason: request.reason,
            status: TransactionStatus::Completed,
            expiry_date: None,
            credits_available: Decimal::ZERO,
            credit_balance_before: before,
            credit_balance_after: wallet.credit_balance,
            priority: 0,
            idempotency_key: request.idempotency_key.clone(),
            created_at: now,
        };

        self.commit(
            WalletWrite {
                wallet,
                transaction,
                credit_updates,
            },
            &request.wallet_id,
            &request.idempotency_key,
        )
        .await
    }

    /// Applies a ledger write, resolving an idempotency-key race by
    /// returning the transaction the concurrent writer recorded.
    async fn commit(
        &self,
        write: WalletWrite,
        wallet_id: &str,
        idempotency_key: &str,
    ) -> Result<WalletTransaction, Error> {
        let transaction = write.transaction.clone();
        match self.store.apply_wallet_write(write).await {
            Ok(()) => Ok(transaction),
            Err(Error::AlreadyExists { .. }) => self
                .store
                .find_by_idempotency_key(wallet_id, idempotency_key)
                .await?
                .ok_or_else(|| {
                    Error::internal(format!(
                        "idempotency key {idempotency_key} conflicted but no transaction recorded"
                    ))
                }),
            Err(e) => Err(e),
        }
    }
}

fn require_operable(wallet: &Wallet, operation: &str) -> Result<(), Error> {
    match wallet.status {
        WalletStatus::Active => Ok(()),
        status => Err(Error::invalid_operation(format!(
            "cannot {operation} {status:?} wallet {}",
            wallet.id
        ))),
    }
}
