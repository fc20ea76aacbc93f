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

//! An in-memory store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codes_iso_4217::CurrencyCode;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::calendar::Period;
use crate::entitlement::Entitlement;
use crate::error::Error;
use crate::invoice::{Invoice, InvoiceLineItem, InvoiceStatus};
use crate::meter::Meter;
use crate::price::Price;
use crate::store::{BillingStore, WalletStore, WalletWrite};
use crate::subscription::{Subscription, SubscriptionLineItem, SubscriptionStatus};
use crate::wallet::{
    InvoiceSummarySource, TransactionStatus, TransactionType, Wallet, WalletStatus,
    WalletTransaction, WalletType,
};

#[derive(Default)]
struct Inner {
    subscriptions: HashMap<String, Subscription>,
    line_items: HashMap<String, Vec<SubscriptionLineItem>>,
    prices: HashMap<String, Price>,
    meters: HashMap<String, Meter>,
    entitlements: Vec<Entitlement>,
    invoices: HashMap<String, Invoice>,
    wallets: HashMap<String, Wallet>,
    transactions: HashMap<String, WalletTransaction>,
}

/// An in-memory implementation of [`BillingStore`] and [`WalletStore`].
///
/// Backs the test suite and embedders that keep billing state elsewhere.
/// Every operation serializes on one mutex, which also provides the
/// wallet-write atomicity the [`WalletStore`] contract requires.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Inserts or replaces a subscription.
    pub async fn insert_subscription(&self, subscription: Subscription) {
        let mut inner = self.inner.lock().await;
        inner
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    /// Inserts a subscription line item.
    pub async fn insert_line_item(&self, line_item: SubscriptionLineItem) {
        let mut inner = self.inner.lock().await;
        inner
            .line_items
            .entry(line_item.subscription_id.clone())
            .or_default()
            .push(line_item);
    }

    /// Inserts or replaces a price.
    pub async fn insert_price(&self, price: Price) {
        let mut inner = self.inner.lock().await;
        inner.prices.insert(price.id.clone(), price);
    }

    /// Inserts or replaces a meter.
    pub async fn insert_meter(&self, meter: Meter) {
        let mut inner = self.inner.lock().await;
        inner.meters.insert(meter.id.clone(), meter);
    }

    /// Inserts an entitlement.
    pub async fn insert_entitlement(&self, entitlement: Entitlement) {
        let mut inner = self.inner.lock().await;
        inner.entitlements.push(entitlement);
    }

    /// Fetches an invoice by ID.
    pub async fn invoice(&self, id: &str) -> Result<Invoice, Error> {
        let inner = self.inner.lock().await;
        inner
            .invoices
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("invoice", id))
    }

    /// Replaces an invoice, e.g. after finalizing or voiding it.
    pub async fn update_invoice(&self, invoice: Invoice) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if !inner.invoices.contains_key(&invoice.id) {
            return Err(Error::not_found("invoice", &invoice.id));
        }
        inner.invoices.insert(invoice.id.clone(), invoice);
        Ok(())
    }

    /// Lists every stored invoice.
    pub async fn invoices(&self) -> Vec<Invoice> {
        let inner = self.inner.lock().await;
        let mut invoices: Vec<_> = inner.invoices.values().cloned().collect();
        invoices.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        invoices
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn subscription(&self, id: &str) -> Result<Subscription, Error> {
        let inner = self.inner.lock().await;
        inner
            .subscriptions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("subscription", id))
    }

    async fn line_items(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<SubscriptionLineItem>, Error> {
        let inner = self.inner.lock().await;
        Ok(inner
            .line_items
            .get(subscription_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn price(&self, id: &str) -> Result<Price, Error> {
        let inner = self.inner.lock().await;
        inner
            .prices
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("price", id))
    }

    async fn meter(&self, id: &str) -> Result<Meter, Error> {
        let inner = self.inner.lock().await;
        inner
            .meters
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("meter", id))
    }

    async fn entitlement(
        &self,
        plan_id: &str,
        meter_id: &str,
    ) -> Result<Option<Entitlement>, Error> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entitlements
            .iter()
            .find(|e| e.plan_id == plan_id && e.meter_id == meter_id)
            .cloned())
    }

    async fn existing_invoice_lines(
        &self,
        subscription_line_item_id: &str,
        service_period: &Period,
    ) -> Result<Vec<InvoiceLineItem>, Error> {
        let inner = self.inner.lock().await;
        Ok(inner
            .invoices
            .values()
            .filter(|invoice| invoice.status != InvoiceStatus::Void)
            .flat_map(|invoice| &invoice.line_items)
            .filter(|line| {
                line.subscription_line_item_id.as_deref() == Some(subscription_line_item_id)
                    && line.period == *service_period
            })
            .cloned()
            .collect())
    }

    async fn insert_draft_invoice(&self, invoice: Invoice) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        for line in &invoice.line_items {
            let Some(sli) = &line.subscription_line_item_id else {
                continue;
            };
            let duplicate = inner
                .invoices
                .values()
                .filter(|existing| existing.status != InvoiceStatus::Void)
                .flat_map(|existing| &existing.line_items)
                .any(|existing| {
                    existing.subscription_line_item_id.as_deref() == Some(sli.as_str())
                        && existing.period == line.period
                });
            if duplicate {
                return Err(Error::already_exists(
                    "invoice line",
                    format!("line item {sli} over {}", line.period),
                ));
            }
        }
        inner.invoices.insert(invoice.id.clone(), invoice);
        Ok(())
    }

    async fn active_subscriptions(
        &self,
        customer_id: &str,
        currency: &CurrencyCode,
    ) -> Result<Vec<Subscription>, Error> {
        let inner = self.inner.lock().await;
        let mut subscriptions: Vec<_> = inner
            .subscriptions
            .values()
            .filter(|s| {
                s.customer_id == customer_id
                    && s.currency == *currency
                    && s.status == SubscriptionStatus::Active
            })
            .cloned()
            .collect();
        subscriptions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(subscriptions)
    }
}

#[async_trait]
impl WalletStore for MemoryStore {
    async fn wallet(&self, id: &str) -> Result<Wallet, Error> {
        let inner = self.inner.lock().await;
        inner
            .wallets
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("wallet", id))
    }

    async fn find_wallet(
        &self,
        customer_id: &str,
        currency: &CurrencyCode,
        wallet_type: &WalletType,
    ) -> Result<Option<Wallet>, Error> {
        let inner = self.inner.lock().await;
        Ok(inner
            .wallets
            .values()
            .find(|w| {
                w.customer_id == customer_id
                    && w.currency == *currency
                    && w.wallet_type == *wallet_type
                    && w.status != WalletStatus::Closed
            })
            .cloned())
    }

    async fn insert_wallet(&self, wallet: Wallet) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        let duplicate = inner.wallets.values().any(|w| {
            w.customer_id == wallet.customer_id
                && w.currency == wallet.currency
                && w.wallet_type == wallet.wallet_type
                && w.status != WalletStatus::Closed
        });
        if duplicate {
            return Err(Error::already_exists(
                "wallet",
                format!(
                    "customer {} already has a {} {:?} wallet",
                    wallet.customer_id, wallet.currency, wallet.wallet_type
                ),
            ));
        }
        inner.wallets.insert(wallet.id.clone(), wallet);
        Ok(())
    }

    async fn update_wallet(&self, wallet: Wallet) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if !inner.wallets.contains_key(&wallet.id) {
            return Err(Error::not_found("wallet", &wallet.id));
        }
        inner.wallets.insert(wallet.id.clone(), wallet);
        Ok(())
    }

    async fn transaction(&self, id: &str) -> Result<WalletTransaction, Error> {
        let inner = self.inner.lock().await;
        inner
            .transactions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("wallet transaction", id))
    }

    async fn transactions(&self, wallet_id: &str) -> Result<Vec<WalletTransaction>, Error> {
        let inner = self.inner.lock().await;
        let mut transactions: Vec<_> = inner
            .transactions
            .values()
            .filter(|t| t.wallet_id == wallet_id)
            .cloned()
            .collect();
        transactions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(transactions)
    }

    async fn find_by_idempotency_key(
        &self,
        wallet_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<WalletTransaction>, Error> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transactions
            .values()
            .find(|t| t.wallet_id == wallet_id && t.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn eligible_credits(
        &self,
        wallet_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<WalletTransaction>, Error> {
        let inner = self.inner.lock().await;
        let mut credits: Vec<_> = inner
            .transactions
            .values()
            .filter(|t| {
                t.wallet_id == wallet_id
                    && t.transaction_type == TransactionType::Credit
                    && t.status == TransactionStatus::Completed
                    && t.credits_available > Decimal::ZERO
                    && t.expiry_date.map_or(true, |expiry| expiry > now)
            })
            .cloned()
            .collect();
        credits.sort_by(|a, b| {
            (a.priority, a.expiry_date.is_none(), a.expiry_date, a.created_at)
                .cmp(&(b.priority, b.expiry_date.is_none(), b.expiry_date, b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(credits)
    }

    async fn expired_credits(
        &self,
        wallet_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<WalletTransaction>, Error> {
        let inner = self.inner.lock().await;
        let mut credits: Vec<_> = inner
            .transactions
            .values()
            .filter(|t| {
                t.wallet_id == wallet_id
                    && t.transaction_type == TransactionType::Credit
                    && t.status == TransactionStatus::Completed
                    && t.credits_available > Decimal::ZERO
                    && t.expiry_date.map_or(false, |expiry| expiry <= now)
            })
            .cloned()
            .collect();
        credits.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(credits)
    }

    async fn apply_wallet_write(&self, write: WalletWrite) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        let WalletWrite {
            wallet,
            transaction,
            credit_updates,
        } = write;
        if !inner.wallets.contains_key(&wallet.id) {
            return Err(Error::not_found("wallet", &wallet.id));
        }
        let duplicate = inner.transactions.values().any(|t| {
            t.wallet_id == transaction.wallet_id
                && t.idempotency_key == transaction.idempotency_key
        });
        if duplicate {
            return Err(Error::already_exists(
                "wallet transaction",
                format!("idempotency key {}", transaction.idempotency_key),
            ));
        }
        for (id, credits_available) in credit_updates {
            let credit = inner
                .transactions
                .get_mut(&id)
                .ok_or_else(|| Error::not_found("wallet transaction", &id))?;
            credit.credits_available = credits_available;
        }
        inner
            .transactions
            .insert(transaction.id.clone(), transaction);
        inner.wallets.insert(wallet.id.clone(), wallet);
        Ok(())
    }
}

#[async_trait]
impl InvoiceSummarySource for MemoryStore {
    async fn unpaid_amount(
        &self,
        customer_id: &str,
        currency: &CurrencyCode,
    ) -> Result<Decimal, Error> {
        let inner = self.inner.lock().await;
        Ok(inner
            .invoices
            .values()
            .filter(|i| {
                i.customer_id == customer_id && i.currency == *currency && i.is_outstanding()
            })
            .map(|i| i.amount_remaining())
            .sum())
    }
}
