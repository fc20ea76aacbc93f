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

//! Wallet ledger tests: FIFO-with-priority consumption, idempotency,
//! credit expiry, balance conservation, and the real-time balance.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use codes_iso_4217::CurrencyCode;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use test_log::test;
use tokio_util::sync::CancellationToken;

use metered_billing::{
    BillingEngine, BillingModel, BillingPeriod, BillingStore, Clock, CreateWalletRequest,
    CreditRequest, DebitRequest, Error, FilterGroup, FilteredUsage, Invoice, InvoiceCadence,
    InvoiceLineItem, MemoryStore, Period, Price, PriceKind, ProrationBehavior, Subscription,
    SubscriptionLineItem, SubscriptionStatus, TierMode, TransactionReason, TransactionType,
    UsagePreviewSource, UsageQuantity, UsageQuery, UsageSource, WalletLedger, WalletStatus,
    WalletStore, WalletType,
};

fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

/// A clock the tests can move.
struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    fn at(instant: DateTime<Utc>) -> Arc<ManualClock> {
        Arc::new(ManualClock(Mutex::new(instant)))
    }

    fn set(&self, instant: DateTime<Utc>) {
        *self.0.lock().unwrap() = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

fn nonce() -> u32 {
    rand::thread_rng().gen()
}

async fn ledger_with_wallet() -> (Arc<MemoryStore>, Arc<ManualClock>, WalletLedger, String) {
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::at(utc(2024, 1, 1));
    let ledger = WalletLedger::new(
        Arc::clone(&store) as Arc<dyn WalletStore>,
        Arc::clone(&clock) as Arc<dyn Clock>,
    );
    let wallet = ledger
        .create_wallet(CreateWalletRequest {
            customer_id: "cus_1".into(),
            currency: CurrencyCode::USD,
            wallet_type: WalletType::PrePaid,
            conversion_rate: Decimal::ONE,
            auto_topup: None,
        })
        .await
        .unwrap();
    (store, clock, ledger, wallet.id)
}

async fn credit(
    ledger: &WalletLedger,
    wallet_id: &str,
    credits: Decimal,
    priority: i32,
    expiry: Option<DateTime<Utc>>,
) -> metered_billing::WalletTransaction {
    ledger
        .credit(
            CreditRequest {
                wallet_id: wallet_id.into(),
                credits,
                reason: TransactionReason::FreeCredit,
                reference: None,
                expiry_date: expiry,
                priority,
                idempotency_key: format!("credit-{}", nonce()),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap()
}

/// Conservation: the wallet's credit balance equals the credits still
/// available across its credit rows.
async fn assert_conserved(store: &MemoryStore, wallet_id: &str) {
    let wallet = WalletStore::wallet(store, wallet_id).await.unwrap();
    let available: Decimal = store
        .transactions(wallet_id)
        .await
        .unwrap()
        .iter()
        .filter(|t| t.transaction_type == TransactionType::Credit)
        .map(|t| t.credits_available)
        .sum();
    assert_eq!(wallet.credit_balance, available);
    assert_eq!(wallet.balance, wallet.credit_balance * wallet.conversion_rate);
}

#[test(tokio::test)]
async fn debits_consume_credits_fifo_with_priority() {
    // C1 = $30 (priority 1, expires Feb 1), C2 = $50 (priority 0, expires
    // Mar 1), C3 = $40 (priority 1, expires Feb 15). A $60 debit consumes
    // C2 fully, then $10 from C1.
    let (store, _clock, ledger, wallet_id) = ledger_with_wallet().await;
    let c1 = credit(&ledger, &wallet_id, dec!(30), 1, Some(utc(2024, 2, 1))).await;
    let c2 = credit(&ledger, &wallet_id, dec!(50), 0, Some(utc(2024, 3, 1))).await;
    let c3 = credit(&ledger, &wallet_id, dec!(40), 1, Some(utc(2024, 2, 15))).await;

    let debit = ledger
        .debit(
            DebitRequest {
                wallet_id: wallet_id.clone(),
                credits: dec!(60),
                reason: TransactionReason::InvoicePayment,
                reference: None,
                idempotency_key: "debit-1".into(),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(debit.credit_amount, dec!(60));
    assert_eq!(debit.credit_balance_before, dec!(120));
    assert_eq!(debit.credit_balance_after, dec!(60));

    let store_ref: &MemoryStore = &store;
    assert_eq!(
        WalletStore::transaction(store_ref, &c2.id)
            .await
            .unwrap()
            .credits_available,
        Decimal::ZERO
    );
    assert_eq!(
        WalletStore::transaction(store_ref, &c1.id)
            .await
            .unwrap()
            .credits_available,
        dec!(20)
    );
    assert_eq!(
        WalletStore::transaction(store_ref, &c3.id)
            .await
            .unwrap()
            .credits_available,
        dec!(40)
    );
    assert_conserved(&store, &wallet_id).await;
}

#[test(tokio::test)]
async fn replayed_operations_do_not_mutate_state() {
    let (store, _clock, ledger, wallet_id) = ledger_with_wallet().await;
    credit(&ledger, &wallet_id, dec!(100), 0, None).await;

    let request = DebitRequest {
        wallet_id: wallet_id.clone(),
        credits: dec!(40),
        reason: TransactionReason::InvoicePayment,
        reference: None,
        idempotency_key: "debit-once".into(),
    };
    let token = CancellationToken::new();
    let first = ledger.debit(request.clone(), &token).await.unwrap();
    let replay = ledger.debit(request, &token).await.unwrap();
    assert_eq!(first.id, replay.id);

    let wallet = WalletStore::wallet(&*store, &wallet_id).await.unwrap();
    assert_eq!(wallet.credit_balance, dec!(60));
    let debits = store
        .transactions(&wallet_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.transaction_type == TransactionType::Debit)
        .count();
    assert_eq!(debits, 1);
    assert_conserved(&store, &wallet_id).await;
}

#[test(tokio::test)]
async fn overdrafts_fail_with_insufficient_balance() {
    let (store, _clock, ledger, wallet_id) = ledger_with_wallet().await;
    credit(&ledger, &wallet_id, dec!(25), 0, None).await;

    let err = ledger
        .debit(
            DebitRequest {
                wallet_id: wallet_id.clone(),
                credits: dec!(30),
                reason: TransactionReason::InvoicePayment,
                reference: None,
                idempotency_key: "debit-overdraft".into(),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "insufficient_balance");
    match err {
        Error::InsufficientBalance { requested, available } => {
            assert_eq!(requested, dec!(30));
            assert_eq!(available, dec!(25));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let wallet = WalletStore::wallet(&*store, &wallet_id).await.unwrap();
    assert_eq!(wallet.credit_balance, dec!(25));
    assert_conserved(&store, &wallet_id).await;
}

#[test(tokio::test)]
async fn expired_credits_are_not_eligible_and_can_be_swept() {
    let (store, clock, ledger, wallet_id) = ledger_with_wallet().await;
    let expiring = credit(&ledger, &wallet_id, dec!(30), 0, Some(utc(2024, 2, 1))).await;
    credit(&ledger, &wallet_id, dec!(50), 0, None).await;

    // Before expiry the credit cannot be expired.
    let err = ledger.expire_credits(&expiring.id).await.unwrap_err();
    assert_eq!(err.code(), "invalid_operation");

    clock.set(utc(2024, 2, 2));

    // An expired credit no longer serves debits.
    let err = ledger
        .debit(
            DebitRequest {
                wallet_id: wallet_id.clone(),
                credits: dec!(60),
                reason: TransactionReason::InvoicePayment,
                reference: None,
                idempotency_key: "debit-after-expiry".into(),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "insufficient_balance");

    // The sweeper issues a synthetic debit for the remainder.
    let debits = ledger.sweep_expired(&wallet_id).await.unwrap();
    assert_eq!(debits.len(), 1);
    assert_eq!(debits[0].reason, TransactionReason::CreditExpired);
    assert_eq!(debits[0].credit_amount, dec!(30));

    let wallet = WalletStore::wallet(&*store, &wallet_id).await.unwrap();
    assert_eq!(wallet.credit_balance, dec!(50));
    assert_conserved(&store, &wallet_id).await;

    // Sweeping again finds nothing; expiring a debit is illegal.
    assert!(ledger.sweep_expired(&wallet_id).await.unwrap().is_empty());
    let err = ledger.expire_credits(&debits[0].id).await.unwrap_err();
    assert_eq!(err.code(), "invalid_operation");
}

#[test(tokio::test)]
async fn one_wallet_per_customer_currency_and_type() {
    let (_store, _clock, ledger, _wallet_id) = ledger_with_wallet().await;
    let err = ledger
        .create_wallet(CreateWalletRequest {
            customer_id: "cus_1".into(),
            currency: CurrencyCode::USD,
            wallet_type: WalletType::PrePaid,
            conversion_rate: Decimal::ONE,
            auto_topup: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "already_exists");

    // A different type is a different wallet.
    ledger
        .create_wallet(CreateWalletRequest {
            customer_id: "cus_1".into(),
            currency: CurrencyCode::USD,
            wallet_type: WalletType::Promotional,
            conversion_rate: Decimal::ONE,
            auto_topup: None,
        })
        .await
        .unwrap();
}

#[test(tokio::test)]
async fn termination_drains_and_closes_the_wallet() {
    let (store, _clock, ledger, wallet_id) = ledger_with_wallet().await;
    ledger
        .top_up(&wallet_id, dec!(75), "topup-1", &CancellationToken::new())
        .await
        .unwrap();

    let wallet = ledger
        .terminate(&wallet_id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(wallet.status, WalletStatus::Closed);
    assert_eq!(wallet.credit_balance, Decimal::ZERO);

    let termination = store
        .transactions(&wallet_id)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.reason == TransactionReason::WalletTermination)
        .unwrap();
    assert_eq!(termination.credit_amount, dec!(75));
    assert_conserved(&store, &wallet_id).await;

    // Closed wallets accept no further operations.
    let err = ledger
        .terminate(&wallet_id, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_operation");
    let err = ledger
        .top_up(&wallet_id, dec!(1), "topup-2", &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_operation");
}

#[test(tokio::test)]
async fn cancelled_tokens_abort_wallet_operations() {
    let (_store, _clock, ledger, wallet_id) = ledger_with_wallet().await;
    let token = CancellationToken::new();
    token.cancel();
    let err = ledger
        .top_up(&wallet_id, dec!(10), "topup-cancelled", &token)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "cancelled");
}

/// A usage source returning a fixed quantity for every query.
struct ConstantUsage(Decimal);

#[async_trait]
impl UsageSource for ConstantUsage {
    async fn get_usage(&self, _query: &UsageQuery) -> Result<UsageQuantity, Error> {
        Ok(UsageQuantity::scalar(self.0))
    }

    async fn get_usage_with_filters(
        &self,
        _query: &UsageQuery,
        groups: &[FilterGroup],
    ) -> Result<Vec<FilteredUsage>, Error> {
        Ok(groups
            .iter()
            .map(|g| FilteredUsage {
                price_id: g.price_id.clone(),
                quantity: UsageQuantity::scalar(self.0),
            })
            .collect())
    }
}

#[test(tokio::test)]
async fn realtime_balance_nets_invoices_and_pending_usage() {
    let (store, _clock, ledger, wallet_id) = ledger_with_wallet().await;
    ledger
        .top_up(&wallet_id, dec!(50), "topup-1", &CancellationToken::new())
        .await
        .unwrap();

    // A finalized, unpaid invoice for $5.
    let period = Period::new(utc(2023, 3, 1), utc(2023, 4, 1)).unwrap();
    let mut invoice = Invoice::draft(
        "inv_prior".into(),
        Some("sub_1".into()),
        "cus_1".into(),
        CurrencyCode::USD,
        period,
        utc(2023, 4, 1),
    );
    invoice.push_line(InvoiceLineItem {
        id: "li_prior".into(),
        invoice_id: "inv_prior".into(),
        price_id: None,
        subscription_line_item_id: None,
        display_name: "March support".into(),
        amount: dec!(5.00),
        quantity: Decimal::ONE,
        period,
    });
    invoice.finalize().unwrap();
    store.insert_draft_invoice(invoice).await.unwrap();

    // An active subscription with a usage line item that has accrued $10
    // of uninvoiced usage this period (1000 calls at $0.01).
    store
        .insert_subscription(Subscription {
            id: "sub_1".into(),
            customer_id: "cus_1".into(),
            plan_id: None,
            currency: CurrencyCode::USD,
            billing_period: BillingPeriod::Monthly,
            billing_period_count: 1,
            billing_anchor: 1,
            current_period_start: utc(2023, 4, 1),
            current_period_end: utc(2023, 5, 1),
            start_date: utc(2023, 1, 1),
            status: SubscriptionStatus::Active,
            proration_behavior: ProrationBehavior::None,
            customer_timezone: Tz::UTC,
        })
        .await;
    store
        .insert_meter(metered_billing::Meter {
            id: "meter_calls".into(),
            event_name: "api_call".into(),
            aggregation: metered_billing::Aggregation {
                kind: metered_billing::AggregationKind::Count,
                field: None,
                bucket_size: None,
            },
            filters: Default::default(),
            reset_usage: metered_billing::ResetUsage::BillingPeriod,
        })
        .await;
    store
        .insert_price(Price {
            id: "price_calls".into(),
            meter_id: Some("meter_calls".into()),
            kind: PriceKind::Usage,
            billing_model: BillingModel::FlatFee,
            tier_mode: TierMode::Slab,
            billing_period: BillingPeriod::Monthly,
            billing_period_count: 1,
            invoice_cadence: InvoiceCadence::Arrear,
            amount: dec!(0.01),
            tiers: vec![],
            transform: None,
            filters: Default::default(),
            currency: CurrencyCode::USD,
        })
        .await;
    store
        .insert_line_item(SubscriptionLineItem {
            id: "sli_calls".into(),
            subscription_id: "sub_1".into(),
            price_id: "price_calls".into(),
            price_kind: PriceKind::Usage,
            meter_id: Some("meter_calls".into()),
            quantity: Decimal::ONE,
            display_name: "API calls".into(),
            billing_period: BillingPeriod::Monthly,
            billing_period_count: 1,
            invoice_cadence: InvoiceCadence::Arrear,
            start_date: utc(2023, 1, 1),
            end_date: None,
        })
        .await;

    let engine = BillingEngine::new(
        Arc::clone(&store) as Arc<dyn metered_billing::BillingStore>,
        Arc::new(ConstantUsage(dec!(1000))),
    );

    // $50 balance − $5 unpaid − $10 pending usage = $35.
    let balance = ledger
        .realtime_balance(
            &wallet_id,
            &*store,
            &engine,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(balance.amount, dec!(35.00));

    // The preview that computed the pending usage wrote nothing.
    assert_eq!(store.invoices().await.len(), 1);
}

#[test(tokio::test)]
async fn uninvoiced_usage_excludes_already_billed_periods() {
    // Once the current period's usage is billed by a finalized invoice, it
    // no longer reduces the real-time balance.
    let (store, _clock, ledger, wallet_id) = ledger_with_wallet().await;
    ledger
        .top_up(&wallet_id, dec!(50), "topup-1", &CancellationToken::new())
        .await
        .unwrap();

    store
        .insert_subscription(Subscription {
            id: "sub_1".into(),
            customer_id: "cus_1".into(),
            plan_id: None,
            currency: CurrencyCode::USD,
            billing_period: BillingPeriod::Monthly,
            billing_period_count: 1,
            billing_anchor: 1,
            current_period_start: utc(2023, 4, 1),
            current_period_end: utc(2023, 5, 1),
            start_date: utc(2023, 1, 1),
            status: SubscriptionStatus::Active,
            proration_behavior: ProrationBehavior::None,
            customer_timezone: Tz::UTC,
        })
        .await;
    store
        .insert_meter(metered_billing::Meter {
            id: "meter_calls".into(),
            event_name: "api_call".into(),
            aggregation: metered_billing::Aggregation {
                kind: metered_billing::AggregationKind::Count,
                field: None,
                bucket_size: None,
            },
            filters: Default::default(),
            reset_usage: metered_billing::ResetUsage::BillingPeriod,
        })
        .await;
    store
        .insert_price(Price {
            id: "price_calls".into(),
            meter_id: Some("meter_calls".into()),
            kind: PriceKind::Usage,
            billing_model: BillingModel::FlatFee,
            tier_mode: TierMode::Slab,
            billing_period: BillingPeriod::Monthly,
            billing_period_count: 1,
            invoice_cadence: InvoiceCadence::Arrear,
            amount: dec!(0.01),
            tiers: vec![],
            transform: None,
            filters: Default::default(),
            currency: CurrencyCode::USD,
        })
        .await;
    store
        .insert_line_item(SubscriptionLineItem {
            id: "sli_calls".into(),
            subscription_id: "sub_1".into(),
            price_id: "price_calls".into(),
            price_kind: PriceKind::Usage,
            meter_id: Some("meter_calls".into()),
            quantity: Decimal::ONE,
            display_name: "API calls".into(),
            billing_period: BillingPeriod::Monthly,
            billing_period_count: 1,
            invoice_cadence: InvoiceCadence::Arrear,
            start_date: utc(2023, 1, 1),
            end_date: None,
        })
        .await;

    let engine = BillingEngine::new(
        Arc::clone(&store) as Arc<dyn metered_billing::BillingStore>,
        Arc::new(ConstantUsage(dec!(1000))),
    );

    let pending = engine.uninvoiced_amount("cus_1", &CurrencyCode::USD).await.unwrap();
    assert_eq!(pending, dec!(10.00));

    // Bill the period; the usage is no longer pending but the invoice is
    // now outstanding, so the real-time balance is unchanged overall.
    let subscription = metered_billing::BillingStore::subscription(&*store, "sub_1")
        .await
        .unwrap();
    let invoice = engine
        .prepare_invoice_request(
            &subscription,
            subscription.current_period().unwrap(),
            metered_billing::ReferencePoint::PeriodEnd,
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let mut finalized = store.invoice(&invoice.id).await.unwrap();
    finalized.finalize().unwrap();
    store.update_invoice(finalized).await.unwrap();

    let pending = engine.uninvoiced_amount("cus_1", &CurrencyCode::USD).await.unwrap();
    assert_eq!(pending, Decimal::ZERO);

    let balance = ledger
        .realtime_balance(&wallet_id, &*store, &engine, &CancellationToken::new())
        .await
        .unwrap();
    // $50 − $10 unpaid invoice − $0 pending.
    assert_eq!(balance.amount, dec!(40.00));
}
