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
use codes_iso_4217::CurrencyCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::calendar::Period;
use crate::error::Error;
use crate::money::round_to_currency;

/// An invoice.
///
/// Created as a draft, then finalized, then paid or voided. Line items are
/// immutable once the invoice is finalized, and `amount_due` is always the
/// sum of line amounts rounded to currency precision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Invoice {
    /// The unique identifier for the invoice.
    pub id: String,
    /// The subscription the invoice bills, when it bills one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    /// The customer the invoice bills.
    pub customer_id: String,
    /// The currency the invoice is denominated in.
    pub currency: CurrencyCode,
    /// The window the invoice was generated for. Individual line items may
    /// cover different service periods.
    pub period: Period,
    /// The lifecycle status of the invoice.
    pub status: InvoiceStatus,
    /// The payment status of the invoice.
    pub payment_status: PaymentStatus,
    /// The total owed: the sum of line amounts, rounded to currency
    /// precision.
    pub amount_due: Decimal,
    /// The amount paid so far.
    pub amount_paid: Decimal,
    /// The invoice's line items.
    pub line_items: Vec<InvoiceLineItem>,
    /// The time at which the invoice was created.
    pub created_at: DateTime<Utc>,
}

/// The lifecycle status of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    /// Prepared but not yet issued.
    Draft,
    /// Issued; line items are immutable.
    Finalized,
    /// Cancelled; the invoice no longer counts toward any balance or
    /// de-duplication check.
    Void,
}

/// The payment status of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Payment has not completed.
    Pending,
    /// The invoice is fully paid.
    Succeeded,
    /// Payment collection failed.
    Failed,
}

/// A line item on an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct InvoiceLineItem {
    /// The unique identifier for the line item.
    pub id: String,
    /// The invoice the line item belongs to.
    pub invoice_id: String,
    /// The price that produced the charge, when one did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_id: Option<String>,
    /// The subscription line item that produced the charge, when one did.
    ///
    /// De-duplication keys on this together with the service period: at most
    /// one non-void invoice line may exist per
    /// `(subscription_line_item_id, service_period)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_line_item_id: Option<String>,
    /// The name shown on the invoice.
    pub display_name: String,
    /// The charged amount, rounded to currency precision.
    pub amount: Decimal,
    /// The billed quantity. For bucketed usage this is the sum of bucket
    /// quantities, while the amount is the sum of per-bucket amounts.
    pub quantity: Decimal,
    /// The service period the charge covers.
    pub period: Period,
}

impl Invoice {
    /// Creates an empty draft invoice for the given window.
    pub fn draft(
        id: String,
        subscription_id: Option<String>,
        customer_id: String,
        currency: CurrencyCode,
        period: Period,
        created_at: DateTime<Utc>,
    ) -> Invoice {
        Invoice {
            id,
            subscription_id,
            customer_id,
            currency,
            period,
            status: InvoiceStatus::Draft,
            payment_status: PaymentStatus::Pending,
            amount_due: Decimal::ZERO,
            amount_paid: Decimal::ZERO,
            line_items: Vec::new(),
            created_at,
        }
    }

    /// Appends a line item, keeping `amount_due` equal to the rounded sum of
    /// line amounts.
    pub fn push_line(&mut self, line: InvoiceLineItem) {
        self.line_items.push(line);
        let total: Decimal = self.line_items.iter().map(|l| l.amount).sum();
        self.amount_due = round_to_currency(total, &self.currency);
    }

    /// The amount still owed.
    pub fn amount_remaining(&self) -> Decimal {
        self.amount_due - self.amount_paid
    }

    /// Whether the invoice still counts toward a customer's outstanding
    /// balance.
    pub fn is_outstanding(&self) -> bool {
        self.status == InvoiceStatus::Finalized && self.amount_remaining() > Decimal::ZERO
    }

    /// Finalizes a draft invoice.
    pub fn finalize(&mut self) -> Result<(), Error> {
        match self.status {
            InvoiceStatus::Draft => {
                self.status = InvoiceStatus::Finalized;
                Ok(())
            }
            status => Err(Error::invalid_operation(format!(
                "cannot finalize {status:?} invoice {}",
                self.id
            ))),
        }
    }

    /// Voids an invoice, removing it from balances and de-duplication.
    pub fn void(&mut self) -> Result<(), Error> {
        match self.status {
            InvoiceStatus::Draft | InvoiceStatus::Finalized => {
                self.status = InvoiceStatus::Void;
                Ok(())
            }
            InvoiceStatus::Void => Err(Error::invalid_operation(format!(
                "invoice {} is already void",
                self.id
            ))),
        }
    }

    /// Records a payment against a finalized invoice.
    ///
    /// `amount_paid + amount_remaining = amount_due` holds before and after;
    /// the payment status flips to `succeeded` when the invoice is fully
    /// paid.
    pub fn record_payment(&mut self, amount: Decimal) -> Result<(), Error> {
        if self.status != InvoiceStatus::Finalized {
            return Err(Error::invalid_operation(format!(
                "cannot pay {:?} invoice {}",
                self.status, self.id
            )));
        }
        if amount <= Decimal::ZERO {
            return Err(Error::validation("payment amount must be positive"));
        }
        if amount > self.amount_remaining() {
            return Err(Error::validation(format!(
                "payment of {amount} exceeds remaining balance {}",
                self.amount_remaining()
            )));
        }
        self.amount_paid += amount;
        if self.amount_remaining().is_zero() {
            self.payment_status = PaymentStatus::Succeeded;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use super::*;

    fn invoice() -> Invoice {
        let period = Period::new(
            Utc.with_ymd_and_hms(2023, 4, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let mut invoice = Invoice::draft(
            "inv_1".into(),
            Some("sub_1".into()),
            "cus_1".into(),
            CurrencyCode::USD,
            period,
            Utc::now(),
        );
        invoice.push_line(InvoiceLineItem {
            id: "line_1".into(),
            invoice_id: "inv_1".into(),
            price_id: Some("price_1".into()),
            subscription_line_item_id: Some("sli_1".into()),
            display_name: "API calls".into(),
            amount: dec!(10.00),
            quantity: dec!(500),
            period,
        });
        invoice
    }

    #[test]
    fn amount_due_tracks_line_items() {
        let mut invoice = invoice();
        assert_eq!(invoice.amount_due, dec!(10.00));
        invoice.push_line(InvoiceLineItem {
            id: "line_2".into(),
            invoice_id: "inv_1".into(),
            price_id: None,
            subscription_line_item_id: None,
            display_name: "Support".into(),
            amount: dec!(5.005),
            quantity: dec!(1),
            period: invoice.period,
        });
        // The rounded sum, not the sum of rounded parts.
        assert_eq!(invoice.amount_due, dec!(15.01));
    }

    #[test]
    fn payments_preserve_the_balance_identity() {
        let mut invoice = invoice();
        invoice.finalize().unwrap();
        invoice.record_payment(dec!(4)).unwrap();
        assert_eq!(invoice.amount_paid + invoice.amount_remaining(), invoice.amount_due);
        assert_eq!(invoice.payment_status, PaymentStatus::Pending);
        invoice.record_payment(dec!(6)).unwrap();
        assert_eq!(invoice.payment_status, PaymentStatus::Succeeded);
        assert!(!invoice.is_outstanding());
        assert_eq!(
            invoice.record_payment(dec!(1)).unwrap_err().code(),
            "validation"
        );
    }

    #[test]
    fn lifecycle_transitions_are_checked() {
        let mut invoice = invoice();
        assert_eq!(invoice.record_payment(dec!(1)).unwrap_err().code(), "invalid_operation");
        invoice.finalize().unwrap();
        assert_eq!(invoice.finalize().unwrap_err().code(), "invalid_operation");
        invoice.void().unwrap();
        assert_eq!(invoice.void().unwrap_err().code(), "invalid_operation");
    }
}
