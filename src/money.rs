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

use codes_iso_4217::CurrencyCode;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The number of decimal places amounts in `currency` are rounded to.
///
/// ISO 4217 minor units for the currencies that deviate from the usual two;
/// everything else rounds to cents.
pub fn currency_precision(currency: &CurrencyCode) -> u32 {
    use CurrencyCode::*;
    match currency {
        // Zero-decimal currencies.
        BIF | CLP | DJF | GNF | JPY | KMF | KRW | PYG | RWF | UGX | VND | VUV | XAF | XOF
        | XPF => 0,
        // Three-decimal currencies.
        BHD | IQD | JOD | KWD | LYD | OMR | TND => 3,
        _ => 2,
    }
}

/// Rounds `amount` to the precision of `currency`.
///
/// This is the single terminal rounding step of the money path: all
/// intermediate arithmetic stays at full precision, and rounding is
/// half-away-from-zero, applied exactly once per emitted amount.
pub fn round_to_currency(amount: Decimal, currency: &CurrencyCode) -> Decimal {
    amount.round_dp_with_strategy(
        currency_precision(currency),
        RoundingStrategy::MidpointAwayFromZero,
    )
}

/// An exact monetary amount in a single currency.
///
/// The amount is an arbitrary-precision decimal; no binary floating point
/// appears anywhere on the money path. Whether the amount has been rounded
/// to currency precision is up to the code that produced it; calculators
/// round once, at the end.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Money {
    /// The amount, serialized as a decimal string with full precision.
    pub amount: Decimal,
    /// The ISO 4217 currency the amount is denominated in.
    pub currency: CurrencyCode,
}

impl Money {
    /// Creates a new amount.
    pub fn new(amount: Decimal, currency: CurrencyCode) -> Money {
        Money { amount, currency }
    }

    /// Creates a zero amount.
    pub fn zero(currency: CurrencyCode) -> Money {
        Money {
            amount: Decimal::ZERO,
            currency,
        }
    }

    /// Returns this amount rounded to the currency's precision,
    /// half-away-from-zero.
    pub fn rounded(&self) -> Money {
        Money {
            amount: round_to_currency(self.amount, &self.currency),
            currency: self.currency.clone(),
        }
    }

    /// Adds two amounts of the same currency.
    ///
    /// Mixing currencies is a `validation` error: the core never performs FX
    /// conversion.
    pub fn checked_add(&self, other: &Money) -> Result<Money, Error> {
        if self.currency != other.currency {
            return Err(Error::validation(format!(
                "cannot add {} to {}",
                other.currency, self.currency
            )));
        }
        Ok(Money {
            amount: self.amount + other.amount,
            currency: self.currency.clone(),
        })
    }

    /// Whether the amount is negative.
    pub fn is_negative(&self) -> bool {
        self.amount < Decimal::ZERO
    }

    /// Whether the amount is exactly zero.
    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn precision_per_currency() {
        assert_eq!(currency_precision(&CurrencyCode::USD), 2);
        assert_eq!(currency_precision(&CurrencyCode::JPY), 0);
        assert_eq!(currency_precision(&CurrencyCode::KWD), 3);
    }

    #[test]
    fn rounding_is_half_away_from_zero() {
        assert_eq!(
            round_to_currency(dec!(1.005), &CurrencyCode::USD),
            dec!(1.01)
        );
        assert_eq!(
            round_to_currency(dec!(-1.005), &CurrencyCode::USD),
            dec!(-1.01)
        );
        assert_eq!(round_to_currency(dec!(1.004), &CurrencyCode::USD), dec!(1.00));
        assert_eq!(round_to_currency(dec!(0.5), &CurrencyCode::JPY), dec!(1));
    }

    #[test]
    fn addition_requires_matching_currency() {
        let usd = Money::new(dec!(1), CurrencyCode::USD);
        let eur = Money::new(dec!(1), CurrencyCode::EUR);
        assert_eq!(
            usd.checked_add(&usd).unwrap().amount,
            dec!(2),
        );
        assert_eq!(usd.checked_add(&eur).unwrap_err().code(), "validation");
    }
}
