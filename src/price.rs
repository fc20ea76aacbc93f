use std::collections::BTreeMap;

use codes_iso_4217::CurrencyCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::calendar::BillingPeriod;
use crate::error::Error;
use crate::money::{round_to_currency, Money};
use crate::usage::UsageQuantity;
use crate::util::require_nonempty;

/// A price attached to a subscription line item.
///
/// Immutable reference data: a price is evaluated, never mutated. The
/// price's own billing period may differ from its subscription's; a
/// quarterly price on a monthly subscription bills only when one of its own
/// period boundaries falls inside an invoice window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Price {
    /// The unique identifier for the price.
    pub id: String,
    /// The meter the price rates. `None` for fixed prices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_id: Option<String>,
    /// Whether the price charges a fixed quantity or metered usage.
    #[serde(rename = "type")]
    pub kind: PriceKind,
    /// How a quantity maps to an amount.
    pub billing_model: BillingModel,
    /// How tiers apportion quantity, for tiered prices.
    #[serde(default)]
    pub tier_mode: TierMode,
    /// The cadence at which this price is invoiced.
    pub billing_period: BillingPeriod,
    /// The number of billing periods per invoice (e.g. every 3 months).
    pub billing_period_count: u32,
    /// Whether the price bills at the start or end of its service period.
    pub invoice_cadence: InvoiceCadence,
    /// The unit amount (flat fee) or per-package amount (package pricing).
    /// Unused for tiered prices.
    pub amount: Decimal,
    /// The tiers of a tiered price, ordered by `up_to` ascending with the
    /// final tier unbounded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tiers: Vec<PriceTier>,
    /// The quantity transform of a package price.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
    /// Event-property filters restricting which of the meter's events this
    /// price sees. Lets several prices share one meter, told apart by
    /// properties; more constrained filter sets win ties.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, Vec<String>>,
    /// The currency amounts are denominated in.
    pub currency: CurrencyCode,
}

/// Whether a price charges a fixed quantity or metered usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceKind {
    /// A fixed charge with a quantity carried on the line item.
    Fixed,
    /// A usage charge rated from aggregated events.
    Usage,
}

/// How a quantity maps to an amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingModel {
    /// `amount × quantity`.
    FlatFee,
    /// Quantity divided into packages, each costing `amount`.
    Package,
    /// Quantity priced through [`PriceTier`]s.
    Tiered,
}

/// How tiers apportion quantity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TierMode {
    /// Graduated: each unit is priced by the tier it falls into.
    #[default]
    Slab,
    /// All units are priced by the single tier containing the total.
    Volume,
}

/// Whether a charge is billed at the start or the end of its service period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceCadence {
    /// Billed at the start of the service period, covering the upcoming
    /// period.
    Advance,
    /// Billed at the end of the service period, covering the elapsed period.
    Arrear,
}

/// One tier of a tiered price.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct PriceTier {
    /// The exclusive upper bound of the tier. `None` means unbounded and is
    /// only legal on the final tier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub up_to: Option<Decimal>,
    /// The cost per unit allocated to this tier.
    pub unit_amount: Decimal,
    /// A cost added once when any units fall in this tier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flat_amount: Option<Decimal>,
}

/// The quantity transform of a package price.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Transform {
    /// The package size. Must be positive.
    pub divide_by: Decimal,
    /// How a partial package rounds.
    pub round: TransformRound,
}

/// The rounding direction of a package transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformRound {
    /// A partial package is charged as a whole package.
    Up,
    /// A partial package is free.
    Down,
}

impl Price {
    /// Validates the price definition.
    pub fn validate(&self) -> Result<(), Error> {
        require_nonempty(&self.id, "price id")?;
        if self.billing_period_count == 0 {
            return Err(Error::validation("billing period count must be positive"));
        }
        if self.amount < Decimal::ZERO {
            return Err(Error::validation("price amount must not be negative"));
        }
        match self.billing_model {
            BillingModel::FlatFee => Ok(()),
            BillingModel::Package => {
                let transform = self.transform.as_ref().ok_or_else(|| {
                    Error::validation("package pricing requires a transform")
                })?;
                if transform.divide_by <= Decimal::ZERO {
                    return Err(Error::validation("transform divide_by must be positive"));
                }
                Ok(())
            }
            BillingModel::Tiered => self.validate_tiers(),
        }
    }

    fn validate_tiers(&self) -> Result<(), Error> {
        if self.tiers.is_empty() {
            return Err(Error::validation("tiered pricing requires at least one tier"));
        }
        let mut prev: Option<Decimal> = None;
        for (i, tier) in self.tiers.iter().enumerate() {
            if tier.unit_amount < Decimal::ZERO
                || tier.flat_amount.map_or(false, |f| f < Decimal::ZERO)
            {
                return Err(Error::validation("tier amounts must not be negative"));
            }
            match tier.up_to {
                None => {
                    if i + 1 != self.tiers.len() {
                        return Err(Error::validation(
                            "only the final tier may be unbounded",
                        ));
                    }
                }
                Some(up_to) => {
                    if prev.map_or(up_to <= Decimal::ZERO, |p| up_to <= p) {
                        return Err(Error::validation(
                            "tiers must be sorted by up_to, strictly ascending",
                        ));
                    }
                    prev = Some(up_to);
                }
            }
        }
        Ok(())
    }

    /// Rates a quantity, returning the unrounded amount in currency units.
    ///
    /// Rounding to currency precision happens once, at the final step of the
    /// charge that consumes this rate; see [`Price::amount_for`].
    pub fn rate(&self, quantity: Decimal) -> Result<Decimal, Error> {
        self.validate()?;
        if quantity < Decimal::ZERO {
            return Err(Error::validation("quantity must not be negative"));
        }
        match self.billing_model {
            BillingModel::FlatFee => Ok(quantity * self.amount),
            BillingModel::Package => {
                let transform = self
                    .transform
                    .as_ref()
                    .expect("validate checked the transform");
                let packages = match transform.round {
                    TransformRound::Up => (quantity / transform.divide_by).ceil(),
                    TransformRound::Down => (quantity / transform.divide_by).floor(),
                };
                Ok(packages * self.amount)
            }
            BillingModel::Tiered => match self.tier_mode {
                TierMode::Slab => Ok(self.rate_slab(quantity)),
                TierMode::Volume => Ok(self.rate_volume(quantity)),
            },
        }
    }

    /// Graduated tiers: walk the tiers, allocating units to each in order.
    /// A tier's flat amount is added once when any units land in it.
    fn rate_slab(&self, quantity: Decimal) -> Decimal {
        let mut total = Decimal::ZERO;
        let mut remaining = quantity;
        let mut prev_up_to = Decimal::ZERO;
        for tier in &self.tiers {
            if remaining <= Decimal::ZERO {
                break;
            }
            let width = tier.up_to.map(|up_to| up_to - prev_up_to);
            let units = match width {
                Some(width) => remaining.min(width),
                None => remaining,
            };
            if units > Decimal::ZERO {
                total += units * tier.unit_amount;
                total += tier.flat_amount.unwrap_or(Decimal::ZERO);
            }
            remaining -= units;
            if let Some(up_to) = tier.up_to {
                prev_up_to = up_to;
            }
        }
        total
    }

    /// Volume tiers: all units are priced by the first tier whose `up_to`
    /// exceeds the quantity, or the final tier.
    fn rate_volume(&self, quantity: Decimal) -> Decimal {
        let tier = self
            .tiers
            .iter()
            .find(|t| t.up_to.map_or(true, |up_to| up_to > quantity))
            .or_else(|| self.tiers.last())
            .expect("validate checked tiers are nonempty");
        quantity * tier.unit_amount + tier.flat_amount.unwrap_or(Decimal::ZERO)
    }

    /// Rates aggregated usage.
    ///
    /// Bucketed aggregations are rated per bucket and the bucket amounts
    /// summed. For package and tiered models this is not the same as rating
    /// the summed quantity, and the per-bucket form is the billable one.
    pub fn rate_usage(&self, usage: &UsageQuantity) -> Result<Decimal, Error> {
        match usage {
            UsageQuantity::Scalar { quantity } => self.rate(*quantity),
            UsageQuantity::Bucketed { per_bucket } => {
                let mut total = Decimal::ZERO;
                for bucket in per_bucket {
                    total += self.rate(bucket.quantity)?;
                }
                Ok(total)
            }
        }
    }

    /// Rates aggregated usage and rounds to currency precision.
    pub fn amount_for(&self, usage: &UsageQuantity) -> Result<Money, Error> {
        let amount = self.rate_usage(usage)?;
        Ok(Money::new(
            round_to_currency(amount, &self.currency),
            self.currency.clone(),
        ))
    }
}
