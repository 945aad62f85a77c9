//! Pricing models for driver tickets

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use core_kernel::Money;

use crate::error::InvoicingError;

/// How an assignment's price is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommodityKind {
    /// Price per billable hour
    ByHour,
    /// Price per ton hauled
    ByTon,
    /// Price per load delivered
    ByLoad,
}

impl CommodityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommodityKind::ByHour => "BY_HOUR",
            CommodityKind::ByTon => "BY_TON",
            CommodityKind::ByLoad => "BY_LOAD",
        }
    }
}

impl fmt::Display for CommodityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommodityKind {
    type Err = InvoicingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BY_HOUR" => Ok(CommodityKind::ByHour),
            "BY_TON" => Ok(CommodityKind::ByTon),
            "BY_LOAD" => Ok(CommodityKind::ByLoad),
            other => Err(InvoicingError::UnknownCommodityKind(other.to_string())),
        }
    }
}

/// Hauled quantities recorded on an assignment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quantities {
    pub tons: Decimal,
    pub load: Decimal,
}

impl Quantities {
    pub fn new(tons: Decimal, load: Decimal) -> Self {
        Self { tons, load }
    }
}

/// Computes a ticket amount from its pricing model
///
/// The result is rounded to the currency's minor unit so that owner and job
/// totals summed from tickets are exact.
pub fn calculate_amount(
    price: Money,
    kind: CommodityKind,
    quantities: Quantities,
    hours: Decimal,
) -> Money {
    let factor = match kind {
        CommodityKind::ByHour => hours,
        CommodityKind::ByTon => quantities.tons,
        CommodityKind::ByLoad => quantities.load,
    };
    price.multiply(factor).round_to_currency()
}
