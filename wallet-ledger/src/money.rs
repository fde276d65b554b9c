//! Fixed-precision monetary value
//!
//! Amounts are always non-negative and normalized to two fractional digits
//! using round-half-up. Operations return new values.

use crate::{Error, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of fractional digits kept by [`Money`]
pub const SCALE: u32 = 2;

/// Non-negative amount with two fractional digits
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Money(Decimal);

impl Money {
    /// Create from a decimal, rounding half-up to two digits
    pub fn new(amount: Decimal) -> Result<Self> {
        let normalized = normalize(amount);
        if normalized.is_zero() {
            return Ok(Self::zero());
        }
        if normalized.is_sign_negative() {
            return Err(Error::InvalidAmount(format!(
                "amount cannot be negative: {}",
                amount
            )));
        }
        Ok(Self(normalized))
    }

    /// Create from minor units (cents)
    pub fn from_minor(cents: u64) -> Self {
        let mut amount = Decimal::from(cents);
        // 2 <= 28, rescale cannot fail
        let _ = amount.set_scale(SCALE);
        Self(normalize(amount))
    }

    /// Zero amount
    pub fn zero() -> Self {
        Self(normalize(Decimal::ZERO))
    }

    /// Underlying decimal value
    pub fn amount(&self) -> Decimal {
        self.0
    }

    /// True for 0.00
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// True for anything above 0.00
    pub fn is_positive(&self) -> bool {
        !self.0.is_zero()
    }

    /// Sum of two amounts
    pub fn checked_add(self, other: Money) -> Result<Money> {
        self.0
            .checked_add(other.0)
            .map(|sum| Self(normalize(sum)))
            .ok_or_else(|| Error::InvalidAmount(format!("overflow adding {} to {}", other, self)))
    }

    /// Difference of two amounts; fails if the result would be negative
    pub fn checked_sub(self, other: Money) -> Result<Money> {
        if other > self {
            return Err(Error::InvalidAmount(format!(
                "subtracting {} from {} would be negative",
                other, self
            )));
        }
        Ok(Self(normalize(self.0 - other.0)))
    }
}

fn normalize(amount: Decimal) -> Decimal {
    let mut rounded = amount.round_dp_with_strategy(SCALE, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(SCALE);
    rounded
}

impl Default for Money {
    fn default() -> Self {
        Self::zero()
    }
}

impl TryFrom<Decimal> for Money {
    type Error = Error;

    fn try_from(amount: Decimal) -> Result<Self> {
        Money::new(amount)
    }
}

impl From<Money> for Decimal {
    fn from(money: Money) -> Self {
        money.0
    }
}

impl FromStr for Money {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let amount = Decimal::from_str(s.trim())
            .map_err(|e| Error::InvalidAmount(format!("'{}' is not a decimal: {}", s, e)))?;
        Money::new(amount)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
