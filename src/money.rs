//! Money Module
//!
//! All amounts in the saga are integer counts of minor currency units
//! (e.g. won, cents). There is exactly one currency per deployment.
//!
//! ## Internal Representation
//! - `Money` wraps an `i64`. It is signed on purpose: event payloads come from
//!   other services and a negative amount must be *recognised and rejected*,
//!   not silently fail to deserialize.
//! - Ledger invariants (`balance >= 0`, `grossAmount >= 0`) are enforced by
//!   the components that own them, not by this type.
//! - Conversions to and from `rust_decimal::Decimal` go through this module so
//!   rounding is never done ad hoc.

use std::fmt;
use std::ops::Deref;

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Money conversion errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Amount too large, would overflow")]
    Overflow,
}

/// Amount in minor currency units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    #[inline]
    pub const fn new(minor_units: i64) -> Self {
        Self(minor_units)
    }

    #[inline]
    pub fn minor_units(&self) -> i64 {
        self.0
    }

    #[inline]
    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, rhs: Money) -> Result<Money, MoneyError> {
        self.0.checked_add(rhs.0).map(Money).ok_or(MoneyError::Overflow)
    }

    pub fn checked_sub(self, rhs: Money) -> Result<Money, MoneyError> {
        self.0.checked_sub(rhs.0).map(Money).ok_or(MoneyError::Overflow)
    }

    /// Exact decimal view of this amount
    #[inline]
    pub fn to_decimal(self) -> Decimal {
        Decimal::from(self.0)
    }

    /// Round a decimal to whole minor units, half away from zero.
    ///
    /// For the non-negative values the saga produces this is "round half up".
    pub fn from_decimal_half_up(value: Decimal) -> Result<Money, MoneyError> {
        value
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .map(Money)
            .ok_or(MoneyError::Overflow)
    }
}

impl Deref for Money {
    type Target = i64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<i64> for Money {
    fn from(value: i64) -> Self {
        Money(value)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
