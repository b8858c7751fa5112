//! Fee calculation utilities
//!
//! Rates are decimal fractions: `0.03` = 3%. The schedule itself is external
//! configuration; this module only holds the arithmetic and the lookup.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::money::{Money, MoneyError};
use crate::settlement::types::PaymentMethodClass;

/// Result of a fee calculation. `fee + net == gross` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeBreakdown {
    pub fee: Money,
    pub net: Money,
}

/// Calculate fee and net amount from a gross amount and rate.
///
/// `fee = round_half_up(gross * rate)`, `net = gross - fee`.
///
/// # Example
/// ```
/// use rust_decimal::Decimal;
/// use settlement_saga::fee::calculate_fee;
/// use settlement_saga::money::Money;
/// // 30000 * 3% = 900
/// let split = calculate_fee(Money::new(30_000), Decimal::new(3, 2)).unwrap();
/// assert_eq!(split.fee, Money::new(900));
/// assert_eq!(split.net, Money::new(29_100));
/// ```
pub fn calculate_fee(gross: Money, rate: Decimal) -> Result<FeeBreakdown, MoneyError> {
    if gross.is_negative() {
        return Err(MoneyError::InvalidAmount);
    }
    let raw = gross
        .to_decimal()
        .checked_mul(rate)
        .ok_or(MoneyError::Overflow)?;
    let fee = Money::from_decimal_half_up(raw)?;
    let net = gross.checked_sub(fee)?;
    Ok(FeeBreakdown { fee, net })
}

/// Fee rate per payment-method class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub wallet_only: Decimal,
    pub card_only: Decimal,
    pub wallet_and_card: Decimal,
}

impl FeeSchedule {
    #[inline]
    pub fn rate_for(&self, class: PaymentMethodClass) -> Decimal {
        match class {
            PaymentMethodClass::WalletOnly => self.wallet_only,
            PaymentMethodClass::CardOnly => self.card_only,
            PaymentMethodClass::WalletAndCard => self.wallet_and_card,
        }
    }

    /// Every rate must lie in `[0, 1)`; a rate of 1 or more would leave
    /// nothing (or less than nothing) to credit.
    pub fn validate(&self) -> Result<(), String> {
        for class in PaymentMethodClass::ALL {
            let rate = self.rate_for(class);
            if rate.is_sign_negative() || rate >= Decimal::ONE {
                return Err(format!("fee rate for {} out of range: {}", class, rate));
            }
        }
        Ok(())
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            wallet_only: Decimal::new(1, 2),
            card_only: Decimal::new(3, 2),
            wallet_and_card: Decimal::new(2, 2),
        }
    }
}
