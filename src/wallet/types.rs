//! Wallet Ledger Types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::money::Money;

/// Balance-changing operation kind. (`type`, `reference_id`) is unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletTxType {
    Credit,
    Debit,
    Refund,
}

impl WalletTxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletTxType::Credit => "CREDIT",
            WalletTxType::Debit => "DEBIT",
            WalletTxType::Refund => "REFUND",
        }
    }

    /// Credits and refunds add, debits subtract
    #[inline]
    pub fn is_inflow(&self) -> bool {
        !matches!(self, WalletTxType::Debit)
    }
}

impl fmt::Display for WalletTxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WalletTxType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREDIT" => Ok(WalletTxType::Credit),
            "DEBIT" => Ok(WalletTxType::Debit),
            "REFUND" => Ok(WalletTxType::Refund),
            other => Err(format!("unknown wallet transaction type: {}", other)),
        }
    }
}

/// Account status codes: 1=ACTIVE, 2=FROZEN, 3=DISABLED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum AccountStatus {
    Active = 1,
    Frozen = 2,
    Disabled = 3,
}

impl AccountStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(AccountStatus::Active),
            2 => Some(AccountStatus::Frozen),
            3 => Some(AccountStatus::Disabled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletBalance {
    pub user_id: String,
    /// Never negative
    pub balance: Money,
    pub status: AccountStatus,
    pub updated_at: DateTime<Utc>,
}

impl WalletBalance {
    pub fn open(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            balance: Money::ZERO,
            status: AccountStatus::Active,
            updated_at: Utc::now(),
        }
    }
}

/// Append-only record of one applied balance mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletLedgerEntry {
    /// Settlement id or other external transaction id
    pub reference_id: String,
    pub transaction_type: WalletTxType,
    pub user_id: String,
    pub amount: Money,
    pub balance_before: Money,
    pub balance_after: Money,
    pub created_at: DateTime<Utc>,
}

/// A requested balance change
#[derive(Debug, Clone, PartialEq)]
pub struct WalletMutation {
    pub user_id: String,
    pub transaction_type: WalletTxType,
    pub reference_id: String,
    pub amount: Money,
}

impl WalletMutation {
    pub fn credit(user_id: impl Into<String>, reference_id: impl Into<String>, amount: Money) -> Self {
        Self {
            user_id: user_id.into(),
            transaction_type: WalletTxType::Credit,
            reference_id: reference_id.into(),
            amount,
        }
    }
}

/// Outcome of a successful `apply`
#[derive(Debug, Clone, PartialEq)]
pub enum MutationResult {
    /// Balance changed by this call
    Applied(WalletLedgerEntry),
    /// An entry with the same (type, reference) already existed; nothing changed
    AlreadyApplied(WalletLedgerEntry),
}

impl MutationResult {
    pub fn entry(&self) -> &WalletLedgerEntry {
        match self {
            MutationResult::Applied(e) | MutationResult::AlreadyApplied(e) => e,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, MutationResult::Applied(_))
    }
}
