//! Settlement Core Types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::SettlementStatus;
use crate::money::Money;

/// Settlement ID - ULID-based, generated at creation, sortable by time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettlementId(ulid::Ulid);

impl SettlementId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    pub fn inner(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for SettlementId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SettlementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SettlementId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// How the buyer paid; selects the fee rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum PaymentMethodClass {
    WalletOnly = 1,
    CardOnly = 2,
    WalletAndCard = 3,
}

impl PaymentMethodClass {
    pub const ALL: [PaymentMethodClass; 3] = [
        PaymentMethodClass::WalletOnly,
        PaymentMethodClass::CardOnly,
        PaymentMethodClass::WalletAndCard,
    ];

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(PaymentMethodClass::WalletOnly),
            2 => Some(PaymentMethodClass::CardOnly),
            3 => Some(PaymentMethodClass::WalletAndCard),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethodClass::WalletOnly => "WALLET_ONLY",
            PaymentMethodClass::CardOnly => "CARD_ONLY",
            PaymentMethodClass::WalletAndCard => "WALLET_AND_CARD",
        }
    }
}

impl fmt::Display for PaymentMethodClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One settlement per purchased order line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: SettlementId,
    /// Purchased order line identifier (unique)
    pub source_transaction_id: String,
    pub user_id: String,
    pub gross_amount: Money,
    /// Set together with `net_amount` on PENDING→READY
    pub fee: Option<Money>,
    pub net_amount: Option<Money>,
    pub payment_method_class: PaymentMethodClass,
    pub status: SettlementStatus,
    /// Machine code from the wallet when the credit was rejected
    pub failure_reason: Option<String>,
    /// Only set on READY→COMPLETED
    pub settled_at: Option<DateTime<Utc>>,
    /// How many times recovery has re-announced this READY settlement
    pub reemit_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Settlement {
    /// Create a new settlement record in PENDING state
    pub fn pending(
        source_transaction_id: impl Into<String>,
        user_id: impl Into<String>,
        gross_amount: Money,
        payment_method_class: PaymentMethodClass,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SettlementId::new(),
            source_transaction_id: source_transaction_id.into(),
            user_id: user_id.into(),
            gross_amount,
            fee: None,
            net_amount: None,
            payment_method_class,
            status: SettlementStatus::Pending,
            failure_reason: None,
            settled_at: None,
            reemit_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// `fee + net_amount == gross_amount` whenever both are set
    pub fn is_balanced(&self) -> bool {
        match (self.fee, self.net_amount) {
            (Some(fee), Some(net)) => fee
                .checked_add(net)
                .map(|sum| sum == self.gross_amount)
                .unwrap_or(false),
            _ => true,
        }
    }
}

impl fmt::Display for Settlement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Settlement[{}] source={} user={} gross={} class={} status={}",
            self.id,
            self.source_transaction_id,
            self.user_id,
            self.gross_amount,
            self.payment_method_class,
            self.status
        )
    }
}
