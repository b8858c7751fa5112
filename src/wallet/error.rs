//! Wallet Error Types

use thiserror::Error;

/// Wallet ledger errors.
///
/// Everything except `DatabaseError` is a business rejection: terminal,
/// reported downstream as `SettlementFailed { reason: code }`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Account is frozen")]
    AccountFrozen,

    #[error("Account is disabled")]
    AccountDisabled,

    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Amount would cause overflow")]
    Overflow,

    /// Replay of a rejection recorded by an earlier delivery
    #[error("Previously rejected: {0}")]
    PreviouslyRejected(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl WalletError {
    pub fn code(&self) -> &'static str {
        match self {
            WalletError::InvalidAmount => "INVALID_AMOUNT",
            WalletError::UnknownUser(_) => "UNKNOWN_USER",
            WalletError::AccountFrozen => "ACCOUNT_FROZEN",
            WalletError::AccountDisabled => "ACCOUNT_DISABLED",
            WalletError::InsufficientBalance => "INSUFFICIENT_BALANCE",
            WalletError::Overflow => "OVERFLOW",
            WalletError::PreviouslyRejected(_) => "PREVIOUSLY_REJECTED",
            WalletError::DatabaseError(_) => "DATABASE_ERROR",
        }
    }

    /// Reason code carried by `SettlementFailed`. A replayed rejection
    /// reports the original code.
    pub fn reason(&self) -> String {
        match self {
            WalletError::PreviouslyRejected(code) => code.clone(),
            other => other.code().to_string(),
        }
    }

    #[inline]
    pub fn is_business_rejection(&self) -> bool {
        !self.is_transient()
    }

    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, WalletError::DatabaseError(_))
    }
}

impl From<sqlx::Error> for WalletError {
    fn from(e: sqlx::Error) -> Self {
        WalletError::DatabaseError(e.to_string())
    }
}
