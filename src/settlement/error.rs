//! Settlement Error Types

use thiserror::Error;

use crate::events::TransportError;
use crate::money::MoneyError;

/// Settlement error types
///
/// Split into validation errors (terminal: log and acknowledge) and
/// infrastructure errors (transient: do not acknowledge, let the transport
/// redeliver). See [`SettlementError::is_transient`].
#[derive(Error, Debug, Clone)]
pub enum SettlementError {
    // === Validation Errors ===
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Missing source transaction id")]
    MissingSourceTransaction,

    #[error("Missing user id")]
    MissingUser,

    #[error("Unknown payment method class: {0}")]
    UnknownPaymentMethod(i16),

    #[error("Fee computation failed: {0}")]
    FeeComputation(#[from] MoneyError),

    #[error("Stored settlement violates fee + net == gross: {0}")]
    Unbalanced(String),

    // === System Errors ===
    #[error("Settlement not found: {0}")]
    NotFound(String),

    #[error("Settlement not ready for outcome yet: {0}")]
    NotReady(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Event publish failed: {0}")]
    Publish(String),

    #[error("Internal system error: {0}")]
    SystemError(String),
}

impl SettlementError {
    /// Stable machine code for logs and dead letters
    pub fn code(&self) -> &'static str {
        match self {
            SettlementError::InvalidAmount => "INVALID_AMOUNT",
            SettlementError::MissingSourceTransaction => "MISSING_SOURCE_TRANSACTION",
            SettlementError::MissingUser => "MISSING_USER",
            SettlementError::UnknownPaymentMethod(_) => "UNKNOWN_PAYMENT_METHOD",
            SettlementError::FeeComputation(_) => "FEE_COMPUTATION",
            SettlementError::Unbalanced(_) => "UNBALANCED",
            SettlementError::NotFound(_) => "SETTLEMENT_NOT_FOUND",
            SettlementError::NotReady(_) => "SETTLEMENT_NOT_READY",
            SettlementError::DatabaseError(_) => "DATABASE_ERROR",
            SettlementError::Publish(_) => "PUBLISH_FAILED",
            SettlementError::SystemError(_) => "SYSTEM_ERROR",
        }
    }

    /// Transient errors must not be acknowledged.
    ///
    /// `NotFound` / `NotReady` count as transient: an outcome can overtake
    /// the write it depends on, and redelivery (bounded, then dead letter)
    /// is the only safe answer.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SettlementError::NotFound(_)
                | SettlementError::NotReady(_)
                | SettlementError::DatabaseError(_)
                | SettlementError::Publish(_)
                | SettlementError::SystemError(_)
        )
    }
}

impl From<sqlx::Error> for SettlementError {
    fn from(e: sqlx::Error) -> Self {
        SettlementError::DatabaseError(e.to_string())
    }
}

impl From<TransportError> for SettlementError {
    fn from(e: TransportError) -> Self {
        SettlementError::Publish(e.to_string())
    }
}
