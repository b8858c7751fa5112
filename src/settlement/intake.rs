//! Settlement Intake
//!
//! Turns a purchase-confirmed `SettlementCreated` event into a PENDING
//! settlement. The store's uniqueness on `source_transaction_id` is the
//! only duplicate guard, so any number of producers may feed this path.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::error::SettlementError;
use super::fee_engine::FeeEngine;
use super::ledger::{InsertOutcome, SettlementLedger};
use super::types::{Settlement, SettlementId};
use crate::events::{Disposition, EventHandler, SagaEvent, SettlementCreated};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeOutcome {
    Created(SettlementId),
    /// Row already existed for this source transaction; nothing written
    Duplicate(SettlementId),
}

impl IntakeOutcome {
    pub fn settlement_id(&self) -> SettlementId {
        match self {
            IntakeOutcome::Created(id) | IntakeOutcome::Duplicate(id) => *id,
        }
    }
}

pub fn validate(created: &SettlementCreated) -> Result<(), SettlementError> {
    if created.source_transaction_id.trim().is_empty() {
        return Err(SettlementError::MissingSourceTransaction);
    }
    if created.user_id.trim().is_empty() {
        return Err(SettlementError::MissingUser);
    }
    if !created.gross_amount.is_positive() {
        return Err(SettlementError::InvalidAmount);
    }
    Ok(())
}

pub struct SettlementIntake {
    ledger: Arc<dyn SettlementLedger>,
    fee_engine: Arc<FeeEngine>,
}

impl SettlementIntake {
    pub fn new(ledger: Arc<dyn SettlementLedger>, fee_engine: Arc<FeeEngine>) -> Self {
        Self { ledger, fee_engine }
    }

    /// Validate, insert, and run the fee step inline for new rows.
    ///
    /// A failed fee step does not fail the intake: the row is committed and
    /// the recovery worker picks it up as a stale PENDING settlement.
    pub async fn intake(&self, created: &SettlementCreated) -> Result<IntakeOutcome, SettlementError> {
        validate(created)?;

        let settlement = Settlement::pending(
            created.source_transaction_id.clone(),
            created.user_id.clone(),
            created.gross_amount,
            created.payment_method_class,
        );

        let id = match self.ledger.insert_pending(&settlement).await? {
            InsertOutcome::Existing(existing) => {
                debug!(
                    source_transaction_id = %created.source_transaction_id,
                    settlement_id = %existing.id,
                    status = %existing.status,
                    "Duplicate SettlementCreated ignored"
                );
                return Ok(IntakeOutcome::Duplicate(existing.id));
            }
            InsertOutcome::Created(record) => record.id,
        };

        info!(
            settlement_id = %id,
            source_transaction_id = %created.source_transaction_id,
            user_id = %created.user_id,
            gross = %created.gross_amount,
            "Settlement created"
        );

        if let Err(e) = self.fee_engine.process(id).await {
            warn!(settlement_id = %id, error = %e, "Inline fee step failed, left for recovery");
        }

        Ok(IntakeOutcome::Created(id))
    }
}

#[async_trait]
impl EventHandler for SettlementIntake {
    fn name(&self) -> &'static str {
        "settlement_intake"
    }

    async fn handle(&self, event: &SagaEvent) -> Disposition {
        let SagaEvent::SettlementCreated(created) = event else {
            return Disposition::Reject(format!("unexpected event {}", event.name()));
        };

        match self.intake(created).await {
            Ok(_) => Disposition::Ack,
            Err(e) if e.is_transient() => Disposition::Retry(e.to_string()),
            Err(e) => {
                warn!(
                    source_transaction_id = %created.source_transaction_id,
                    code = e.code(),
                    "Invalid SettlementCreated rejected"
                );
                Disposition::Reject(e.code().to_string())
            }
        }
    }
}
