//! Fee Engine
//!
//! PENDING → READY with fee and net persisted in the same CAS write, then
//! `SettlementReady` is published. Publishing strictly follows the commit;
//! a crash in between leaves a stale READY row that the recovery worker
//! re-announces.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::error::SettlementError;
use super::ledger::SettlementLedger;
use super::state::SettlementStatus;
use super::types::{Settlement, SettlementId};
use crate::events::{EventPublisher, SettlementReady};
use crate::fee::{FeeSchedule, calculate_fee};

/// What a `process` call did
#[derive(Debug, Clone, PartialEq)]
pub enum FeeOutcome {
    /// This call moved the settlement to READY and announced it
    Ready(SettlementReady),
    /// Already READY or terminal; nothing written, nothing published
    AlreadyProcessed(SettlementStatus),
}

pub struct FeeEngine {
    ledger: Arc<dyn SettlementLedger>,
    schedule: FeeSchedule,
    publisher: Arc<dyn EventPublisher>,
}

impl FeeEngine {
    pub fn new(
        ledger: Arc<dyn SettlementLedger>,
        schedule: FeeSchedule,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            ledger,
            schedule,
            publisher,
        }
    }

    pub fn schedule(&self) -> &FeeSchedule {
        &self.schedule
    }

    pub async fn process(&self, id: SettlementId) -> Result<FeeOutcome, SettlementError> {
        let settlement = self
            .ledger
            .get(id)
            .await?
            .ok_or_else(|| SettlementError::NotFound(id.to_string()))?;

        if settlement.status != SettlementStatus::Pending {
            debug!(settlement_id = %id, status = %settlement.status, "Fee already applied");
            return Ok(FeeOutcome::AlreadyProcessed(settlement.status));
        }

        let rate = self.schedule.rate_for(settlement.payment_method_class);
        let breakdown = calculate_fee(settlement.gross_amount, rate)?;

        if !self
            .ledger
            .mark_ready(id, breakdown.fee, breakdown.net)
            .await?
        {
            // Another worker won the CAS and owns the announcement
            let status = self
                .ledger
                .get(id)
                .await?
                .map(|s| s.status)
                .unwrap_or(SettlementStatus::Ready);
            debug!(settlement_id = %id, status = %status, "Lost PENDING→READY race");
            return Ok(FeeOutcome::AlreadyProcessed(status));
        }

        info!(
            settlement_id = %id,
            class = %settlement.payment_method_class,
            gross = %settlement.gross_amount,
            fee = %breakdown.fee,
            net = %breakdown.net,
            "Settlement READY"
        );

        let ready = SettlementReady {
            settlement_id: id,
            user_id: settlement.user_id.clone(),
            net_amount: breakdown.net,
        };
        self.publisher.publish(ready.clone().into()).await?;
        Ok(FeeOutcome::Ready(ready))
    }

    /// Publish `SettlementReady` again for a settlement already READY.
    ///
    /// The re-announcement is counted on the row before publishing. Returns
    /// the new count, or `None` if the row left READY in the meantime.
    pub async fn reemit_ready(&self, settlement: &Settlement) -> Result<Option<u32>, SettlementError> {
        if settlement.status != SettlementStatus::Ready {
            return Err(SettlementError::SystemError(format!(
                "cannot re-emit ready for {} in {}",
                settlement.id, settlement.status
            )));
        }
        let net_amount = settlement
            .net_amount
            .ok_or_else(|| SettlementError::Unbalanced(settlement.id.to_string()))?;
        if !settlement.is_balanced() {
            warn!(settlement_id = %settlement.id, "Stored fee and net do not add up to gross");
            return Err(SettlementError::Unbalanced(settlement.id.to_string()));
        }

        let Some(count) = self.ledger.record_reemit(settlement.id).await? else {
            debug!(settlement_id = %settlement.id, "Settlement left READY, not re-announcing");
            return Ok(None);
        };

        self.publisher
            .publish(
                SettlementReady {
                    settlement_id: settlement.id,
                    user_id: settlement.user_id.clone(),
                    net_amount,
                }
                .into(),
            )
            .await?;
        Ok(Some(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{RecordingPublisher, SagaEvent};
    use crate::money::Money;
    use crate::settlement::ledger::InMemorySettlementLedger;
    use crate::settlement::types::PaymentMethodClass;

    async fn setup(
        gross: i64,
        class: PaymentMethodClass,
    ) -> (Arc<InMemorySettlementLedger>, Arc<RecordingPublisher>, FeeEngine, SettlementId) {
        let ledger = Arc::new(InMemorySettlementLedger::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let engine = FeeEngine::new(ledger.clone(), FeeSchedule::default(), publisher.clone());
        let s = Settlement::pending("oi-1", "u-1", Money::new(gross), class);
        ledger.insert_pending(&s).await.unwrap();
        (ledger, publisher, engine, s.id)
    }

    #[tokio::test]
    async fn test_card_only_fee() {
        let (ledger, publisher, engine, id) = setup(30_000, PaymentMethodClass::CardOnly).await;

        let outcome = engine.process(id).await.unwrap();
        let FeeOutcome::Ready(ready) = outcome else {
            panic!("expected Ready");
        };
        assert_eq!(ready.net_amount, Money::new(29_100));

        let stored = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, SettlementStatus::Ready);
        assert_eq!(stored.fee, Some(Money::new(900)));
        assert_eq!(stored.net_amount, Some(Money::new(29_100)));
        assert!(stored.is_balanced());
        assert_eq!(publisher.events(), vec![SagaEvent::SettlementReady(ready)]);
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let (_ledger, publisher, engine, id) = setup(10_000, PaymentMethodClass::WalletOnly).await;
        engine.process(id).await.unwrap();
        assert_eq!(
            engine.process(id).await.unwrap(),
            FeeOutcome::AlreadyProcessed(SettlementStatus::Ready)
        );
        assert_eq!(publisher.events().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_ready_row() {
        let (ledger, publisher, engine, id) = setup(10_000, PaymentMethodClass::WalletAndCard).await;
        publisher.set_fail(true);

        let err = engine.process(id).await.unwrap_err();
        assert!(err.is_transient());
        let stored = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, SettlementStatus::Ready);

        publisher.set_fail(false);
        assert_eq!(engine.reemit_ready(&stored).await.unwrap(), Some(1));
        assert_eq!(publisher.events().len(), 1);
        assert_eq!(ledger.get(id).await.unwrap().unwrap().reemit_count, 1);
    }

    #[tokio::test]
    async fn test_reemit_skips_settled_row() {
        let (ledger, publisher, engine, id) = setup(10_000, PaymentMethodClass::WalletOnly).await;
        engine.process(id).await.unwrap();
        let ready = ledger.get(id).await.unwrap().unwrap();
        ledger
            .mark_terminal(
                id,
                &crate::settlement::ledger::TerminalUpdate::Completed {
                    settled_at: chrono::Utc::now(),
                },
            )
            .await
            .unwrap();

        assert_eq!(engine.reemit_ready(&ready).await.unwrap(), None);
        assert_eq!(publisher.events().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_settlement() {
        let ledger = Arc::new(InMemorySettlementLedger::new());
        let engine = FeeEngine::new(
            ledger,
            FeeSchedule::default(),
            Arc::new(RecordingPublisher::new()),
        );
        assert!(matches!(
            engine.process(SettlementId::new()).await,
            Err(SettlementError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reemit_requires_ready() {
        let (ledger, _publisher, engine, id) = setup(500, PaymentMethodClass::CardOnly).await;
        let pending = ledger.get(id).await.unwrap().unwrap();
        assert!(engine.reemit_ready(&pending).await.is_err());
    }
}
