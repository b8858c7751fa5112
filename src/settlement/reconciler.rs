//! Settlement Reconciler
//!
//! Applies wallet outcomes to the settlement ledger. Every decision goes
//! through [`SettlementStatus::transition_to`]; the CAS in
//! `mark_terminal` makes the first terminal write win.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::error::SettlementError;
use super::ledger::{SettlementLedger, TerminalUpdate};
use super::state::{SettlementStatus, Transition};
use super::types::SettlementId;
use crate::events::{Disposition, EventHandler, SagaEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// This call wrote the terminal status
    Applied(SettlementStatus),
    /// Already in the requested terminal status
    Duplicate,
    /// Already in the other terminal status; outcome dropped
    Conflict(SettlementStatus),
}

pub struct SettlementReconciler {
    ledger: Arc<dyn SettlementLedger>,
}

impl SettlementReconciler {
    pub fn new(ledger: Arc<dyn SettlementLedger>) -> Self {
        Self { ledger }
    }

    pub async fn reconcile(
        &self,
        id: SettlementId,
        update: TerminalUpdate,
    ) -> Result<ReconcileOutcome, SettlementError> {
        let target = update.status();

        // Bounded: status only moves forward, so a lost CAS settles on re-read
        for _ in 0..3 {
            let settlement = self
                .ledger
                .get(id)
                .await?
                .ok_or_else(|| SettlementError::NotFound(id.to_string()))?;

            match settlement.status.transition_to(target) {
                Transition::Apply => {
                    if self.ledger.mark_terminal(id, &update).await? {
                        info!(settlement_id = %id, status = %target, "Settlement reconciled");
                        return Ok(ReconcileOutcome::Applied(target));
                    }
                }
                Transition::AlreadyApplied => {
                    debug!(settlement_id = %id, status = %target, "Duplicate outcome ignored");
                    return Ok(ReconcileOutcome::Duplicate);
                }
                Transition::Conflict => {
                    warn!(
                        settlement_id = %id,
                        current = %settlement.status,
                        requested = %target,
                        "Outcome conflicts with recorded terminal status, ignoring"
                    );
                    return Ok(ReconcileOutcome::Conflict(settlement.status));
                }
                Transition::Premature => {
                    return Err(SettlementError::NotReady(id.to_string()));
                }
            }
        }

        Err(SettlementError::SystemError(format!(
            "status of {} kept changing during reconcile",
            id
        )))
    }
}

#[async_trait]
impl EventHandler for SettlementReconciler {
    fn name(&self) -> &'static str {
        "settlement_reconciler"
    }

    async fn handle(&self, event: &SagaEvent) -> Disposition {
        let (id, update) = match event {
            SagaEvent::SettlementCompleted(done) => (
                done.settlement_id,
                TerminalUpdate::Completed {
                    settled_at: Utc::now(),
                },
            ),
            SagaEvent::SettlementFailed(failed) => (
                failed.settlement_id,
                TerminalUpdate::Failed {
                    reason: failed.reason.clone(),
                },
            ),
            other => return Disposition::Reject(format!("unexpected event {}", other.name())),
        };

        match self.reconcile(id, update).await {
            Ok(_) => Disposition::Ack,
            Err(e) if e.is_transient() => Disposition::Retry(e.to_string()),
            Err(e) => Disposition::Reject(e.code().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::Barrier;

    use super::*;
    use crate::events::{SettlementCompleted, SettlementFailed};
    use crate::money::Money;
    use crate::settlement::ledger::InMemorySettlementLedger;
    use crate::settlement::types::{PaymentMethodClass, Settlement};

    async fn ready_settlement() -> (Arc<InMemorySettlementLedger>, SettlementReconciler, SettlementId) {
        let ledger = Arc::new(InMemorySettlementLedger::new());
        let s = Settlement::pending("oi-1", "u-1", Money::new(10_000), PaymentMethodClass::WalletOnly);
        ledger.insert_pending(&s).await.unwrap();
        ledger
            .mark_ready(s.id, Money::new(100), Money::new(9_900))
            .await
            .unwrap();
        (ledger.clone(), SettlementReconciler::new(ledger), s.id)
    }

    fn completed(id: SettlementId) -> SagaEvent {
        SettlementCompleted {
            settlement_id: id,
            user_id: "u-1".into(),
        }
        .into()
    }

    fn failed(id: SettlementId) -> SagaEvent {
        SettlementFailed {
            settlement_id: id,
            user_id: "u-1".into(),
            reason: "ACCOUNT_FROZEN".into(),
        }
        .into()
    }

    #[tokio::test]
    async fn test_completion_then_duplicates() {
        let (ledger, reconciler, id) = ready_settlement().await;

        assert_eq!(reconciler.handle(&completed(id)).await, Disposition::Ack);
        let first = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(first.status, SettlementStatus::Completed);
        assert!(first.settled_at.is_some());

        assert_eq!(reconciler.handle(&completed(id)).await, Disposition::Ack);
        let second = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(second.settled_at, first.settled_at);
    }

    #[tokio::test]
    async fn test_late_failure_cannot_undo_completion() {
        let (ledger, reconciler, id) = ready_settlement().await;
        reconciler.handle(&completed(id)).await;

        let outcome = reconciler
            .reconcile(
                id,
                TerminalUpdate::Failed {
                    reason: "ACCOUNT_FROZEN".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Conflict(SettlementStatus::Completed));
        let stored = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, SettlementStatus::Completed);
        assert!(stored.failure_reason.is_none());
    }

    #[tokio::test]
    async fn test_failure_then_completion_ignored() {
        let (ledger, reconciler, id) = ready_settlement().await;
        assert_eq!(reconciler.handle(&failed(id)).await, Disposition::Ack);
        assert_eq!(reconciler.handle(&completed(id)).await, Disposition::Ack);
        assert_eq!(reconciler.handle(&failed(id)).await, Disposition::Ack);

        let stored = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, SettlementStatus::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some("ACCOUNT_FROZEN"));
        assert!(stored.settled_at.is_none());
    }

    #[tokio::test]
    async fn test_outcome_before_ready_is_retried() {
        let ledger = Arc::new(InMemorySettlementLedger::new());
        let s = Settlement::pending("oi-7", "u-1", Money::new(100), PaymentMethodClass::CardOnly);
        ledger.insert_pending(&s).await.unwrap();
        let reconciler = SettlementReconciler::new(ledger);

        assert!(reconciler.handle(&completed(s.id)).await.is_retry());
        assert!(reconciler.handle(&completed(SettlementId::new())).await.is_retry());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_conflicting_outcomes_converge() {
        for _ in 0..20 {
            let (ledger, reconciler, id) = ready_settlement().await;
            let reconciler = Arc::new(reconciler);
            let barrier = Arc::new(Barrier::new(8));

            let mut handles = Vec::new();
            for i in 0..8 {
                let reconciler = reconciler.clone();
                let barrier = barrier.clone();
                let event = if i % 2 == 0 { completed(id) } else { failed(id) };
                handles.push(tokio::spawn(async move {
                    barrier.wait().await;
                    reconciler.handle(&event).await
                }));
            }
            for h in handles {
                assert_eq!(h.await.unwrap(), Disposition::Ack);
            }

            let stored = ledger.get(id).await.unwrap().unwrap();
            assert!(stored.status.is_terminal());
            match stored.status {
                SettlementStatus::Completed => assert!(stored.failure_reason.is_none()),
                SettlementStatus::Failed => assert!(stored.settled_at.is_none()),
                other => panic!("unexpected {}", other),
            }
        }
    }
}
