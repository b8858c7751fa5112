//! Wallet Crediting Worker
//!
//! Consumes `SettlementReady`, credits `net_amount` to the user's wallet
//! exactly once per settlement, and reports the outcome.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::error::WalletError;
use super::ledger::WalletLedger;
use super::types::{WalletMutation, WalletTxType};
use crate::events::{
    Disposition, EventHandler, EventPublisher, SagaEvent, SettlementCompleted, SettlementFailed,
    SettlementReady,
};

pub struct WalletCreditingWorker {
    ledger: Arc<dyn WalletLedger>,
    publisher: Arc<dyn EventPublisher>,
}

impl WalletCreditingWorker {
    pub fn new(ledger: Arc<dyn WalletLedger>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { ledger, publisher }
    }

    /// Credit once, then compute the outcome event.
    ///
    /// `Err` only for transient store failures.
    pub async fn credit(&self, ready: &SettlementReady) -> Result<SagaEvent, WalletError> {
        let reference = ready.settlement_id.to_string();

        if let Some(entry) = self.ledger.find_entry(WalletTxType::Credit, &reference).await? {
            debug!(
                settlement_id = %ready.settlement_id,
                balance_after = %entry.balance_after,
                "Credit already applied, re-emitting completion"
            );
            return Ok(self.completed(ready));
        }

        let mutation = WalletMutation::credit(&ready.user_id, &reference, ready.net_amount);
        match self.ledger.apply(&mutation).await {
            Ok(result) => {
                if result.is_applied() {
                    info!(
                        settlement_id = %ready.settlement_id,
                        user_id = %ready.user_id,
                        amount = %ready.net_amount,
                        balance_after = %result.entry().balance_after,
                        "Wallet credited"
                    );
                }
                Ok(self.completed(ready))
            }
            Err(e) if e.is_business_rejection() => {
                warn!(
                    settlement_id = %ready.settlement_id,
                    user_id = %ready.user_id,
                    reason = %e.reason(),
                    "Wallet credit rejected"
                );
                Ok(SettlementFailed {
                    settlement_id: ready.settlement_id,
                    user_id: ready.user_id.clone(),
                    reason: e.reason(),
                }
                .into())
            }
            Err(e) => Err(e),
        }
    }

    fn completed(&self, ready: &SettlementReady) -> SagaEvent {
        SettlementCompleted {
            settlement_id: ready.settlement_id,
            user_id: ready.user_id.clone(),
        }
        .into()
    }
}

#[async_trait]
impl EventHandler for WalletCreditingWorker {
    fn name(&self) -> &'static str {
        "wallet_crediting"
    }

    async fn handle(&self, event: &SagaEvent) -> Disposition {
        let SagaEvent::SettlementReady(ready) = event else {
            return Disposition::Reject(format!("unexpected event {}", event.name()));
        };

        let outcome = match self.credit(ready).await {
            Ok(outcome) => outcome,
            Err(e) => return Disposition::Retry(e.to_string()),
        };

        // The credit is durable; a redelivery re-emits the same outcome.
        match self.publisher.publish(outcome).await {
            Ok(()) => Disposition::Ack,
            Err(e) => Disposition::Retry(format!("publish outcome: {}", e)),
        }
    }
}
