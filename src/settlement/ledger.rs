//! Settlement Ledger
//!
//! Storage seam for settlement records. Implementations must provide:
//! - at most one row per `source_transaction_id` (insert is race-safe)
//! - compare-and-swap status updates, so the status column is the
//!   serialization point between concurrent workers
//!
//! [`InMemorySettlementLedger`] honours the same contract for tests and
//! single-instance runs; [`super::db::PgSettlementLedger`] is the durable one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::error::SettlementError;
use super::state::{SettlementStatus, Transition};
use super::types::{Settlement, SettlementId};
use crate::money::Money;

/// Result of a race-safe insert
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// This call created the row
    Created(Settlement),
    /// A row with the same source transaction already existed (any status)
    Existing(Settlement),
}

impl InsertOutcome {
    pub fn settlement(&self) -> &Settlement {
        match self {
            InsertOutcome::Created(s) | InsertOutcome::Existing(s) => s,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, InsertOutcome::Created(_))
    }
}

/// Terminal write applied by the reconciler (READY → COMPLETED/FAILED)
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalUpdate {
    Completed { settled_at: DateTime<Utc> },
    Failed { reason: String },
}

impl TerminalUpdate {
    pub fn status(&self) -> SettlementStatus {
        match self {
            TerminalUpdate::Completed { .. } => SettlementStatus::Completed,
            TerminalUpdate::Failed { .. } => SettlementStatus::Failed,
        }
    }
}

#[async_trait]
pub trait SettlementLedger: Send + Sync {
    /// Insert a PENDING settlement unless one exists for the same source transaction
    async fn insert_pending(&self, settlement: &Settlement) -> Result<InsertOutcome, SettlementError>;

    async fn get(&self, id: SettlementId) -> Result<Option<Settlement>, SettlementError>;

    async fn get_by_source(
        &self,
        source_transaction_id: &str,
    ) -> Result<Option<Settlement>, SettlementError>;

    /// CAS PENDING → READY, persisting fee and net in the same write.
    ///
    /// Returns false if the row was not PENDING (another worker won).
    async fn mark_ready(
        &self,
        id: SettlementId,
        fee: Money,
        net_amount: Money,
    ) -> Result<bool, SettlementError>;

    /// CAS READY → COMPLETED/FAILED. Returns false if the row was not READY.
    async fn mark_terminal(
        &self,
        id: SettlementId,
        update: &TerminalUpdate,
    ) -> Result<bool, SettlementError>;

    /// Count one re-announcement of a READY settlement and restart its stale
    /// clock. Returns the new count, or `None` if the row is no longer READY.
    async fn record_reemit(&self, id: SettlementId) -> Result<Option<u32>, SettlementError>;

    /// Non-terminal settlements not touched for at least `threshold`, oldest
    /// first. READY rows already re-announced `max_reemits` times are left
    /// out: they are waiting for manual intervention.
    async fn find_stale(
        &self,
        threshold: Duration,
        max_reemits: u32,
        limit: usize,
    ) -> Result<Vec<Settlement>, SettlementError>;
}

/// DashMap-backed ledger. Per-key atomicity comes from the shard lock held
/// across each check-and-write.
#[derive(Default)]
pub struct InMemorySettlementLedger {
    settlements: DashMap<SettlementId, Settlement>,
    by_source: DashMap<String, SettlementId>,
    unavailable: AtomicBool,
}

impl InMemorySettlementLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection: every call fails with a transient database error while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.settlements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settlements.is_empty()
    }

    /// Force `updated_at` into the past (recovery tests)
    pub fn backdate(&self, id: SettlementId, by: Duration) {
        if let Some(mut s) = self.settlements.get_mut(&id)
            && let Ok(delta) = chrono::Duration::from_std(by)
        {
            s.updated_at -= delta;
        }
    }

    fn check_available(&self) -> Result<(), SettlementError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SettlementError::DatabaseError(
                "settlement store unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SettlementLedger for InMemorySettlementLedger {
    async fn insert_pending(&self, settlement: &Settlement) -> Result<InsertOutcome, SettlementError> {
        self.check_available()?;

        match self.by_source.entry(settlement.source_transaction_id.clone()) {
            Entry::Occupied(existing) => {
                let id = *existing.get();
                let record = self
                    .settlements
                    .get(&id)
                    .map(|r| r.clone())
                    .ok_or_else(|| SettlementError::SystemError(format!("dangling index for {}", id)))?;
                Ok(InsertOutcome::Existing(record))
            }
            Entry::Vacant(slot) => {
                self.settlements.insert(settlement.id, settlement.clone());
                slot.insert(settlement.id);
                Ok(InsertOutcome::Created(settlement.clone()))
            }
        }
    }

    async fn get(&self, id: SettlementId) -> Result<Option<Settlement>, SettlementError> {
        self.check_available()?;
        Ok(self.settlements.get(&id).map(|r| r.clone()))
    }

    async fn get_by_source(
        &self,
        source_transaction_id: &str,
    ) -> Result<Option<Settlement>, SettlementError> {
        self.check_available()?;
        let Some(id) = self.by_source.get(source_transaction_id).map(|r| *r) else {
            return Ok(None);
        };
        Ok(self.settlements.get(&id).map(|r| r.clone()))
    }

    async fn mark_ready(
        &self,
        id: SettlementId,
        fee: Money,
        net_amount: Money,
    ) -> Result<bool, SettlementError> {
        self.check_available()?;
        let Some(mut record) = self.settlements.get_mut(&id) else {
            return Ok(false);
        };
        if record.status.transition_to(SettlementStatus::Ready) != Transition::Apply {
            return Ok(false);
        }
        record.fee = Some(fee);
        record.net_amount = Some(net_amount);
        record.status = SettlementStatus::Ready;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_terminal(
        &self,
        id: SettlementId,
        update: &TerminalUpdate,
    ) -> Result<bool, SettlementError> {
        self.check_available()?;
        let Some(mut record) = self.settlements.get_mut(&id) else {
            return Ok(false);
        };
        if record.status.transition_to(update.status()) != Transition::Apply {
            return Ok(false);
        }
        match update {
            TerminalUpdate::Completed { settled_at } => {
                record.settled_at = Some(*settled_at);
            }
            TerminalUpdate::Failed { reason } => {
                record.failure_reason = Some(reason.clone());
            }
        }
        record.status = update.status();
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_reemit(&self, id: SettlementId) -> Result<Option<u32>, SettlementError> {
        self.check_available()?;
        let Some(mut record) = self.settlements.get_mut(&id) else {
            return Ok(None);
        };
        if record.status != SettlementStatus::Ready {
            return Ok(None);
        }
        record.reemit_count += 1;
        record.updated_at = Utc::now();
        Ok(Some(record.reemit_count))
    }

    async fn find_stale(
        &self,
        threshold: Duration,
        max_reemits: u32,
        limit: usize,
    ) -> Result<Vec<Settlement>, SettlementError> {
        self.check_available()?;
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| SettlementError::SystemError(e.to_string()))?;
        let cutoff = Utc::now() - threshold;

        let mut stale: Vec<Settlement> = self
            .settlements
            .iter()
            .filter(|r| match r.status {
                SettlementStatus::Pending => true,
                SettlementStatus::Ready => r.reemit_count < max_reemits,
                SettlementStatus::Completed | SettlementStatus::Failed => false,
            })
            .filter(|r| r.updated_at <= cutoff)
            .map(|r| r.clone())
            .collect();
        stale.sort_by_key(|s| s.updated_at);
        stale.truncate(limit);
        Ok(stale)
    }
}
