//! Recovery Worker
//!
//! Background worker that finds settlements stuck in a non-terminal state
//! and pushes them forward again:
//!
//! - PENDING: the inline fee step failed; run the fee engine again
//! - READY: `SettlementReady` may have been lost; publish it again, at most
//!   `max_reemits` times. After that the row is left for manual intervention.
//!
//! Both actions are idempotent downstream.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::error::SettlementError;
use super::fee_engine::{FeeEngine, FeeOutcome};
use super::ledger::SettlementLedger;
use super::state::SettlementStatus;

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// How often to scan, in seconds
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// How long a settlement must sit untouched to be considered stuck
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Re-announcements of one READY settlement before giving up on it
    #[serde(default = "default_max_reemits")]
    pub max_reemits: u32,
}

fn default_scan_interval_secs() -> u64 {
    30
}

fn default_stale_threshold_secs() -> u64 {
    60
}

fn default_batch_size() -> usize {
    100
}

fn default_max_reemits() -> u32 {
    5
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval_secs(),
            stale_threshold_secs: default_stale_threshold_secs(),
            batch_size: default_batch_size(),
            max_reemits: default_max_reemits(),
        }
    }
}

impl WorkerConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub advanced: usize,
    pub reemitted: usize,
    pub failed: usize,
    /// READY rows that used their last re-announcement this scan
    pub exhausted: usize,
}

impl ScanReport {
    pub fn touched(&self) -> usize {
        self.advanced + self.reemitted
    }
}

pub struct RecoveryWorker {
    ledger: Arc<dyn SettlementLedger>,
    fee_engine: Arc<FeeEngine>,
    config: WorkerConfig,
}

impl RecoveryWorker {
    pub fn new(
        ledger: Arc<dyn SettlementLedger>,
        fee_engine: Arc<FeeEngine>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            ledger,
            fee_engine,
            config,
        }
    }

    /// Scan until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            scan_interval_secs = self.config.scan_interval_secs,
            stale_threshold_secs = self.config.stale_threshold_secs,
            "Starting recovery worker"
        );

        loop {
            if let Err(e) = self.scan_and_recover().await {
                error!(error = %e, "Recovery scan failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.scan_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Recovery worker stopped");
    }

    /// Run a single scan and recovery cycle
    pub async fn scan_and_recover(&self) -> Result<ScanReport, SettlementError> {
        let stale = self
            .ledger
            .find_stale(
                self.config.stale_threshold(),
                self.config.max_reemits,
                self.config.batch_size,
            )
            .await?;

        if stale.is_empty() {
            debug!("No stale settlements found");
            return Ok(ScanReport::default());
        }

        info!(count = stale.len(), "Found stale settlements to recover");

        let mut report = ScanReport::default();
        for settlement in &stale {
            let result = match settlement.status {
                SettlementStatus::Pending => self
                    .fee_engine
                    .process(settlement.id)
                    .await
                    .map(|outcome| {
                        if matches!(outcome, FeeOutcome::Ready(_)) {
                            report.advanced += 1;
                        }
                    }),
                SettlementStatus::Ready => {
                    self.fee_engine
                        .reemit_ready(settlement)
                        .await
                        .map(|count| {
                            let Some(count) = count else { return };
                            report.reemitted += 1;
                            if count >= self.config.max_reemits {
                                report.exhausted += 1;
                                error!(
                                    settlement_id = %settlement.id,
                                    user_id = %settlement.user_id,
                                    reemits = count,
                                    "Settlement still READY after last re-announcement, needs manual intervention"
                                );
                            }
                        })
                }
                // find_stale never returns terminal rows
                SettlementStatus::Completed | SettlementStatus::Failed => Ok(()),
            };

            if let Err(e) = result {
                report.failed += 1;
                warn!(
                    settlement_id = %settlement.id,
                    status = %settlement.status,
                    error = %e,
                    "Failed to recover settlement"
                );
            }
        }

        if report.touched() > 0 {
            info!(
                advanced = report.advanced,
                reemitted = report.reemitted,
                exhausted = report.exhausted,
                "Recovered settlements this scan"
            );
        }
        Ok(report)
    }
}
