//! Bulk Intake Scanner
//!
//! Second producer of settlements: periodically pages through confirmed
//! purchase records and feeds each one through [`SettlementIntake`]. It may
//! run next to the event-driven intake; the ledger's uniqueness on
//! `source_transaction_id` keeps the two from creating duplicates.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::{PgPool, Row};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use super::error::SettlementError;
use super::intake::{IntakeOutcome, SettlementIntake};
use super::types::PaymentMethodClass;
use crate::events::SettlementCreated;
use crate::money::Money;

/// One confirmed purchase line, ordered by `sequence`.
///
/// `purchase` is `Err` when the stored record cannot be decoded into a
/// valid purchase; the scanner skips it and moves on.
#[derive(Debug, Clone)]
pub struct ConfirmedPurchase {
    pub sequence: i64,
    pub purchase: Result<SettlementCreated, SettlementError>,
}

/// Decode one stored purchase row. An unknown class id is a validation
/// error on that record alone.
pub fn decode_purchase(
    source_transaction_id: String,
    user_id: String,
    gross_amount: i64,
    payment_method_class: i16,
) -> Result<SettlementCreated, SettlementError> {
    let payment_method_class = PaymentMethodClass::from_id(payment_method_class)
        .ok_or(SettlementError::UnknownPaymentMethod(payment_method_class))?;
    Ok(SettlementCreated {
        source_transaction_id,
        user_id,
        gross_amount: Money::new(gross_amount),
        payment_method_class,
    })
}

#[async_trait]
pub trait ConfirmedPurchaseSource: Send + Sync {
    /// Purchases with `sequence > after`, ascending, at most `limit`
    async fn fetch_after(
        &self,
        after: i64,
        limit: usize,
    ) -> Result<Vec<ConfirmedPurchase>, SettlementError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkScanConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_interval_secs() -> u64 {
    300
}

fn default_batch_size() -> usize {
    500
}

impl Default for BulkScanConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkScanReport {
    pub scanned: usize,
    pub created: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

pub struct BulkIntakeScanner {
    source: Arc<dyn ConfirmedPurchaseSource>,
    intake: Arc<SettlementIntake>,
    config: BulkScanConfig,
    cursor: AtomicI64,
}

impl BulkIntakeScanner {
    pub fn new(
        source: Arc<dyn ConfirmedPurchaseSource>,
        intake: Arc<SettlementIntake>,
        config: BulkScanConfig,
    ) -> Self {
        Self {
            source,
            intake,
            config,
            cursor: AtomicI64::new(0),
        }
    }

    /// Last sequence fully processed. Restarting at 0 is safe: everything
    /// already ingested comes back as a duplicate.
    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::SeqCst)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval_secs,
            batch_size = self.config.batch_size,
            "Starting bulk intake scanner"
        );

        loop {
            if let Err(e) = self.scan_once().await {
                error!(error = %e, cursor = self.cursor(), "Bulk intake scan failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.interval_secs)) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Bulk intake scanner stopped");
    }

    /// Drain everything past the cursor, one batch at a time.
    ///
    /// A transient failure stops the scan without moving the cursor past the
    /// failing record, so the next scan starts there.
    pub async fn scan_once(&self) -> Result<BulkScanReport, SettlementError> {
        let mut report = BulkScanReport::default();

        loop {
            let batch = self
                .source
                .fetch_after(self.cursor(), self.config.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }
            let full_batch = batch.len() >= self.config.batch_size;

            for record in batch {
                report.scanned += 1;
                let result = match &record.purchase {
                    Ok(purchase) => self.intake.intake(purchase).await,
                    Err(e) => Err(e.clone()),
                };
                match result {
                    Ok(IntakeOutcome::Created(_)) => report.created += 1,
                    Ok(IntakeOutcome::Duplicate(_)) => report.duplicates += 1,
                    Err(e) if e.is_transient() => return Err(e),
                    Err(e) => {
                        report.rejected += 1;
                        warn!(
                            sequence = record.sequence,
                            code = e.code(),
                            error = %e,
                            "Skipping invalid confirmed purchase"
                        );
                    }
                }
                self.cursor.store(record.sequence, Ordering::SeqCst);
            }

            if !full_batch {
                break;
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                created = report.created,
                duplicates = report.duplicates,
                rejected = report.rejected,
                cursor = self.cursor(),
                "Bulk intake scan complete"
            );
        } else {
            debug!("Bulk intake scan found nothing new");
        }
        Ok(report)
    }
}

/// Purchases held in memory (tests, demos)
#[derive(Default)]
pub struct InMemoryPurchaseSource {
    records: Mutex<Vec<ConfirmedPurchase>>,
}

impl InMemoryPurchaseSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a purchase; returns its sequence number
    pub async fn push(&self, purchase: SettlementCreated) -> i64 {
        let mut records = self.records.lock().await;
        let sequence = records.len() as i64 + 1;
        records.push(ConfirmedPurchase {
            sequence,
            purchase: Ok(purchase),
        });
        sequence
    }
}

#[async_trait]
impl ConfirmedPurchaseSource for InMemoryPurchaseSource {
    async fn fetch_after(
        &self,
        after: i64,
        limit: usize,
    ) -> Result<Vec<ConfirmedPurchase>, SettlementError> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|r| r.sequence > after)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Reads `confirmed_purchases_tb`, written by the payments side
pub struct PgPurchaseSource {
    pool: PgPool,
}

impl PgPurchaseSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConfirmedPurchaseSource for PgPurchaseSource {
    async fn fetch_after(
        &self,
        after: i64,
        limit: usize,
    ) -> Result<Vec<ConfirmedPurchase>, SettlementError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_transaction_id, user_id, gross_amount, payment_method_class
            FROM confirmed_purchases_tb
            WHERE id > $1
            ORDER BY id ASC
            LIMIT $2
            "#,
        )
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(ConfirmedPurchase {
                sequence: row.try_get("id")?,
                purchase: decode_purchase(
                    row.try_get("source_transaction_id")?,
                    row.try_get("user_id")?,
                    row.try_get("gross_amount")?,
                    row.try_get("payment_method_class")?,
                ),
            });
        }
        Ok(records)
    }
}
