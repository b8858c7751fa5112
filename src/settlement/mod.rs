//! Settlement Saga
//!
//! One settlement per purchased order line, moved through its lifecycle by
//! idempotent event handlers:
//!
//! ```text
//!            SettlementCreated                 SettlementReady
//! producer ────────────────────▶ Intake ──▶ FeeEngine ──────────▶ wallet
//!                                  │            │
//!                              PENDING ──────▶ READY
//!                                                │   SettlementCompleted / Failed
//!                                  Reconciler ◀──┴──────────────────────── wallet
//!                                      │
//!                               COMPLETED | FAILED
//! ```
//!
//! Handlers never trust delivery count or order: each one re-derives
//! "already done?" from the ledger's status column.

pub mod bulk;
pub mod db;
pub mod error;
pub mod fee_engine;
pub mod intake;
pub mod ledger;
pub mod reconciler;
pub mod state;
pub mod types;
pub mod worker;

pub use bulk::{
    BulkIntakeScanner, BulkScanConfig, BulkScanReport, ConfirmedPurchase, ConfirmedPurchaseSource,
    InMemoryPurchaseSource, PgPurchaseSource, decode_purchase,
};
pub use db::PgSettlementLedger;
pub use error::SettlementError;
pub use fee_engine::{FeeEngine, FeeOutcome};
pub use intake::{IntakeOutcome, SettlementIntake};
pub use ledger::{InMemorySettlementLedger, InsertOutcome, SettlementLedger, TerminalUpdate};
pub use reconciler::{ReconcileOutcome, SettlementReconciler};
pub use state::{SettlementStatus, Transition};
pub use types::{PaymentMethodClass, Settlement, SettlementId};
pub use worker::{RecoveryWorker, ScanReport, WorkerConfig};
