//! Settlement Saga
//!
//! Turns a confirmed purchase into a fee-adjusted settlement and a credited
//! wallet balance over one-way, at-least-once events, with no distributed
//! transaction.
//!
//! # Modules
//!
//! - [`money`] - Minor-unit money type
//! - [`fee`] - Fee schedule and round-half-up fee arithmetic
//! - [`settlement`] - Settlement ledger, state machine, intake, fee engine, reconciler, recovery
//! - [`wallet`] - Wallet ledger and the crediting worker
//! - [`events`] - Saga events, transport, consumer loop, retry policy, dead letters
//! - [`db`] - PostgreSQL pool and schema
//! - [`config`] / [`logging`] - Process setup

pub mod config;
pub mod db;
pub mod events;
pub mod fee;
pub mod logging;
pub mod money;
pub mod settlement;
pub mod wallet;

pub use fee::{FeeBreakdown, FeeSchedule, calculate_fee};
pub use money::{Money, MoneyError};
pub use settlement::{Settlement, SettlementId, SettlementStatus};
pub use wallet::{WalletBalance, WalletLedgerEntry};
