//! Wallet
//!
//! User balances plus an append-only ledger of every balance change, and
//! the worker that credits settled funds.

pub mod crediting;
pub mod db;
pub mod error;
pub mod ledger;
pub mod types;

pub use crediting::WalletCreditingWorker;
pub use db::PgWalletLedger;
pub use error::WalletError;
pub use ledger::{InMemoryWalletLedger, WalletLedger};
pub use types::{
    AccountStatus, MutationResult, WalletBalance, WalletLedgerEntry, WalletMutation, WalletTxType,
};
