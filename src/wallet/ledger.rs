//! Wallet Ledger
//!
//! Balance mutations are idempotent on (`transaction_type`, `reference_id`):
//! the ledger entry and the balance change commit together or not at all.
//! Business rejections are memoized under the same key so a redelivered
//! request replays the original verdict instead of re-evaluating it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::error::WalletError;
use super::types::{
    AccountStatus, MutationResult, WalletBalance, WalletLedgerEntry, WalletMutation, WalletTxType,
};
use crate::money::Money;

#[async_trait]
pub trait WalletLedger: Send + Sync {
    /// Create an ACTIVE zero-balance account. No-op if it exists.
    async fn open_account(&self, user_id: &str) -> Result<WalletBalance, WalletError>;

    async fn set_status(&self, user_id: &str, status: AccountStatus) -> Result<(), WalletError>;

    async fn balance(&self, user_id: &str) -> Result<Option<WalletBalance>, WalletError>;

    async fn find_entry(
        &self,
        tx_type: WalletTxType,
        reference_id: &str,
    ) -> Result<Option<WalletLedgerEntry>, WalletError>;

    /// Atomically apply a mutation.
    ///
    /// - existing entry for the key: `AlreadyApplied`, balance untouched
    /// - recorded rejection for the key: `PreviouslyRejected(code)`
    /// - business rule violation: recorded, then returned
    async fn apply(&self, mutation: &WalletMutation) -> Result<MutationResult, WalletError>;

    async fn entries_for_user(&self, user_id: &str) -> Result<Vec<WalletLedgerEntry>, WalletError>;
}

/// Business rules for a single mutation against the locked balance.
///
/// Returns the balance after the change.
pub(crate) fn plan_mutation(
    account: Option<(Money, AccountStatus)>,
    mutation: &WalletMutation,
) -> Result<Money, WalletError> {
    if !mutation.amount.is_positive() {
        return Err(WalletError::InvalidAmount);
    }

    let (before, status) =
        account.ok_or_else(|| WalletError::UnknownUser(mutation.user_id.clone()))?;

    match status {
        AccountStatus::Active => {}
        AccountStatus::Frozen => return Err(WalletError::AccountFrozen),
        AccountStatus::Disabled => return Err(WalletError::AccountDisabled),
    }

    if mutation.transaction_type.is_inflow() {
        before
            .checked_add(mutation.amount)
            .map_err(|_| WalletError::Overflow)
    } else {
        let after = before
            .checked_sub(mutation.amount)
            .map_err(|_| WalletError::Overflow)?;
        if after.is_negative() {
            return Err(WalletError::InsufficientBalance);
        }
        Ok(after)
    }
}

type EntryKey = (WalletTxType, String);

#[derive(Default)]
struct WalletState {
    accounts: HashMap<String, WalletBalance>,
    entries: HashMap<EntryKey, WalletLedgerEntry>,
    rejections: HashMap<EntryKey, String>,
}

/// In-memory wallet ledger. One lock covers balances, entries and
/// rejections, which gives the same atomicity as a database transaction.
#[derive(Default)]
pub struct InMemoryWalletLedger {
    state: Mutex<WalletState>,
    unavailable: AtomicBool,
}

impl InMemoryWalletLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a store outage: every call fails with `DatabaseError`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn rejection(&self, tx_type: WalletTxType, reference_id: &str) -> Option<String> {
        let state = self.state.lock().await;
        state
            .rejections
            .get(&(tx_type, reference_id.to_string()))
            .cloned()
    }

    fn check_available(&self) -> Result<(), WalletError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(WalletError::DatabaseError("wallet store unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl WalletLedger for InMemoryWalletLedger {
    async fn open_account(&self, user_id: &str) -> Result<WalletBalance, WalletError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .entry(user_id.to_string())
            .or_insert_with(|| WalletBalance::open(user_id));
        Ok(account.clone())
    }

    async fn set_status(&self, user_id: &str, status: AccountStatus) -> Result<(), WalletError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(user_id)
            .ok_or_else(|| WalletError::UnknownUser(user_id.to_string()))?;
        account.status = status;
        account.updated_at = Utc::now();
        Ok(())
    }

    async fn balance(&self, user_id: &str) -> Result<Option<WalletBalance>, WalletError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.accounts.get(user_id).cloned())
    }

    async fn find_entry(
        &self,
        tx_type: WalletTxType,
        reference_id: &str,
    ) -> Result<Option<WalletLedgerEntry>, WalletError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.entries.get(&(tx_type, reference_id.to_string())).cloned())
    }

    async fn apply(&self, mutation: &WalletMutation) -> Result<MutationResult, WalletError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let key = (mutation.transaction_type, mutation.reference_id.clone());

        if let Some(existing) = state.entries.get(&key) {
            return Ok(MutationResult::AlreadyApplied(existing.clone()));
        }
        if let Some(code) = state.rejections.get(&key) {
            return Err(WalletError::PreviouslyRejected(code.clone()));
        }

        let account = state
            .accounts
            .get(&mutation.user_id)
            .map(|a| (a.balance, a.status));

        let after = match plan_mutation(account, mutation) {
            Ok(after) => after,
            Err(e) => {
                state.rejections.insert(key, e.code().to_string());
                return Err(e);
            }
        };

        let now = Utc::now();
        let Some(account) = state.accounts.get_mut(&mutation.user_id) else {
            return Err(WalletError::UnknownUser(mutation.user_id.clone()));
        };
        let before = account.balance;
        account.balance = after;
        account.updated_at = now;

        let entry = WalletLedgerEntry {
            reference_id: mutation.reference_id.clone(),
            transaction_type: mutation.transaction_type,
            user_id: mutation.user_id.clone(),
            amount: mutation.amount,
            balance_before: before,
            balance_after: after,
            created_at: now,
        };
        state.entries.insert(key, entry.clone());
        Ok(MutationResult::Applied(entry))
    }

    async fn entries_for_user(&self, user_id: &str) -> Result<Vec<WalletLedgerEntry>, WalletError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut entries: Vec<WalletLedgerEntry> = state
            .entries
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    fn debit(user: &str, reference: &str, amount: i64) -> WalletMutation {
        WalletMutation {
            user_id: user.into(),
            transaction_type: WalletTxType::Debit,
            reference_id: reference.into(),
            amount: Money::new(amount),
        }
    }

    #[test]
    fn test_plan_rejects_non_positive_amount() {
        let m = WalletMutation::credit("u-1", "s-1", Money::ZERO);
        assert_eq!(
            plan_mutation(Some((Money::ZERO, AccountStatus::Active)), &m),
            Err(WalletError::InvalidAmount)
        );
    }

    #[test]
    fn test_plan_account_status() {
        let m = WalletMutation::credit("u-1", "s-1", Money::new(5));
        assert_eq!(
            plan_mutation(Some((Money::ZERO, AccountStatus::Frozen)), &m),
            Err(WalletError::AccountFrozen)
        );
        assert_eq!(
            plan_mutation(Some((Money::ZERO, AccountStatus::Disabled)), &m),
            Err(WalletError::AccountDisabled)
        );
        assert!(matches!(plan_mutation(None, &m), Err(WalletError::UnknownUser(_))));
    }

    #[test]
    fn test_plan_overflow() {
        let m = WalletMutation::credit("u-1", "s-1", Money::new(1));
        assert_eq!(
            plan_mutation(Some((Money::new(i64::MAX), AccountStatus::Active)), &m),
            Err(WalletError::Overflow)
        );
    }

    #[tokio::test]
    async fn test_credit_applies_once() {
        let ledger = InMemoryWalletLedger::new();
        ledger.open_account("u-1").await.unwrap();
        let m = WalletMutation::credit("u-1", "s-1", Money::new(9_900));

        let first = ledger.apply(&m).await.unwrap();
        assert!(first.is_applied());
        assert_eq!(first.entry().balance_before, Money::ZERO);
        assert_eq!(first.entry().balance_after, Money::new(9_900));

        let second = ledger.apply(&m).await.unwrap();
        assert!(!second.is_applied());
        assert_eq!(second.entry(), first.entry());

        let balance = ledger.balance("u-1").await.unwrap().unwrap();
        assert_eq!(balance.balance, Money::new(9_900));
        assert_eq!(ledger.entries_for_user("u-1").await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_credits_same_reference() {
        let ledger = Arc::new(InMemoryWalletLedger::new());
        ledger.open_account("u-1").await.unwrap();
        let barrier = Arc::new(Barrier::new(16));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                ledger
                    .apply(&WalletMutation::credit("u-1", "s-1", Money::new(100)))
                    .await
                    .unwrap()
                    .is_applied()
            }));
        }
        let mut applied = 0;
        for h in handles {
            if h.await.unwrap() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        let balance = ledger.balance("u-1").await.unwrap().unwrap();
        assert_eq!(balance.balance, Money::new(100));
    }

    #[tokio::test]
    async fn test_debit_cannot_go_negative() {
        let ledger = InMemoryWalletLedger::new();
        ledger.open_account("u-1").await.unwrap();
        ledger
            .apply(&WalletMutation::credit("u-1", "s-1", Money::new(50)))
            .await
            .unwrap();

        assert_eq!(
            ledger.apply(&debit("u-1", "w-1", 80)).await,
            Err(WalletError::InsufficientBalance)
        );
        let ok = ledger.apply(&debit("u-1", "w-2", 50)).await.unwrap();
        assert_eq!(ok.entry().balance_after, Money::ZERO);
    }

    #[tokio::test]
    async fn test_rejection_is_replayed() {
        let ledger = InMemoryWalletLedger::new();
        ledger.open_account("u-1").await.unwrap();
        ledger.set_status("u-1", AccountStatus::Frozen).await.unwrap();
        let m = WalletMutation::credit("u-1", "s-1", Money::new(10));

        assert_eq!(ledger.apply(&m).await, Err(WalletError::AccountFrozen));

        // Unfreezing does not change the verdict for the same reference
        ledger.set_status("u-1", AccountStatus::Active).await.unwrap();
        assert_eq!(
            ledger.apply(&m).await,
            Err(WalletError::PreviouslyRejected("ACCOUNT_FROZEN".into()))
        );
        assert_eq!(
            ledger.rejection(WalletTxType::Credit, "s-1").await.as_deref(),
            Some("ACCOUNT_FROZEN")
        );
        assert_eq!(
            ledger.balance("u-1").await.unwrap().unwrap().balance,
            Money::ZERO
        );
    }

    #[tokio::test]
    async fn test_unavailable_store_is_transient() {
        let ledger = InMemoryWalletLedger::new();
        ledger.set_unavailable(true);
        let err = ledger
            .apply(&WalletMutation::credit("u-1", "s-1", Money::new(10)))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        ledger.set_unavailable(false);
        assert!(ledger.rejection(WalletTxType::Credit, "s-1").await.is_none());
    }
}
