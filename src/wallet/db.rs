//! PostgreSQL Wallet Ledger
//!
//! Tables: `wallet_balances_tb`, `wallet_ledger_entries_tb`
//! (UNIQUE (transaction_type, reference_id)), `wallet_rejections_tb`.
//! Each `apply` runs in one transaction holding the balance row lock.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, warn};

use super::error::WalletError;
use super::ledger::{WalletLedger, plan_mutation};
use super::types::{
    AccountStatus, MutationResult, WalletBalance, WalletLedgerEntry, WalletMutation, WalletTxType,
};
use crate::money::Money;

pub struct PgWalletLedger {
    pool: PgPool,
}

impl PgWalletLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &PgRow) -> Result<WalletLedgerEntry, WalletError> {
        let tx_type: String = row.try_get("transaction_type")?;
        Ok(WalletLedgerEntry {
            reference_id: row.try_get("reference_id")?,
            transaction_type: tx_type
                .parse()
                .map_err(WalletError::DatabaseError)?,
            user_id: row.try_get("user_id")?,
            amount: Money::new(row.try_get("amount")?),
            balance_before: Money::new(row.try_get("balance_before")?),
            balance_after: Money::new(row.try_get("balance_after")?),
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_balance(row: &PgRow) -> Result<WalletBalance, WalletError> {
        let status: i16 = row.try_get("status")?;
        Ok(WalletBalance {
            user_id: row.try_get("user_id")?,
            balance: Money::new(row.try_get("balance")?),
            status: AccountStatus::from_id(status).ok_or_else(|| {
                WalletError::DatabaseError(format!("invalid account status: {}", status))
            })?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn entry_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        tx_type: WalletTxType,
        reference_id: &str,
    ) -> Result<Option<WalletLedgerEntry>, WalletError> {
        let row = sqlx::query(
            r#"
            SELECT reference_id, transaction_type, user_id, amount,
                   balance_before, balance_after, created_at
            FROM wallet_ledger_entries_tb
            WHERE transaction_type = $1 AND reference_id = $2
            "#,
        )
        .bind(tx_type.as_str())
        .bind(reference_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn rejection_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        tx_type: WalletTxType,
        reference_id: &str,
    ) -> Result<Option<String>, WalletError> {
        let row = sqlx::query(
            "SELECT reason FROM wallet_rejections_tb WHERE transaction_type = $1 AND reference_id = $2",
        )
        .bind(tx_type.as_str())
        .bind(reference_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.map(|r| r.try_get::<String, _>("reason")).transpose()?)
    }

    /// Record a rejection and commit. First writer wins.
    async fn reject(
        mut tx: Transaction<'_, Postgres>,
        mutation: &WalletMutation,
        err: WalletError,
    ) -> Result<MutationResult, WalletError> {
        sqlx::query(
            r#"
            INSERT INTO wallet_rejections_tb (transaction_type, reference_id, user_id, reason, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (transaction_type, reference_id) DO NOTHING
            "#,
        )
        .bind(mutation.transaction_type.as_str())
        .bind(&mutation.reference_id)
        .bind(&mutation.user_id)
        .bind(err.code())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Err(err)
    }
}

#[async_trait]
impl WalletLedger for PgWalletLedger {
    async fn open_account(&self, user_id: &str) -> Result<WalletBalance, WalletError> {
        sqlx::query(
            r#"
            INSERT INTO wallet_balances_tb (user_id, balance, status, updated_at)
            VALUES ($1, 0, $2, NOW())
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(AccountStatus::Active.id())
        .execute(&self.pool)
        .await?;

        self.balance(user_id)
            .await?
            .ok_or_else(|| WalletError::UnknownUser(user_id.to_string()))
    }

    async fn set_status(&self, user_id: &str, status: AccountStatus) -> Result<(), WalletError> {
        let result = sqlx::query(
            "UPDATE wallet_balances_tb SET status = $1, updated_at = NOW() WHERE user_id = $2",
        )
        .bind(status.id())
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WalletError::UnknownUser(user_id.to_string()));
        }
        Ok(())
    }

    async fn balance(&self, user_id: &str) -> Result<Option<WalletBalance>, WalletError> {
        let row = sqlx::query(
            "SELECT user_id, balance, status, updated_at FROM wallet_balances_tb WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_balance).transpose()
    }

    async fn find_entry(
        &self,
        tx_type: WalletTxType,
        reference_id: &str,
    ) -> Result<Option<WalletLedgerEntry>, WalletError> {
        let row = sqlx::query(
            r#"
            SELECT reference_id, transaction_type, user_id, amount,
                   balance_before, balance_after, created_at
            FROM wallet_ledger_entries_tb
            WHERE transaction_type = $1 AND reference_id = $2
            "#,
        )
        .bind(tx_type.as_str())
        .bind(reference_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn apply(&self, mutation: &WalletMutation) -> Result<MutationResult, WalletError> {
        let mut tx = self.pool.begin().await?;

        // Lock the balance row first: concurrent mutations for the same user
        // (and therefore the same reference) serialize here.
        let account = sqlx::query(
            "SELECT balance, status FROM wallet_balances_tb WHERE user_id = $1 FOR UPDATE",
        )
        .bind(&mutation.user_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| -> Result<(Money, AccountStatus), WalletError> {
            let status: i16 = row.try_get("status")?;
            let status = AccountStatus::from_id(status).ok_or_else(|| {
                WalletError::DatabaseError(format!("invalid account status: {}", status))
            })?;
            Ok((Money::new(row.try_get("balance")?), status))
        })
        .transpose()?;

        if let Some(existing) =
            Self::entry_in_tx(&mut tx, mutation.transaction_type, &mutation.reference_id).await?
        {
            tx.commit().await?;
            debug!(reference_id = %mutation.reference_id, tx_type = %mutation.transaction_type, "Wallet mutation already applied");
            return Ok(MutationResult::AlreadyApplied(existing));
        }

        if let Some(code) =
            Self::rejection_in_tx(&mut tx, mutation.transaction_type, &mutation.reference_id).await?
        {
            tx.commit().await?;
            return Err(WalletError::PreviouslyRejected(code));
        }

        let after = match plan_mutation(account, mutation) {
            Ok(after) => after,
            Err(e) => {
                warn!(
                    reference_id = %mutation.reference_id,
                    user_id = %mutation.user_id,
                    code = e.code(),
                    "Wallet mutation rejected"
                );
                return Self::reject(tx, mutation, e).await;
            }
        };
        let before = account.map(|(b, _)| b).unwrap_or(Money::ZERO);

        let inserted = sqlx::query(
            r#"
            INSERT INTO wallet_ledger_entries_tb
                (reference_id, transaction_type, user_id, amount, balance_before, balance_after, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (transaction_type, reference_id) DO NOTHING
            RETURNING reference_id, transaction_type, user_id, amount,
                      balance_before, balance_after, created_at
            "#,
        )
        .bind(&mutation.reference_id)
        .bind(mutation.transaction_type.as_str())
        .bind(&mutation.user_id)
        .bind(*mutation.amount)
        .bind(*before)
        .bind(*after)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            // Same reference applied under a different user's row lock
            tx.rollback().await?;
            return self
                .find_entry(mutation.transaction_type, &mutation.reference_id)
                .await?
                .map(MutationResult::AlreadyApplied)
                .ok_or_else(|| {
                    WalletError::DatabaseError("ledger entry conflict without row".into())
                });
        };
        let entry = Self::row_to_entry(&row)?;

        sqlx::query(
            "UPDATE wallet_balances_tb SET balance = $1, updated_at = NOW() WHERE user_id = $2",
        )
        .bind(*after)
        .bind(&mutation.user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(MutationResult::Applied(entry))
    }

    async fn entries_for_user(&self, user_id: &str) -> Result<Vec<WalletLedgerEntry>, WalletError> {
        let rows = sqlx::query(
            r#"
            SELECT reference_id, transaction_type, user_id, amount,
                   balance_before, balance_after, created_at
            FROM wallet_ledger_entries_tb
            WHERE user_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn ledger() -> Option<PgWalletLedger> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let db = Database::connect(&url).await.ok()?;
        db.migrate().await.ok()?;
        Some(PgWalletLedger::new(db.pool().clone()))
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_pg_credit_idempotent() {
        let Some(ledger) = ledger().await else {
            return;
        };
        let user = format!("u-{}", uuid::Uuid::new_v4());
        let reference = uuid::Uuid::new_v4().to_string();
        ledger.open_account(&user).await.unwrap();

        let m = WalletMutation::credit(&user, &reference, Money::new(9_900));
        assert!(ledger.apply(&m).await.unwrap().is_applied());
        assert!(!ledger.apply(&m).await.unwrap().is_applied());

        let balance = ledger.balance(&user).await.unwrap().unwrap();
        assert_eq!(balance.balance, Money::new(9_900));
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_pg_frozen_rejection_replayed() {
        let Some(ledger) = ledger().await else {
            return;
        };
        let user = format!("u-{}", uuid::Uuid::new_v4());
        let reference = uuid::Uuid::new_v4().to_string();
        ledger.open_account(&user).await.unwrap();
        ledger.set_status(&user, AccountStatus::Frozen).await.unwrap();

        let m = WalletMutation::credit(&user, &reference, Money::new(10));
        assert_eq!(ledger.apply(&m).await, Err(WalletError::AccountFrozen));
        ledger.set_status(&user, AccountStatus::Active).await.unwrap();
        assert_eq!(
            ledger.apply(&m).await,
            Err(WalletError::PreviouslyRejected("ACCOUNT_FROZEN".into()))
        );
    }
}
