//! PostgreSQL Settlement Ledger
//!
//! `settlements_tb` with UNIQUE (source_transaction_id). All status writes
//! are compare-and-swap on the current status column.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::error::SettlementError;
use super::ledger::{InsertOutcome, SettlementLedger, TerminalUpdate};
use super::state::SettlementStatus;
use super::types::{PaymentMethodClass, Settlement, SettlementId};
use crate::money::Money;

const SELECT_COLUMNS: &str = r#"
    SELECT settlement_id, source_transaction_id, user_id, gross_amount, fee, net_amount,
           payment_method_class, status, failure_reason, settled_at, reemit_count,
           created_at, updated_at
    FROM settlements_tb
"#;

pub struct PgSettlementLedger {
    pool: PgPool,
}

impl PgSettlementLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_where(
        &self,
        clause: &str,
        value: &str,
    ) -> Result<Option<Settlement>, SettlementError> {
        let sql = format!("{} WHERE {} = $1", SELECT_COLUMNS, clause);
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    fn row_to_record(row: &PgRow) -> Result<Settlement, SettlementError> {
        let id_str: String = row.try_get("settlement_id")?;
        let id: SettlementId = id_str
            .parse()
            .map_err(|_| SettlementError::SystemError(format!("Invalid settlement_id: {}", id_str)))?;

        let status_id: i16 = row.try_get("status")?;
        let status = SettlementStatus::from_id(status_id)
            .ok_or_else(|| SettlementError::SystemError(format!("Invalid status ID: {}", status_id)))?;

        let class_id: i16 = row.try_get("payment_method_class")?;
        let payment_method_class = PaymentMethodClass::from_id(class_id).ok_or_else(|| {
            SettlementError::SystemError(format!("Invalid payment_method_class: {}", class_id))
        })?;

        let fee: Option<i64> = row.try_get("fee")?;
        let net_amount: Option<i64> = row.try_get("net_amount")?;
        let reemit_count: i32 = row.try_get("reemit_count")?;

        Ok(Settlement {
            id,
            source_transaction_id: row.try_get("source_transaction_id")?,
            user_id: row.try_get("user_id")?,
            gross_amount: Money::new(row.try_get("gross_amount")?),
            fee: fee.map(Money::new),
            net_amount: net_amount.map(Money::new),
            payment_method_class,
            status,
            failure_reason: row.try_get("failure_reason")?,
            settled_at: row.try_get("settled_at")?,
            reemit_count: reemit_count.max(0) as u32,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl SettlementLedger for PgSettlementLedger {
    async fn insert_pending(&self, settlement: &Settlement) -> Result<InsertOutcome, SettlementError> {
        let row = sqlx::query(
            r#"
            INSERT INTO settlements_tb
                (settlement_id, source_transaction_id, user_id, gross_amount,
                 payment_method_class, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            ON CONFLICT (source_transaction_id) DO NOTHING
            RETURNING settlement_id, source_transaction_id, user_id, gross_amount, fee, net_amount,
                      payment_method_class, status, failure_reason, settled_at, reemit_count,
                      created_at, updated_at
            "#,
        )
        .bind(settlement.id.to_string())
        .bind(&settlement.source_transaction_id)
        .bind(&settlement.user_id)
        .bind(*settlement.gross_amount)
        .bind(settlement.payment_method_class.id())
        .bind(SettlementStatus::Pending.id())
        .bind(settlement.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(InsertOutcome::Created(Self::row_to_record(&row)?));
        }

        // Lost the race (or a redelivery): the winner's row is committed
        self.get_by_source(&settlement.source_transaction_id)
            .await?
            .map(InsertOutcome::Existing)
            .ok_or_else(|| {
                SettlementError::SystemError(format!(
                    "conflict on {} but no row found",
                    settlement.source_transaction_id
                ))
            })
    }

    async fn get(&self, id: SettlementId) -> Result<Option<Settlement>, SettlementError> {
        self.fetch_one_where("settlement_id", &id.to_string()).await
    }

    async fn get_by_source(
        &self,
        source_transaction_id: &str,
    ) -> Result<Option<Settlement>, SettlementError> {
        self.fetch_one_where("source_transaction_id", source_transaction_id)
            .await
    }

    async fn mark_ready(
        &self,
        id: SettlementId,
        fee: Money,
        net_amount: Money,
    ) -> Result<bool, SettlementError> {
        let result = sqlx::query(
            r#"
            UPDATE settlements_tb
            SET status = $1, fee = $2, net_amount = $3, updated_at = NOW()
            WHERE settlement_id = $4 AND status = $5
            "#,
        )
        .bind(SettlementStatus::Ready.id())
        .bind(*fee)
        .bind(*net_amount)
        .bind(id.to_string())
        .bind(SettlementStatus::Pending.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_terminal(
        &self,
        id: SettlementId,
        update: &TerminalUpdate,
    ) -> Result<bool, SettlementError> {
        let (settled_at, reason) = match update {
            TerminalUpdate::Completed { settled_at } => (Some(*settled_at), None),
            TerminalUpdate::Failed { reason } => (None, Some(reason.as_str())),
        };

        let result = sqlx::query(
            r#"
            UPDATE settlements_tb
            SET status = $1, settled_at = $2, failure_reason = $3, updated_at = NOW()
            WHERE settlement_id = $4 AND status = $5
            "#,
        )
        .bind(update.status().id())
        .bind(settled_at)
        .bind(reason)
        .bind(id.to_string())
        .bind(SettlementStatus::Ready.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_reemit(&self, id: SettlementId) -> Result<Option<u32>, SettlementError> {
        let count: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE settlements_tb
            SET reemit_count = reemit_count + 1, updated_at = NOW()
            WHERE settlement_id = $1 AND status = $2
            RETURNING reemit_count
            "#,
        )
        .bind(id.to_string())
        .bind(SettlementStatus::Ready.id())
        .fetch_optional(&self.pool)
        .await?;

        Ok(count.map(|c| c.max(0) as u32))
    }

    async fn find_stale(
        &self,
        threshold: Duration,
        max_reemits: u32,
        limit: usize,
    ) -> Result<Vec<Settlement>, SettlementError> {
        let sql = format!(
            "{} WHERE (status = $1 OR (status = $2 AND reemit_count < $3)) \
             AND updated_at < NOW() - INTERVAL '1 second' * $4 \
             ORDER BY updated_at ASC LIMIT $5",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(SettlementStatus::Pending.id())
            .bind(SettlementStatus::Ready.id())
            .bind(i32::try_from(max_reemits).unwrap_or(i32::MAX))
            .bind(threshold.as_secs() as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db::Database;

    async fn ledger() -> Option<PgSettlementLedger> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let db = Database::connect(&url).await.ok()?;
        db.migrate().await.ok()?;
        Some(PgSettlementLedger::new(db.pool().clone()))
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_pg_concurrent_insert_single_row() {
        let Some(ledger) = ledger().await else {
            return;
        };
        let ledger = Arc::new(ledger);
        let source = format!("line-{}", uuid::Uuid::new_v4());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            let source = source.clone();
            handles.push(tokio::spawn(async move {
                let s = Settlement::pending(
                    source,
                    "u-1",
                    Money::new(30_000),
                    PaymentMethodClass::CardOnly,
                );
                ledger.insert_pending(&s).await.unwrap()
            }));
        }

        let mut created = 0;
        let mut ids = std::collections::HashSet::new();
        for h in handles {
            let outcome = h.await.unwrap();
            if outcome.is_created() {
                created += 1;
            }
            ids.insert(outcome.settlement().id);
        }
        assert_eq!(created, 1);
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_pg_status_cas() {
        let Some(ledger) = ledger().await else {
            return;
        };
        let s = Settlement::pending(
            format!("line-{}", uuid::Uuid::new_v4()),
            "u-1",
            Money::new(10_000),
            PaymentMethodClass::WalletOnly,
        );
        ledger.insert_pending(&s).await.unwrap();

        assert!(ledger.mark_ready(s.id, Money::new(100), Money::new(9_900)).await.unwrap());
        assert!(!ledger.mark_ready(s.id, Money::new(100), Money::new(9_900)).await.unwrap());
        assert_eq!(ledger.record_reemit(s.id).await.unwrap(), Some(1));

        let done = TerminalUpdate::Completed {
            settled_at: chrono::Utc::now(),
        };
        assert!(ledger.mark_terminal(s.id, &done).await.unwrap());
        let failed = TerminalUpdate::Failed {
            reason: "ACCOUNT_FROZEN".into(),
        };
        assert!(!ledger.mark_terminal(s.id, &failed).await.unwrap());

        let stored = ledger.get(s.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SettlementStatus::Completed);
        assert!(stored.settled_at.is_some());
        assert!(stored.failure_reason.is_none());
        assert_eq!(stored.reemit_count, 1);
        assert_eq!(ledger.record_reemit(s.id).await.unwrap(), None);
    }
}
