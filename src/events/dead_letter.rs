//! Dead Letters
//!
//! Deliveries that used up their retry budget land here for manual
//! intervention. `requeue` puts one back on the bus with a fresh attempt
//! counter; handlers are idempotent so a requeue is always safe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use super::error::TransportError;
use super::transport::EventPublisher;
use super::types::{Delivery, Topic};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub topic: Topic,
    pub delivery: Delivery,
    pub last_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(delivery: Delivery, last_error: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: delivery.topic(),
            delivery,
            last_error: last_error.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn store(&self, letter: DeadLetter) -> Result<(), TransportError>;

    /// Most recent first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>, TransportError>;

    /// Remove and return a dead letter
    async fn take(&self, id: Uuid) -> Result<Option<DeadLetter>, TransportError>;
}

/// Republish a dead letter as a fresh delivery (attempt 1).
///
/// If the publish fails the letter is stored back.
pub async fn requeue(
    sink: &dyn DeadLetterSink,
    publisher: &dyn EventPublisher,
    id: Uuid,
) -> Result<(), TransportError> {
    let letter = sink
        .take(id)
        .await?
        .ok_or_else(|| TransportError::DeadLetterNotFound(id.to_string()))?;

    let fresh = Delivery {
        attempt: 1,
        ..letter.delivery.clone()
    };

    if let Err(e) = publisher.deliver(fresh).await {
        warn!(dead_letter_id = %id, error = %e, "Requeue failed, restoring dead letter");
        sink.store(letter).await?;
        return Err(e);
    }

    info!(
        dead_letter_id = %id,
        topic = %letter.topic,
        event_id = %letter.delivery.event_id,
        "Dead letter requeued"
    );
    Ok(())
}

#[derive(Default)]
pub struct InMemoryDeadLetters {
    letters: DashMap<Uuid, DeadLetter>,
}

impl InMemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.letters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.letters.is_empty()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetters {
    async fn store(&self, letter: DeadLetter) -> Result<(), TransportError> {
        self.letters.insert(letter.id, letter);
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>, TransportError> {
        let mut all: Vec<DeadLetter> = self.letters.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| b.dead_lettered_at.cmp(&a.dead_lettered_at));
        all.truncate(limit);
        Ok(all)
    }

    async fn take(&self, id: Uuid) -> Result<Option<DeadLetter>, TransportError> {
        Ok(self.letters.remove(&id).map(|(_, letter)| letter))
    }
}

/// PostgreSQL dead-letter table (`saga_dead_letters_tb`)
pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_letter(row: &sqlx::postgres::PgRow) -> Result<DeadLetter, TransportError> {
        let delivery: serde_json::Value = row.try_get("delivery")?;
        let delivery: Delivery = serde_json::from_value(delivery)?;
        Ok(DeadLetter {
            id: row.try_get("id")?,
            topic: delivery.topic(),
            delivery,
            last_error: row.try_get("last_error")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
        })
    }
}

#[async_trait]
impl DeadLetterSink for PgDeadLetterStore {
    async fn store(&self, letter: DeadLetter) -> Result<(), TransportError> {
        let delivery = serde_json::to_value(&letter.delivery)?;
        sqlx::query(
            r#"
            INSERT INTO saga_dead_letters_tb
                (id, topic, event_id, attempts, delivery, last_error, dead_lettered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(letter.id)
        .bind(letter.topic.as_str())
        .bind(letter.delivery.event_id)
        .bind(letter.delivery.attempt as i32)
        .bind(delivery)
        .bind(&letter.last_error)
        .bind(letter.dead_lettered_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>, TransportError> {
        let rows = sqlx::query(
            r#"
            SELECT id, delivery, last_error, dead_lettered_at
            FROM saga_dead_letters_tb
            ORDER BY dead_lettered_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_letter).collect()
    }

    async fn take(&self, id: Uuid) -> Result<Option<DeadLetter>, TransportError> {
        let row = sqlx::query(
            r#"
            DELETE FROM saga_dead_letters_tb
            WHERE id = $1
            RETURNING id, delivery, last_error, dead_lettered_at
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_letter).transpose()
    }
}
