//! Saga Event Payloads
//!
//! Wire format is JSON with a `type` tag. Field names are camelCase so the
//! payloads match what the purchase and wallet services publish.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::money::Money;
use crate::settlement::types::{PaymentMethodClass, SettlementId};

/// Purchase confirmed: start a settlement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementCreated {
    pub source_transaction_id: String,
    pub user_id: String,
    pub gross_amount: Money,
    pub payment_method_class: PaymentMethodClass,
}

/// Fee computed, READY committed: credit the wallet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReady {
    pub settlement_id: SettlementId,
    pub user_id: String,
    pub net_amount: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementCompleted {
    pub settlement_id: SettlementId,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementFailed {
    pub settlement_id: SettlementId,
    pub user_id: String,
    /// Machine code, e.g. `ACCOUNT_FROZEN`
    pub reason: String,
}

/// Logical topic; one consumer group per topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    SettlementCreated,
    SettlementReady,
    /// Completed and Failed share a topic so the reconciler sees them in one stream
    SettlementOutcome,
}

impl Topic {
    pub const ALL: [Topic; 3] = [
        Topic::SettlementCreated,
        Topic::SettlementReady,
        Topic::SettlementOutcome,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::SettlementCreated => "settlement.created",
            Topic::SettlementReady => "settlement.ready",
            Topic::SettlementOutcome => "settlement.outcome",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SagaEvent {
    SettlementCreated(SettlementCreated),
    SettlementReady(SettlementReady),
    SettlementCompleted(SettlementCompleted),
    SettlementFailed(SettlementFailed),
}

impl SagaEvent {
    pub fn topic(&self) -> Topic {
        match self {
            SagaEvent::SettlementCreated(_) => Topic::SettlementCreated,
            SagaEvent::SettlementReady(_) => Topic::SettlementReady,
            SagaEvent::SettlementCompleted(_) | SagaEvent::SettlementFailed(_) => {
                Topic::SettlementOutcome
            }
        }
    }

    /// Partition key: the business identifier the handler serializes on
    pub fn key(&self) -> String {
        match self {
            SagaEvent::SettlementCreated(e) => e.source_transaction_id.clone(),
            SagaEvent::SettlementReady(e) => e.settlement_id.to_string(),
            SagaEvent::SettlementCompleted(e) => e.settlement_id.to_string(),
            SagaEvent::SettlementFailed(e) => e.settlement_id.to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SagaEvent::SettlementCreated(_) => "SettlementCreated",
            SagaEvent::SettlementReady(_) => "SettlementReady",
            SagaEvent::SettlementCompleted(_) => "SettlementCompleted",
            SagaEvent::SettlementFailed(_) => "SettlementFailed",
        }
    }
}

impl From<SettlementCreated> for SagaEvent {
    fn from(e: SettlementCreated) -> Self {
        SagaEvent::SettlementCreated(e)
    }
}

impl From<SettlementReady> for SagaEvent {
    fn from(e: SettlementReady) -> Self {
        SagaEvent::SettlementReady(e)
    }
}

impl From<SettlementCompleted> for SagaEvent {
    fn from(e: SettlementCompleted) -> Self {
        SagaEvent::SettlementCompleted(e)
    }
}

impl From<SettlementFailed> for SagaEvent {
    fn from(e: SettlementFailed) -> Self {
        SagaEvent::SettlementFailed(e)
    }
}

/// Transport envelope. `attempt` starts at 1 and grows on every redelivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub event_id: Uuid,
    pub attempt: u32,
    pub first_published_at: DateTime<Utc>,
    pub event: SagaEvent,
}

impl Delivery {
    pub fn new(event: SagaEvent) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            attempt: 1,
            first_published_at: Utc::now(),
            event,
        }
    }

    /// Same event, next attempt
    pub fn redelivery(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }

    pub fn topic(&self) -> Topic {
        self.event.topic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_wire_format() {
        let json = r#"{
            "type": "SettlementCreated",
            "sourceTransactionId": "oi-1",
            "userId": "u-1",
            "grossAmount": 30000,
            "paymentMethodClass": "CARD_ONLY"
        }"#;
        let event: SagaEvent = serde_json::from_str(json).unwrap();
        let SagaEvent::SettlementCreated(created) = &event else {
            panic!("wrong variant: {:?}", event);
        };
        assert_eq!(created.source_transaction_id, "oi-1");
        assert_eq!(created.gross_amount, Money::new(30_000));
        assert_eq!(created.payment_method_class, PaymentMethodClass::CardOnly);
        assert_eq!(event.topic(), Topic::SettlementCreated);
        assert_eq!(event.key(), "oi-1");
    }

    #[test]
    fn test_outcomes_share_topic() {
        let id = SettlementId::new();
        let done: SagaEvent = SettlementCompleted { settlement_id: id, user_id: "u-1".into() }.into();
        let failed: SagaEvent = SettlementFailed {
            settlement_id: id,
            user_id: "u-1".into(),
            reason: "UNKNOWN_USER".into(),
        }
        .into();
        assert_eq!(done.topic(), Topic::SettlementOutcome);
        assert_eq!(failed.topic(), Topic::SettlementOutcome);
        assert_eq!(done.key(), failed.key());
    }

    #[test]
    fn test_redelivery_keeps_identity() {
        let ready: SagaEvent = SettlementReady {
            settlement_id: SettlementId::new(),
            user_id: "u-1".into(),
            net_amount: Money::new(29_100),
        }
        .into();
        let first = Delivery::new(ready);
        let second = first.redelivery();
        assert_eq!(second.event_id, first.event_id);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.event, first.event);
    }
}
