use thiserror::Error;

use super::types::Topic;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No subscriber for topic {0}")]
    NoSubscriber(Topic),

    #[error("Topic {0} already has a subscriber")]
    AlreadySubscribed(Topic),

    #[error("Channel closed for topic {0}")]
    ChannelClosed(Topic),

    #[error("Dead letter store error: {0}")]
    DeadLetterStore(String),

    #[error("Dead letter not found: {0}")]
    DeadLetterNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for TransportError {
    fn from(e: sqlx::Error) -> Self {
        TransportError::DeadLetterStore(e.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Serialization(e.to_string())
    }
}
