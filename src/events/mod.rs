//! Saga Events and Transport Plumbing
//!
//! Every hop of the saga crosses a service boundary as a one-way event:
//!
//! ```text
//! SettlementCreated ─▶ intake + fee engine ─▶ SettlementReady
//! SettlementReady   ─▶ wallet crediting    ─▶ SettlementCompleted | SettlementFailed
//! outcome           ─▶ reconciler
//! ```
//!
//! The transport is at-least-once. Handlers return a [`Disposition`]; the
//! [`consumer`] turns it into ack / redelivery with backoff / dead letter.

pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod retry;
pub mod transport;
pub mod types;

pub use consumer::{Consumer, ConsumerStats, ConsumerStatsSnapshot, Dispatcher, Disposition, EventHandler};
pub use dead_letter::{DeadLetter, DeadLetterSink, InMemoryDeadLetters, PgDeadLetterStore, requeue};
pub use error::TransportError;
pub use retry::RetryPolicy;
pub use transport::{EventPublisher, InMemoryBus, RecordingPublisher, Subscription};
pub use types::{
    Delivery, SagaEvent, SettlementCompleted, SettlementCreated, SettlementFailed, SettlementReady,
    Topic,
};
