//! Event Transport
//!
//! [`EventPublisher`] is the seam to the external broker. [`InMemoryBus`] is
//! the in-process stand-in used by the binary and the tests: one bounded
//! `mpsc` channel per topic, at-least-once (the consumer redelivers on retry),
//! no exactly-once and no cross-topic ordering.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use super::error::TransportError;
use super::types::{Delivery, SagaEvent, Topic};

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Hand an envelope to the transport (first delivery or redelivery)
    async fn deliver(&self, delivery: Delivery) -> Result<(), TransportError>;

    /// Publish a fresh event
    async fn publish(&self, event: SagaEvent) -> Result<(), TransportError> {
        self.deliver(Delivery::new(event)).await
    }
}

/// Topic-routed in-process bus
pub struct InMemoryBus {
    senders: DashMap<Topic, mpsc::Sender<Delivery>>,
    receivers: DashMap<Topic, mpsc::Receiver<Delivery>>,
}

impl InMemoryBus {
    /// Create the bus with one channel of `capacity` per topic
    pub fn new(capacity: usize) -> Self {
        let senders = DashMap::new();
        let receivers = DashMap::new();
        for topic in Topic::ALL {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            senders.insert(topic, tx);
            receivers.insert(topic, rx);
        }
        Self { senders, receivers }
    }

    /// Take the receiving side of a topic. Each topic has exactly one consumer group.
    pub fn subscribe(&self, topic: Topic) -> Result<Subscription, TransportError> {
        let (_, rx) = self
            .receivers
            .remove(&topic)
            .ok_or(TransportError::AlreadySubscribed(topic))?;
        Ok(Subscription { topic, rx })
    }
}

#[async_trait]
impl EventPublisher for InMemoryBus {
    async fn deliver(&self, delivery: Delivery) -> Result<(), TransportError> {
        let topic = delivery.topic();
        // Clone the sender so no shard lock is held across the await
        let tx = self
            .senders
            .get(&topic)
            .map(|s| s.clone())
            .ok_or(TransportError::NoSubscriber(topic))?;

        debug!(
            topic = %topic,
            event = delivery.event.name(),
            key = %delivery.event.key(),
            attempt = delivery.attempt,
            "Delivering event"
        );
        tx.send(delivery)
            .await
            .map_err(|_| TransportError::ChannelClosed(topic))
    }
}

/// Receiving side of one topic
pub struct Subscription {
    topic: Topic,
    rx: mpsc::Receiver<Delivery>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Receive the next delivery (blocks until available or the bus is dropped)
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}

/// Publisher that records every event instead of sending it
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<SagaEvent>>,
    fail: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection: publish fails with `ChannelClosed` while set
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<SagaEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn deliver(&self, delivery: Delivery) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed(delivery.topic()));
        }
        if let Ok(mut events) = self.events.lock() {
            events.push(delivery.event);
        }
        Ok(())
    }
}
