//! Consumer Loop
//!
//! Pulls deliveries for one topic and runs them through an [`EventHandler`]
//! with bounded concurrency. The handler only says what happened
//! ([`Disposition`]); acknowledgement, redelivery with backoff and
//! dead-lettering are decided here, in one place.
//!
//! ```text
//! Ack    → acknowledged
//! Reject → acknowledged, logged (terminal application error)
//! Retry  → redelivered after backoff, dead-lettered once attempts run out
//! ```
//!
//! Pending redeliveries are tracked. On shutdown any still waiting out their
//! backoff are written to the dead-letter sink instead of being dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::dead_letter::{DeadLetter, DeadLetterSink};
use super::retry::RetryPolicy;
use super::transport::{EventPublisher, Subscription};
use super::types::{Delivery, SagaEvent};

/// What a handler wants done with a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Processed (or already processed): acknowledge
    Ack,
    /// Terminal application error: log and acknowledge, never redeliver
    Reject(String),
    /// Transient failure: do not acknowledge, redeliver later
    Retry(String),
}

impl Disposition {
    #[inline]
    pub fn is_ack(&self) -> bool {
        matches!(self, Disposition::Ack)
    }

    #[inline]
    pub fn is_retry(&self) -> bool {
        matches!(self, Disposition::Retry(_))
    }
}

/// A saga step. Must be idempotent: the same event may arrive many times,
/// concurrently, and out of order.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &SagaEvent) -> Disposition;
}

/// Per-consumer counters
#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub acked: AtomicU64,
    pub rejected: AtomicU64,
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumerStatsSnapshot {
    pub acked: u64,
    pub rejected: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            acked: self.acked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Applies a handler's disposition: ack, redeliver or dead-letter
pub struct Dispatcher {
    handler: Arc<dyn EventHandler>,
    transport: Arc<dyn EventPublisher>,
    dead_letters: Arc<dyn DeadLetterSink>,
    policy: RetryPolicy,
    stats: Arc<ConsumerStats>,
    redeliveries: Mutex<JoinSet<()>>,
    closing: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn new(
        handler: Arc<dyn EventHandler>,
        transport: Arc<dyn EventPublisher>,
        dead_letters: Arc<dyn DeadLetterSink>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            handler,
            transport,
            dead_letters,
            policy,
            stats: Arc::new(ConsumerStats::default()),
            redeliveries: Mutex::new(JoinSet::new()),
            closing: watch::channel(false).0,
        }
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    /// Process one delivery to completion and return the handler's verdict
    pub async fn dispatch(&self, delivery: Delivery) -> Disposition {
        let disposition = self.handler.handle(&delivery.event).await;

        match &disposition {
            Disposition::Ack => {
                debug!(
                    handler = self.handler.name(),
                    event_id = %delivery.event_id,
                    key = %delivery.event.key(),
                    "Delivery acknowledged"
                );
                self.stats.acked.fetch_add(1, Ordering::Relaxed);
            }
            Disposition::Reject(reason) => {
                warn!(
                    handler = self.handler.name(),
                    event_id = %delivery.event_id,
                    event = delivery.event.name(),
                    key = %delivery.event.key(),
                    reason = %reason,
                    "Delivery rejected (acknowledged, not retried)"
                );
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            }
            Disposition::Retry(reason) => self.retry_or_dead_letter(delivery, reason).await,
        }

        disposition
    }

    async fn retry_or_dead_letter(&self, delivery: Delivery, reason: &str) {
        if self.policy.is_exhausted(delivery.attempt) {
            error!(
                handler = self.handler.name(),
                event_id = %delivery.event_id,
                event = delivery.event.name(),
                key = %delivery.event.key(),
                attempts = delivery.attempt,
                reason = %reason,
                "Retry budget exhausted, dead-lettering"
            );
            match self
                .dead_letters
                .store(DeadLetter::new(delivery.clone(), reason))
                .await
            {
                Ok(()) => {
                    self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                // Never drop an event: keep redelivering until the DLQ accepts it
                Err(e) => error!(
                    event_id = %delivery.event_id,
                    error = %e,
                    "Dead letter store failed, redelivering instead"
                ),
            }
        }

        let delay = self.policy.backoff(delivery.attempt);
        debug!(
            handler = self.handler.name(),
            event_id = %delivery.event_id,
            attempt = delivery.attempt,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Scheduling redelivery"
        );
        self.stats.retried.fetch_add(1, Ordering::Relaxed);

        let transport = self.transport.clone();
        let dead_letters = self.dead_letters.clone();
        let stats = self.stats.clone();
        let mut closing = self.closing.subscribe();
        let next = delivery.redelivery();
        let reason = reason.to_string();

        let mut redeliveries = self.redeliveries.lock().await;
        while redeliveries.try_join_next().is_some() {}
        redeliveries.spawn(async move {
            let interrupted = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = closing.wait_for(|closed| *closed) => true,
            };
            let last_error = if interrupted {
                format!("shutdown before redelivery: {}", reason)
            } else {
                match transport.deliver(next.clone()).await {
                    Ok(()) => return,
                    Err(e) => format!("redelivery failed: {}", e),
                }
            };
            park(dead_letters.as_ref(), &stats, next, last_error).await;
        });
    }

    /// Redelivery tasks scheduled and not yet joined
    pub async fn pending_redeliveries(&self) -> usize {
        self.redeliveries.lock().await.len()
    }

    /// Stop scheduling: every redelivery still waiting out its backoff is
    /// dead-lettered now. Waits until all of them are stored.
    pub async fn close(&self) {
        self.closing.send_replace(true);
        let mut redeliveries = std::mem::take(&mut *self.redeliveries.lock().await);
        while let Some(joined) = redeliveries.join_next().await {
            if let Err(e) = joined {
                error!(handler = self.handler.name(), error = %e, "Redelivery task failed");
            }
        }
    }
}

async fn park(
    dead_letters: &dyn DeadLetterSink,
    stats: &ConsumerStats,
    delivery: Delivery,
    last_error: String,
) {
    warn!(
        event_id = %delivery.event_id,
        event = delivery.event.name(),
        key = %delivery.event.key(),
        attempt = delivery.attempt,
        reason = %last_error,
        "Redelivery not possible, dead-lettering"
    );
    let event_id = delivery.event_id;
    match dead_letters.store(DeadLetter::new(delivery, last_error)).await {
        Ok(()) => {
            stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => error!(event_id = %event_id, error = %e, "Dead letter store failed, event lost"),
    }
}

/// Long-running consumer for one topic
pub struct Consumer {
    subscription: Subscription,
    dispatcher: Arc<Dispatcher>,
    max_in_flight: usize,
}

impl Consumer {
    pub fn new(subscription: Subscription, dispatcher: Dispatcher, max_in_flight: usize) -> Self {
        Self {
            subscription,
            dispatcher: Arc::new(dispatcher),
            max_in_flight: max_in_flight.max(1),
        }
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.dispatcher.stats()
    }

    /// Run until `shutdown` flips to true (or the transport closes), then
    /// wait for in-flight deliveries to finish.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ConsumerStatsSnapshot {
        let topic = self.subscription.topic();
        let handler = self.dispatcher.handler.name();
        info!(topic = %topic, handler, max_in_flight = self.max_in_flight, "Starting consumer");

        let permits = Arc::new(Semaphore::new(self.max_in_flight));

        loop {
            let delivery = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                delivery = self.subscription.recv() => delivery,
            };

            let Some(delivery) = delivery else {
                warn!(topic = %topic, "Transport closed");
                break;
            };

            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                dispatcher.dispatch(delivery).await;
                drop(permit);
            });
        }

        // Drain: every permit back means nothing is in flight
        let _ = permits.acquire_many(self.max_in_flight as u32).await;
        self.dispatcher.close().await;

        let stats = self.dispatcher.stats.snapshot();
        info!(topic = %topic, handler, ?stats, "Consumer stopped");
        stats
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::events::dead_letter::InMemoryDeadLetters;
    use crate::events::transport::InMemoryBus;
    use crate::events::types::{SettlementCompleted, Topic};
    use crate::settlement::types::SettlementId;

    /// Returns the scripted dispositions in order, then Ack
    struct ScriptedHandler {
        script: Mutex<Vec<Disposition>>,
        calls: AtomicU64,
    }

    impl ScriptedHandler {
        fn new(mut script: Vec<Disposition>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl EventHandler for ScriptedHandler {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn handle(&self, _event: &SagaEvent) -> Disposition {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().unwrap().pop().unwrap_or(Disposition::Ack)
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2,
            jitter: false,
        }
    }

    fn completed() -> SagaEvent {
        SettlementCompleted {
            settlement_id: SettlementId::new(),
            user_id: "u-1".into(),
        }
        .into()
    }

    #[tokio::test]
    async fn test_reject_is_acknowledged_without_retry() {
        let bus = Arc::new(InMemoryBus::new(8));
        let mut sub = bus.subscribe(Topic::SettlementOutcome).unwrap();
        let dlq = Arc::new(InMemoryDeadLetters::new());
        let handler = Arc::new(ScriptedHandler::new(vec![Disposition::Reject("bad".into())]));
        let dispatcher = Dispatcher::new(handler.clone(), bus.clone(), dlq.clone(), fast_policy(3));

        let result = dispatcher.dispatch(Delivery::new(completed())).await;
        assert_eq!(result, Disposition::Reject("bad".into()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sub.try_recv().is_none());
        assert_eq!(dispatcher.stats().snapshot().rejected, 1);
    }

    #[tokio::test]
    async fn test_retry_redelivers_with_next_attempt() {
        let bus = Arc::new(InMemoryBus::new(8));
        let mut sub = bus.subscribe(Topic::SettlementOutcome).unwrap();
        let dlq = Arc::new(InMemoryDeadLetters::new());
        let handler = Arc::new(ScriptedHandler::new(vec![Disposition::Retry("db down".into())]));
        let dispatcher = Dispatcher::new(handler, bus.clone(), dlq.clone(), fast_policy(3));

        let first = Delivery::new(completed());
        dispatcher.dispatch(first.clone()).await;

        let again = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.event_id, first.event_id);
        assert_eq!(again.attempt, 2);
        assert!(dlq.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_go_to_dead_letters() {
        let bus = Arc::new(InMemoryBus::new(8));
        let dlq = Arc::new(InMemoryDeadLetters::new());
        let handler = Arc::new(ScriptedHandler::new(vec![Disposition::Retry("db down".into())]));
        let dispatcher = Dispatcher::new(handler, bus.clone(), dlq.clone(), fast_policy(3));

        let mut last = Delivery::new(completed());
        last.attempt = 3;
        dispatcher.dispatch(last.clone()).await;

        let letters = dlq.list(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].delivery.event_id, last.event_id);
        assert_eq!(letters[0].last_error, "db down");
        assert_eq!(dispatcher.stats().snapshot().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_close_dead_letters_pending_redeliveries() {
        let bus = Arc::new(InMemoryBus::new(8));
        let mut sub = bus.subscribe(Topic::SettlementOutcome).unwrap();
        let dlq = Arc::new(InMemoryDeadLetters::new());
        let handler = Arc::new(ScriptedHandler::new(vec![Disposition::Retry("db down".into())]));
        let slow = RetryPolicy {
            initial_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
            ..fast_policy(3)
        };
        let dispatcher = Dispatcher::new(handler, bus.clone(), dlq.clone(), slow);

        let first = Delivery::new(completed());
        dispatcher.dispatch(first.clone()).await;
        assert_eq!(dispatcher.pending_redeliveries().await, 1);

        tokio::time::timeout(Duration::from_secs(5), dispatcher.close())
            .await
            .unwrap();

        let letters = dlq.list(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].delivery.event_id, first.event_id);
        assert_eq!(letters[0].delivery.attempt, 2);
        assert!(letters[0].last_error.contains("db down"));
        assert_eq!(dispatcher.pending_redeliveries().await, 0);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_consumer_shutdown_keeps_pending_redelivery() {
        let bus = Arc::new(InMemoryBus::new(8));
        let sub = bus.subscribe(Topic::SettlementOutcome).unwrap();
        let dlq = Arc::new(InMemoryDeadLetters::new());
        let handler = Arc::new(ScriptedHandler::new(vec![Disposition::Retry("db down".into())]));
        let slow = RetryPolicy {
            initial_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
            ..fast_policy(3)
        };
        let dispatcher = Dispatcher::new(handler.clone(), bus.clone(), dlq.clone(), slow);
        let consumer = Consumer::new(sub, dispatcher, 2);
        let (stop_tx, stop_rx) = watch::channel(false);
        let running = tokio::spawn(consumer.run(stop_rx));

        bus.publish(completed()).await.unwrap();
        for _ in 0..100 {
            if handler.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop_tx.send(true).unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stats.retried, 1);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(dlq.len(), 1);
    }

    #[tokio::test]
    async fn test_consumer_loop_retries_until_dead_letter() {
        let bus = Arc::new(InMemoryBus::new(8));
        let sub = bus.subscribe(Topic::SettlementOutcome).unwrap();
        let dlq = Arc::new(InMemoryDeadLetters::new());
        let handler = Arc::new(ScriptedHandler::new(vec![
            Disposition::Retry("1".into()),
            Disposition::Retry("2".into()),
            Disposition::Retry("3".into()),
        ]));
        let dispatcher = Dispatcher::new(handler.clone(), bus.clone(), dlq.clone(), fast_policy(3));
        let consumer = Consumer::new(sub, dispatcher, 2);
        let (stop_tx, stop_rx) = watch::channel(false);
        let running = tokio::spawn(consumer.run(stop_rx));

        bus.publish(completed()).await.unwrap();

        for _ in 0..100 {
            if !dlq.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop_tx.send(true).unwrap();
        let stats = running.await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(dlq.len(), 1);
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.dead_lettered, 1);
    }
}
