//! In-process message bus
//!
//! Each subscription owns an unbounded channel and a delivery task. The
//! task runs handler invocations concurrently (bounded by a semaphore) and
//! schedules a redelivery for every nack, so delivery order is not preserved
//! and a message may be seen more than once, like a real broker.
//!
//! Every successful publish is also kept in a log, which tests and the
//! simulation use to observe the coordinator's output.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{BusError, Message, MessageBus, MessageHandler};
use crate::config::BusConfig;

/// State shared between the bus handle and its delivery tasks.
struct Shared {
    config: BusConfig,
    subscribers: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>,
    published: Mutex<Vec<Message>>,
    dead_letters: Mutex<Vec<Message>>,
    /// Deliveries not yet acknowledged or dead-lettered
    in_flight: AtomicUsize,
    fail_next: AtomicU32,
    changed: Notify,
    cancel: CancellationToken,
}

impl Shared {
    fn settle(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }
}

pub struct InMemoryBus {
    shared: Arc<Shared>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl InMemoryBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                subscribers: RwLock::new(HashMap::new()),
                published: Mutex::new(Vec::new()),
                dead_letters: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                fail_next: AtomicU32::new(0),
                changed: Notify::new(),
                cancel: CancellationToken::new(),
            }),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    /// Make the next `n` publishes fail with a transport error.
    pub fn fail_next_publishes(&self, n: u32) {
        self.shared.fail_next.store(n, Ordering::SeqCst);
    }

    /// Messages successfully published on `topic`, in publish order.
    pub fn published(&self, topic: &str) -> Vec<Message> {
        self.shared
            .published
            .lock()
            .map(|log| log.iter().filter(|m| m.topic == topic).cloned().collect())
            .unwrap_or_default()
    }

    /// Decoded payloads published on `topic`. Undecodable ones are skipped.
    pub fn published_payloads<T: DeserializeOwned>(&self, topic: &str) -> Vec<T> {
        self.published(topic)
            .iter()
            .filter_map(|m| m.decode().ok())
            .collect()
    }

    /// Number of publishes across all topics.
    pub fn published_count(&self) -> usize {
        self.shared.published.lock().map(|log| log.len()).unwrap_or(0)
    }

    /// Messages dropped after exhausting their redeliveries.
    pub fn dead_letters(&self) -> Vec<Message> {
        self.shared
            .dead_letters
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    /// Wait until `topic` has seen at least `count` publishes.
    pub async fn wait_for(&self, topic: &str, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.published(topic).len() >= count)
            .await
    }

    /// Wait until every delivery has been acknowledged or dead-lettered.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.shared.in_flight.load(Ordering::SeqCst) == 0)
            .await
    }

    async fn wait_until<F: Fn() -> bool>(&self, timeout: Duration, done: F) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if done() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return done();
            }
        }
    }

    /// Stop every delivery task. Later publishes fail with `Closed`.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Bus delivery task ended abnormally");
            }
        }
        if let Ok(mut subscribers) = self.shared.subscribers.write() {
            subscribers.clear();
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let shared = &self.shared;
        if shared.cancel.is_cancelled() {
            return Err(BusError::Closed);
        }
        let injected = shared
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BusError::Transport(format!("injected fault publishing to {topic}")));
        }

        let message = Message::new(topic, payload);
        let senders = shared
            .subscribers
            .read()
            .map_err(|e| BusError::Transport(e.to_string()))?
            .get(topic)
            .cloned()
            .unwrap_or_default();

        for sender in &senders {
            shared.in_flight.fetch_add(1, Ordering::SeqCst);
            if sender.send(message.clone()).is_err() {
                shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                debug!(topic, "Subscriber gone, delivery skipped");
            }
        }

        shared
            .published
            .lock()
            .map_err(|e| BusError::Transport(e.to_string()))?
            .push(message);
        shared.changed.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BusError> {
        if self.shared.cancel.is_cancelled() {
            return Err(BusError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .subscribers
            .write()
            .map_err(|e| BusError::Transport(e.to_string()))?
            .entry(topic.to_string())
            .or_default()
            .push(tx.clone());

        let shared = Arc::clone(&self.shared);
        let topic = topic.to_string();
        self.tasks
            .lock()
            .await
            .spawn(deliver(topic, rx, tx, handler, shared));
        Ok(())
    }
}

/// Delivery loop for one subscription.
async fn deliver(
    topic: String,
    mut rx: mpsc::UnboundedReceiver<Message>,
    redeliver_tx: mpsc::UnboundedSender<Message>,
    handler: Arc<dyn MessageHandler>,
    shared: Arc<Shared>,
) {
    let permits = Arc::new(Semaphore::new(shared.config.max_concurrent_handlers.max(1)));
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            Some(message) = rx.recv() => {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let handler = Arc::clone(&handler);
                let shared = Arc::clone(&shared);
                let redeliver_tx = redeliver_tx.clone();
                running.spawn(async move {
                    let outcome = handler.handle(&message).await;
                    drop(permit);
                    match outcome {
                        Ok(()) => shared.settle(),
                        Err(nack) => schedule_redelivery(message, &nack.reason, redeliver_tx, &shared),
                    }
                });
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    error!(topic = %topic, error = %e, "Message handler panicked");
                }
            }
        }
    }

    running.shutdown().await;
    debug!(topic = %topic, "Delivery task stopped");
}

fn schedule_redelivery(
    message: Message,
    reason: &str,
    redeliver_tx: mpsc::UnboundedSender<Message>,
    shared: &Arc<Shared>,
) {
    let max = shared.config.max_redeliveries;
    if message.delivery_attempt > max {
        error!(
            topic = %message.topic,
            message_id = %message.id,
            deliveries = message.delivery_attempt,
            reason,
            "Message dead-lettered after exhausting redeliveries"
        );
        if let Ok(mut dead) = shared.dead_letters.lock() {
            dead.push(message);
        }
        shared.settle();
        return;
    }

    debug!(
        topic = %message.topic,
        message_id = %message.id,
        delivery = message.delivery_attempt,
        reason,
        "Message nacked, scheduling redelivery"
    );
    let delay = Duration::from_millis(shared.config.redelivery_delay_ms);
    let cancel = shared.cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                let _ = redeliver_tx.send(message.redelivery());
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Nack;

    struct Counting {
        seen: AtomicUsize,
        nack_first: u32,
    }

    #[async_trait]
    impl MessageHandler for Counting {
        async fn handle(&self, message: &Message) -> Result<(), Nack> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if message.delivery_attempt <= self.nack_first {
                return Err(Nack::new("not yet"));
            }
            Ok(())
        }
    }

    fn fast_config(max_redeliveries: u32) -> BusConfig {
        BusConfig {
            max_concurrent_handlers: 4,
            redelivery_delay_ms: 1,
            max_redeliveries,
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = InMemoryBus::new(fast_config(3));
        let a = Arc::new(Counting { seen: AtomicUsize::new(0), nack_first: 0 });
        let b = Arc::new(Counting { seen: AtomicUsize::new(0), nack_first: 0 });
        bus.subscribe("t", a.clone()).await.unwrap();
        bus.subscribe("t", b.clone()).await.unwrap();

        bus.publish("t", b"1".to_vec()).await.unwrap();
        bus.publish("other", b"2".to_vec()).await.unwrap();
        assert!(bus.wait_idle(Duration::from_secs(2)).await);

        assert_eq!(a.seen.load(Ordering::SeqCst), 1);
        assert_eq!(b.seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.published_count(), 2);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_nack_is_redelivered() {
        let bus = InMemoryBus::new(fast_config(5));
        let handler = Arc::new(Counting { seen: AtomicUsize::new(0), nack_first: 2 });
        bus.subscribe("t", handler.clone()).await.unwrap();

        bus.publish("t", Vec::new()).await.unwrap();
        assert!(bus.wait_idle(Duration::from_secs(2)).await);

        assert_eq!(handler.seen.load(Ordering::SeqCst), 3);
        assert!(bus.dead_letters().is_empty());
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_redeliveries() {
        let bus = InMemoryBus::new(fast_config(2));
        let handler = Arc::new(Counting { seen: AtomicUsize::new(0), nack_first: u32::MAX });
        bus.subscribe("t", handler.clone()).await.unwrap();

        bus.publish("t", Vec::new()).await.unwrap();
        assert!(bus.wait_idle(Duration::from_secs(2)).await);

        // First delivery plus two redeliveries
        assert_eq!(handler.seen.load(Ordering::SeqCst), 3);
        assert_eq!(bus.dead_letters().len(), 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_injected_faults_are_not_logged() {
        let bus = InMemoryBus::default();
        bus.fail_next_publishes(1);
        assert!(matches!(
            bus.publish("t", Vec::new()).await,
            Err(BusError::Transport(_))
        ));
        bus.publish("t", Vec::new()).await.unwrap();
        assert_eq!(bus.published("t").len(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let bus = InMemoryBus::default();
        assert!(!bus.wait_for("t", 1, Duration::from_millis(20)).await);
    }
}
