//! In-memory topic bus with per-subscriber bounded queues.
//!
//! Two instances back the server: one keyed by hex drop-box ID (`String`)
//! and one keyed by user ID (`i64`).  Both are the same generic type; the
//! topic spaces never meet.
//!
//! Delivery policy is **blocking publish**: [`PubSub::publish`] waits on any
//! subscriber whose queue is full, back-pressuring the publisher rather than
//! dropping items.  Per (topic, subscriber), items arrive in publish order.
//! Queues on different topics never serialise with each other.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// Capacity of each subscriber's FIFO queue.  Small on purpose: a subscriber
/// that falls this far behind holds up its publishers until it catches up.
pub const SUBSCRIPTION_QUEUE_CAPACITY: usize = 5;

struct TopicEntry {
    id: u64,
    tx: mpsc::Sender<Vec<u8>>,
}

/// A subscriber's handle to one topic: a bounded FIFO queue of published
/// items plus the registry ID used to unsubscribe.
///
/// Dropping the handle alone leaves a dead entry in the topic table; call
/// [`PubSub::unsubscribe`] when done.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Subscription {
    /// Registry ID of this subscription, passed to [`PubSub::unsubscribe`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next published item.  Returns `None` once the
    /// subscription has been removed from its topic and the queue drained:
    /// the subscription is gone and the consumer should exit its loop.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// Topic multiplexer.  Cheap to clone; clones share the topic table.
pub struct PubSub<K> {
    topics: Arc<Mutex<HashMap<K, Vec<TopicEntry>>>>,
    next_id: Arc<AtomicU64>,
}

impl<K> Clone for PubSub<K> {
    fn clone(&self) -> Self {
        Self {
            topics: Arc::clone(&self.topics),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<K: Eq + Hash + Clone> PubSub<K> {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a new subscriber on `topic`.  Every call yields an
    /// independent handle with its own queue.
    pub fn subscribe(&self, topic: K) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut topics = self.topics.lock().expect("pubsub topic table poisoned");
        topics.entry(topic).or_default().push(TopicEntry { id, tx });
        Subscription { id, rx }
    }

    /// Remove subscription `sub_id` from `topic` and close its queue.  The
    /// subscriber drains whatever was already queued, then sees
    /// end-of-stream.  Unknown topic or ID is a no-op, so calling this twice
    /// is harmless.
    pub fn unsubscribe(&self, topic: &K, sub_id: u64) {
        let mut topics = self.topics.lock().expect("pubsub topic table poisoned");
        if let Some(entries) = topics.get_mut(topic) {
            entries.retain(|entry| entry.id != sub_id);
            if entries.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Deliver `item` to every current subscriber of `topic`.  Waits on any
    /// full queue (blocking-publish policy).  Subscribers that unsubscribe
    /// mid-delivery simply miss the item.
    pub async fn publish(&self, item: Vec<u8>, topic: &K) {
        // Clone the senders out of the lock so a slow subscriber on this
        // topic cannot stall subscribes or publishes elsewhere.
        let senders: Vec<mpsc::Sender<Vec<u8>>> = {
            let topics = self.topics.lock().expect("pubsub topic table poisoned");
            match topics.get(topic) {
                Some(entries) => entries.iter().map(|entry| entry.tx.clone()).collect(),
                None => return,
            }
        };

        for tx in senders {
            let _ = tx.send(item.clone()).await;
        }
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &K) -> usize {
        let topics = self.topics.lock().expect("pubsub topic table poisoned");
        topics.get(topic).map(Vec::len).unwrap_or(0)
    }
}

impl<K: Eq + Hash + Clone> Default for PubSub<K> {
    fn default() -> Self {
        Self::new()
    }
}
