//! Topic-keyed in-process broadcast bus.
//!
//! Carries opaque byte payloads between a publisher (the backing sheet store)
//! and any number of subscribers (one per live sheet session). Closing a topic
//! drops its sender, which every current subscriber observes as
//! [`tokio::sync::broadcast::error::RecvError::Closed`]; that is how transport
//! failures are simulated in tests.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;

    /// Publishes to every current subscriber of `topic` and returns how many
    /// received the message. A topic nobody listens on simply yields 0.
    fn publish(&self, topic: &str, payload: Bytes) -> usize;

    /// Drops the topic's sender so live subscribers see the channel close.
    /// Returns `false` when the topic did not exist.
    fn close(&self, topic: &str) -> bool;

    fn subscriber_count(&self, topic: &str) -> usize;
}

/// In-memory bus backed by one `broadcast` channel per topic.
#[derive(Debug)]
pub struct LocalBus {
    capacity: usize,
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &str, payload: Bytes) -> usize {
        let Some(sender) = self.topics.read().get(topic).cloned() else {
            return 0;
        };
        // An error only means every receiver went away.
        sender
            .send(BusMessage {
                topic: topic.to_string(),
                payload,
            })
            .unwrap_or(0)
    }

    fn close(&self, topic: &str) -> bool {
        let removed = self.topics.write().remove(topic).is_some();
        if removed {
            debug!(target = "change.bus", topic, "closed bus topic");
        }
        removed
    }

    fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}
