//! Subscription table and retained-message store
//!
//! Maps topic names to their subscriber sets and holds the last retained
//! payload per topic. This is the only state shared between connection
//! tasks; every operation serializes against concurrent mutation through
//! the table lock.
//!
//! Topic matching is exact, plus the literal `"#"` topic which receives a
//! copy of every published message. Level wildcards are not supported.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::warn;

use crate::broker::SharedWriter;
use crate::protocol::QoS;

/// The global-wildcard topic: subscribers receive every published message.
pub const GLOBAL_WILDCARD: &str = "#";

/// A subscriber entry for one topic.
///
/// Identity is the connection id alone; the writer is a handle sufficient
/// to append outbound bytes and never owns the transport.
#[derive(Debug, Clone)]
pub struct Subscriber {
    /// Connection id (unique per accepted connection)
    pub conn_id: u64,
    /// Granted QoS
    pub qos: QoS,
    /// Outbound write handle for the connection
    pub writer: Arc<SharedWriter>,
}

/// Thread-safe subscription table plus retained-message store.
pub struct SubscriptionStore {
    topics: RwLock<AHashMap<String, Vec<Subscriber>>>,
    retained: DashMap<String, Bytes>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(AHashMap::new()),
            retained: DashMap::new(),
        }
    }

    /// Add a subscription. Re-subscribing replaces the existing record
    /// for that connection; a topic never holds two records for one
    /// connection.
    pub fn subscribe(&self, topic: &str, subscriber: Subscriber) {
        let mut topics = self.topics.write();
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| s.conn_id != subscriber.conn_id);
            subs.push(subscriber);
        } else {
            topics.insert(topic.to_string(), vec![subscriber]);
        }
    }

    /// Remove a subscription. No-op when the connection was not
    /// subscribed to the topic.
    pub fn unsubscribe(&self, topic: &str, conn_id: u64) -> bool {
        let mut topics = self.topics.write();
        if let Some(subs) = topics.get_mut(topic) {
            let len_before = subs.len();
            subs.retain(|s| s.conn_id != conn_id);
            subs.len() != len_before
        } else {
            false
        }
    }

    /// Remove a connection's records from every topic. Used on disconnect
    /// and connection loss; empty topic entries are left in place.
    pub fn remove_connection(&self, conn_id: u64) {
        let mut topics = self.topics.write();
        for subs in topics.values_mut() {
            subs.retain(|s| s.conn_id != conn_id);
        }
    }

    /// Deliver an encoded frame to every subscriber of the exact topic,
    /// then to every `"#"` subscriber not already covered. Returns the
    /// number of subscribers the frame was handed to.
    ///
    /// A closed writer is logged and skipped; it never aborts delivery to
    /// the remaining subscribers.
    pub fn publish(&self, topic: &str, frame: &Bytes) -> usize {
        let targets = self.match_subscribers(topic);

        let mut delivered = 0;
        for sub in &targets {
            match sub.writer.append(frame) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        "failed to deliver to subscriber {} of '{}': {}",
                        sub.conn_id, topic, e
                    );
                }
            }
        }
        delivered
    }

    /// Snapshot the subscribers a publish to `topic` must reach, deduped
    /// by connection id. Taken under the read lock; delivery happens
    /// outside it.
    fn match_subscribers(&self, topic: &str) -> SmallVec<[Subscriber; 16]> {
        let topics = self.topics.read();
        let mut result: SmallVec<[Subscriber; 16]> = SmallVec::new();
        let mut seen: AHashSet<u64> = AHashSet::new();

        if let Some(subs) = topics.get(topic) {
            for sub in subs {
                if seen.insert(sub.conn_id) {
                    result.push(sub.clone());
                }
            }
        }

        if topic != GLOBAL_WILDCARD {
            if let Some(subs) = topics.get(GLOBAL_WILDCARD) {
                for sub in subs {
                    if seen.insert(sub.conn_id) {
                        result.push(sub.clone());
                    }
                }
            }
        }

        result
    }

    /// Store the last retained payload for a topic. An empty payload
    /// clears the entry.
    pub fn retain(&self, topic: &str, payload: Bytes) {
        if payload.is_empty() {
            self.retained.remove(topic);
        } else {
            self.retained.insert(topic.to_string(), payload);
        }
    }

    /// Last retained payload for a topic, if any.
    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        self.retained.get(topic).map(|p| p.value().clone())
    }

    /// Number of subscribers currently recorded for a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map_or(0, |s| s.len())
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}
