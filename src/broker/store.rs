//! Persistence for retained messages and offline queues
//!
//! The router only talks to [`PersistenceStore`]; [`MemoryStore`] keeps
//! everything in process memory and is the default.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::message::Message;
use crate::protocol::QoS;
use crate::topic;

/// Last retained message of a topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetainedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    /// Unix time in seconds
    pub stored_at: u64,
}

impl RetainedMessage {
    pub fn new(topic: impl Into<String>, payload: Bytes, qos: QoS) -> Self {
        let stored_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            topic: topic.into(),
            payload,
            qos,
            stored_at,
        }
    }

    /// Message handed to a new subscriber, retain flag set
    pub fn to_message(&self) -> Message {
        Message::new(self.topic.clone(), self.payload.clone(), self.qos, true)
    }
}

/// Storage collaborator of the router.
///
/// Methods are called from the router without awaiting, some of them while
/// the routing table is locked; implementations must not block on I/O.
pub trait PersistenceStore: Send + Sync {
    fn retained(&self, topic: &str) -> Option<RetainedMessage>;

    /// Retained messages whose topic matches `filter`
    fn retained_matching(&self, filter: &str) -> Vec<RetainedMessage>;

    /// Replace the retained message of its topic
    fn put_retained(&self, message: RetainedMessage);

    fn delete_retained(&self, topic: &str);

    /// Queue a message for a persistent client that is offline
    fn push_offline(&self, client_id: &str, message: Message);

    /// Remove and return the offline queue of a client, oldest first
    fn take_offline(&self, client_id: &str) -> Vec<Message>;

    /// Forget the offline queue of a client
    fn purge_offline(&self, client_id: &str);
}

/// In-memory [`PersistenceStore`]
#[derive(Debug)]
pub struct MemoryStore {
    retained: Mutex<HashMap<String, RetainedMessage>>,
    offline: Mutex<HashMap<String, VecDeque<Message>>>,
    offline_limit: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_offline_limit(crate::config::DEFAULT_QUEUE_CAPACITY)
    }
}

impl MemoryStore {
    /// Store keeping at most `limit` offline messages per client
    pub fn with_offline_limit(limit: usize) -> Self {
        Self {
            retained: Mutex::new(HashMap::new()),
            offline: Mutex::new(HashMap::new()),
            offline_limit: limit.max(1),
        }
    }

    pub fn retained_count(&self) -> usize {
        lock(&self.retained).len()
    }

    pub fn offline_count(&self, client_id: &str) -> usize {
        lock(&self.offline).get(client_id).map_or(0, VecDeque::len)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PersistenceStore for MemoryStore {
    fn retained(&self, topic: &str) -> Option<RetainedMessage> {
        lock(&self.retained).get(topic).cloned()
    }

    fn retained_matching(&self, filter: &str) -> Vec<RetainedMessage> {
        let mut found: Vec<RetainedMessage> = lock(&self.retained)
            .values()
            .filter(|m| topic::matches(filter, &m.topic))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.topic.cmp(&b.topic));
        found
    }

    fn put_retained(&self, message: RetainedMessage) {
        lock(&self.retained).insert(message.topic.clone(), message);
    }

    fn delete_retained(&self, topic: &str) {
        lock(&self.retained).remove(topic);
    }

    fn push_offline(&self, client_id: &str, message: Message) {
        let mut offline = lock(&self.offline);
        let queue = offline.entry(client_id.to_string()).or_default();
        if queue.len() >= self.offline_limit {
            queue.pop_front();
            warn!(
                "offline queue of {} full, dropped oldest message",
                client_id
            );
        }
        queue.push_back(message);
    }

    fn take_offline(&self, client_id: &str) -> Vec<Message> {
        lock(&self.offline)
            .remove(client_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    fn purge_offline(&self, client_id: &str) {
        lock(&self.offline).remove(client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retained_replace_and_match() {
        let store = MemoryStore::default();
        store.put_retained(RetainedMessage::new("a/b", Bytes::from_static(b"1"), QoS::AtMostOnce));
        store.put_retained(RetainedMessage::new("a/b", Bytes::from_static(b"2"), QoS::AtLeastOnce));
        store.put_retained(RetainedMessage::new("a/c", Bytes::from_static(b"3"), QoS::AtMostOnce));
        store.put_retained(RetainedMessage::new("$SYS/x", Bytes::from_static(b"4"), QoS::AtMostOnce));

        assert_eq!(store.retained_count(), 3);
        assert_eq!(store.retained("a/b").unwrap().payload, Bytes::from_static(b"2"));

        let topics: Vec<_> = store
            .retained_matching("#")
            .into_iter()
            .map(|m| m.topic)
            .collect();
        assert_eq!(topics, vec!["a/b", "a/c"]);

        store.delete_retained("a/b");
        assert!(store.retained("a/b").is_none());
    }

    #[test]
    fn test_offline_queue_is_bounded() {
        let store = MemoryStore::with_offline_limit(2);
        for n in 0..3u8 {
            store.push_offline("c1", Message::new("t", vec![n], QoS::AtLeastOnce, false));
        }
        assert_eq!(store.offline_count("c1"), 2);

        let taken = store.take_offline("c1");
        assert_eq!(taken[0].payload, Bytes::from(vec![1u8]));
        assert_eq!(store.offline_count("c1"), 0);
    }
}
