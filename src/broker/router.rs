//! Subscription table and message fan-out
//!
//! One routing table shared by every connection task. All mutations happen
//! under a single lock that is never held across an `.await`; delivery only
//! pushes onto per-session queues.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use super::queue::{OutboundQueue, PushOutcome};
use super::store::{PersistenceStore, RetainedMessage};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::protocol::QoS;
use crate::topic::{self, validate_topic_filter, validate_topic_name};

/// Identifies one connection's registration; changes when a client reconnects
pub type SessionId = u64;

/// Result of [`Router::register`]
#[derive(Debug, Clone)]
pub struct Registration {
    pub session_id: SessionId,
    pub client_id: String,
    /// Deliveries for this session
    pub queue: Arc<OutboundQueue>,
    /// Stored state from a previous persistent session was resumed
    pub session_present: bool,
}

#[derive(Debug)]
struct ClientEntry {
    session_id: SessionId,
    /// `None` while a persistent client is offline
    queue: Option<Arc<OutboundQueue>>,
    persistent: bool,
}

#[derive(Debug, Default)]
struct RouterState {
    clients: HashMap<String, ClientEntry>,
    /// Online sessions, resolving a session to its client identifier
    sessions: HashMap<SessionId, String>,
    /// filter -> client_id -> granted QoS
    subscriptions: HashMap<String, HashMap<String, QoS>>,
    next_session_id: SessionId,
}

impl RouterState {
    fn client_of(&self, session_id: SessionId) -> Result<&str> {
        self.sessions
            .get(&session_id)
            .map(String::as_str)
            .ok_or(Error::ConnectionLost)
    }

    fn drop_subscriptions(&mut self, client_id: &str) {
        self.subscriptions.retain(|_, subscribers| {
            subscribers.remove(client_id);
            !subscribers.is_empty()
        });
    }
}

struct RouterInner {
    state: Mutex<RouterState>,
    store: Arc<dyn PersistenceStore>,
    max_qos: QoS,
    queue_capacity: usize,
}

/// Shared broker routing table. Cloning yields another handle to the same table.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("max_qos", &self.inner.max_qos)
            .field("queue_capacity", &self.inner.queue_capacity)
            .finish_non_exhaustive()
    }
}

impl Router {
    pub fn new(max_qos: QoS, queue_capacity: usize, store: Arc<dyn PersistenceStore>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                state: Mutex::new(RouterState::default()),
                store,
                max_qos,
                queue_capacity,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RouterState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &Arc<dyn PersistenceStore> {
        &self.inner.store
    }

    /// Attach a newly connected client.
    ///
    /// An existing session with the same client identifier is taken over: its
    /// queue is closed so its connection task terminates. A persistent
    /// session is resumed when both the old and the new connection asked for
    /// one; otherwise any stored state is discarded.
    pub fn register(&self, client_id: &str, clean_session: bool) -> Registration {
        let store = &self.inner.store;
        let queue = Arc::new(OutboundQueue::new(self.inner.queue_capacity));

        let mut state = self.state();
        state.next_session_id += 1;
        let session_id = state.next_session_id;

        let previous = state.clients.remove(client_id);
        let mut resumable = false;
        let mut undelivered = Vec::new();
        if let Some(previous) = previous {
            state.sessions.remove(&previous.session_id);
            if let Some(old_queue) = previous.queue {
                info!("client {} taken over by a new connection", client_id);
                old_queue.close();
                undelivered = old_queue.drain();
            }
            resumable = previous.persistent;
        }

        let session_present = resumable && !clean_session;
        if session_present {
            for message in store.take_offline(client_id).into_iter().chain(undelivered) {
                queue.push(message);
            }
        } else {
            state.drop_subscriptions(client_id);
            store.purge_offline(client_id);
        }

        state.clients.insert(
            client_id.to_string(),
            ClientEntry {
                session_id,
                queue: Some(Arc::clone(&queue)),
                persistent: !clean_session,
            },
        );
        state.sessions.insert(session_id, client_id.to_string());
        debug!(
            "registered {} as session {} (session present: {})",
            client_id, session_id, session_present
        );

        Registration {
            session_id,
            client_id: client_id.to_string(),
            queue,
            session_present,
        }
    }

    /// Detach a session. Persistent clients keep their subscriptions and
    /// collect messages offline, starting with whatever was still queued;
    /// clean ones are forgotten. A session that was already taken over is
    /// left alone.
    pub fn deregister(&self, session_id: SessionId) {
        let mut state = self.state();
        let Some(client_id) = state.sessions.remove(&session_id) else {
            return;
        };

        let (persistent, undelivered) = match state.clients.get_mut(&client_id) {
            Some(entry) if entry.session_id == session_id => {
                let undelivered = match entry.queue.take() {
                    Some(queue) => {
                        queue.close();
                        queue.drain()
                    }
                    None => Vec::new(),
                };
                (entry.persistent, undelivered)
            }
            _ => return,
        };

        if persistent {
            for message in undelivered {
                if message.qos > QoS::AtMostOnce {
                    self.inner.store.push_offline(&client_id, message);
                }
            }
        } else {
            state.clients.remove(&client_id);
            state.drop_subscriptions(&client_id);
        }
        debug!("deregistered session {} of {}", session_id, client_id);
    }

    /// Add or replace a subscription; returns the granted QoS.
    ///
    /// Retained messages matching the filter are queued for the session at once.
    pub fn subscribe(&self, session_id: SessionId, filter: &str, qos: QoS) -> Result<QoS> {
        validate_topic_filter(filter)?;
        let granted = qos.min(self.inner.max_qos);

        let queue = {
            let mut state = self.state();
            let client_id = state.client_of(session_id)?.to_string();
            state
                .subscriptions
                .entry(filter.to_string())
                .or_default()
                .insert(client_id.clone(), granted);
            state
                .clients
                .get(&client_id)
                .and_then(|entry| entry.queue.clone())
        };

        if let Some(queue) = queue {
            for retained in self.inner.store.retained_matching(filter) {
                let mut message = retained.to_message();
                message.qos = message.qos.min(granted);
                queue.push(message);
            }
        }
        Ok(granted)
    }

    /// Remove a subscription; returns whether it existed
    pub fn unsubscribe(&self, session_id: SessionId, filter: &str) -> Result<bool> {
        let mut state = self.state();
        let client_id = state.client_of(session_id)?.to_string();
        let Some(subscribers) = state.subscriptions.get_mut(filter) else {
            return Ok(false);
        };
        let removed = subscribers.remove(&client_id).is_some();
        if subscribers.is_empty() {
            state.subscriptions.remove(filter);
        }
        Ok(removed)
    }

    /// Route a message to every matching subscriber.
    ///
    /// Each subscriber receives it once, at the lower of the publish QoS and
    /// the highest QoS among its matching subscriptions. With `retain` set the
    /// message replaces the topic's retained message; an empty payload clears
    /// it. Returns the number of sessions the message was queued for, offline
    /// persistent sessions included.
    pub fn publish(
        &self,
        from: Option<SessionId>,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<usize> {
        validate_topic_name(topic)?;

        if retain {
            if payload.is_empty() {
                self.inner.store.delete_retained(topic);
                debug!("cleared retained message on {}", topic);
            } else {
                self.inner
                    .store
                    .put_retained(RetainedMessage::new(topic, payload.clone(), qos));
            }
        }

        let state = self.state();
        let mut targets: HashMap<&str, QoS> = HashMap::new();
        for (filter, subscribers) in &state.subscriptions {
            if !topic::matches(filter, topic) {
                continue;
            }
            for (client_id, granted) in subscribers {
                let best = targets.entry(client_id.as_str()).or_insert(*granted);
                *best = (*best).max(*granted);
            }
        }

        let mut delivered = 0;
        for (client_id, granted) in targets {
            let Some(entry) = state.clients.get(client_id) else {
                continue;
            };
            let message = Message::new(topic, payload.clone(), qos.min(granted), false);
            match &entry.queue {
                Some(queue) => match queue.push(message) {
                    PushOutcome::Queued => delivered += 1,
                    PushOutcome::DroppedOldest => {
                        warn!("queue of {} full, dropped oldest message", client_id);
                        delivered += 1;
                    }
                    PushOutcome::Closed => {}
                },
                None if entry.persistent && message.qos > QoS::AtMostOnce => {
                    self.inner.store.push_offline(client_id, message);
                    delivered += 1;
                }
                None => {}
            }
        }

        trace!(
            "routed {} from session {:?} to {} subscriber(s)",
            topic,
            from,
            delivered
        );
        Ok(delivered)
    }

    /// Retained message currently stored for `topic`
    pub fn retained(&self, topic: &str) -> Option<RetainedMessage> {
        self.inner.store.retained(topic)
    }

    /// Clients known to the router, online or persistent offline
    pub fn client_count(&self) -> usize {
        self.state().clients.len()
    }

    pub fn is_online(&self, client_id: &str) -> bool {
        self.state()
            .clients
            .get(client_id)
            .is_some_and(|entry| entry.queue.is_some())
    }

    /// Filters `client_id` is subscribed to, with their granted QoS
    pub fn subscriptions_of(&self, client_id: &str) -> Vec<(String, QoS)> {
        let state = self.state();
        let mut found: Vec<(String, QoS)> = state
            .subscriptions
            .iter()
            .filter_map(|(filter, subscribers)| {
                subscribers.get(client_id).map(|qos| (filter.clone(), *qos))
            })
            .collect();
        found.sort();
        found
    }
}
