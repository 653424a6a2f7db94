//! Bounded per-session outbound queue
//!
//! The router pushes without waiting; the connection task pops when its
//! transport can take more. A full queue drops its oldest message so one slow
//! subscriber never stalls publishers.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after discarding the oldest message
    DroppedOldest,
    /// Session is gone; nothing queued
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<Message>,
    dropped: usize,
    closed: bool,
}

#[derive(Debug)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, message: Message) -> PushOutcome {
        let outcome = {
            let mut state = self.state();
            if state.closed {
                return PushOutcome::Closed;
            }
            let outcome = if state.messages.len() >= self.capacity {
                state.messages.pop_front();
                state.dropped += 1;
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            state.messages.push_back(message);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    pub fn pop(&self) -> Option<Message> {
        self.state().messages.pop_front()
    }

    /// Remove every queued message
    pub fn drain(&self) -> Vec<Message> {
        self.state().messages.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.state().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages dropped since the last call
    pub fn take_dropped(&self) -> usize {
        std::mem::take(&mut self.state().dropped)
    }

    /// Refuse further pushes and wake the consumer
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Wait until something was pushed or the queue was closed.
    ///
    /// A push that happens while nobody is waiting is remembered, so the
    /// next call returns at once.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}
