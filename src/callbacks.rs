//! Callback registry shared by the client and server façades
//!
//! A fixed set of typed hook slots. Hooks run on the task that drives the
//! session, so a slow hook delays that session's keep-alive handling; calls
//! that exceed the configured budget are logged.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::Error;
use crate::message::Message;
use crate::protocol::{ConnectReturnCode, QoS};

/// Identity of the session a hook is invoked for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub client_id: String,
    /// Broker resumed stored state for this client
    pub session_present: bool,
}

impl SessionInfo {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            session_present: false,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// DISCONNECT sent or received
    Normal,
    /// Peer violated the protocol
    ProtocolError,
    /// Keep-alive grace exceeded
    KeepAliveTimeout,
    /// Transport failed or closed
    ConnectionLost,
    /// Another connection claimed the same client identifier
    TakenOver,
    /// Broker shutting down
    Shutdown,
}

impl DisconnectReason {
    /// Map a fatal session error to the reason reported to hooks
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::Codec(_) => DisconnectReason::ProtocolError,
            Error::SessionExpired => DisconnectReason::KeepAliveTimeout,
            _ => DisconnectReason::ConnectionLost,
        }
    }
}

type ConnectHook = Arc<dyn Fn(&SessionInfo, ConnectReturnCode) + Send + Sync>;
type MessageHook = Arc<dyn Fn(&SessionInfo, &Message) + Send + Sync>;
type DisconnectHook = Arc<dyn Fn(&SessionInfo, DisconnectReason) + Send + Sync>;
type SubscribeHook = Arc<dyn Fn(&SessionInfo, &str, Option<QoS>) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&SessionInfo, &Error) + Send + Sync>;

/// Typed hook slots. Cloning shares the hooks.
#[derive(Clone)]
pub struct Callbacks {
    on_connect: Option<ConnectHook>,
    on_message: Option<MessageHook>,
    on_disconnect: Option<DisconnectHook>,
    on_subscribe: Option<SubscribeHook>,
    on_error: Option<ErrorHook>,
    budget: Duration,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            on_connect: None,
            on_message: None,
            on_disconnect: None,
            on_subscribe: None,
            on_error: None,
            budget: Duration::from_millis(50),
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_subscribe", &self.on_subscribe.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("budget", &self.budget)
            .finish()
    }
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the CONNACK return code, on success and on refusal.
    ///
    /// On a client this reports the broker's answer. On a server it fires for
    /// every CONNECT answered, refused ones included; a refused session has
    /// `session_present == false` and is never registered with the router.
    pub fn on_connect<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&SessionInfo, ConnectReturnCode) + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    /// Called for every application message delivered to the session
    pub fn on_message<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&SessionInfo, &Message) + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(hook));
        self
    }

    pub fn on_disconnect<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&SessionInfo, DisconnectReason) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(hook));
        self
    }

    /// Called per filter with the granted QoS, `None` if refused
    pub fn on_subscribe<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&SessionInfo, &str, Option<QoS>) + Send + Sync + 'static,
    {
        self.on_subscribe = Some(Arc::new(hook));
        self
    }

    /// Called for delivery timeouts, slow-consumer drops and fatal session errors
    pub fn on_error<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&SessionInfo, &Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Time a single hook may take before a warning is logged
    pub fn set_budget(&mut self, budget: Duration) -> &mut Self {
        self.budget = budget;
        self
    }

    pub(crate) fn connected(&self, info: &SessionInfo, code: ConnectReturnCode) {
        if let Some(hook) = &self.on_connect {
            self.timed("on_connect", || hook(info, code));
        }
    }

    pub(crate) fn message(&self, info: &SessionInfo, message: &Message) {
        if let Some(hook) = &self.on_message {
            self.timed("on_message", || hook(info, message));
        }
    }

    pub(crate) fn disconnected(&self, info: &SessionInfo, reason: DisconnectReason) {
        if let Some(hook) = &self.on_disconnect {
            self.timed("on_disconnect", || hook(info, reason));
        }
    }

    pub(crate) fn subscribed(&self, info: &SessionInfo, filter: &str, granted: Option<QoS>) {
        if let Some(hook) = &self.on_subscribe {
            self.timed("on_subscribe", || hook(info, filter, granted));
        }
    }

    pub(crate) fn error(&self, info: &SessionInfo, error: &Error) {
        if let Some(hook) = &self.on_error {
            self.timed("on_error", || hook(info, error));
        }
    }

    fn timed(&self, name: &str, call: impl FnOnce()) {
        let started = Instant::now();
        call();
        let elapsed = started.elapsed();
        if elapsed > self.budget {
            warn!(
                "{} callback took {:?} (budget {:?})",
                name, elapsed, self.budget
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_unset_hooks_are_noops() {
        let callbacks = Callbacks::new();
        let info = SessionInfo::new("c1");
        callbacks.connected(&info, ConnectReturnCode::Accepted);
        callbacks.disconnected(&info, DisconnectReason::Normal);
    }

    #[test]
    fn test_hooks_receive_arguments() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut callbacks = Callbacks::new();
        let counter = Arc::clone(&seen);
        callbacks.on_subscribe(move |info, filter, granted| {
            assert_eq!(info.client_id, "c1");
            assert_eq!(filter, "a/#");
            assert_eq!(granted, Some(QoS::AtLeastOnce));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let shared = callbacks.clone();
        shared.subscribed(&SessionInfo::new("c1"), "a/#", Some(QoS::AtLeastOnce));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disconnect_reason_from_error() {
        assert_eq!(
            DisconnectReason::from_error(&Error::SessionExpired),
            DisconnectReason::KeepAliveTimeout
        );
        assert_eq!(
            DisconnectReason::from_error(&Error::Codec(crate::error::CodecError::Protocol(
                "x".into()
            ))),
            DisconnectReason::ProtocolError
        );
        assert_eq!(
            DisconnectReason::from_error(&Error::ConnectionLost),
            DisconnectReason::ConnectionLost
        );
    }
}
