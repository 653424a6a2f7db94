//! One broker-side client connection
//!
//! Handshake, then a loop over socket reads, routed deliveries, session timers
//! and the shutdown signal. Any failure ends this connection only.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::broker::{AuthDecision, AuthHook, Credentials, OutboundQueue, Registration, Router};
use crate::callbacks::{Callbacks, DisconnectReason, SessionInfo};
use crate::config::BrokerConfig;
use crate::error::{CodecError, Error, Result};
use crate::message::Message;
use crate::protocol::{ConnectReturnCode, LastWill, Packet};
use crate::session::{sleep_until_deadline, Role, Session, SessionEvent};
use crate::topic;
use crate::transport::{PacketStream, Transport};

pub(crate) struct Connection<S> {
    transport: PacketStream<S>,
    session: Session,
    router: Router,
    auth: Arc<dyn AuthHook>,
    callbacks: Callbacks,
    shutdown: watch::Receiver<bool>,
    peer: String,
    config: BrokerConfig,
    info: SessionInfo,
    registration: Option<Registration>,
    will: Option<LastWill>,
}

impl<S: Transport> Connection<S> {
    pub(crate) fn new(
        stream: S,
        peer: String,
        config: BrokerConfig,
        router: Router,
        auth: Arc<dyn AuthHook>,
        callbacks: Callbacks,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport: PacketStream::new(stream, config.max_packet_size, &config.timings),
            session: Session::new(Role::Server, config.timings, Instant::now()),
            router,
            auth,
            callbacks,
            shutdown,
            peer,
            config,
            info: SessionInfo::default(),
            registration: None,
            will: None,
        }
    }

    pub(crate) async fn run(mut self) {
        match self.handshake().await {
            Ok(true) => {}
            Ok(false) => {
                self.transport.shutdown().await;
                return;
            }
            Err(e) => {
                debug!("{}: handshake failed: {}", self.peer, e);
                self.transport.shutdown().await;
                return;
            }
        }

        let reason = match self.serve().await {
            Ok(reason) => reason,
            Err(e) => {
                warn!("{} ({}): {}", self.info.client_id, self.peer, e);
                self.callbacks.error(&self.info, &e);
                DisconnectReason::from_error(&e)
            }
        };
        self.teardown(reason).await;
    }

    /// Returns whether the client was accepted
    async fn handshake(&mut self) -> Result<bool> {
        let connect_timeout = self.config.timings.connect_timeout;
        let packet = match timeout(connect_timeout, self.transport.read_packet()).await {
            Ok(packet) => packet?,
            Err(_) => return Err(Error::ConnectTimeout),
        };
        let connect = match packet {
            Packet::Connect(connect) => connect,
            other => {
                return Err(Error::Codec(CodecError::Protocol(format!(
                    "expected CONNECT, got {:?}",
                    other.packet_type()
                ))))
            }
        };

        let now = Instant::now();
        let mut code = self.session.receive_connect(&connect, now)?;
        if code.is_success() {
            let credentials = Credentials {
                username: connect.username.as_deref(),
                password: connect.password.as_deref(),
            };
            if self.auth.authenticate(self.session.client_id(), &credentials) == AuthDecision::Deny
            {
                code = if credentials.is_empty() {
                    ConnectReturnCode::NotAuthorized
                } else {
                    ConnectReturnCode::BadUsernamePassword
                };
            }
        }

        let mut session_present = false;
        if code.is_success() {
            let registration = self
                .router
                .register(self.session.client_id(), connect.clean_session);
            session_present = registration.session_present;
            self.registration = Some(registration);
            self.will = connect.will;
        }
        self.info = SessionInfo {
            client_id: self.session.client_id().to_string(),
            session_present,
        };

        self.session.complete_connect(code, session_present, now)?;
        self.flush().await?;
        self.callbacks.connected(&self.info, code);

        if code.is_success() {
            info!(
                "{} connected from {} (session present: {})",
                self.info.client_id, self.peer, session_present
            );
        } else {
            info!("{} refused: {}", self.peer, code);
        }
        Ok(code.is_success())
    }

    async fn serve(&mut self) -> Result<DisconnectReason> {
        let Some(queue) = self.registration.as_ref().map(|r| Arc::clone(&r.queue)) else {
            return Ok(DisconnectReason::ConnectionLost);
        };

        loop {
            while let Some(packet) = self.transport.next_buffered()? {
                let events = self.session.handle_incoming(packet, Instant::now())?;
                if self.dispatch(events) {
                    self.flush().await?;
                    return Ok(DisconnectReason::Normal);
                }
            }
            self.forward(&queue);
            self.flush().await?;
            if queue.is_closed() {
                return Ok(DisconnectReason::TakenOver);
            }
            if *self.shutdown.borrow_and_update() {
                return Ok(DisconnectReason::Shutdown);
            }

            let deadline = self.session.next_deadline();
            tokio::select! {
                read = self.transport.fill() => read?,
                _ = queue.notified() => {}
                _ = sleep_until_deadline(deadline) => {
                    let events = self.session.handle_timers(Instant::now())?;
                    self.dispatch(events);
                }
                changed = self.shutdown.changed() => {
                    // server dropped
                    if changed.is_err() {
                        return Ok(DisconnectReason::Shutdown);
                    }
                }
            }
        }
    }

    /// Move routed messages into the session while the in-flight window allows
    fn forward(&mut self, queue: &OutboundQueue) {
        let dropped = queue.take_dropped();
        if dropped > 0 {
            let error = Error::SlowConsumer {
                client_id: self.info.client_id.clone(),
                dropped,
            };
            warn!("{}", error);
            self.callbacks.error(&self.info, &error);
        }

        let now = Instant::now();
        while self.session.inflight_len() < self.config.max_inflight {
            let Some(message) = queue.pop() else {
                break;
            };
            if let Err(e) = self.session.publish(message.to_publish(), now) {
                warn!(
                    "dropping message on {} for {}: {}",
                    message.topic, self.info.client_id, e
                );
            }
        }
    }

    /// Returns true once the peer has sent DISCONNECT
    fn dispatch(&mut self, events: Vec<SessionEvent>) -> bool {
        let Some(session_id) = self.registration.as_ref().map(|r| r.session_id) else {
            return false;
        };
        let now = Instant::now();

        for event in events {
            match event {
                SessionEvent::Message(publish) => {
                    if topic::is_reserved(&publish.topic) {
                        warn!(
                            "{} published to reserved topic {}, ignored",
                            self.info.client_id, publish.topic
                        );
                        continue;
                    }
                    let message = Message::from(publish);
                    self.callbacks.message(&self.info, &message);
                    if let Err(e) = self.router.publish(
                        Some(session_id),
                        &message.topic,
                        message.payload.clone(),
                        message.qos,
                        message.retain,
                    ) {
                        warn!("routing {} failed: {}", message.topic, e);
                    }
                }
                SessionEvent::SubscribeRequest(subscribe) => {
                    let mut results = Vec::with_capacity(subscribe.filters.len());
                    for (filter, qos) in subscribe.filters {
                        let granted = match self.router.subscribe(session_id, &filter, qos) {
                            Ok(granted) => Some(granted),
                            Err(e) => {
                                warn!("{}: subscribe {} refused: {}", self.info.client_id, filter, e);
                                None
                            }
                        };
                        self.callbacks.subscribed(&self.info, &filter, granted);
                        results.push((filter, granted));
                    }
                    self.session.ack_subscribe(subscribe.packet_id, results, now);
                }
                SessionEvent::UnsubscribeRequest(unsubscribe) => {
                    for filter in &unsubscribe.filters {
                        if let Err(e) = self.router.unsubscribe(session_id, filter) {
                            warn!("{}: unsubscribe {} failed: {}", self.info.client_id, filter, e);
                        }
                    }
                    self.session
                        .ack_unsubscribe(unsubscribe.packet_id, &unsubscribe.filters, now);
                }
                SessionEvent::DeliveryFailed { packet_id } => {
                    self.callbacks
                        .error(&self.info, &Error::DeliveryTimeout { packet_id });
                }
                SessionEvent::Disconnected => {
                    // graceful: the will is discarded
                    self.will = None;
                    return true;
                }
                SessionEvent::Delivered { packet_id } => trace!("packet {} delivered", packet_id),
                other => debug!("ignoring {:?}", other),
            }
        }
        false
    }

    /// Write pending packets.
    ///
    /// A peer that stops reading can stall the write indefinitely, so session
    /// timers keep running meanwhile; an expired keep-alive ends the
    /// connection. Returns early, leaving bytes buffered, on shutdown or
    /// takeover so the caller can notice either.
    async fn flush(&mut self) -> Result<()> {
        let queue = self.registration.as_ref().map(|r| Arc::clone(&r.queue));
        loop {
            self.transport.queue(self.session.take_outgoing())?;
            let deadline = self.session.next_deadline();
            tokio::select! {
                sent = self.transport.write_queued() => return sent,
                _ = sleep_until_deadline(deadline) => {
                    let events = self.session.handle_timers(Instant::now())?;
                    self.dispatch(events);
                }
                _ = queue_closed(queue.as_deref()) => return Ok(()),
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn teardown(&mut self, reason: DisconnectReason) {
        let cancelled = self.session.close();
        if !cancelled.is_empty() {
            debug!(
                "{}: {} unacknowledged deliveries cancelled",
                self.info.client_id,
                cancelled.len()
            );
        }

        if let Some(registration) = self.registration.take() {
            if let Some(will) = self.will.take() {
                debug!("publishing will of {} to {}", self.info.client_id, will.topic);
                if let Err(e) =
                    self.router
                        .publish(None, &will.topic, will.payload, will.qos, will.retain)
                {
                    warn!("will of {} not published: {}", self.info.client_id, e);
                }
            }
            self.router.deregister(registration.session_id);
        }

        self.transport.shutdown().await;
        info!("{} disconnected ({:?})", self.info.client_id, reason);
        self.callbacks.disconnected(&self.info, reason);
    }
}

/// Resolves once `queue` is closed by a takeover; never without a queue
async fn queue_closed(queue: Option<&OutboundQueue>) {
    match queue {
        Some(queue) => {
            while !queue.is_closed() {
                queue.notified().await;
            }
        }
        None => std::future::pending().await,
    }
}
