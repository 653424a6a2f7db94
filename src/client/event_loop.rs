//! Task that owns a client connection
//!
//! Reads, user commands and session timers are multiplexed in one loop so the
//! session is only ever touched from this task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use super::options::ClientOptions;
use crate::callbacks::{Callbacks, DisconnectReason, SessionInfo};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::protocol::{ConnectReturnCode, Publish, QoS};
use crate::session::{sleep_until_deadline, Role, Session, SessionEvent};
use crate::transport::{PacketStream, Transport};

type SubscribeReply = oneshot::Sender<Result<Vec<(String, Option<QoS>)>>>;

/// Requests from the [`Client`](super::Client) handle
pub(crate) enum Command {
    Publish {
        publish: Publish,
        reply: oneshot::Sender<Result<Option<u16>>>,
    },
    Subscribe {
        filters: Vec<(String, QoS)>,
        reply: SubscribeReply,
    },
    Unsubscribe {
        filters: Vec<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) struct EventLoop<S> {
    transport: PacketStream<S>,
    session: Session,
    options: ClientOptions,
    callbacks: Callbacks,
    commands: mpsc::Receiver<Command>,
    connected: Arc<AtomicBool>,
    info: SessionInfo,
    subscribe_replies: HashMap<u16, SubscribeReply>,
    unsubscribe_replies: HashMap<u16, oneshot::Sender<Result<()>>>,
    disconnect_reply: Option<oneshot::Sender<()>>,
}

impl<S: Transport> EventLoop<S> {
    pub(crate) fn new(
        stream: S,
        options: ClientOptions,
        mut callbacks: Callbacks,
        commands: mpsc::Receiver<Command>,
        connected: Arc<AtomicBool>,
    ) -> Self {
        callbacks.set_budget(options.timings.callback_budget);
        Self {
            transport: PacketStream::new(stream, options.max_packet_size, &options.timings),
            session: Session::new(Role::Client, options.timings, Instant::now()),
            info: SessionInfo::new(options.client_id.clone()),
            options,
            callbacks,
            commands,
            connected,
            subscribe_replies: HashMap::new(),
            unsubscribe_replies: HashMap::new(),
            disconnect_reply: None,
        }
    }

    /// Connect, report the outcome through `ready`, then serve until the
    /// session ends
    pub(crate) async fn run(mut self, ready: oneshot::Sender<Result<()>>) {
        if let Err(e) = self.handshake().await {
            self.session.close();
            self.transport.shutdown().await;
            let _ = ready.send(Err(e));
            return;
        }

        self.connected.store(true, Ordering::SeqCst);
        info!(
            "connected as {} (session present: {})",
            self.info.client_id, self.info.session_present
        );
        self.callbacks
            .connected(&self.info, ConnectReturnCode::Accepted);
        let _ = ready.send(Ok(()));

        let reason = match self.serve().await {
            Ok(reason) => reason,
            Err(e) => {
                warn!("session {} ended: {}", self.info.client_id, e);
                self.callbacks.error(&self.info, &e);
                DisconnectReason::from_error(&e)
            }
        };
        self.teardown(reason).await;
    }

    async fn handshake(&mut self) -> Result<()> {
        let now = Instant::now();
        let connect = self.options.to_connect()?;
        self.session.connect(connect, now)?;
        self.flush().await?;

        let deadline = now + self.options.timings.connect_timeout;
        let packet = match timeout_at(deadline, self.transport.read_packet()).await {
            Ok(packet) => packet?,
            Err(_) => {
                warn!("no CONNACK within {:?}", self.options.timings.connect_timeout);
                return Err(Error::ConnectTimeout);
            }
        };

        match self.session.handle_incoming(packet, Instant::now()) {
            Ok(events) => {
                for event in events {
                    if let SessionEvent::Connected {
                        session_present, ..
                    } = event
                    {
                        self.info.session_present = session_present;
                    }
                }
            }
            Err(Error::ConnectionRefused(code)) => {
                warn!("connection refused: {}", code);
                self.callbacks.connected(&self.info, code);
                return Err(Error::ConnectionRefused(code));
            }
            Err(e) => return Err(e),
        }

        if !self.options.subscriptions.is_empty() {
            self.session
                .subscribe(self.options.subscriptions.clone(), Instant::now())?;
        }
        Ok(())
    }

    async fn serve(&mut self) -> Result<DisconnectReason> {
        loop {
            while let Some(packet) = self.transport.next_buffered()? {
                let events = self.session.handle_incoming(packet, Instant::now())?;
                self.dispatch(events);
            }
            self.flush().await?;

            let deadline = self.session.next_deadline();
            tokio::select! {
                read = self.transport.fill() => read?,
                command = self.commands.recv() => match command {
                    Some(Command::Disconnect { reply }) => {
                        self.disconnect_reply = Some(reply);
                        return Ok(DisconnectReason::Normal);
                    }
                    Some(command) => self.execute(command),
                    // every handle dropped
                    None => return Ok(DisconnectReason::Normal),
                },
                _ = sleep_until_deadline(deadline) => {
                    let events = self.session.handle_timers(Instant::now())?;
                    self.dispatch(events);
                }
            }
        }
    }

    fn execute(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Publish { publish, reply } => {
                let _ = reply.send(self.session.publish(publish, now));
            }
            Command::Subscribe { filters, reply } => match self.session.subscribe(filters, now) {
                Ok(packet_id) => {
                    self.subscribe_replies.insert(packet_id, reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Unsubscribe { filters, reply } => {
                match self.session.unsubscribe(filters, now) {
                    Ok(packet_id) => {
                        self.unsubscribe_replies.insert(packet_id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Disconnect { reply } => self.disconnect_reply = Some(reply),
        }
    }

    fn dispatch(&mut self, events: Vec<SessionEvent>) {
        for event in events {
            match event {
                SessionEvent::Message(publish) => {
                    let message = Message::from(publish);
                    self.callbacks.message(&self.info, &message);
                }
                SessionEvent::Delivered { packet_id } => trace!("packet {} delivered", packet_id),
                SessionEvent::DeliveryFailed { packet_id } => {
                    self.callbacks
                        .error(&self.info, &Error::DeliveryTimeout { packet_id });
                }
                SessionEvent::Subscribed { packet_id, results } => {
                    for (filter, granted) in &results {
                        self.callbacks.subscribed(&self.info, filter, *granted);
                    }
                    if let Some(reply) = self.subscribe_replies.remove(&packet_id) {
                        let _ = reply.send(Ok(results));
                    }
                }
                SessionEvent::Unsubscribed { packet_id, .. } => {
                    if let Some(reply) = self.unsubscribe_replies.remove(&packet_id) {
                        let _ = reply.send(Ok(()));
                    }
                }
                SessionEvent::PingResponse => trace!("PINGRESP"),
                other => debug!("ignoring {:?}", other),
            }
        }
    }

    async fn flush(&mut self) -> Result<()> {
        let packets = self.session.take_outgoing();
        if packets.is_empty() {
            return Ok(());
        }
        self.transport.send(packets).await
    }

    async fn teardown(&mut self, reason: DisconnectReason) {
        if reason == DisconnectReason::Normal {
            while let Ok(command) = self.commands.try_recv() {
                self.execute(command);
            }
            if self.flush().await.is_ok() {
                self.await_inflight().await;
            }
            let cancelled = self.session.disconnect(Instant::now());
            if !cancelled.is_empty() {
                debug!("{} unacknowledged deliveries cancelled", cancelled.len());
            }
            let _ = self.flush().await;
        }

        self.session.close();
        self.transport.shutdown().await;
        self.connected.store(false, Ordering::SeqCst);
        // pending subscribe/unsubscribe callers see ConnectionLost
        self.subscribe_replies.clear();
        self.unsubscribe_replies.clear();

        info!("{} disconnected ({:?})", self.info.client_id, reason);
        self.callbacks.disconnected(&self.info, reason);
        if let Some(reply) = self.disconnect_reply.take() {
            let _ = reply.send(());
        }
    }

    /// Give outstanding QoS1/QoS2 exchanges one retry interval to complete
    async fn await_inflight(&mut self) {
        let deadline = Instant::now() + self.options.timings.retry_interval;
        while self.session.inflight_len() > 0 {
            let packet = match timeout_at(deadline, self.transport.read_packet()).await {
                Ok(Ok(packet)) => packet,
                _ => return,
            };
            match self.session.handle_incoming(packet, Instant::now()) {
                Ok(events) => self.dispatch(events),
                Err(_) => return,
            }
            if self.flush().await.is_err() {
                return;
            }
        }
    }
}
