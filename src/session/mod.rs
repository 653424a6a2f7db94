//! Per-connection MQTT session state machine
//!
//! [`Session`] performs no I/O. Its driver feeds it decoded packets and the
//! current monotonic time, sends whatever [`Session::take_outgoing`] yields and
//! sleeps until [`Session::next_deadline`]. The same type serves both ends of
//! a connection; [`Role`] selects which packets are legal.
//!
//! ```text
//! Disconnected -> ConnectSent (client) / ConnectReceived (server)
//!              -> Active -> Disconnecting -> Disconnected
//! ```

mod inflight;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::Timings;
use crate::error::{CodecError, Error, Result};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, SubAck, Subscribe, Unsubscribe,
    LEGACY_PROTOCOL_LEVEL, LEGACY_PROTOCOL_NAME, PROTOCOL_LEVEL, PROTOCOL_NAME,
};
use crate::topic::{validate_topic_filter, validate_topic_name};

pub use inflight::{Inflight, PacketIds, PendingDelivery, Stage};

/// Which end of the connection a session represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Connection phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    ConnectSent,
    ConnectReceived,
    Active,
    Disconnecting,
}

/// State changes reported to the session driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// CONNACK accepted (client side)
    Connected {
        session_present: bool,
        code: ConnectReturnCode,
    },
    /// Application message to hand to the user (client) or router (server)
    Message(Publish),
    /// Outbound QoS1/QoS2 exchange completed
    Delivered { packet_id: u16 },
    /// Outbound exchange abandoned after exhausting its retries
    DeliveryFailed { packet_id: u16 },
    /// SUBACK received; each filter with its granted QoS, `None` if refused
    Subscribed {
        packet_id: u16,
        results: Vec<(String, Option<QoS>)>,
    },
    /// UNSUBACK received
    Unsubscribed { packet_id: u16, filters: Vec<String> },
    /// Peer asked to subscribe (server side); answer with [`Session::ack_subscribe`]
    SubscribeRequest(Subscribe),
    /// Peer asked to unsubscribe (server side); answer with [`Session::ack_unsubscribe`]
    UnsubscribeRequest(Unsubscribe),
    PingResponse,
    /// Peer sent DISCONNECT
    Disconnected,
}

/// Sleep until a deadline from [`Session::next_deadline`]; forever if there is none
pub async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

static ASSIGNED_IDS: AtomicU64 = AtomicU64::new(1);

/// Client identifier handed to clients that connect with an empty one
fn assign_client_id() -> String {
    format!(
        "mqttd-{}-{}",
        std::process::id(),
        ASSIGNED_IDS.fetch_add(1, Ordering::Relaxed)
    )
}

/// One logical MQTT connection
#[derive(Debug)]
pub struct Session {
    role: Role,
    phase: Phase,
    client_id: String,
    clean_session: bool,
    keep_alive: Duration,
    timings: Timings,
    subscriptions: HashMap<String, QoS>,
    inflight: Inflight,
    packet_ids: PacketIds,
    pending_subscribes: HashMap<u16, Vec<(String, QoS)>>,
    pending_unsubscribes: HashMap<u16, Vec<String>>,
    /// QoS1 ids recently delivered, with the end of their dedup window
    inbound_qos1: HashMap<u16, Instant>,
    /// QoS2 ids delivered but not yet released by PUBREL
    inbound_qos2: HashSet<u16>,
    outbox: VecDeque<Packet>,
    last_sent: Instant,
    last_received: Instant,
    ping_sent: Option<Instant>,
    connect_deadline: Option<Instant>,
}

impl Session {
    pub fn new(role: Role, timings: Timings, now: Instant) -> Self {
        Self {
            role,
            phase: Phase::Disconnected,
            client_id: String::new(),
            clean_session: true,
            keep_alive: Duration::ZERO,
            timings,
            subscriptions: HashMap::new(),
            inflight: Inflight::default(),
            packet_ids: PacketIds::default(),
            pending_subscribes: HashMap::new(),
            pending_unsubscribes: HashMap::new(),
            inbound_qos1: HashMap::new(),
            inbound_qos2: HashSet::new(),
            outbox: VecDeque::new(),
            last_sent: now,
            last_received: now,
            ping_sent: None,
            connect_deadline: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase == Phase::Active
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// Active subscriptions with their granted QoS
    pub fn subscriptions(&self) -> &HashMap<String, QoS> {
        &self.subscriptions
    }

    /// Number of outbound exchanges awaiting acknowledgement
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Drain packets queued for the transport
    pub fn take_outgoing(&mut self) -> Vec<Packet> {
        self.outbox.drain(..).collect()
    }

    fn send(&mut self, packet: Packet, now: Instant) {
        trace!("queue {:?} for {}", packet.packet_type(), self.client_id);
        self.outbox.push_back(packet);
        self.last_sent = now;
    }

    fn expect_phase(&self, expected: Phase) -> Result<()> {
        if self.phase != expected {
            return Err(Error::InvalidState {
                expected,
                actual: self.phase,
            });
        }
        Ok(())
    }

    fn violation(&self, msg: impl Into<String>) -> Error {
        Error::Codec(CodecError::protocol(msg))
    }

    fn allocate_packet_id(&mut self) -> Result<u16> {
        let inflight = &self.inflight;
        let subscribes = &self.pending_subscribes;
        let unsubscribes = &self.pending_unsubscribes;
        self.packet_ids
            .allocate(|id| {
                inflight.contains(id)
                    || subscribes.contains_key(&id)
                    || unsubscribes.contains_key(&id)
            })
            .ok_or(Error::PacketIdsExhausted)
    }

    // ---- connection establishment ----

    /// Client: queue CONNECT and wait for CONNACK
    pub fn connect(&mut self, connect: Connect, now: Instant) -> Result<()> {
        if self.role != Role::Client {
            return Err(self.violation("server session cannot send CONNECT"));
        }
        self.expect_phase(Phase::Disconnected)?;

        self.client_id = connect.client_id.clone();
        self.clean_session = connect.clean_session;
        self.keep_alive = Duration::from_secs(connect.keep_alive as u64);
        self.phase = Phase::ConnectSent;
        self.connect_deadline = Some(now + self.timings.connect_timeout);
        self.last_received = now;
        self.send(Packet::Connect(connect), now);
        Ok(())
    }

    /// Server: take in the first CONNECT and validate it.
    ///
    /// Returns the verdict on protocol version and client identifier. The
    /// caller may refuse further (authentication) and must then call
    /// [`Session::complete_connect`].
    pub fn receive_connect(&mut self, connect: &Connect, now: Instant) -> Result<ConnectReturnCode> {
        if self.role != Role::Server {
            return Err(self.violation("client session received CONNECT"));
        }
        self.expect_phase(Phase::Disconnected)?;

        self.phase = Phase::ConnectReceived;
        self.last_received = now;
        self.clean_session = connect.clean_session;
        self.keep_alive = Duration::from_secs(connect.keep_alive as u64);

        let version_ok = (connect.protocol_name == PROTOCOL_NAME
            && connect.protocol_level == PROTOCOL_LEVEL)
            || (connect.protocol_name == LEGACY_PROTOCOL_NAME
                && connect.protocol_level == LEGACY_PROTOCOL_LEVEL);
        if !version_ok {
            return Ok(ConnectReturnCode::UnacceptableProtocolVersion);
        }

        if connect.client_id.is_empty() {
            if !connect.clean_session {
                return Ok(ConnectReturnCode::IdentifierRejected);
            }
            self.client_id = assign_client_id();
            debug!("assigned client id {}", self.client_id);
        } else {
            self.client_id = connect.client_id.clone();
        }

        Ok(ConnectReturnCode::Accepted)
    }

    /// Server: answer CONNECT with CONNACK and enter `Active` or `Disconnected`
    pub fn complete_connect(
        &mut self,
        code: ConnectReturnCode,
        session_present: bool,
        now: Instant,
    ) -> Result<()> {
        self.expect_phase(Phase::ConnectReceived)?;
        let accepted = code.is_success();
        self.send(
            Packet::ConnAck(ConnAck {
                session_present: session_present && accepted,
                code,
            }),
            now,
        );
        self.phase = if accepted {
            Phase::Active
        } else {
            Phase::Disconnected
        };
        Ok(())
    }

    // ---- application operations ----

    /// Queue a PUBLISH. Returns the packet identifier for QoS1/QoS2.
    pub fn publish(&mut self, mut publish: Publish, now: Instant) -> Result<Option<u16>> {
        self.expect_phase(Phase::Active)?;
        validate_topic_name(&publish.topic)?;
        publish.dup = false;

        if publish.qos == QoS::AtMostOnce {
            publish.packet_id = None;
            self.send(Packet::Publish(publish), now);
            return Ok(None);
        }

        let packet_id = self.allocate_packet_id()?;
        publish.packet_id = Some(packet_id);
        self.inflight.insert(PendingDelivery::new(
            packet_id,
            publish.clone(),
            now + self.timings.retry_interval,
        ));
        self.send(Packet::Publish(publish), now);
        Ok(Some(packet_id))
    }

    /// Client: queue SUBSCRIBE
    pub fn subscribe(&mut self, filters: Vec<(String, QoS)>, now: Instant) -> Result<u16> {
        self.expect_phase(Phase::Active)?;
        if filters.is_empty() {
            return Err(Error::InvalidTopic("no topic filters".to_string()));
        }
        for (filter, _) in &filters {
            validate_topic_filter(filter)?;
        }
        let packet_id = self.allocate_packet_id()?;
        self.pending_subscribes.insert(packet_id, filters.clone());
        self.send(Packet::Subscribe(Subscribe { packet_id, filters }), now);
        Ok(packet_id)
    }

    /// Client: queue UNSUBSCRIBE
    pub fn unsubscribe(&mut self, filters: Vec<String>, now: Instant) -> Result<u16> {
        self.expect_phase(Phase::Active)?;
        if filters.is_empty() {
            return Err(Error::InvalidTopic("no topic filters".to_string()));
        }
        let packet_id = self.allocate_packet_id()?;
        self.pending_unsubscribes.insert(packet_id, filters.clone());
        self.send(
            Packet::Unsubscribe(Unsubscribe { packet_id, filters }),
            now,
        );
        Ok(packet_id)
    }

    /// Server: answer SUBSCRIBE with the grants decided by the router
    pub fn ack_subscribe(
        &mut self,
        packet_id: u16,
        results: Vec<(String, Option<QoS>)>,
        now: Instant,
    ) {
        let mut return_codes = Vec::with_capacity(results.len());
        for (filter, granted) in results {
            if let Some(qos) = granted {
                self.subscriptions.insert(filter, qos);
            }
            return_codes.push(granted);
        }
        self.send(
            Packet::SubAck(SubAck {
                packet_id,
                return_codes,
            }),
            now,
        );
    }

    /// Server: answer UNSUBSCRIBE
    pub fn ack_unsubscribe(&mut self, packet_id: u16, filters: &[String], now: Instant) {
        for filter in filters {
            self.subscriptions.remove(filter);
        }
        self.send(Packet::UnsubAck(packet_id), now);
    }

    /// Begin an orderly shutdown. Pending deliveries are cancelled and their
    /// identifiers returned.
    pub fn disconnect(&mut self, now: Instant) -> Vec<u16> {
        if self.phase == Phase::Active && self.role == Role::Client {
            self.send(Packet::Disconnect, now);
        }
        if self.phase != Phase::Disconnected {
            self.phase = Phase::Disconnecting;
        }
        self.cancel_pending()
    }

    /// Release all state; the session ends `Disconnected`
    pub fn close(&mut self) -> Vec<u16> {
        self.phase = Phase::Disconnected;
        self.connect_deadline = None;
        self.cancel_pending()
    }

    fn cancel_pending(&mut self) -> Vec<u16> {
        self.pending_subscribes.clear();
        self.pending_unsubscribes.clear();
        self.inbound_qos1.clear();
        self.inbound_qos2.clear();
        self.ping_sent = None;
        self.inflight.cancel_all()
    }

    // ---- inbound packets ----

    /// Apply one packet received from the peer
    pub fn handle_incoming(&mut self, packet: Packet, now: Instant) -> Result<Vec<SessionEvent>> {
        self.last_received = now;

        if let Packet::ConnAck(ack) = packet {
            return self.handle_connack(ack, now);
        }
        if self.phase != Phase::Active {
            return Err(self.violation(format!(
                "{:?} received while {:?}",
                packet.packet_type(),
                self.phase
            )));
        }

        let mut events = Vec::new();
        match (self.role, packet) {
            (_, Packet::Publish(publish)) => return self.handle_publish(publish, now),
            (_, Packet::PubAck(id)) => {
                if self.inflight.stage(id) == Some(Stage::AwaitPubAck) {
                    self.inflight.remove(id);
                    events.push(SessionEvent::Delivered { packet_id: id });
                } else {
                    debug!("ignoring PUBACK for unknown packet {}", id);
                }
            }
            (_, Packet::PubRec(id)) => {
                let deadline = now + self.timings.retry_interval;
                match self.inflight.stage(id) {
                    Some(Stage::AwaitPubRec) => {
                        if let Some(pending) = self.inflight.get_mut(id) {
                            pending.advance(Stage::AwaitPubComp, deadline);
                        }
                    }
                    Some(Stage::AwaitPubAck) => {
                        return Err(self.violation(format!("PUBREC for QoS1 packet {}", id)));
                    }
                    _ => {}
                }
                // A retransmitted PUBREC is answered again
                self.send(Packet::PubRel(id), now);
            }
            (_, Packet::PubRel(id)) => {
                self.inbound_qos2.remove(&id);
                self.send(Packet::PubComp(id), now);
            }
            (_, Packet::PubComp(id)) => {
                if self.inflight.stage(id) == Some(Stage::AwaitPubComp) {
                    self.inflight.remove(id);
                    events.push(SessionEvent::Delivered { packet_id: id });
                } else {
                    debug!("ignoring PUBCOMP for unknown packet {}", id);
                }
            }
            (Role::Server, Packet::Subscribe(subscribe)) => {
                events.push(SessionEvent::SubscribeRequest(subscribe));
            }
            (Role::Server, Packet::Unsubscribe(unsubscribe)) => {
                events.push(SessionEvent::UnsubscribeRequest(unsubscribe));
            }
            (Role::Server, Packet::PingReq) => {
                self.send(Packet::PingResp, now);
            }
            (Role::Server, Packet::Disconnect) => {
                self.close();
                events.push(SessionEvent::Disconnected);
            }
            (Role::Client, Packet::SubAck(ack)) => {
                let Some(filters) = self.pending_subscribes.remove(&ack.packet_id) else {
                    debug!("ignoring SUBACK for unknown packet {}", ack.packet_id);
                    return Ok(events);
                };
                if filters.len() != ack.return_codes.len() {
                    return Err(self.violation(format!(
                        "SUBACK carries {} codes for {} filters",
                        ack.return_codes.len(),
                        filters.len()
                    )));
                }
                let mut results = Vec::with_capacity(filters.len());
                for ((filter, _), granted) in filters.into_iter().zip(ack.return_codes) {
                    if let Some(qos) = granted {
                        self.subscriptions.insert(filter.clone(), qos);
                    }
                    results.push((filter, granted));
                }
                events.push(SessionEvent::Subscribed {
                    packet_id: ack.packet_id,
                    results,
                });
            }
            (Role::Client, Packet::UnsubAck(id)) => {
                if let Some(filters) = self.pending_unsubscribes.remove(&id) {
                    for filter in &filters {
                        self.subscriptions.remove(filter);
                    }
                    events.push(SessionEvent::Unsubscribed {
                        packet_id: id,
                        filters,
                    });
                }
            }
            (Role::Client, Packet::PingResp) => {
                self.ping_sent = None;
                events.push(SessionEvent::PingResponse);
            }
            (role, packet) => {
                return Err(self.violation(format!(
                    "{:?} is not valid for a {:?} session",
                    packet.packet_type(),
                    role
                )));
            }
        }
        Ok(events)
    }

    fn handle_connack(&mut self, ack: ConnAck, _now: Instant) -> Result<Vec<SessionEvent>> {
        if self.role != Role::Client || self.phase != Phase::ConnectSent {
            return Err(self.violation(format!("unexpected CONNACK while {:?}", self.phase)));
        }
        self.connect_deadline = None;

        if !ack.code.is_success() {
            self.close();
            return Err(Error::ConnectionRefused(ack.code));
        }

        self.phase = Phase::Active;
        Ok(vec![SessionEvent::Connected {
            session_present: ack.session_present,
            code: ack.code,
        }])
    }

    fn handle_publish(&mut self, publish: Publish, now: Instant) -> Result<Vec<SessionEvent>> {
        let packet_id = match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => return Ok(vec![SessionEvent::Message(publish)]),
            (_, Some(id)) => id,
            (_, None) => return Err(self.violation("QoS>0 PUBLISH without packet identifier")),
        };

        let mut events = Vec::new();
        match publish.qos {
            QoS::AtLeastOnce => {
                let window = now + self.dedup_window();
                let seen = self.inbound_qos1.insert(packet_id, window).is_some();
                if publish.dup && seen {
                    debug!("suppressing duplicate QoS1 packet {}", packet_id);
                } else {
                    events.push(SessionEvent::Message(publish));
                }
                self.send(Packet::PubAck(packet_id), now);
            }
            QoS::ExactlyOnce => {
                if self.inbound_qos2.insert(packet_id) {
                    events.push(SessionEvent::Message(publish));
                } else {
                    debug!("suppressing duplicate QoS2 packet {}", packet_id);
                }
                self.send(Packet::PubRec(packet_id), now);
            }
            QoS::AtMostOnce => unreachable!("handled above"),
        }
        Ok(events)
    }

    /// How long a peer may keep retransmitting one QoS1 PUBLISH
    fn dedup_window(&self) -> Duration {
        self.timings.retry_interval * (self.timings.max_retries + 1)
    }

    // ---- timers ----

    /// Earliest instant at which [`Session::handle_timers`] has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::ConnectSent => self.connect_deadline,
            Phase::Active => {
                let keep_alive = self.keep_alive_deadline();
                match (self.inflight.next_deadline(), keep_alive) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            }
            _ => None,
        }
    }

    fn keep_alive_deadline(&self) -> Option<Instant> {
        if self.keep_alive.is_zero() {
            return None;
        }
        let grace = Timings::keep_alive_grace(self.keep_alive);
        Some(match (self.role, self.ping_sent) {
            (Role::Client, Some(sent)) => sent + grace,
            (Role::Client, None) => self.last_sent + self.keep_alive,
            (Role::Server, _) => self.last_received + grace,
        })
    }

    /// Run connect timeout, retransmission and keep-alive timers
    pub fn handle_timers(&mut self, now: Instant) -> Result<Vec<SessionEvent>> {
        match self.phase {
            Phase::ConnectSent => {
                if self.connect_deadline.is_some_and(|d| d <= now) {
                    self.close();
                    return Err(Error::ConnectTimeout);
                }
                return Ok(Vec::new());
            }
            Phase::Active => {}
            _ => return Ok(Vec::new()),
        }

        let mut events = Vec::new();

        for packet_id in self.inflight.expired(now) {
            let max_retries = self.timings.max_retries;
            let deadline = now + self.timings.retry_interval;
            let Some(pending) = self.inflight.get_mut(packet_id) else {
                continue;
            };
            if pending.retries < max_retries {
                pending.retries += 1;
                pending.deadline = deadline;
                debug!(
                    "resending packet {} ({:?}, attempt {})",
                    packet_id, pending.stage, pending.retries
                );
                let packet = pending.retransmission();
                self.send(packet, now);
            } else {
                warn!(
                    "delivery of packet {} to {} timed out",
                    packet_id, self.client_id
                );
                self.inflight.remove(packet_id);
                events.push(SessionEvent::DeliveryFailed { packet_id });
            }
        }

        self.inbound_qos1.retain(|_, until| *until > now);

        if !self.keep_alive.is_zero() {
            let grace = Timings::keep_alive_grace(self.keep_alive);
            match self.role {
                Role::Client => match self.ping_sent {
                    Some(sent) if now >= sent + grace => {
                        warn!("no PINGRESP for {} within {:?}", self.client_id, grace);
                        self.phase = Phase::Disconnecting;
                        return Err(Error::SessionExpired);
                    }
                    Some(_) => {}
                    None if now >= self.last_sent + self.keep_alive => {
                        self.send(Packet::PingReq, now);
                        self.ping_sent = Some(now);
                    }
                    None => {}
                },
                Role::Server => {
                    if now >= self.last_received + grace {
                        warn!("keep-alive of {} expired", self.client_id);
                        self.phase = Phase::Disconnecting;
                        return Err(Error::SessionExpired);
                    }
                }
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn timings() -> Timings {
        Timings {
            connect_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(2),
            max_retries: 2,
            ..Timings::default()
        }
    }

    fn active_client(now: Instant) -> Session {
        let mut session = Session::new(Role::Client, timings(), now);
        session.connect(Connect::new("c1", 10), now).unwrap();
        session.take_outgoing();
        session
            .handle_incoming(
                Packet::ConnAck(ConnAck {
                    session_present: false,
                    code: ConnectReturnCode::Accepted,
                }),
                now,
            )
            .unwrap();
        session
    }

    fn active_server(now: Instant) -> Session {
        let mut session = Session::new(Role::Server, timings(), now);
        let code = session.receive_connect(&Connect::new("c1", 10), now).unwrap();
        session.complete_connect(code, false, now).unwrap();
        session.take_outgoing();
        session
    }

    fn qos_publish(qos: QoS, id: u16, dup: bool) -> Publish {
        let mut publish = Publish::new("a/b", Bytes::from_static(b"21.5"), qos);
        publish.packet_id = Some(id);
        publish.dup = dup;
        publish
    }

    fn messages(events: &[SessionEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Message(_)))
            .count()
    }

    #[test]
    fn test_client_connect_flow() {
        let now = Instant::now();
        let mut session = Session::new(Role::Client, timings(), now);
        session.connect(Connect::new("c1", 10), now).unwrap();
        assert_eq!(session.phase(), Phase::ConnectSent);
        assert!(matches!(session.take_outgoing()[..], [Packet::Connect(_)]));

        let events = session
            .handle_incoming(
                Packet::ConnAck(ConnAck {
                    session_present: false,
                    code: ConnectReturnCode::Accepted,
                }),
                now,
            )
            .unwrap();
        assert!(session.is_active());
        assert!(matches!(events[..], [SessionEvent::Connected { .. }]));
    }

    #[test]
    fn test_refused_connack_returns_to_disconnected() {
        let now = Instant::now();
        let mut session = Session::new(Role::Client, timings(), now);
        session.connect(Connect::new("c1", 10), now).unwrap();
        let err = session
            .handle_incoming(
                Packet::ConnAck(ConnAck {
                    session_present: false,
                    code: ConnectReturnCode::BadUsernamePassword,
                }),
                now,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ConnectionRefused(ConnectReturnCode::BadUsernamePassword)
        ));
        assert_eq!(session.phase(), Phase::Disconnected);
    }

    #[test]
    fn test_connect_timeout() {
        let now = Instant::now();
        let mut session = Session::new(Role::Client, timings(), now);
        session.connect(Connect::new("c1", 10), now).unwrap();
        assert_eq!(session.next_deadline(), Some(now + Duration::from_secs(5)));
        assert!(session.handle_timers(now + Duration::from_secs(4)).is_ok());
        assert!(matches!(
            session.handle_timers(now + Duration::from_secs(5)),
            Err(Error::ConnectTimeout)
        ));
        assert_eq!(session.phase(), Phase::Disconnected);
    }

    #[test]
    fn test_server_rejects_bad_version_and_empty_persistent_id() {
        let now = Instant::now();
        let mut connect = Connect::new("c1", 10);
        connect.protocol_level = 5;
        let mut session = Session::new(Role::Server, timings(), now);
        let code = session.receive_connect(&connect, now).unwrap();
        assert_eq!(code, ConnectReturnCode::UnacceptableProtocolVersion);
        session.complete_connect(code, false, now).unwrap();
        assert_eq!(session.phase(), Phase::Disconnected);
        assert_eq!(
            session.take_outgoing(),
            vec![Packet::ConnAck(ConnAck {
                session_present: false,
                code: ConnectReturnCode::UnacceptableProtocolVersion,
            })]
        );

        let mut connect = Connect::new("", 10);
        connect.clean_session = false;
        let mut session = Session::new(Role::Server, timings(), now);
        assert_eq!(
            session.receive_connect(&connect, now).unwrap(),
            ConnectReturnCode::IdentifierRejected
        );
    }

    #[test]
    fn test_server_assigns_id_to_empty_clean_client() {
        let now = Instant::now();
        let mut session = Session::new(Role::Server, timings(), now);
        let code = session.receive_connect(&Connect::new("", 10), now).unwrap();
        assert!(code.is_success());
        assert!(session.client_id().starts_with("mqttd-"));
    }

    #[test]
    fn test_qos0_publish_is_untracked() {
        let now = Instant::now();
        let mut session = active_client(now);
        let id = session
            .publish(Publish::new("a/b", &b"x"[..], QoS::AtMostOnce), now)
            .unwrap();
        assert_eq!(id, None);
        assert_eq!(session.inflight_len(), 0);
        assert_eq!(session.take_outgoing().len(), 1);
    }

    #[test]
    fn test_publish_requires_active_session() {
        let now = Instant::now();
        let mut session = Session::new(Role::Client, timings(), now);
        let err = session
            .publish(Publish::new("a", &b"x"[..], QoS::AtMostOnce), now)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[test]
    fn test_qos1_retry_with_dup_then_timeout() {
        let now = Instant::now();
        let mut session = active_client(now);
        let id = session
            .publish(Publish::new("a/b", &b"x"[..], QoS::AtLeastOnce), now)
            .unwrap()
            .unwrap();
        session.take_outgoing();

        let retry = Duration::from_secs(2);
        for attempt in 1..=2u32 {
            let at = now + retry * attempt;
            assert!(session.handle_timers(at).unwrap().is_empty());
            let out = session.take_outgoing();
            assert!(
                matches!(&out[..], [Packet::Publish(p)] if p.dup && p.packet_id == Some(id)),
                "attempt {}: {:?}",
                attempt,
                out
            );
        }

        let events = session.handle_timers(now + retry * 3).unwrap();
        assert_eq!(events, vec![SessionEvent::DeliveryFailed { packet_id: id }]);
        assert_eq!(session.inflight_len(), 0);
        assert!(session.is_active());
    }

    #[test]
    fn test_qos1_puback_completes_delivery() {
        let now = Instant::now();
        let mut session = active_client(now);
        let id = session
            .publish(Publish::new("a/b", &b"x"[..], QoS::AtLeastOnce), now)
            .unwrap()
            .unwrap();
        let events = session.handle_incoming(Packet::PubAck(id), now).unwrap();
        assert_eq!(events, vec![SessionEvent::Delivered { packet_id: id }]);
        assert_eq!(session.inflight_len(), 0);
    }

    #[test]
    fn test_qos1_retransmitted_publish_delivered_once() {
        let now = Instant::now();
        let mut session = active_server(now);

        let first = session
            .handle_incoming(Packet::Publish(qos_publish(QoS::AtLeastOnce, 4, false)), now)
            .unwrap();
        // PUBACK lost; peer resends with DUP
        let second = session
            .handle_incoming(Packet::Publish(qos_publish(QoS::AtLeastOnce, 4, true)), now)
            .unwrap();

        assert_eq!(messages(&first) + messages(&second), 1);
        assert_eq!(
            session.take_outgoing(),
            vec![Packet::PubAck(4), Packet::PubAck(4)]
        );
    }

    #[test]
    fn test_qos1_id_reuse_after_window_is_delivered() {
        let now = Instant::now();
        let mut session = active_server(now);
        session
            .handle_incoming(Packet::Publish(qos_publish(QoS::AtLeastOnce, 4, false)), now)
            .unwrap();
        let later = now + Duration::from_secs(7);
        session.handle_timers(later).unwrap();
        let events = session
            .handle_incoming(Packet::Publish(qos_publish(QoS::AtLeastOnce, 4, true)), later)
            .unwrap();
        assert_eq!(messages(&events), 1);
    }

    #[test]
    fn test_qos2_inbound_exactly_once_across_lost_pubrec() {
        let now = Instant::now();
        let mut session = active_server(now);

        let first = session
            .handle_incoming(Packet::Publish(qos_publish(QoS::ExactlyOnce, 9, false)), now)
            .unwrap();
        // PUBREC lost; peer resends PUBLISH
        let second = session
            .handle_incoming(Packet::Publish(qos_publish(QoS::ExactlyOnce, 9, true)), now)
            .unwrap();
        assert_eq!(messages(&first) + messages(&second), 1);
        assert_eq!(
            session.take_outgoing(),
            vec![Packet::PubRec(9), Packet::PubRec(9)]
        );

        session.handle_incoming(Packet::PubRel(9), now).unwrap();
        assert_eq!(session.take_outgoing(), vec![Packet::PubComp(9)]);

        // the identifier is free again after PUBREL
        let reused = session
            .handle_incoming(Packet::Publish(qos_publish(QoS::ExactlyOnce, 9, false)), now)
            .unwrap();
        assert_eq!(messages(&reused), 1);
    }

    #[test]
    fn test_qos2_outbound_handshake_survives_retransmitted_pubrec() {
        let now = Instant::now();
        let mut session = active_client(now);
        let id = session
            .publish(Publish::new("a/b", &b"x"[..], QoS::ExactlyOnce), now)
            .unwrap()
            .unwrap();
        session.take_outgoing();

        session.handle_incoming(Packet::PubRec(id), now).unwrap();
        session.handle_incoming(Packet::PubRec(id), now).unwrap();
        assert_eq!(
            session.take_outgoing(),
            vec![Packet::PubRel(id), Packet::PubRel(id)]
        );

        // PUBREL stage has its own retry budget
        session.handle_timers(now + Duration::from_secs(2)).unwrap();
        assert_eq!(session.take_outgoing(), vec![Packet::PubRel(id)]);

        let events = session.handle_incoming(Packet::PubComp(id), now).unwrap();
        assert_eq!(events, vec![SessionEvent::Delivered { packet_id: id }]);
        // late duplicate PUBCOMP is ignored
        assert!(session
            .handle_incoming(Packet::PubComp(id), now)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_subscribe_records_grants() {
        let now = Instant::now();
        let mut session = active_client(now);
        let id = session
            .subscribe(
                vec![
                    ("sensors/+/temp".to_string(), QoS::ExactlyOnce),
                    ("$SYS/#".to_string(), QoS::AtMostOnce),
                ],
                now,
            )
            .unwrap();
        let events = session
            .handle_incoming(
                Packet::SubAck(SubAck {
                    packet_id: id,
                    return_codes: vec![Some(QoS::AtLeastOnce), None],
                }),
                now,
            )
            .unwrap();
        assert_eq!(
            events,
            vec![SessionEvent::Subscribed {
                packet_id: id,
                results: vec![
                    ("sensors/+/temp".to_string(), Some(QoS::AtLeastOnce)),
                    ("$SYS/#".to_string(), None),
                ],
            }]
        );
        assert_eq!(
            session.subscriptions().get("sensors/+/temp"),
            Some(&QoS::AtLeastOnce)
        );
        assert!(!session.subscriptions().contains_key("$SYS/#"));
    }

    #[test]
    fn test_subscribe_rejects_bad_filter() {
        let now = Instant::now();
        let mut session = active_client(now);
        assert!(session
            .subscribe(vec![("a/#/b".to_string(), QoS::AtMostOnce)], now)
            .is_err());
    }

    #[test]
    fn test_client_keep_alive_ping_and_expiry() {
        let now = Instant::now();
        let mut session = active_client(now);
        let keep_alive = Duration::from_secs(10);

        assert_eq!(session.next_deadline(), Some(now + keep_alive));
        session.handle_timers(now + keep_alive).unwrap();
        assert_eq!(session.take_outgoing(), vec![Packet::PingReq]);

        // PINGRESP arrives, next ping scheduled from the last send
        session
            .handle_incoming(Packet::PingResp, now + keep_alive)
            .unwrap();
        session.handle_timers(now + keep_alive * 2).unwrap();
        assert_eq!(session.take_outgoing(), vec![Packet::PingReq]);

        // no PINGRESP within 1.5x keep-alive
        let err = session
            .handle_timers(now + keep_alive * 2 + Duration::from_secs(15))
            .unwrap_err();
        assert!(matches!(err, Error::SessionExpired));
        assert_eq!(session.phase(), Phase::Disconnecting);
    }

    #[test]
    fn test_server_keep_alive_expiry() {
        let now = Instant::now();
        let mut session = active_server(now);
        session
            .handle_incoming(Packet::PingReq, now + Duration::from_secs(10))
            .unwrap();
        assert_eq!(session.take_outgoing(), vec![Packet::PingResp]);
        assert!(session.handle_timers(now + Duration::from_secs(24)).is_ok());
        assert!(matches!(
            session.handle_timers(now + Duration::from_secs(25)),
            Err(Error::SessionExpired)
        ));
    }

    #[test]
    fn test_disconnect_cancels_pending() {
        let now = Instant::now();
        let mut session = active_client(now);
        let id = session
            .publish(Publish::new("a", &b"x"[..], QoS::AtLeastOnce), now)
            .unwrap()
            .unwrap();
        session.take_outgoing();

        assert_eq!(session.disconnect(now), vec![id]);
        assert_eq!(session.phase(), Phase::Disconnecting);
        assert_eq!(session.take_outgoing(), vec![Packet::Disconnect]);
        assert_eq!(session.next_deadline(), None);
        session.close();
        assert_eq!(session.phase(), Phase::Disconnected);
    }

    #[test]
    fn test_wrong_direction_packets_are_violations() {
        let now = Instant::now();
        let mut client = active_client(now);
        assert!(client.handle_incoming(Packet::PingReq, now).is_err());

        let mut server = active_server(now);
        assert!(server
            .handle_incoming(
                Packet::SubAck(SubAck {
                    packet_id: 1,
                    return_codes: vec![]
                }),
                now
            )
            .is_err());
        assert!(server
            .handle_incoming(Packet::Connect(Connect::new("again", 1)), now)
            .is_err());
    }

    #[test]
    fn test_packet_ids_skip_pending_requests() {
        let now = Instant::now();
        let mut session = active_client(now);
        let sub = session
            .subscribe(vec![("a".to_string(), QoS::AtMostOnce)], now)
            .unwrap();
        let publ = session
            .publish(Publish::new("a", &b"x"[..], QoS::AtLeastOnce), now)
            .unwrap()
            .unwrap();
        assert_ne!(sub, publ);
    }
}
