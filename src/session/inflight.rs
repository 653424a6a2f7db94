//! Outbound QoS1/QoS2 exchanges awaiting acknowledgement

use std::collections::BTreeMap;

use tokio::time::Instant;

use crate::protocol::{Packet, Publish, QoS};

/// Step of an outbound acknowledged exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// QoS1: PUBLISH sent, waiting for PUBACK
    AwaitPubAck,
    /// QoS2: PUBLISH sent, waiting for PUBREC
    AwaitPubRec,
    /// QoS2: PUBREL sent, waiting for PUBCOMP
    AwaitPubComp,
}

/// One outbound exchange tracked by packet identifier
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub packet_id: u16,
    pub publish: Publish,
    pub stage: Stage,
    /// Resends performed for the current stage
    pub retries: u32,
    pub deadline: Instant,
}

impl PendingDelivery {
    pub fn new(packet_id: u16, publish: Publish, deadline: Instant) -> Self {
        let stage = if publish.qos == QoS::ExactlyOnce {
            Stage::AwaitPubRec
        } else {
            Stage::AwaitPubAck
        };
        Self {
            packet_id,
            publish,
            stage,
            retries: 0,
            deadline,
        }
    }

    /// Move to the next stage with a fresh retry budget
    pub fn advance(&mut self, stage: Stage, deadline: Instant) {
        self.stage = stage;
        self.retries = 0;
        self.deadline = deadline;
    }

    /// Packet to resend for the current stage. PUBLISH resends carry DUP.
    pub fn retransmission(&self) -> Packet {
        match self.stage {
            Stage::AwaitPubAck | Stage::AwaitPubRec => {
                let mut publish = self.publish.clone();
                publish.dup = true;
                Packet::Publish(publish)
            }
            Stage::AwaitPubComp => Packet::PubRel(self.packet_id),
        }
    }
}

/// Outbound exchanges of one session, keyed by packet identifier
#[derive(Debug, Default)]
pub struct Inflight {
    entries: BTreeMap<u16, PendingDelivery>,
}

impl Inflight {
    pub fn insert(&mut self, pending: PendingDelivery) {
        self.entries.insert(pending.packet_id, pending);
    }

    pub fn get_mut(&mut self, packet_id: u16) -> Option<&mut PendingDelivery> {
        self.entries.get_mut(&packet_id)
    }

    pub fn stage(&self, packet_id: u16) -> Option<Stage> {
        self.entries.get(&packet_id).map(|p| p.stage)
    }

    pub fn remove(&mut self, packet_id: u16) -> Option<PendingDelivery> {
        self.entries.remove(&packet_id)
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.entries.contains_key(&packet_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest retry deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|p| p.deadline).min()
    }

    /// Identifiers whose deadline has passed
    pub fn expired(&self, now: Instant) -> Vec<u16> {
        self.entries
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| p.packet_id)
            .collect()
    }

    /// Drop every exchange, returning the cancelled identifiers
    pub fn cancel_all(&mut self) -> Vec<u16> {
        std::mem::take(&mut self.entries).into_keys().collect()
    }
}

/// Rolling allocator of non-zero packet identifiers
#[derive(Debug)]
pub struct PacketIds {
    next: u16,
}

impl Default for PacketIds {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl PacketIds {
    /// Next identifier for which `in_use` is false, or `None` if all are taken
    pub fn allocate(&mut self, in_use: impl Fn(u16) -> bool) -> Option<u16> {
        for _ in 0..u16::MAX {
            let id = self.next;
            self.next = if id == u16::MAX { 1 } else { id + 1 };
            if !in_use(id) {
                return Some(id);
            }
        }
        None
    }
}
