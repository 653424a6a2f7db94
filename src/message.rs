//! Application messages as seen by callbacks and the router

use std::borrow::Cow;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::protocol::{Publish, QoS};

/// A published application message.
///
/// Unlike [`Publish`] it carries no packet identifier or DUP flag; those
/// belong to a single hop between two sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }

    /// Payload decoded as UTF-8, with invalid sequences replaced
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Build an outgoing PUBLISH; the session assigns the packet identifier
    pub fn to_publish(&self) -> Publish {
        let mut publish = Publish::new(self.topic.clone(), self.payload.clone(), self.qos);
        publish.retain = self.retain;
        publish
    }
}

impl From<Publish> for Message {
    fn from(publish: Publish) -> Self {
        Self {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
        }
    }
}
