//! Error types for mqttd

use thiserror::Error;

use crate::protocol::ConnectReturnCode;
use crate::session::Phase;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("connection refused by broker: {0}")]
    ConnectionRefused(ConnectReturnCode),

    #[error("timeout waiting for CONNACK")]
    ConnectTimeout,

    #[error("delivery of packet {packet_id} timed out")]
    DeliveryTimeout { packet_id: u16 },

    #[error("slow consumer {client_id}: dropped {dropped} queued message(s)")]
    SlowConsumer { client_id: String, dropped: usize },

    #[error("keep-alive expired")]
    SessionExpired,

    #[error("connection lost")]
    ConnectionLost,

    #[error("session is {actual:?}, expected {expected:?}")]
    InvalidState { expected: Phase, actual: Phase },

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("no free packet identifier")]
    PacketIdsExhausted,

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while encoding or decoding control packets
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid remaining length encoding")]
    InvalidRemainingLength,

    #[error("packet of {size} bytes exceeds limit of {max}")]
    PacketTooLarge { size: usize, max: usize },
}

impl CodecError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        CodecError::MalformedPacket(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        CodecError::Protocol(msg.into())
    }

    /// True for violations of the framing rules (as opposed to bad field values)
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            CodecError::Protocol(_) | CodecError::InvalidRemainingLength
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
