//! MQTT protocol module - packet types and the frame codec

mod codec;
mod packet;

pub use codec::{
    decode, decode_remaining_length, encode, encode_into, write_remaining_length,
    MAX_REMAINING_LENGTH,
};
pub use packet::{
    ConnAck, Connect, ConnectReturnCode, LastWill, Packet, PacketType, Publish, QoS, SubAck,
    Subscribe, Unsubscribe, LEGACY_PROTOCOL_LEVEL, LEGACY_PROTOCOL_NAME, PROTOCOL_LEVEL,
    PROTOCOL_NAME,
};
