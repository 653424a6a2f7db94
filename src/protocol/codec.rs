//! Wire encoding and decoding of MQTT 3.1.1 control packets
//!
//! [`decode`] is resumable: it only consumes complete frames and reports how
//! many bytes it used, so callers keep the residual bytes for the next read.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CodecError;

use super::packet::{
    ConnAck, Connect, ConnectReturnCode, LastWill, Packet, PacketType, Publish, QoS, SubAck,
    Subscribe, Unsubscribe, LEGACY_PROTOCOL_NAME, PROTOCOL_NAME,
};

/// Largest value representable by the remaining-length field
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// SUBACK return code for a rejected filter
const SUBACK_FAILURE: u8 = 0x80;

/// Encode a packet into a fresh buffer
pub fn encode(packet: &Packet) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    encode_into(packet, &mut buf)?;
    Ok(buf.freeze())
}

/// Append the encoded packet to `out`. Nothing is written on error.
pub fn encode_into(packet: &Packet, out: &mut BytesMut) -> Result<(), CodecError> {
    let mut body = BytesMut::new();
    let flags = match packet {
        Packet::Connect(connect) => {
            write_connect(connect, &mut body)?;
            0
        }
        Packet::ConnAck(ack) => {
            if ack.session_present && !ack.code.is_success() {
                return Err(CodecError::malformed(
                    "session present set on a refused CONNACK",
                ));
            }
            body.put_u8(ack.session_present as u8);
            body.put_u8(ack.code as u8);
            0
        }
        Packet::Publish(publish) => write_publish(publish, &mut body)?,
        Packet::PubAck(id) | Packet::PubRec(id) | Packet::PubComp(id) | Packet::UnsubAck(id) => {
            put_packet_id(*id, &mut body)?;
            0
        }
        Packet::PubRel(id) => {
            put_packet_id(*id, &mut body)?;
            0x02
        }
        Packet::Subscribe(subscribe) => {
            put_packet_id(subscribe.packet_id, &mut body)?;
            if subscribe.filters.is_empty() {
                return Err(CodecError::malformed("SUBSCRIBE without topic filters"));
            }
            for (filter, qos) in &subscribe.filters {
                if filter.is_empty() {
                    return Err(CodecError::malformed("empty topic filter"));
                }
                put_string(filter, &mut body)?;
                body.put_u8(*qos as u8);
            }
            0x02
        }
        Packet::SubAck(ack) => {
            put_packet_id(ack.packet_id, &mut body)?;
            for code in &ack.return_codes {
                body.put_u8(code.map(|q| q as u8).unwrap_or(SUBACK_FAILURE));
            }
            0
        }
        Packet::Unsubscribe(unsubscribe) => {
            put_packet_id(unsubscribe.packet_id, &mut body)?;
            if unsubscribe.filters.is_empty() {
                return Err(CodecError::malformed("UNSUBSCRIBE without topic filters"));
            }
            for filter in &unsubscribe.filters {
                put_string(filter, &mut body)?;
            }
            0x02
        }
        Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
    };

    if body.len() > MAX_REMAINING_LENGTH {
        return Err(CodecError::PacketTooLarge {
            size: body.len(),
            max: MAX_REMAINING_LENGTH,
        });
    }

    out.reserve(5 + body.len());
    out.put_u8(((packet.packet_type() as u8) << 4) | flags);
    write_remaining_length(body.len(), out);
    out.extend_from_slice(&body);
    Ok(())
}

/// Try to decode one packet from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the packet and the
/// number of bytes it occupied. A `max_packet_size` of 0 disables the limit.
pub fn decode(buf: &[u8], max_packet_size: usize) -> Result<Option<(Packet, usize)>, CodecError> {
    let Some(&header) = buf.first() else {
        return Ok(None);
    };

    let packet_type = PacketType::try_from(header >> 4)?;
    let flags = header & 0x0F;
    check_fixed_header_flags(packet_type, flags)?;

    let Some((remaining, len_bytes)) = decode_remaining_length(&buf[1..])? else {
        return Ok(None);
    };

    let total = 1 + len_bytes + remaining;
    if max_packet_size > 0 && total > max_packet_size {
        return Err(CodecError::PacketTooLarge {
            size: total,
            max: max_packet_size,
        });
    }
    if buf.len() < total {
        return Ok(None);
    }

    let mut reader = Reader::new(&buf[1 + len_bytes..total]);
    let packet = match packet_type {
        PacketType::Connect => Packet::Connect(read_connect(&mut reader)?),
        PacketType::ConnAck => Packet::ConnAck(read_connack(&mut reader)?),
        PacketType::Publish => Packet::Publish(read_publish(flags, &mut reader)?),
        PacketType::PubAck => Packet::PubAck(read_packet_id(&mut reader)?),
        PacketType::PubRec => Packet::PubRec(read_packet_id(&mut reader)?),
        PacketType::PubRel => Packet::PubRel(read_packet_id(&mut reader)?),
        PacketType::PubComp => Packet::PubComp(read_packet_id(&mut reader)?),
        PacketType::Subscribe => Packet::Subscribe(read_subscribe(&mut reader)?),
        PacketType::SubAck => Packet::SubAck(read_suback(&mut reader)?),
        PacketType::Unsubscribe => Packet::Unsubscribe(read_unsubscribe(&mut reader)?),
        PacketType::UnsubAck => Packet::UnsubAck(read_packet_id(&mut reader)?),
        PacketType::PingReq => Packet::PingReq,
        PacketType::PingResp => Packet::PingResp,
        PacketType::Disconnect => Packet::Disconnect,
    };
    reader.finish()?;

    Ok(Some((packet, total)))
}

/// Decode the variable-length remaining-length field.
///
/// Returns the value and the number of bytes it used, or `None` if the field
/// continues past the end of `buf`.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, CodecError> {
    let mut value = 0usize;
    for (i, &byte) in buf.iter().take(4).enumerate() {
        value |= ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= 4 {
        // Fourth byte still had the continuation bit set
        return Err(CodecError::InvalidRemainingLength);
    }
    Ok(None)
}

/// Append the variable-length encoding of `len`
pub fn write_remaining_length(mut len: usize, out: &mut BytesMut) {
    loop {
        let mut byte = (len & 0x7F) as u8;
        len >>= 7;
        if len > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn check_fixed_header_flags(packet_type: PacketType, flags: u8) -> Result<(), CodecError> {
    let expected = match packet_type {
        PacketType::Publish => return Ok(()),
        PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => 0x02,
        _ => 0x00,
    };
    if flags != expected {
        return Err(CodecError::protocol(format!(
            "{:?} with reserved flags {:#06b}",
            packet_type, flags
        )));
    }
    Ok(())
}

fn write_connect(connect: &Connect, body: &mut BytesMut) -> Result<(), CodecError> {
    if connect.password.is_some() && connect.username.is_none() {
        return Err(CodecError::malformed("password without user name"));
    }

    put_string(&connect.protocol_name, body)?;
    body.put_u8(connect.protocol_level);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        check_topic_name(&will.topic)?;
        flags |= 0x04 | ((will.qos as u8) << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);

    put_string(&connect.client_id, body)?;
    if let Some(will) = &connect.will {
        put_string(&will.topic, body)?;
        put_binary(&will.payload, body)?;
    }
    if let Some(username) = &connect.username {
        put_string(username, body)?;
    }
    if let Some(password) = &connect.password {
        put_binary(password, body)?;
    }
    Ok(())
}

fn write_publish(publish: &Publish, body: &mut BytesMut) -> Result<u8, CodecError> {
    check_topic_name(&publish.topic)?;

    match (publish.qos, publish.packet_id) {
        (QoS::AtMostOnce, Some(_)) => {
            return Err(CodecError::malformed("QoS 0 PUBLISH with a packet identifier"))
        }
        (QoS::AtMostOnce, None) if publish.dup => {
            return Err(CodecError::malformed("QoS 0 PUBLISH with DUP set"))
        }
        (QoS::AtLeastOnce | QoS::ExactlyOnce, None) => {
            return Err(CodecError::malformed("QoS>0 PUBLISH without a packet identifier"))
        }
        _ => {}
    }

    put_string(&publish.topic, body)?;
    if let Some(id) = publish.packet_id {
        put_packet_id(id, body)?;
    }
    body.extend_from_slice(&publish.payload);

    let mut flags = (publish.qos as u8) << 1;
    if publish.dup {
        flags |= 0x08;
    }
    if publish.retain {
        flags |= 0x01;
    }
    Ok(flags)
}

fn check_topic_name(topic: &str) -> Result<(), CodecError> {
    if topic.is_empty() {
        return Err(CodecError::malformed("empty topic name"));
    }
    if topic.contains(['+', '#']) {
        return Err(CodecError::malformed(format!(
            "wildcard in topic name '{}'",
            topic
        )));
    }
    Ok(())
}

fn put_packet_id(id: u16, body: &mut BytesMut) -> Result<(), CodecError> {
    if id == 0 {
        return Err(CodecError::malformed("packet identifier 0"));
    }
    body.put_u16(id);
    Ok(())
}

fn put_string(s: &str, body: &mut BytesMut) -> Result<(), CodecError> {
    put_binary(s.as_bytes(), body)
}

fn put_binary(data: &[u8], body: &mut BytesMut) -> Result<(), CodecError> {
    let len = u16::try_from(data.len())
        .map_err(|_| CodecError::malformed(format!("field of {} bytes is too long", data.len())))?;
    body.put_u16(len);
    body.extend_from_slice(data);
    Ok(())
}

fn read_connect(reader: &mut Reader<'_>) -> Result<Connect, CodecError> {
    let protocol_name = reader.read_string()?;
    if protocol_name != PROTOCOL_NAME && protocol_name != LEGACY_PROTOCOL_NAME {
        return Err(CodecError::protocol(format!(
            "unknown protocol name '{}'",
            protocol_name
        )));
    }
    let protocol_level = reader.read_u8()?;

    let flags = reader.read_u8()?;
    if flags & 0x01 != 0 {
        return Err(CodecError::protocol("CONNECT reserved flag set"));
    }
    let clean_session = flags & 0x02 != 0;
    let will_flag = flags & 0x04 != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = flags & 0x20 != 0;
    let password_flag = flags & 0x40 != 0;
    let username_flag = flags & 0x80 != 0;

    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(CodecError::protocol("will QoS/retain set without will flag"));
    }
    if password_flag && !username_flag {
        return Err(CodecError::protocol("password flag without user name flag"));
    }

    let keep_alive = reader.read_u16()?;
    let client_id = reader.read_string()?;

    let will = if will_flag {
        let topic = reader.read_string()?;
        let payload = Bytes::copy_from_slice(reader.read_binary()?);
        Some(LastWill {
            topic,
            payload,
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(reader.read_string()?)
    } else {
        None
    };
    let password = if password_flag {
        Some(Bytes::copy_from_slice(reader.read_binary()?))
    } else {
        None
    };

    Ok(Connect {
        protocol_name,
        protocol_level,
        client_id,
        keep_alive,
        clean_session,
        username,
        password,
        will,
    })
}

fn read_connack(reader: &mut Reader<'_>) -> Result<ConnAck, CodecError> {
    let ack_flags = reader.read_u8()?;
    if ack_flags & 0xFE != 0 {
        return Err(CodecError::protocol("CONNACK reserved flags set"));
    }
    let code = ConnectReturnCode::try_from(reader.read_u8()?)?;
    Ok(ConnAck {
        session_present: ack_flags & 0x01 != 0,
        code,
    })
}

fn read_publish(flags: u8, reader: &mut Reader<'_>) -> Result<Publish, CodecError> {
    let dup = flags & 0x08 != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = flags & 0x01 != 0;
    if qos == QoS::AtMostOnce && dup {
        return Err(CodecError::protocol("QoS 0 PUBLISH with DUP set"));
    }

    let topic = reader.read_string()?;
    check_topic_name(&topic)?;

    let packet_id = if qos == QoS::AtMostOnce {
        None
    } else {
        Some(read_packet_id(reader)?)
    };
    let payload = Bytes::copy_from_slice(reader.read_rest());

    Ok(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload,
    })
}

fn read_packet_id(reader: &mut Reader<'_>) -> Result<u16, CodecError> {
    let id = reader.read_u16()?;
    if id == 0 {
        return Err(CodecError::protocol("packet identifier 0"));
    }
    Ok(id)
}

fn read_subscribe(reader: &mut Reader<'_>) -> Result<Subscribe, CodecError> {
    let packet_id = read_packet_id(reader)?;
    let mut filters = Vec::new();
    while !reader.is_empty() {
        let filter = reader.read_string()?;
        let requested = reader.read_u8()?;
        if requested & 0xFC != 0 {
            return Err(CodecError::protocol("SUBSCRIBE reserved option bits set"));
        }
        filters.push((filter, QoS::try_from(requested)?));
    }
    if filters.is_empty() {
        return Err(CodecError::protocol("SUBSCRIBE without topic filters"));
    }
    Ok(Subscribe { packet_id, filters })
}

fn read_suback(reader: &mut Reader<'_>) -> Result<SubAck, CodecError> {
    let packet_id = read_packet_id(reader)?;
    let mut return_codes = Vec::new();
    while !reader.is_empty() {
        let code = match reader.read_u8()? {
            SUBACK_FAILURE => None,
            n => Some(
                QoS::try_from(n)
                    .map_err(|_| CodecError::malformed(format!("SUBACK return code {:#04x}", n)))?,
            ),
        };
        return_codes.push(code);
    }
    Ok(SubAck {
        packet_id,
        return_codes,
    })
}

fn read_unsubscribe(reader: &mut Reader<'_>) -> Result<Unsubscribe, CodecError> {
    let packet_id = read_packet_id(reader)?;
    let mut filters = Vec::new();
    while !reader.is_empty() {
        filters.push(reader.read_string()?);
    }
    if filters.is_empty() {
        return Err(CodecError::protocol("UNSUBSCRIBE without topic filters"));
    }
    Ok(Unsubscribe { packet_id, filters })
}

/// Cursor over the variable header and payload of one frame
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| CodecError::malformed("packet body truncated"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + len > self.buf.len() {
            return Err(CodecError::malformed("packet body truncated"));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_binary(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }

    fn read_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_binary()?;
        if bytes.contains(&0) {
            return Err(CodecError::malformed("NUL character in string"));
        }
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| CodecError::malformed("invalid UTF-8 string"))
    }

    fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    fn finish(&self) -> Result<(), CodecError> {
        if self.pos != self.buf.len() {
            return Err(CodecError::malformed(format!(
                "{} trailing byte(s) in packet",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packets() -> Vec<Packet> {
        let mut connect = Connect::new("sensor-7", 30);
        connect.clean_session = false;
        connect.username = Some("alice".to_string());
        connect.password = Some(Bytes::from_static(b"secret"));
        connect.will = Some(LastWill {
            topic: "status/sensor-7".to_string(),
            payload: Bytes::from_static(b"offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        });

        let mut publish = Publish::new("sensors/room1/temp", &b"21.5"[..], QoS::ExactlyOnce);
        publish.packet_id = Some(7);
        publish.dup = true;
        publish.retain = true;

        vec![
            Packet::Connect(connect),
            Packet::Connect(Connect::new("", 0)),
            Packet::ConnAck(ConnAck {
                session_present: true,
                code: ConnectReturnCode::Accepted,
            }),
            Packet::ConnAck(ConnAck {
                session_present: false,
                code: ConnectReturnCode::NotAuthorized,
            }),
            Packet::Publish(publish),
            Packet::Publish(Publish::new("a/b", Bytes::new(), QoS::AtMostOnce)),
            Packet::PubAck(1),
            Packet::PubRec(2),
            Packet::PubRel(3),
            Packet::PubComp(u16::MAX),
            Packet::Subscribe(Subscribe {
                packet_id: 10,
                filters: vec![
                    ("sensors/+/temp".to_string(), QoS::AtLeastOnce),
                    ("#".to_string(), QoS::AtMostOnce),
                ],
            }),
            Packet::SubAck(SubAck {
                packet_id: 10,
                return_codes: vec![Some(QoS::AtLeastOnce), None, Some(QoS::ExactlyOnce)],
            }),
            Packet::Unsubscribe(Unsubscribe {
                packet_id: 11,
                filters: vec!["sensors/+/temp".to_string()],
            }),
            Packet::UnsubAck(11),
            Packet::PingReq,
            Packet::PingResp,
            Packet::Disconnect,
        ]
    }

    #[test]
    fn test_every_variant_round_trips() {
        for packet in sample_packets() {
            let bytes = encode(&packet).unwrap();
            let (decoded, used) = decode(&bytes, 0).unwrap().unwrap();
            assert_eq!(decoded, packet);
            assert_eq!(used, bytes.len());
        }
    }

    #[test]
    fn test_known_wire_bytes() {
        assert_eq!(&encode(&Packet::PingReq).unwrap()[..], &[0xC0, 0x00]);
        assert_eq!(&encode(&Packet::PubRel(0x0102)).unwrap()[..], &[0x62, 0x02, 0x01, 0x02]);

        let publish = Packet::Publish(Publish::new("a/b", &b"hi"[..], QoS::AtMostOnce));
        assert_eq!(
            &encode(&publish).unwrap()[..],
            &[0x30, 0x07, 0x00, 0x03, b'a', b'/', b'b', b'h', b'i']
        );
    }

    #[test]
    fn test_partial_frames_are_incomplete() {
        let bytes = encode(&sample_packets()[0]).unwrap();
        for cut in 0..bytes.len() {
            assert_eq!(decode(&bytes[..cut], 0).unwrap(), None, "cut at {}", cut);
        }
    }

    #[test]
    fn test_decode_reports_consumed_bytes_for_residual_buffer() {
        let mut buf = BytesMut::new();
        encode_into(&Packet::PubAck(5), &mut buf).unwrap();
        encode_into(&Packet::PingResp, &mut buf).unwrap();
        buf.extend_from_slice(&[0x30]); // start of the next frame

        let (first, used) = decode(&buf, 0).unwrap().unwrap();
        assert_eq!(first, Packet::PubAck(5));
        assert_eq!(used, 4);

        let rest = &buf[used..];
        let (second, used2) = decode(rest, 0).unwrap().unwrap();
        assert_eq!(second, Packet::PingResp);
        assert_eq!(decode(&rest[used2..], 0).unwrap(), None);
    }

    #[test]
    fn test_remaining_length_boundaries() {
        for value in [0, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152, MAX_REMAINING_LENGTH] {
            let mut buf = BytesMut::new();
            write_remaining_length(value, &mut buf);
            let (decoded, used) = decode_remaining_length(&buf).unwrap().unwrap();
            assert_eq!(decoded, value);
            assert_eq!(used, buf.len());
        }
        assert_eq!(decode_remaining_length(&[0xFF, 0xFF]).unwrap(), None);
        assert_eq!(
            decode_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
            Err(CodecError::InvalidRemainingLength)
        );
    }

    #[test]
    fn test_reserved_flags_are_protocol_errors() {
        let err = decode(&[0xC1, 0x00], 0).unwrap_err();
        assert!(err.is_protocol_error());

        // PUBREL must carry 0b0010
        let err = decode(&[0x60, 0x02, 0x00, 0x01], 0).unwrap_err();
        assert!(err.is_protocol_error());

        // packet type 0 is reserved
        assert!(decode(&[0x00, 0x00], 0).unwrap_err().is_protocol_error());
    }

    #[test]
    fn test_publish_with_qos_three_is_rejected() {
        let err = decode(&[0x36, 0x05, 0x00, 0x01, b'a', 0x00, 0x01], 0).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_encode_rejects_wildcard_topic_and_missing_id() {
        let wildcard = Packet::Publish(Publish::new("a/+", Bytes::new(), QoS::AtMostOnce));
        assert!(matches!(
            encode(&wildcard),
            Err(CodecError::MalformedPacket(_))
        ));

        let missing_id = Packet::Publish(Publish::new("a", Bytes::new(), QoS::AtLeastOnce));
        assert!(matches!(
            encode(&missing_id),
            Err(CodecError::MalformedPacket(_))
        ));

        assert!(encode(&Packet::PubAck(0)).is_err());
    }

    #[test]
    fn test_packet_size_limit() {
        let publish = Packet::Publish(Publish::new("t", vec![0u8; 100], QoS::AtMostOnce));
        let bytes = encode(&publish).unwrap();
        assert!(matches!(
            decode(&bytes, 64),
            Err(CodecError::PacketTooLarge { max: 64, .. })
        ));
        assert!(decode(&bytes, 0).unwrap().is_some());
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let err = decode(&[0xE0, 0x01, 0x00], 0).unwrap_err();
        assert!(matches!(err, CodecError::MalformedPacket(_)));
    }

    #[test]
    fn test_unknown_protocol_level_still_decodes() {
        let mut connect = Connect::new("old", 10);
        connect.protocol_level = 9;
        let bytes = encode(&Packet::Connect(connect)).unwrap();
        let (decoded, _) = decode(&bytes, 0).unwrap().unwrap();
        assert!(matches!(decoded, Packet::Connect(c) if c.protocol_level == 9));
    }
}
