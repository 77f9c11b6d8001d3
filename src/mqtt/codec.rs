//! Wire codec: fixed header with a 1–4 byte remaining length, then the
//! command-specific variable header and payload.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{
    MqttError,
    packet::{
        ConnAck,
        ConnAckCode,
        Connect,
        ConnectFlags,
        Packet,
        Publish,
        Qos,
        SubAck,
        Subscribe,
        Unsubscribe,
        Will,
    },
};
use crate::byte_order::{u16_at, write_network_u16};

/// Largest value the remaining-length varint can express.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Decodes and encodes [`Packet`]s.
///
/// # Examples
///
/// ```
/// use bytes::BytesMut;
/// use netmux::mqtt::{MqttCodec, Packet};
/// use tokio_util::codec::{Decoder, Encoder};
///
/// let mut codec = MqttCodec::default();
/// let mut buf = BytesMut::new();
/// codec.encode(&Packet::PubAck(7), &mut buf).unwrap();
/// assert_eq!(&buf[..], &[0x40, 0x02, 0x00, 0x07]);
/// assert_eq!(codec.decode(&mut buf).unwrap(), Some(Packet::PubAck(7)));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MqttCodec {
    max_packet_size: usize,
}

impl Default for MqttCodec {
    fn default() -> Self { Self::new(MAX_REMAINING_LENGTH) }
}

impl MqttCodec {
    /// Codec refusing packets whose remaining length exceeds `max`.
    #[must_use]
    pub fn new(max_packet_size: usize) -> Self { Self { max_packet_size } }

    #[must_use]
    pub fn max_packet_size(&self) -> usize { self.max_packet_size }

    /// Fixed header byte, body offset and total length of the packet at the
    /// start of `buf`, once the remaining-length field is complete.
    fn frame_bounds(&self, buf: &[u8]) -> Result<Option<(u8, usize, usize)>, MqttError> {
        let Some(&header) = buf.first() else {
            return Ok(None);
        };
        let Some((remaining, len_bytes)) = decode_length(&buf[1..])? else {
            return Ok(None);
        };
        if remaining > self.max_packet_size {
            return Err(MqttError::TooLarge {
                size: remaining,
                max: self.max_packet_size,
            });
        }
        Ok(Some((header, 1 + len_bytes, 1 + len_bytes + remaining)))
    }

    /// Decode the packet at the start of `buf` without consuming it.
    ///
    /// Returns the packet with its encoded length, or `Ok(None)` while the
    /// packet is incomplete.
    ///
    /// # Errors
    ///
    /// Returns an [`MqttError`] for malformed or oversized packets.
    pub fn peek(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, MqttError> {
        let Some((header, body_start, total)) = self.frame_bounds(buf)? else {
            return Ok(None);
        };
        let Some(body) = buf.get(body_start..total) else {
            return Ok(None);
        };
        let packet = parse_body(header, Bytes::copy_from_slice(body))?;
        Ok(Some((packet, total)))
    }
}

/// Decode the remaining-length varint at the start of `buf`.
///
/// Returns the value and the number of bytes it occupied.
fn decode_length(buf: &[u8]) -> Result<Option<(usize, usize)>, MqttError> {
    let mut value = 0usize;
    for (i, &b) in buf.iter().take(4).enumerate() {
        value |= usize::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= 4 {
        return Err(MqttError::MalformedLength);
    }
    Ok(None)
}

fn encode_length(mut len: usize, dst: &mut BytesMut) {
    loop {
        let mut byte = u8::try_from(len & 0x7f).unwrap_or_default();
        len >>= 7;
        if len > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if len == 0 {
            return;
        }
    }
}

struct Reader {
    buf: Bytes,
    pos: usize,
}

impl Reader {
    fn remaining(&self) -> usize { self.buf.len() - self.pos }

    fn u8(&mut self) -> Result<u8, MqttError> {
        let b = *self.buf.get(self.pos).ok_or(MqttError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, MqttError> {
        let v = u16_at(&self.buf, self.pos).ok_or(MqttError::Truncated)?;
        self.pos += 2;
        Ok(v)
    }

    fn bytes(&mut self) -> Result<Bytes, MqttError> {
        let len = usize::from(self.u16()?);
        if self.remaining() < len {
            return Err(MqttError::Truncated);
        }
        let out = self.buf.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(out)
    }

    fn string(&mut self) -> Result<String, MqttError> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| MqttError::InvalidUtf8)
    }

    fn rest(&mut self) -> Bytes {
        let out = self.buf.slice(self.pos..);
        self.pos = self.buf.len();
        out
    }
}

fn parse_connect(r: &mut Reader) -> Result<Connect, MqttError> {
    let protocol_name = r.string()?;
    let protocol_level = r.u8()?;
    let flags = ConnectFlags::from_bits_retain(r.u8()?);
    if flags.bits() & 0x01 != 0 {
        return Err(MqttError::Malformed("reserved connect flag set"));
    }
    let keep_alive = r.u16()?;
    let client_id = r.string()?;
    let will = if flags.contains(ConnectFlags::HAS_WILL) {
        let topic = r.string()?;
        let message = r.bytes()?;
        let qos = Qos::from_u8((flags & ConnectFlags::WILL_QOS).bits() >> 3)
            .ok_or(MqttError::InvalidQos(3))?;
        Some(Will {
            topic,
            message,
            qos,
            retain: flags.contains(ConnectFlags::WILL_RETAIN),
        })
    } else {
        None
    };
    let username = if flags.contains(ConnectFlags::HAS_USER_NAME) {
        Some(r.string()?)
    } else {
        None
    };
    let password = if flags.contains(ConnectFlags::HAS_PASSWORD) {
        Some(r.bytes()?)
    } else {
        None
    };
    Ok(Connect {
        protocol_name,
        protocol_level,
        clean_session: flags.contains(ConnectFlags::CLEAN_SESSION),
        keep_alive,
        client_id,
        will,
        username,
        password,
    })
}

fn parse_publish(flags: u8, r: &mut Reader) -> Result<Publish, MqttError> {
    let raw_qos = (flags >> 1) & 0x03;
    let qos = Qos::from_u8(raw_qos).ok_or(MqttError::InvalidQos(raw_qos))?;
    let topic = r.string()?;
    let packet_id = if qos == Qos::AtMostOnce { None } else { Some(r.u16()?) };
    Ok(Publish {
        dup: flags & 0x08 != 0,
        qos,
        retain: flags & 0x01 != 0,
        topic,
        packet_id,
        payload: r.rest(),
    })
}

fn parse_subscribe(r: &mut Reader) -> Result<Subscribe, MqttError> {
    let packet_id = r.u16()?;
    let mut topics = Vec::new();
    while r.remaining() > 0 {
        let filter = r.string()?;
        let raw = r.u8()?;
        let qos = Qos::from_u8(raw).ok_or(MqttError::InvalidQos(raw))?;
        topics.push((filter, qos));
    }
    if topics.is_empty() {
        return Err(MqttError::Malformed("subscribe without topics"));
    }
    Ok(Subscribe { packet_id, topics })
}

fn parse_unsubscribe(r: &mut Reader) -> Result<Unsubscribe, MqttError> {
    let packet_id = r.u16()?;
    let mut topics = Vec::new();
    while r.remaining() > 0 {
        topics.push(r.string()?);
    }
    if topics.is_empty() {
        return Err(MqttError::Malformed("unsubscribe without topics"));
    }
    Ok(Unsubscribe { packet_id, topics })
}

fn parse_body(header: u8, body: Bytes) -> Result<Packet, MqttError> {
    let mut r = Reader { buf: body, pos: 0 };
    let packet = match header >> 4 {
        1 => Packet::Connect(parse_connect(&mut r)?),
        2 => {
            let session_present = r.u8()? & 0x01 != 0;
            let raw = r.u8()?;
            let code = ConnAckCode::from_u8(raw).ok_or(MqttError::Malformed("connack code"))?;
            Packet::ConnAck(ConnAck {
                session_present,
                code,
            })
        }
        3 => Packet::Publish(parse_publish(header & 0x0f, &mut r)?),
        4 => Packet::PubAck(r.u16()?),
        5 => Packet::PubRec(r.u16()?),
        6 => Packet::PubRel(r.u16()?),
        7 => Packet::PubComp(r.u16()?),
        8 => Packet::Subscribe(parse_subscribe(&mut r)?),
        9 => {
            let packet_id = r.u16()?;
            Packet::SubAck(SubAck {
                packet_id,
                return_codes: r.rest().to_vec(),
            })
        }
        10 => Packet::Unsubscribe(parse_unsubscribe(&mut r)?),
        11 => Packet::UnsubAck(r.u16()?),
        12 => Packet::PingReq,
        13 => Packet::PingResp,
        14 => Packet::Disconnect,
        other => return Err(MqttError::UnknownCommand(other)),
    };
    Ok(packet)
}

impl Decoder for MqttCodec {
    type Item = Packet;
    type Error = MqttError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((header, body_start, total)) = self.frame_bounds(src)? else {
            return Ok(None);
        };
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let frame = src.split_to(total).freeze();
        parse_body(header, frame.slice(body_start..)).map(Some)
    }
}

fn put_str(out: &mut BytesMut, s: &[u8]) -> Result<(), MqttError> {
    let len = u16::try_from(s.len()).map_err(|_| MqttError::FieldTooLong(s.len()))?;
    out.put_slice(&write_network_u16(len));
    out.put_slice(s);
    Ok(())
}

fn encode_body(packet: &Packet, out: &mut BytesMut) -> Result<u8, MqttError> {
    let flags = match packet {
        Packet::Connect(c) => {
            put_str(out, c.protocol_name.as_bytes())?;
            out.put_u8(c.protocol_level);
            let mut flags = ConnectFlags::empty();
            flags.set(ConnectFlags::CLEAN_SESSION, c.clean_session);
            if let Some(w) = &c.will {
                flags |= ConnectFlags::HAS_WILL
                    | ConnectFlags::from_bits_retain(w.qos.as_u8() << 3);
                flags.set(ConnectFlags::WILL_RETAIN, w.retain);
            }
            flags.set(ConnectFlags::HAS_USER_NAME, c.username.is_some());
            flags.set(ConnectFlags::HAS_PASSWORD, c.password.is_some());
            out.put_u8(flags.bits());
            out.put_slice(&write_network_u16(c.keep_alive));
            put_str(out, c.client_id.as_bytes())?;
            if let Some(w) = &c.will {
                put_str(out, w.topic.as_bytes())?;
                put_str(out, &w.message)?;
            }
            if let Some(u) = &c.username {
                put_str(out, u.as_bytes())?;
            }
            if let Some(p) = &c.password {
                put_str(out, p)?;
            }
            0
        }
        Packet::ConnAck(a) => {
            out.put_u8(u8::from(a.session_present));
            out.put_u8(a.code.as_u8());
            0
        }
        Packet::Publish(p) => {
            put_str(out, p.topic.as_bytes())?;
            if p.qos != Qos::AtMostOnce {
                let id = p.packet_id.ok_or(MqttError::Malformed("publish without packet id"))?;
                out.put_slice(&write_network_u16(id));
            }
            out.put_slice(&p.payload);
            (u8::from(p.dup) << 3) | (p.qos.as_u8() << 1) | u8::from(p.retain)
        }
        Packet::PubAck(id) | Packet::PubRec(id) | Packet::PubComp(id) | Packet::UnsubAck(id) => {
            out.put_slice(&write_network_u16(*id));
            0
        }
        Packet::PubRel(id) => {
            out.put_slice(&write_network_u16(*id));
            0x02
        }
        Packet::Subscribe(s) => {
            out.put_slice(&write_network_u16(s.packet_id));
            for (filter, qos) in &s.topics {
                put_str(out, filter.as_bytes())?;
                out.put_u8(qos.as_u8());
            }
            0x02
        }
        Packet::SubAck(s) => {
            out.put_slice(&write_network_u16(s.packet_id));
            out.put_slice(&s.return_codes);
            0
        }
        Packet::Unsubscribe(u) => {
            out.put_slice(&write_network_u16(u.packet_id));
            for filter in &u.topics {
                put_str(out, filter.as_bytes())?;
            }
            0x02
        }
        Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
    };
    Ok(flags)
}

impl Encoder<&Packet> for MqttCodec {
    type Error = MqttError;

    fn encode(&mut self, item: &Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        let flags = encode_body(item, &mut body)?;
        if body.len() > MAX_REMAINING_LENGTH {
            return Err(MqttError::TooLarge {
                size: body.len(),
                max: MAX_REMAINING_LENGTH,
            });
        }
        dst.reserve(body.len() + 5);
        dst.put_u8((item.command() << 4) | flags);
        encode_length(body.len(), dst);
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use rstest::rstest;
    use tokio_util::codec::{Decoder, Encoder};

    use super::{MqttCodec, decode_length, encode_length};
    use crate::mqtt::{
        MqttError,
        packet::{Connect, Packet, Publish, Qos, Subscribe, Will},
    };

    fn encode(packet: &Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        MqttCodec::default().encode(packet, &mut buf).expect("encodable");
        buf
    }

    #[rstest]
    #[case(0, &[0x00])]
    #[case(127, &[0x7f])]
    #[case(128, &[0x80, 0x01])]
    #[case(16_383, &[0xff, 0x7f])]
    #[case(2_097_152, &[0x80, 0x80, 0x80, 0x01])]
    #[case(268_435_455, &[0xff, 0xff, 0xff, 0x7f])]
    fn remaining_length_boundaries(#[case] value: usize, #[case] wire: &[u8]) {
        let mut out = BytesMut::new();
        encode_length(value, &mut out);
        assert_eq!(&out[..], wire);
        assert_eq!(decode_length(wire), Ok(Some((value, wire.len()))));
    }

    #[test]
    fn five_byte_length_is_rejected() {
        assert_eq!(
            decode_length(&[0xff, 0xff, 0xff, 0xff, 0x01]),
            Err(MqttError::MalformedLength)
        );
    }

    #[test]
    fn publish_waits_for_whole_packet() {
        let packet = Packet::Publish(Publish {
            qos: Qos::AtLeastOnce,
            topic: "a/b".into(),
            packet_id: Some(9),
            payload: Bytes::from_static(b"payload"),
            ..Publish::default()
        });
        let full = encode(&packet);
        let mut codec = MqttCodec::default();
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert_eq!(codec.decode(&mut partial), Ok(None));
        partial.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(codec.decode(&mut partial), Ok(Some(packet)));
        assert!(partial.is_empty());
    }

    #[test]
    fn peek_reports_length_without_consuming() {
        let mut wire = encode(&Packet::PubAck(3)).to_vec();
        wire.extend_from_slice(&encode(&Packet::PingReq));
        let codec = MqttCodec::default();
        assert_eq!(codec.peek(&wire), Ok(Some((Packet::PubAck(3), 4))));
        assert_eq!(codec.peek(&wire[4..]), Ok(Some((Packet::PingReq, 2))));
        assert_eq!(codec.peek(&wire[..3]), Ok(None));
        assert_eq!(wire.len(), 6);
    }

    #[test]
    fn connect_with_will_and_credentials() {
        let packet = Packet::Connect(Connect {
            client_id: "dev-1".into(),
            keep_alive: 30,
            will: Some(Will {
                topic: "dead".into(),
                message: Bytes::from_static(b"bye"),
                qos: Qos::AtLeastOnce,
                retain: true,
            }),
            username: Some("u".into()),
            password: Some(Bytes::from_static(b"p")),
            ..Connect::default()
        });
        let mut buf = encode(&packet);
        assert_eq!(buf[9], 0x02 | 0x04 | 0x08 | 0x20 | 0x40 | 0x80);
        assert_eq!(MqttCodec::default().decode(&mut buf), Ok(Some(packet)));
    }

    #[rstest]
    #[case::qos3_publish(&[0x36, 0x03, 0x00, 0x01, b'a'], MqttError::InvalidQos(3))]
    #[case::reserved_command(&[0xf0, 0x00], MqttError::UnknownCommand(15))]
    #[case::empty_subscribe(&[0x82, 0x02, 0x00, 0x01], MqttError::Malformed("subscribe without topics"))]
    #[case::short_puback(&[0x40, 0x01, 0x00], MqttError::Truncated)]
    fn malformed_packets(#[case] raw: &[u8], #[case] expected: MqttError) {
        let mut buf = BytesMut::from(raw);
        assert_eq!(MqttCodec::default().decode(&mut buf), Err(expected));
    }

    #[test]
    fn oversized_packet_is_refused_before_buffering() {
        let mut codec = MqttCodec::new(64);
        let mut buf = BytesMut::from(&[0x30, 0x80, 0x01][..]);
        assert_eq!(
            codec.decode(&mut buf),
            Err(MqttError::TooLarge { size: 128, max: 64 })
        );
    }

    #[test]
    fn subscribe_sets_reserved_flags() {
        let buf = encode(&Packet::Subscribe(Subscribe {
            packet_id: 1,
            topics: vec![("x/#".into(), Qos::ExactlyOnce)],
        }));
        assert_eq!(buf[0], 0x82);
        assert_eq!(&buf[2..], &[0x00, 0x01, 0x00, 0x03, b'x', b'/', b'#', 0x02]);
    }
}
