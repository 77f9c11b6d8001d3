//! RFC 7252 message layout.

use bytes::Bytes;

use super::{CoapError, CoapMessage, CoapOption, FieldFlags, MessageType};
use crate::byte_order::{u16_at, write_network_u16};

const VERSION: u8 = 1;
const HEADER_LEN: usize = 4;
const MAX_TOKEN_LEN: usize = 8;
const PAYLOAD_MARKER: u8 = 0xff;
const EXT_BYTE: u8 = 13;
const EXT_WORD: u8 = 14;
const RESERVED: u8 = 15;
const EXT_BYTE_BASE: u32 = 13;
const EXT_WORD_BASE: u32 = 269;

struct Cursor {
    buf: Bytes,
    pos: usize,
}

impl Cursor {
    fn remaining(&self) -> usize { self.buf.len() - self.pos }

    fn u8(&mut self) -> Result<u8, CoapError> {
        let b = *self.buf.get(self.pos).ok_or(CoapError::NotEnoughData)?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<Bytes, CoapError> {
        if self.remaining() < n {
            return Err(CoapError::NotEnoughData);
        }
        let out = self.buf.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(out)
    }

    /// Value of a delta or length nibble after its extension bytes.
    fn extended(&mut self, nibble: u8) -> Result<u32, CoapError> {
        match nibble {
            EXT_BYTE => Ok(EXT_BYTE_BASE + u32::from(self.u8()?)),
            EXT_WORD => {
                let v = u16_at(&self.buf, self.pos).ok_or(CoapError::NotEnoughData)?;
                self.pos += 2;
                Ok(EXT_WORD_BASE + u32::from(v))
            }
            RESERVED => Err(CoapError::Format),
            n => Ok(u32::from(n)),
        }
    }
}

/// Parse one datagram.
///
/// # Errors
///
/// Returns [`CoapError::Ignore`] for a version other than 1,
/// [`CoapError::NotEnoughData`] when a field runs past the end and
/// [`CoapError::Format`] for reserved nibbles, tokens over eight bytes and an
/// empty payload after the marker.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use netmux::coap::{FieldFlags, MessageType, parse_coap};
///
/// let msg = parse_coap(Bytes::from_static(&[0x60, 0x00, 0x12, 0x34])).unwrap();
/// assert_eq!(msg.msg_type, MessageType::Acknowledgement);
/// assert_eq!(msg.msg_id, 0x1234);
/// assert!(!msg.fields.contains(FieldFlags::TOKEN));
/// ```
pub fn parse_coap(buf: Bytes) -> Result<CoapMessage, CoapError> {
    if buf.len() < HEADER_LEN {
        return Err(CoapError::NotEnoughData);
    }
    let mut cur = Cursor { buf, pos: 0 };
    let first = cur.u8()?;
    if first >> 6 != VERSION {
        return Err(CoapError::Ignore);
    }
    let code = cur.u8()?;
    let mut msg = CoapMessage {
        fields: FieldFlags::MSG_TYPE
            | FieldFlags::CODE_CLASS
            | FieldFlags::CODE_DETAIL
            | FieldFlags::MSG_ID,
        msg_type: MessageType::from_bits(first >> 4),
        code_class: code >> 5,
        code_detail: code & 0x1f,
        msg_id: u16_at(&cur.buf, 2).ok_or(CoapError::NotEnoughData)?,
        ..CoapMessage::default()
    };
    cur.pos = HEADER_LEN;

    let token_len = usize::from(first & 0x0f);
    if token_len > MAX_TOKEN_LEN {
        return Err(CoapError::Format);
    }
    if token_len > 0 {
        msg.token = cur.take(token_len)?;
        msg.fields |= FieldFlags::TOKEN;
    }

    let mut number = 0u32;
    while cur.remaining() > 0 {
        let head = cur.u8()?;
        if head == PAYLOAD_MARKER {
            if cur.remaining() == 0 {
                return Err(CoapError::Format);
            }
            msg.payload = cur.take(cur.remaining())?;
            msg.fields |= FieldFlags::PAYLOAD;
            break;
        }
        number += cur.extended(head >> 4)?;
        let len = cur.extended(head & 0x0f)?;
        let value = cur.take(usize::try_from(len).map_err(|_| CoapError::Format)?)?;
        msg.options.push(CoapOption {
            number: u16::try_from(number).map_err(|_| CoapError::Format)?,
            value,
        });
        msg.fields |= FieldFlags::OPTIONS;
    }
    Ok(msg)
}

fn split_ext(v: u32) -> (u8, Option<u8>, Option<u16>) {
    if v < EXT_BYTE_BASE {
        (u8::try_from(v).unwrap_or(0), None, None)
    } else if v < EXT_WORD_BASE {
        (EXT_BYTE, u8::try_from(v - EXT_BYTE_BASE).ok(), None)
    } else {
        (EXT_WORD, None, u16::try_from(v - EXT_WORD_BASE).ok())
    }
}

fn put_ext(out: &mut Vec<u8>, byte: Option<u8>, word: Option<u16>) {
    if let Some(b) = byte {
        out.push(b);
    }
    if let Some(w) = word {
        out.extend_from_slice(&write_network_u16(w));
    }
}

/// Append the wire form of `msg` to `out`.
///
/// Options are written in ascending number order; options sharing a number
/// keep their relative order.
///
/// # Errors
///
/// Returns [`CoapError::Format`] for tokens over eight bytes, a code class
/// above 7, a code detail above 31 or option values over 65804 bytes.
pub fn compose_coap(msg: &CoapMessage, out: &mut Vec<u8>) -> Result<(), CoapError> {
    if msg.token.len() > MAX_TOKEN_LEN || msg.code_class > 7 || msg.code_detail > 31 {
        return Err(CoapError::Format);
    }
    let token_len = u8::try_from(msg.token.len()).map_err(|_| CoapError::Format)?;
    out.push((VERSION << 6) | (msg.msg_type.bits() << 4) | token_len);
    out.push((msg.code_class << 5) | msg.code_detail);
    out.extend_from_slice(&write_network_u16(msg.msg_id));
    out.extend_from_slice(&msg.token);

    let mut sorted: Vec<&CoapOption> = msg.options.iter().collect();
    sorted.sort_by_key(|o| o.number);
    let mut prev = 0u16;
    for opt in sorted {
        let len = u32::try_from(opt.value.len()).map_err(|_| CoapError::Format)?;
        if len > EXT_WORD_BASE + u32::from(u16::MAX) {
            return Err(CoapError::Format);
        }
        let (delta_nibble, delta_byte, delta_word) = split_ext(u32::from(opt.number - prev));
        let (len_nibble, len_byte, len_word) = split_ext(len);
        out.push((delta_nibble << 4) | len_nibble);
        put_ext(out, delta_byte, delta_word);
        put_ext(out, len_byte, len_word);
        out.extend_from_slice(&opt.value);
        prev = opt.number;
    }

    if !msg.payload.is_empty() {
        out.push(PAYLOAD_MARKER);
        out.extend_from_slice(&msg.payload);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;

    use super::{compose_coap, parse_coap};
    use crate::coap::{CoapError, CoapMessage, FieldFlags, MessageType};

    fn compose(msg: &CoapMessage) -> Vec<u8> {
        let mut out = Vec::new();
        compose_coap(msg, &mut out).expect("composable");
        out
    }

    #[test]
    fn get_request_layout() {
        let mut msg = CoapMessage {
            msg_type: MessageType::Confirmable,
            code_class: 0,
            code_detail: 1,
            msg_id: 0x7d34,
            token: Bytes::from_static(b"\x01\x02"),
            ..CoapMessage::default()
        };
        msg.add_option(11, Bytes::from_static(b"temp"));
        assert_eq!(
            compose(&msg),
            [0x42, 0x01, 0x7d, 0x34, 0x01, 0x02, 0xb4, b't', b'e', b'm', b'p']
        );
    }

    #[test]
    fn extended_deltas_and_lengths() {
        let mut msg = CoapMessage::default();
        msg.add_option(300, Bytes::from(vec![7; 20]));
        msg.add_option(14, Bytes::new());
        let wire = compose(&msg);
        // 14: delta 13+1, empty value.
        assert_eq!(&wire[4..6], &[0xd0, 0x01]);
        // 300: delta 286 = 269 + 17, length 20 = 13 + 7.
        assert_eq!(&wire[6..10], &[0xed, 0x00, 0x11, 0x07]);
        let parsed = parse_coap(Bytes::from(wire)).expect("parse");
        let numbers: Vec<u16> = parsed.options.iter().map(|o| o.number).collect();
        assert_eq!(numbers, [14, 300]);
        assert_eq!(parsed.options[1].value.len(), 20);
    }

    #[test]
    fn payload_sets_field_flag() {
        let msg = CoapMessage {
            msg_type: MessageType::NonConfirmable,
            code_class: 2,
            code_detail: 5,
            payload: Bytes::from_static(b"22.5"),
            ..CoapMessage::default()
        };
        let parsed = parse_coap(Bytes::from(compose(&msg))).expect("parse");
        assert!(parsed.fields.contains(FieldFlags::PAYLOAD));
        assert!(!parsed.fields.contains(FieldFlags::OPTIONS));
        assert_eq!(parsed.payload.as_ref(), b"22.5");
        assert_eq!((parsed.code_class, parsed.code_detail), (2, 5));
    }

    #[rstest]
    #[case::short_header(&[0x40, 0x01, 0x00][..], CoapError::NotEnoughData)]
    #[case::wrong_version(&[0x80, 0x01, 0x00, 0x01][..], CoapError::Ignore)]
    #[case::long_token(&[0x49, 0x01, 0x00, 0x01][..], CoapError::Format)]
    #[case::missing_token(&[0x42, 0x01, 0x00, 0x01, 0xaa][..], CoapError::NotEnoughData)]
    #[case::reserved_delta(&[0x40, 0x01, 0x00, 0x01, 0xf0][..], CoapError::Format)]
    #[case::reserved_length(&[0x40, 0x01, 0x00, 0x01, 0x0f][..], CoapError::Format)]
    #[case::empty_payload(&[0x40, 0x01, 0x00, 0x01, 0xff][..], CoapError::Format)]
    #[case::short_option(&[0x40, 0x01, 0x00, 0x01, 0x13, b'a'][..], CoapError::NotEnoughData)]
    fn rejected_datagrams(#[case] wire: &[u8], #[case] expected: CoapError) {
        assert_eq!(parse_coap(Bytes::copy_from_slice(wire)), Err(expected));
    }

    #[test]
    fn oversized_token_is_not_composed() {
        let msg = CoapMessage {
            token: Bytes::from_static(&[0; 9]),
            ..CoapMessage::default()
        };
        assert_eq!(compose_coap(&msg, &mut Vec::new()), Err(CoapError::Format));
    }
}
