//! WebSocket handshake and framing.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use rand::Rng;
use sha1::{Digest, Sha1};

use super::{HttpError, HttpMessage, WsEvent};
use crate::{
    buffer::Buffer,
    byte_order::{u16_at, u64_at, write_network_u16, write_network_u64},
    connection::{ConnFlags, Connection},
    event::Event,
    manager::Context,
};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const FIN: u8 = 0x80;
const RSV: u8 = 0x70;
const OPCODE: u8 = 0x0f;
const MASKED: u8 = 0x80;
const MAX_CONTROL_PAYLOAD: usize = 125;

/// Frame opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    /// Decode the low nibble of a frame's first byte.
    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xa => Self::Pong,
            _ => return None,
        })
    }

    /// Wire value.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xa,
        }
    }

    /// PING, PONG and CLOSE.
    #[must_use]
    pub fn is_control(self) -> bool { matches!(self, Self::Close | Self::Ping | Self::Pong) }
}

/// A received frame with its payload unmasked.
///
/// When defragmentation is on, `data` holds the whole reassembled message,
/// `opcode` is that of the first fragment and `fin` is set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WsFrame<'a> {
    pub opcode: Opcode,
    pub fin: bool,
    pub data: &'a [u8],
}

/// A message being reassembled at the front of the receive buffer.
#[derive(Clone, Copy, Debug)]
pub(super) struct Fragment {
    opcode: Opcode,
    len: usize,
}

#[derive(Debug, PartialEq, Eq)]
struct Header {
    fin: bool,
    opcode: Opcode,
    mask: Option<[u8; 4]>,
    header_len: usize,
    payload_len: usize,
}

fn parse_header(buf: &[u8]) -> Result<Option<Header>, HttpError> {
    let (Some(&b0), Some(&b1)) = (buf.first(), buf.get(1)) else {
        return Ok(None);
    };
    if b0 & RSV != 0 {
        return Err(HttpError::BadFrame("reserved bits set"));
    }
    let opcode = Opcode::from_u8(b0 & OPCODE).ok_or(HttpError::BadFrame("unknown opcode"))?;
    let fin = b0 & FIN != 0;
    let (payload_len, mut header_len) = match b1 & 0x7f {
        126 => match u16_at(buf, 2) {
            Some(n) => (usize::from(n), 4),
            None => return Ok(None),
        },
        127 => match u64_at(buf, 2) {
            Some(n) => (
                usize::try_from(n).map_err(|_| HttpError::BadFrame("length overflow"))?,
                10,
            ),
            None => return Ok(None),
        },
        n => (usize::from(n), 2),
    };
    if opcode.is_control() && (!fin || payload_len > MAX_CONTROL_PAYLOAD) {
        return Err(HttpError::BadFrame("oversized or fragmented control frame"));
    }
    let mask = if b1 & MASKED == 0 {
        None
    } else {
        let Some(key) = buf.get(header_len..header_len + 4) else {
            return Ok(None);
        };
        header_len += 4;
        Some([key[0], key[1], key[2], key[3]])
    };
    Ok(Some(Header {
        fin,
        opcode,
        mask,
        header_len,
        payload_len,
    }))
}

fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= mask[i % 4];
    }
}

/// Value of `Sec-WebSocket-Accept` for a client's `Sec-WebSocket-Key`.
///
/// # Examples
///
/// ```
/// use netmux::http::websocket_accept_key;
///
/// assert_eq!(
///     websocket_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
#[must_use]
pub fn websocket_accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(GUID.as_bytes());
    STANDARD.encode(sha.finalize())
}

fn header_has_token(value: Option<&str>, token: &str) -> bool {
    value.is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
}

pub(super) fn is_upgrade_request(msg: &HttpMessage<'_>) -> bool {
    header_has_token(msg.header("Upgrade"), "websocket") && msg.header("Sec-WebSocket-Key").is_some()
}

pub(super) fn is_upgrade_reply(msg: &HttpMessage<'_>) -> bool {
    header_has_token(msg.header("Upgrade"), "websocket")
        && msg.header("Sec-WebSocket-Accept").is_some()
}

impl Connection {
    /// Accept an upgrade request carrying `key`.
    pub fn send_websocket_handshake_reply(&mut self, key: &str, protocol: Option<&str>) {
        self.send_fmt(format_args!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: \
             Upgrade\r\nSec-WebSocket-Accept: {}\r\n",
            websocket_accept_key(key)
        ));
        if let Some(p) = protocol {
            self.send_fmt(format_args!("Sec-WebSocket-Protocol: {p}\r\n"));
        }
        self.send(b"\r\n");
    }

    /// Send an upgrade request for `path` and return the generated key.
    ///
    /// `extra_headers` must be empty or end with CRLF.
    pub fn send_websocket_handshake(
        &mut self,
        path: &str,
        host: Option<&str>,
        protocol: Option<&str>,
        extra_headers: &str,
    ) -> String {
        let nonce: [u8; 16] = rand::thread_rng().r#gen();
        let key = STANDARD.encode(nonce);
        self.send_fmt(format_args!(
            "GET {path} HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {key}\r\n"
        ));
        if let Some(h) = host {
            self.send_fmt(format_args!("Host: {h}\r\n"));
        }
        if let Some(p) = protocol {
            self.send_fmt(format_args!("Sec-WebSocket-Protocol: {p}\r\n"));
        }
        self.send_fmt(format_args!("{extra_headers}\r\n"));
        key
    }

    /// Send a complete message in one frame.
    pub fn send_websocket_frame(&mut self, opcode: Opcode, data: &[u8]) {
        self.send_websocket_fragment(opcode, data, true);
    }

    /// Send one frame. Fragmented messages start with the data opcode and
    /// continue with [`Opcode::Continuation`]; the last frame sets `fin`.
    ///
    /// Frames sent by client connections are masked.
    pub fn send_websocket_fragment(&mut self, opcode: Opcode, data: &[u8], fin: bool) {
        let mut header = Vec::with_capacity(14);
        header.push(if fin { FIN } else { 0 } | opcode.as_u8());
        let mask_bit = if self.is_client() { MASKED } else { 0 };
        match data.len() {
            n @ 0..126 => header.push(mask_bit | u8::try_from(n).unwrap_or(125)),
            n if u16::try_from(n).is_ok() => {
                header.push(mask_bit | 126);
                header.extend_from_slice(&write_network_u16(u16::try_from(n).unwrap_or(u16::MAX)));
            }
            n => {
                header.push(mask_bit | 127);
                header.extend_from_slice(&write_network_u64(u64::try_from(n).unwrap_or(u64::MAX)));
            }
        }
        if mask_bit == 0 {
            self.send(&header);
            self.send(data);
            return;
        }
        let mask: [u8; 4] = rand::thread_rng().r#gen();
        header.extend_from_slice(&mask);
        let mut masked = data.to_vec();
        apply_mask(&mut masked, mask);
        self.send(&header);
        self.send(&masked);
    }
}

fn handle_control(ctx: &mut Context<'_>, frame: &WsFrame<'_>) {
    match frame.opcode {
        Opcode::Ping => ctx.conn_mut().send_websocket_frame(Opcode::Pong, frame.data),
        Opcode::Close => {
            let conn = ctx.conn_mut();
            conn.send_websocket_frame(Opcode::Close, frame.data);
            conn.close_after_send();
        }
        _ => {}
    }
    ctx.deliver(Event::WebSocket(WsEvent::ControlFrame(frame)));
}

/// Deliver every complete frame in `buf`.
///
/// A partially reassembled message sits at the front of `buf`, frame
/// headers removed, and is tracked by `fragment`.
pub(super) fn process_frames(
    ctx: &mut Context<'_>,
    fragment: &mut Option<Fragment>,
    buf: &mut Buffer,
) -> Result<(), HttpError> {
    loop {
        if ctx.conn().flags().is_closing() {
            return Ok(());
        }
        let at = fragment.map_or(0, |f| f.len);
        let Some(h) = parse_header(&buf.as_slice()[at..])? else {
            return check_frame_limit(ctx, buf);
        };
        let frame_len = h
            .header_len
            .checked_add(h.payload_len)
            .ok_or(HttpError::BadFrame("length overflow"))?;
        if buf.len() - at < frame_len {
            return check_frame_limit(ctx, buf);
        }
        let payload = at + h.header_len..at + frame_len;
        if let Some(mask) = h.mask {
            apply_mask(&mut buf.as_mut_slice()[payload.clone()], mask);
        }

        if h.opcode.is_control() {
            let frame = WsFrame {
                opcode: h.opcode,
                fin: true,
                data: &buf.as_slice()[payload],
            };
            handle_control(ctx, &frame);
            buf.remove_range(at, frame_len);
            continue;
        }

        if ctx.conn().flags().contains(ConnFlags::WEBSOCKET_NO_DEFRAG) {
            let frame = WsFrame {
                opcode: h.opcode,
                fin: h.fin,
                data: &buf.as_slice()[payload],
            };
            ctx.deliver(Event::WebSocket(WsEvent::Frame(&frame)));
            buf.remove(frame_len);
            continue;
        }

        match (*fragment, h.opcode) {
            (None, Opcode::Continuation) => {
                return Err(HttpError::BadFrame("continuation without a message"));
            }
            (Some(_), op) if op != Opcode::Continuation => {
                return Err(HttpError::BadFrame("data frame inside a fragmented message"));
            }
            (None, opcode) if h.fin => {
                let frame = WsFrame {
                    opcode,
                    fin: true,
                    data: &buf.as_slice()[payload],
                };
                ctx.deliver(Event::WebSocket(WsEvent::Frame(&frame)));
                buf.remove(frame_len);
            }
            (None, opcode) => {
                buf.remove_range(0, h.header_len);
                *fragment = Some(Fragment {
                    opcode,
                    len: h.payload_len,
                });
            }
            (Some(f), _) => {
                buf.remove_range(at, h.header_len);
                let len = f.len + h.payload_len;
                if !h.fin {
                    *fragment = Some(Fragment { len, ..f });
                    continue;
                }
                *fragment = None;
                let frame = WsFrame {
                    opcode: f.opcode,
                    fin: true,
                    data: &buf.as_slice()[..len],
                };
                ctx.deliver(Event::WebSocket(WsEvent::Frame(&frame)));
                buf.remove(len);
            }
        }
    }
}

fn check_frame_limit(ctx: &Context<'_>, buf: &Buffer) -> Result<(), HttpError> {
    let limit = ctx.conn().recv_limit();
    if buf.len() > limit {
        return Err(HttpError::TooLarge(limit));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{Header, HttpError, Opcode, apply_mask, parse_header};

    #[rstest]
    #[case::short(&[0x81, 0x05], Header { fin: true, opcode: Opcode::Text, mask: None, header_len: 2, payload_len: 5 })]
    #[case::extended16(&[0x02, 0x7e, 0x01, 0x00], Header { fin: false, opcode: Opcode::Binary, mask: None, header_len: 4, payload_len: 256 })]
    #[case::masked(&[0x89, 0x80, 1, 2, 3, 4], Header { fin: true, opcode: Opcode::Ping, mask: Some([1, 2, 3, 4]), header_len: 6, payload_len: 0 })]
    fn headers_parse(#[case] raw: &[u8], #[case] expected: Header) {
        assert_eq!(parse_header(raw), Ok(Some(expected)));
    }

    #[rstest]
    #[case::one_byte(&[0x81])]
    #[case::missing_extended_length(&[0x81, 0x7e, 0x01])]
    #[case::missing_mask(&[0x81, 0x85, 1, 2])]
    fn truncated_headers_wait(#[case] raw: &[u8]) {
        assert_eq!(parse_header(raw), Ok(None));
    }

    #[rstest]
    #[case::reserved_bits(&[0xc1, 0x00])]
    #[case::unknown_opcode(&[0x83, 0x00])]
    #[case::fragmented_ping(&[0x09, 0x00])]
    #[case::long_close(&[0x88, 0x7e, 0x00, 0x80])]
    fn invalid_headers_fail(#[case] raw: &[u8]) {
        assert!(matches!(parse_header(raw), Err(HttpError::BadFrame(_))));
    }

    #[test]
    fn masking_is_an_involution() {
        let mut data = *b"hello websocket";
        apply_mask(&mut data, [0xde, 0xad, 0xbe, 0xef]);
        assert_ne!(&data, b"hello websocket");
        apply_mask(&mut data, [0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&data, b"hello websocket");
    }
}
