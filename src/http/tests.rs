//! Unit tests for the HTTP reply helpers and shared scanning utilities.

use std::time::Instant;

use rstest::{fixture, rstest};
use slotmap::SlotMap;

use super::{Opcode, find_subslice, parse_http, status_text, strip_leading_newlines};
use crate::{
    buffer::Buffer,
    connection::{ConnFlags, ConnId, Connection},
};

#[fixture]
fn server_conn() -> Connection {
    let mut ids: SlotMap<ConnId, ()> = SlotMap::with_key();
    let mut conn = Connection::new(ids.insert(()), None, 1.5, 4096, Instant::now());
    conn.listener = Some(ids.insert(()));
    conn
}

fn sent(conn: &Connection) -> &str {
    std::str::from_utf8(conn.send_buffer().as_slice()).expect("replies are text")
}

#[rstest]
#[case(b"abcdef".as_slice(), b"cd".as_slice(), Some(2))]
#[case(b"abc".as_slice(), b"abcd".as_slice(), None)]
#[case(b"abc".as_slice(), b"".as_slice(), None)]
fn subslice_search(#[case] hay: &[u8], #[case] needle: &[u8], #[case] expected: Option<usize>) {
    assert_eq!(find_subslice(hay, needle), expected);
}

#[test]
fn keep_alive_separators_are_skipped() {
    let mut buf = Buffer::new();
    buf.append(b"\r\n\r\nGET / HTTP/1.1\r\n\r\n");
    strip_leading_newlines(&mut buf);
    assert!(buf.as_slice().starts_with(b"GET"));
}

#[rstest]
fn head_with_length_is_parseable(mut server_conn: Connection) {
    server_conn.send_head(200, Some(5), Some("X-A: 1"));
    server_conn.send(b"hello");
    let reply = parse_http(server_conn.send_buffer().as_slice(), false, 20)
        .expect("valid reply")
        .expect("complete reply");
    assert_eq!(reply.resp_code, 200);
    assert_eq!(reply.header("x-a"), Some("1"));
    assert!(reply.header("Server").is_some_and(|s| s.starts_with("netmux/")));
    assert_eq!(reply.body, b"hello");
}

#[rstest]
fn chunked_head_and_terminator(mut server_conn: Connection) {
    server_conn.send_head(200, None, None);
    server_conn.send_http_chunk(b"0123456789ab");
    server_conn.send_http_chunk(b"");
    let text = sent(&server_conn);
    assert!(text.contains("Transfer-Encoding: chunked\r\n\r\n"));
    assert!(text.ends_with("C\r\n0123456789ab\r\n0\r\n\r\n"));
}

#[rstest]
fn error_reply_closes_after_send(mut server_conn: Connection) {
    server_conn.send_error(404, None);
    let text = sent(&server_conn);
    assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(text.ends_with("\r\n\r\nNot Found"));
    assert!(server_conn.flags().contains(ConnFlags::SEND_AND_CLOSE));
}

#[rstest]
fn redirect_carries_location(mut server_conn: Connection) {
    server_conn.send_redirect(302, "/login", None);
    let reply = parse_http(server_conn.send_buffer().as_slice(), false, 20)
        .expect("valid reply")
        .expect("complete reply");
    assert_eq!(reply.resp_status_msg, status_text(302));
    assert_eq!(reply.header("Location"), Some("/login"));
    assert_eq!(reply.content_length(), Some(reply.body.len()));
}

#[rstest]
fn handshake_reply_uses_accept_key(mut server_conn: Connection) {
    server_conn.send_websocket_handshake_reply("dGhlIHNhbXBsZSBub25jZQ==", Some("chat"));
    let reply = parse_http(server_conn.send_buffer().as_slice(), false, 20)
        .expect("valid reply")
        .expect("complete reply");
    assert_eq!(reply.resp_code, 101);
    assert_eq!(reply.header("Sec-WebSocket-Accept"), Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    assert_eq!(reply.header("Sec-WebSocket-Protocol"), Some("chat"));
}

#[rstest]
#[case::tiny(5, 2)]
#[case::medium(300, 4)]
#[case::large(70_000, 10)]
fn server_frames_are_unmasked(mut server_conn: Connection, #[case] len: usize, #[case] header: usize) {
    let payload = vec![7u8; len];
    server_conn.send_websocket_frame(Opcode::Binary, &payload);
    let out = server_conn.send_buffer().as_slice();
    assert_eq!(out[0], 0x82);
    assert_eq!(out[1] & 0x80, 0);
    assert_eq!(out.len(), header + len);
    assert!(out[header..].iter().all(|&b| b == 7));
}

#[test]
fn client_frames_are_masked() {
    let mut ids: SlotMap<ConnId, ()> = SlotMap::with_key();
    let mut conn = Connection::new(ids.insert(()), None, 1.5, 4096, Instant::now());
    conn.send_websocket_fragment(Opcode::Text, b"hi", false);
    let out = conn.send_buffer().as_slice();
    assert_eq!(out[0], 0x01);
    assert_eq!(out[1], 0x80 | 2);
    assert_eq!(out.len(), 2 + 4 + 2);
    let mask = &out[2..6];
    assert_eq!([out[6] ^ mask[0], out[7] ^ mask[1]], *b"hi");
}
