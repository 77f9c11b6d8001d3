//! HTTP/1.1 and WebSocket protocol layer.
//!
//! The layer re-parses the accumulated receive buffer on every `Recv` event.
//! Complete messages are delivered as [`HttpEvent`]s, chunked bodies are
//! reassembled in place and, once a connection upgrades, framing switches to
//! WebSocket and [`WsEvent`]s are delivered instead.
//!
//! Requests may be routed to per-URI endpoint handlers registered with
//! [`Manager::register_http_endpoint`](crate::Manager::register_http_endpoint).
//! Input arriving after a reply was marked close-after-send is discarded.
//!
//! Parsed messages borrow the receive buffer. While protocol events are being
//! dispatched the buffer is detached from the connection, so handlers must
//! use the event payload rather than [`Connection::recv_buffer`].

mod auth;
mod chunked;
mod client;
mod endpoint;
mod multipart;
mod parser;
mod response;
mod websocket;

use std::{mem, time::SystemTime};

pub use auth::{
    DigestAuth,
    NONCE_LIFETIME,
    check_digest_auth,
    create_digest_auth_header,
    digest_nonce,
    htdigest_line,
};
pub use endpoint::EndpointOptions;
use log::warn;
pub use multipart::{MultipartPart, parse_multipart};
pub use parser::{HttpMessage, parse_http};
pub use response::status_text;
use thiserror::Error;
pub use websocket::{Opcode, WsFrame, websocket_accept_key};

use self::{
    endpoint::Endpoint,
    multipart::MultipartStream,
    websocket::Fragment,
};
use crate::{
    buffer::Buffer,
    connection::{ConnFlags, Connection, HandlerId},
    event::Event,
    manager::Context,
    metrics::{self, ProtocolKind},
    protocol::Protocol,
    uri::parse_header_var,
};

/// HTTP-level events.
#[derive(Clone, Copy, Debug)]
pub enum HttpEvent<'a> {
    /// A complete request arrived on a server connection.
    Request(&'a HttpMessage<'a>),
    /// A complete reply arrived on a client connection.
    Reply(&'a HttpMessage<'a>),
    /// One more chunk of a chunked body was reassembled; `body` holds every
    /// chunk not yet discarded with [`ConnFlags::DELETE_CHUNK`].
    Chunk(&'a HttpMessage<'a>),
    /// Head of a `multipart/form-data` request in streaming mode.
    MultipartRequest(&'a HttpMessage<'a>),
    /// A new part starts; `data` is empty.
    PartBegin(&'a MultipartPart<'a>),
    /// Body bytes of the current part.
    PartData(&'a MultipartPart<'a>),
    /// The current part is complete; `data` is empty.
    PartEnd(&'a MultipartPart<'a>),
    /// The closing boundary of the multipart body was seen.
    MultipartRequestEnd,
}

/// WebSocket events.
#[derive(Clone, Copy, Debug)]
pub enum WsEvent<'a> {
    /// A client asked to upgrade. Closing the connection here refuses it.
    HandshakeRequest(&'a HttpMessage<'a>),
    /// The upgrade completed; frames follow.
    HandshakeDone,
    /// A data frame, or a whole reassembled message.
    Frame(&'a WsFrame<'a>),
    /// A PING, PONG or CLOSE frame.
    ControlFrame(&'a WsFrame<'a>),
}

/// Reasons a message is rejected and its connection closed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HttpError {
    /// A control character appeared in the message head.
    #[error("non-printable byte {0:#04x} in message head")]
    BadByte(u8),
    /// The message head is not UTF-8.
    #[error("message head is not valid UTF-8")]
    InvalidEncoding,
    /// The request line lacks a method, target or `HTTP/` version.
    #[error("malformed request line")]
    BadRequestLine,
    /// The status line is malformed or its code is outside `100..=599`.
    #[error("malformed status line")]
    BadStatusLine,
    /// A header line has no `:` separator.
    #[error("header line without ':'")]
    MalformedHeader,
    /// `Content-Length` is not a decimal number or announces a body larger
    /// than the receive limit.
    #[error("invalid Content-Length")]
    BadContentLength,
    /// A chunk size line is not hexadecimal or a chunk lacks its CRLF.
    #[error("invalid chunk framing")]
    BadChunk,
    /// A multipart body does not follow its boundary structure.
    #[error("malformed multipart body")]
    BadMultipart,
    /// A WebSocket frame violates the framing rules.
    #[error("invalid WebSocket frame: {0}")]
    BadFrame(&'static str),
    /// The connection's receive limit was reached without a full message.
    #[error("message exceeds receive limit of {0} bytes")]
    TooLarge(usize),
}

/// Per-connection HTTP parser state.
#[derive(Debug, Default)]
pub(crate) struct HttpState {
    chunk_body_len: usize,
    multipart: Option<MultipartStream>,
    fragment: Option<Fragment>,
    /// Endpoint handler of the request being parsed.
    route: Option<HandlerId>,
    /// Endpoints registered on this listener.
    endpoints: Vec<Endpoint>,
}

impl Connection {
    /// Attach the HTTP/WebSocket protocol layer.
    ///
    /// On a listener, every accepted peer gets its own fresh parser state.
    /// Endpoints registered on the listener are dropped.
    pub fn set_protocol_http_websocket(&mut self) {
        self.protocol = Protocol::Http(Box::default());
    }
}

pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub(crate) fn on_event(ctx: &mut Context<'_>, state: &mut HttpState, event: Event<'_>) {
    match event {
        Event::Recv(_) => with_detached_recv(ctx, |ctx, buf| process(ctx, state, buf)),
        Event::Close => with_detached_recv(ctx, |ctx, buf| {
            deliver_close_delimited(ctx, state, buf);
            Ok(())
        }),
        _ => {}
    }
    ctx.set_route(None);
    ctx.deliver(event);
}

fn with_detached_recv<F>(ctx: &mut Context<'_>, f: F)
where
    F: FnOnce(&mut Context<'_>, &mut Buffer) -> Result<(), HttpError>,
{
    let mut buf = mem::take(ctx.conn_mut().recv_buffer_mut());
    let result = f(ctx, &mut buf);
    let conn = ctx.conn_mut();
    let added = mem::replace(conn.recv_buffer_mut(), buf);
    if !added.is_empty() {
        conn.recv_buffer_mut().append(added.as_slice());
    }
    if let Err(e) = result {
        let kind = if conn.flags().contains(ConnFlags::WEBSOCKET) {
            ProtocolKind::WebSocket
        } else {
            ProtocolKind::Http
        };
        warn!("closing connection on malformed input: conn={}, error={e}", conn.id());
        metrics::inc_protocol_errors(kind);
        conn.close();
    }
}

fn strip_leading_newlines(buf: &mut Buffer) {
    let skip = buf
        .as_slice()
        .iter()
        .take_while(|b| matches!(b, b'\r' | b'\n'))
        .count();
    buf.remove(skip);
}

fn check_limit(ctx: &Context<'_>, buf: &Buffer) -> Result<(), HttpError> {
    let limit = ctx.conn().recv_limit();
    if buf.len() > limit {
        return Err(HttpError::TooLarge(limit));
    }
    Ok(())
}

/// Pick the endpoint for a request head. Returns `false` when the request
/// was refused and answered with an authentication challenge.
fn route_request(ctx: &mut Context<'_>, state: &mut HttpState, msg: &HttpMessage<'_>) -> bool {
    let endpoint = endpoint::find(ctx, state, msg.uri);
    state.route = endpoint.as_ref().map(|e| e.handler);
    ctx.set_route(state.route);
    let Some(endpoint) = endpoint else {
        return true;
    };
    let now = SystemTime::now();
    if endpoint.admits(msg, now) {
        return true;
    }
    let conn = ctx.conn_mut();
    conn.send_digest_auth_request(endpoint.realm(), now);
    conn.close_after_send();
    false
}

fn process(ctx: &mut Context<'_>, state: &mut HttpState, buf: &mut Buffer) -> Result<(), HttpError> {
    let flags = ctx.conn().flags();
    if flags.contains(ConnFlags::SEND_AND_CLOSE) && !flags.contains(ConnFlags::UDP) {
        buf.clear();
        return Ok(());
    }
    ctx.set_route(state.route);
    loop {
        if ctx.conn().flags().is_closing() {
            return Ok(());
        }
        if ctx.conn().flags().contains(ConnFlags::WEBSOCKET) {
            return websocket::process_frames(ctx, &mut state.fragment, buf);
        }
        if let Some(stream) = state.multipart.as_mut() {
            if !multipart::feed(ctx, stream, buf)? {
                return check_limit(ctx, buf);
            }
            state.multipart = None;
            continue;
        }
        strip_leading_newlines(buf);
        let is_request = !ctx.conn().is_client();
        let max_headers = ctx.config().max_http_headers;
        let Some(msg) = parse_http(buf.as_slice(), is_request, max_headers)? else {
            return check_limit(ctx, buf);
        };
        let head_len = msg.head_len();
        if msg.total_len().is_some_and(|total| total > ctx.conn().recv_limit()) {
            return Err(HttpError::BadContentLength);
        }
        if is_request && !route_request(ctx, state, &msg) {
            drop(msg);
            buf.clear();
            return Ok(());
        }

        if msg.is_chunked() {
            drop(msg);
            if !chunked::process(ctx, &mut state.chunk_body_len, buf, is_request, max_headers)? {
                return check_limit(ctx, buf);
            }
            continue;
        }

        if is_request && websocket::is_upgrade_request(&msg) {
            ctx.deliver(Event::WebSocket(WsEvent::HandshakeRequest(&msg)));
            let key = msg.header("Sec-WebSocket-Key").unwrap_or_default().to_owned();
            let protocol = msg.header("Sec-WebSocket-Protocol").map(str::to_owned);
            drop(msg);
            buf.remove(head_len);
            if ctx.conn().flags().is_closing() {
                return Ok(());
            }
            if let Some(handler) = state.route.take() {
                ctx.conn_mut().set_handler(handler);
                ctx.set_route(None);
            }
            ctx.conn_mut()
                .send_websocket_handshake_reply(&key, protocol.as_deref());
            ctx.conn_mut().flags_mut().insert(ConnFlags::WEBSOCKET);
            ctx.deliver(Event::WebSocket(WsEvent::HandshakeDone));
            continue;
        }

        if !is_request && msg.resp_code == 101 && websocket::is_upgrade_reply(&msg) {
            drop(msg);
            buf.remove(head_len);
            ctx.conn_mut().flags_mut().insert(ConnFlags::WEBSOCKET);
            ctx.deliver(Event::WebSocket(WsEvent::HandshakeDone));
            continue;
        }

        if is_request && ctx.config().http_streaming_multipart {
            let boundary = msg
                .header("Content-Type")
                .filter(|ct| {
                    ct.get(..19)
                        .is_some_and(|p| p.eq_ignore_ascii_case("multipart/form-data"))
                })
                .and_then(|ct| parse_header_var(ct, "boundary"))
                .map(str::to_owned);
            if let Some(boundary) = boundary {
                ctx.deliver(Event::Http(HttpEvent::MultipartRequest(&msg)));
                drop(msg);
                buf.remove(head_len);
                state.multipart = Some(MultipartStream::new(&boundary));
                continue;
            }
        }

        match msg.total_len() {
            Some(total) if buf.len() >= total => {
                let event = if is_request {
                    HttpEvent::Request(&msg)
                } else {
                    HttpEvent::Reply(&msg)
                };
                ctx.deliver(Event::Http(event));
                drop(msg);
                buf.remove(total);
            }
            _ => return check_limit(ctx, buf),
        }
    }
}

fn deliver_close_delimited(ctx: &mut Context<'_>, state: &mut HttpState, buf: &Buffer) {
    if ctx.conn().flags().contains(ConnFlags::WEBSOCKET) || state.multipart.is_some() {
        return;
    }
    let is_request = !ctx.conn().is_client();
    let max_headers = ctx.config().max_http_headers;
    let Ok(Some(msg)) = parse_http(buf.as_slice(), is_request, max_headers) else {
        return;
    };
    if msg.total_len().is_some() || msg.is_chunked() {
        return;
    }
    if is_request && !route_request(ctx, state, &msg) {
        return;
    }
    let event = if is_request {
        HttpEvent::Request(&msg)
    } else {
        HttpEvent::Reply(&msg)
    };
    ctx.deliver(Event::Http(event));
}

#[cfg(test)]
mod tests;
