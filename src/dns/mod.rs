//! DNS codec, server-side layer and asynchronous resolver.
//!
//! [`Connection::set_protocol_dns`] turns a listener into a DNS server: each
//! query is delivered as [`Event::Dns`] and answered with a [`DnsReply`].
//! Lookups started through [`Manager::resolve`](crate::Manager::resolve)
//! reuse the same layer on a private connection.

mod hosts;
mod message;
mod name;
mod reply;
mod resolver;

use std::io;

use bytes::{Bytes, BytesMut};
pub use hosts::{DEFAULT_NAMESERVER, lookup_host, parse_hosts, parse_resolv_conf};
use log::warn;
pub use message::{
    CLASS_IN,
    DnsMessage,
    RecordData,
    RecordKind,
    RecordType,
    Resource,
    encode_query,
};
pub use name::{MAX_POINTER_HOPS, NameCompressor, encode_name, uncompress_name};
pub use reply::{DEFAULT_TTL, DnsReply, format_error_reply};
pub(crate) use resolver::PendingQuery;
pub use resolver::{Resolve, ResolveCallback, ResolveError, ResolveOptions};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::{
    connection::{ConnFlags, Connection},
    event::Event,
    manager::Context,
    metrics::{self, ProtocolKind},
    protocol::Protocol,
};

/// Reasons a DNS message or name is rejected.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DnsError {
    /// A field runs past the end of the packet.
    #[error("message truncated")]
    Truncated,
    /// A label length byte uses the reserved `0x40` or `0x80` tags.
    #[error("unsupported label type {0:#04x}")]
    BadLabel(u8),
    /// Compression pointers did not terminate.
    #[error("compression pointer loop")]
    PointerLoop,
    /// The decoded or encoded name exceeds 255 bytes.
    #[error("name exceeds 255 bytes")]
    NameTooLong,
    /// A label exceeds 63 bytes.
    #[error("label of {0} bytes exceeds 63")]
    LabelTooLong(usize),
    /// Two dots in a row.
    #[error("empty label")]
    EmptyLabel,
    /// Record data does not match its type.
    #[error("malformed {0} record data")]
    BadRecordData(RecordType),
    /// More records than a 16-bit count can carry.
    #[error("too many records")]
    TooManyRecords,
}

/// Length-prefixed framing used by DNS over TCP.
fn stream_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(2)
        .max_frame_length(usize::from(u16::MAX))
        .new_codec()
}

/// DNS layer state of one connection.
#[derive(Debug)]
pub(crate) struct DnsState {
    framing: Option<LengthDelimitedCodec>,
    query: Option<PendingQuery>,
}

impl DnsState {
    pub(crate) fn server(tcp: bool) -> Self {
        Self {
            framing: tcp.then(stream_codec),
            query: None,
        }
    }

    pub(crate) fn resolver(tcp: bool, query: PendingQuery) -> Self {
        Self {
            framing: tcp.then(stream_codec),
            query: Some(query),
        }
    }

    pub(crate) fn is_tcp(&self) -> bool { self.framing.is_some() }
}

impl Connection {
    /// Attach the DNS layer.
    ///
    /// Stream connections use two-byte length framing. On a listener every
    /// accepted peer inherits the layer.
    pub fn set_protocol_dns(&mut self) {
        let tcp = !self.flags.contains(ConnFlags::UDP);
        self.protocol = Protocol::Dns(Box::new(DnsState::server(tcp)));
    }

    pub(crate) fn send_dns_packet(&mut self, pkt: &[u8]) {
        if self.flags.contains(ConnFlags::UDP) {
            self.send(pkt);
            return;
        }
        let mut framed = BytesMut::with_capacity(pkt.len() + 2);
        match stream_codec().encode(Bytes::copy_from_slice(pkt), &mut framed) {
            Ok(()) => self.send(&framed),
            Err(e) => warn!("dropping oversized DNS message: conn={}, error={e}", self.id),
        }
    }
}

pub(crate) fn on_event(ctx: &mut Context<'_>, state: &mut DnsState, event: Event<'_>) {
    if let Event::Recv(_) = event {
        decode_all(ctx, state);
    } else if let Some(query) = state.query.as_mut() {
        match event {
            Event::Connect(result) => resolver::on_connect(ctx, query, result),
            Event::Timer(_) => resolver::on_timer(ctx, query),
            Event::Close => resolver::on_close(ctx, query),
            _ => {}
        }
    }
    ctx.deliver(event);
}

fn next_packet(ctx: &mut Context<'_>, state: &mut DnsState) -> io::Result<Option<Bytes>> {
    let buf = ctx.conn_mut().recv_buffer_mut();
    match state.framing.as_mut() {
        Some(codec) => Ok(codec.decode(buf.as_bytes_mut())?.map(BytesMut::freeze)),
        None if buf.is_empty() => Ok(None),
        None => {
            let len = buf.len();
            Ok(Some(buf.split_to(len)))
        }
    }
}

fn decode_all(ctx: &mut Context<'_>, state: &mut DnsState) {
    let max_questions = ctx.config().max_dns_questions;
    let max_answers = ctx.config().max_dns_answers;
    loop {
        if ctx.conn().flags().is_closing() {
            return;
        }
        let pkt = match next_packet(ctx, state) {
            Ok(Some(pkt)) => pkt,
            Ok(None) => return,
            Err(e) => {
                warn!("closing connection on bad DNS framing: conn={}, error={e}", ctx.id());
                metrics::inc_protocol_errors(ProtocolKind::Dns);
                ctx.close();
                return;
            }
        };
        match DnsMessage::parse(pkt.clone(), max_questions, max_answers) {
            Ok(msg) => match state.query.as_mut() {
                Some(query) => resolver::on_message(ctx, query, &msg),
                None => ctx.deliver(Event::Dns(&msg)),
            },
            Err(e) => {
                warn!("malformed DNS message: conn={}, error={e}", ctx.id());
                metrics::inc_protocol_errors(ProtocolKind::Dns);
                if state.query.is_none() && !ctx.conn().is_client() {
                    ctx.conn_mut().send_dns_packet(&format_error_reply(&pkt));
                }
                if state.is_tcp() {
                    ctx.conn_mut().close_after_send();
                    return;
                }
            }
        }
    }
}
