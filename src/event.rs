//! Events delivered to handlers.
//!
//! Every event carries its own payload. Protocol layers see the raw network
//! events first and add their own variants before the user handler runs.

use std::{io, net::SocketAddr, time::Instant};

use crate::{
    coap::CoapMessage,
    dns::DnsMessage,
    http::{HttpEvent, WsEvent},
    mqtt::Packet,
};

/// Event dispatched to a connection's handler chain.
///
/// Payload references stay valid for the duration of the handler call only.
#[derive(Clone, Copy, Debug)]
pub enum Event<'a> {
    /// Periodic tick delivered to every connection once per poll pass.
    Poll,
    /// A peer was accepted; carries the remote address.
    Accept(SocketAddr),
    /// Outcome of an outbound connect.
    Connect(Result<(), io::ErrorKind>),
    /// Bytes were appended to the receive buffer.
    Recv(usize),
    /// Bytes from the send buffer were written to the transport.
    Send(usize),
    /// The connection is about to be destroyed.
    Close,
    /// The connection's timer fired at the given instant.
    Timer(Instant),
    /// A message injected through a [`Broadcaster`](crate::Broadcaster).
    Broadcast(&'a [u8]),
    /// HTTP message parsed.
    Http(HttpEvent<'a>),
    /// WebSocket handshake step or frame.
    WebSocket(WsEvent<'a>),
    /// MQTT packet decoded.
    Mqtt(&'a Packet),
    /// DNS message decoded.
    Dns(&'a DnsMessage),
    /// CoAP message decoded.
    Coap(&'a CoapMessage),
}

impl Event<'_> {
    /// Short label used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Event::Poll => "poll",
            Event::Accept(_) => "accept",
            Event::Connect(_) => "connect",
            Event::Recv(_) => "recv",
            Event::Send(_) => "send",
            Event::Close => "close",
            Event::Timer(_) => "timer",
            Event::Broadcast(_) => "broadcast",
            Event::Http(_) => "http",
            Event::WebSocket(_) => "websocket",
            Event::Mqtt(_) => "mqtt",
            Event::Dns(_) => "dns",
            Event::Coap(_) => "coap",
        }
    }
}
