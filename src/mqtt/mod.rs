//! MQTT 3.1.1 protocol layer and broker.
//!
//! Attach the layer with [`Connection::set_protocol_mqtt`]. Every decoded
//! packet is delivered as [`Event::Mqtt`]; the helpers in this module queue
//! outbound packets. [`Broker`] is a ready-made handler implementing a
//! non-persistent broker on top of these events.

mod broker;
mod client;
mod codec;
mod packet;
mod topic;

use std::io;

pub use broker::{Broker, Session};
pub use client::HandshakeOptions;
pub use codec::{MAX_REMAINING_LENGTH, MqttCodec};
use log::warn;
pub use packet::{
    ConnAck,
    ConnAckCode,
    Connect,
    ConnectFlags,
    PROTOCOL_LEVEL,
    PROTOCOL_LEVEL_31,
    Packet,
    Publish,
    Qos,
    SUBACK_FAILURE,
    SubAck,
    Subscribe,
    Unsubscribe,
    Will,
};
use thiserror::Error;
pub use topic::{topic_matches, validate_filter, validate_topic};

use crate::{
    connection::Connection,
    event::Event,
    manager::Context,
    metrics::{self, ProtocolKind},
    protocol::Protocol,
};

/// Reasons an MQTT packet cannot be decoded or encoded.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MqttError {
    /// The remaining-length field runs past four bytes.
    #[error("remaining length exceeds four bytes")]
    MalformedLength,
    /// A field extends past the end of the packet.
    #[error("packet truncated")]
    Truncated,
    /// A string field is not UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    /// A QoS value of 3 was found.
    #[error("invalid QoS {0}")]
    InvalidQos(u8),
    /// Command codes 0 and 15 are reserved.
    #[error("unknown command {0}")]
    UnknownCommand(u8),
    /// The packet violates a structural rule.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    /// The remaining length exceeds the codec limit.
    #[error("packet of {size} bytes exceeds limit of {max}")]
    TooLarge {
        /// Declared or encoded size.
        size: usize,
        /// Configured limit.
        max: usize,
    },
    /// A string or binary field is longer than 65535 bytes.
    #[error("field of {0} bytes does not fit a 16-bit length")]
    FieldTooLong(usize),
    /// A topic name or filter is malformed.
    #[error("invalid topic {0:?}")]
    InvalidTopic(String),
    /// I/O failure reported through the codec traits.
    #[error("i/o error: {0:?}")]
    Io(io::ErrorKind),
}

impl From<io::Error> for MqttError {
    fn from(e: io::Error) -> Self { Self::Io(e.kind()) }
}

impl Connection {
    /// Attach the MQTT protocol layer.
    ///
    /// On a listener, every accepted peer inherits the layer. Packets larger
    /// than `mqtt_max_packet_size` close the connection.
    pub fn set_protocol_mqtt(&mut self) { self.protocol = Protocol::Mqtt; }
}

pub(crate) fn on_event(ctx: &mut Context<'_>, event: Event<'_>) {
    match event {
        Event::Recv(_) => decode_all(ctx),
        Event::Poll => keep_alive(ctx),
        _ => {}
    }
    ctx.deliver(event);
}

fn decode_all(ctx: &mut Context<'_>) {
    let codec = MqttCodec::new(ctx.config().mqtt_max_packet_size);
    loop {
        if ctx.conn().flags().is_closing() {
            return;
        }
        let decoded = codec.peek(ctx.conn().recv_buffer().as_slice());
        match decoded {
            Ok(Some((packet, used))) => {
                ctx.conn_mut().recv_buffer_mut().remove(used);
                ctx.deliver(Event::Mqtt(&packet));
            }
            Ok(None) => return,
            Err(e) => {
                warn!("closing connection on malformed MQTT packet: conn={}, error={e}", ctx.id());
                metrics::inc_protocol_errors(ProtocolKind::Mqtt);
                ctx.close();
                return;
            }
        }
    }
}

fn keep_alive(ctx: &mut Context<'_>) {
    let now = ctx.now();
    let conn = ctx.conn_mut();
    let Some(interval) = conn.mqtt_keep_alive else {
        return;
    };
    if conn.is_client() && !conn.has_pending_send() && now.saturating_duration_since(conn.last_io()) >= interval {
        conn.mqtt_ping();
    }
}
