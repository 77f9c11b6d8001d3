//! CoAP (RFC 7252) codec and datagram layer.
//!
//! Attach with [`Connection::set_protocol_coap`] on a UDP connection. Each
//! valid datagram is delivered as [`Event::Coap`]; malformed datagrams are
//! dropped.

mod codec;

use bitflags::bitflags;
use bytes::Bytes;
pub use codec::{compose_coap, parse_coap};
use thiserror::Error;
use tracing::debug;

use crate::{
    connection::{ConnFlags, Connection},
    event::Event,
    manager::Context,
    metrics::{self, ProtocolKind},
    protocol::Protocol,
};

/// Bit shared by every error code returned by [`CoapError::bits`].
pub const ERROR_BIT: u32 = 0x1_0000;

/// Code class of requests.
pub const CODE_CLASS_REQUEST: u8 = 0;
/// Code class of successful responses.
pub const CODE_CLASS_RESP_OK: u8 = 2;
/// Code class of client error responses.
pub const CODE_CLASS_CLIENT_ERR: u8 = 4;
/// Code class of server error responses.
pub const CODE_CLASS_SRV_ERR: u8 = 5;

bitflags! {
    /// Header fields found by [`parse_coap`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct FieldFlags: u32 {
        const MSG_TYPE = 0x02;
        const CODE_CLASS = 0x04;
        const CODE_DETAIL = 0x08;
        const MSG_ID = 0x10;
        const TOKEN = 0x20;
        const OPTIONS = 0x40;
        const PAYLOAD = 0x80;
    }
}

/// Message type from the first header byte.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MessageType {
    #[default]
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    /// Decode the low two bits of `bits`.
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgement,
            _ => Self::Reset,
        }
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            Self::Confirmable => 0,
            Self::NonConfirmable => 1,
            Self::Acknowledgement => 2,
            Self::Reset => 3,
        }
    }
}

/// One option: absolute number and raw value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Bytes,
}

/// A parsed or outgoing CoAP message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CoapMessage {
    /// Fields present in a parsed message; ignored when composing.
    pub fields: FieldFlags,
    pub msg_type: MessageType,
    /// Three-bit class of the code, as in `2.05`.
    pub code_class: u8,
    /// Five-bit detail of the code.
    pub code_detail: u8,
    pub msg_id: u16,
    /// Up to eight bytes.
    pub token: Bytes,
    /// Options in wire order after parsing; any order when composing.
    pub options: Vec<CoapOption>,
    pub payload: Bytes,
}

impl CoapMessage {
    /// Append an option.
    pub fn add_option(&mut self, number: u16, value: impl Into<Bytes>) -> &mut Self {
        self.options.push(CoapOption {
            number,
            value: value.into(),
        });
        self
    }

    /// First option with `number`.
    #[must_use]
    pub fn option(&self, number: u16) -> Option<&CoapOption> {
        self.options.iter().find(|o| o.number == number)
    }
}

/// Reasons a CoAP message cannot be parsed, composed or sent.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum CoapError {
    /// A structural rule was violated.
    #[error("malformed CoAP message")]
    Format,
    /// The input ends inside a field.
    #[error("CoAP message truncated")]
    NotEnoughData,
    /// The layer requires a UDP connection.
    #[error("CoAP requires a UDP connection")]
    Network,
    /// Not a CoAP version 1 datagram; drop it silently.
    #[error("datagram is not CoAP version 1")]
    Ignore,
}

impl CoapError {
    /// Numeric code: [`ERROR_BIT`] combined with a reason bit.
    ///
    /// # Examples
    ///
    /// ```
    /// use netmux::coap::CoapError;
    ///
    /// assert_eq!(CoapError::Format.bits(), 0x3_0000);
    /// assert_eq!(CoapError::Network.bits(), 0x11_0000);
    /// ```
    #[must_use]
    pub fn bits(self) -> u32 {
        ERROR_BIT
            | match self {
                Self::Format => 0x2_0000,
                Self::Ignore => 0x4_0000,
                Self::NotEnoughData => 0x8_0000,
                Self::Network => 0x10_0000,
            }
    }
}

impl Connection {
    /// Attach the CoAP layer.
    ///
    /// # Errors
    ///
    /// Returns [`CoapError::Network`] unless the connection is UDP.
    pub fn set_protocol_coap(&mut self) -> Result<(), CoapError> {
        if !self.flags.contains(ConnFlags::UDP) {
            return Err(CoapError::Network);
        }
        self.protocol = Protocol::Coap;
        Ok(())
    }

    /// Compose `msg` and queue it.
    ///
    /// # Errors
    ///
    /// Returns [`CoapError::Network`] on a stream connection, or the error
    /// of [`compose_coap`].
    pub fn send_coap_message(&mut self, msg: &CoapMessage) -> Result<(), CoapError> {
        if !self.flags.contains(ConnFlags::UDP) {
            return Err(CoapError::Network);
        }
        let mut out = Vec::with_capacity(4 + msg.token.len() + msg.payload.len());
        compose_coap(msg, &mut out)?;
        self.send(&out);
        Ok(())
    }

    /// Queue an empty acknowledgement for `msg_id`.
    ///
    /// # Errors
    ///
    /// As for [`Connection::send_coap_message`].
    pub fn send_coap_ack(&mut self, msg_id: u16) -> Result<(), CoapError> {
        self.send_coap_message(&CoapMessage {
            msg_type: MessageType::Acknowledgement,
            msg_id,
            ..CoapMessage::default()
        })
    }
}

pub(crate) fn on_event(ctx: &mut Context<'_>, event: Event<'_>) {
    if let Event::Recv(_) = event {
        let buf = ctx.conn_mut().recv_buffer_mut();
        let len = buf.len();
        let datagram = buf.split_to(len);
        match parse_coap(datagram) {
            Ok(msg) => ctx.deliver(Event::Coap(&msg)),
            Err(CoapError::Ignore) => {}
            Err(e) => {
                debug!(conn = %ctx.id(), error = %e, code = e.bits(), "dropping CoAP datagram");
                metrics::inc_protocol_errors(ProtocolKind::Coap);
            }
        }
    }
    ctx.deliver(event);
}
