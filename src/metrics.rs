//! Metric helpers for `netmux`.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. With the `metrics` feature
//! disabled every helper compiles to a no-op.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking live connections (listeners included).
pub const CONNECTIONS_ACTIVE: &str = "netmux_connections_active";
/// Name of the counter tracking bytes moved through the network seam.
pub const BYTES_TOTAL: &str = "netmux_bytes_total";
/// Name of the counter tracking malformed protocol input.
pub const PROTOCOL_ERRORS_TOTAL: &str = "netmux_protocol_errors_total";
/// Name of the counter tracking messages fanned out by the MQTT broker.
pub const BROKER_FORWARDED_TOTAL: &str = "netmux_broker_forwarded_total";

/// Direction of traffic through the network seam.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Bytes received from a peer.
    Inbound,
    /// Bytes written to a peer.
    Outbound,
}

impl Direction {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Protocol layer that rejected its input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolKind {
    Http,
    WebSocket,
    Mqtt,
    Dns,
    Coap,
}

impl ProtocolKind {
    /// Label value used for this protocol.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolKind::Http => "http",
            ProtocolKind::WebSocket => "websocket",
            ProtocolKind::Mqtt => "mqtt",
            ProtocolKind::Dns => "dns",
            ProtocolKind::Coap => "coap",
        }
    }
}

/// Increment the active connections gauge.
pub fn inc_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

/// Decrement the active connections gauge.
pub fn dec_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record `n` bytes moved in the given direction.
pub fn add_bytes(direction: Direction, n: usize) {
    #[cfg(feature = "metrics")]
    counter!(BYTES_TOTAL, "direction" => direction.as_str())
        .increment(u64::try_from(n).unwrap_or(u64::MAX));
    #[cfg(not(feature = "metrics"))]
    let _ = (direction, n);
}

/// Record a malformed message rejected by `protocol`.
pub fn inc_protocol_errors(protocol: ProtocolKind) {
    #[cfg(feature = "metrics")]
    counter!(PROTOCOL_ERRORS_TOTAL, "protocol" => protocol.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = protocol;
}

/// Record one PUBLISH forwarded to a broker session.
pub fn inc_broker_forwarded() {
    #[cfg(feature = "metrics")]
    counter!(BROKER_FORWARDED_TOTAL).increment(1);
}
