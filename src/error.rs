//! Canonical error types for the engine surface.
//!
//! Protocol layers define their own error enums next to their parsers; this
//! module holds the errors raised by the manager itself when creating
//! connections or injecting broadcasts.

use std::io;

use thiserror::Error;

use crate::{ConnId, HandlerId, uri::AddressError};

/// Top-level error type exposed by `netmux`.
#[derive(Debug, Error)]
pub enum NetmuxError {
    /// The bind or connect address could not be parsed.
    #[error("invalid address: {0}")]
    Address(#[from] AddressError),
    /// A URL passed to an HTTP or WebSocket helper was malformed.
    #[error("invalid url: {0}")]
    Uri(#[from] crate::uri::UriError),
    /// The network seam refused to create a listener.
    #[error("bind to {addr} failed: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Error reported by the network seam.
        #[source]
        source: io::Error,
    },
    /// The network seam refused to start a connection.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        /// Address that was requested.
        addr: String,
        /// Error reported by the network seam.
        #[source]
        source: io::Error,
    },
    /// No live connection has this identifier.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnId),
    /// No registered handler has this identifier.
    #[error("unknown handler {0}")]
    UnknownHandler(HandlerId),
    /// TLS was requested but is disabled in the engine configuration.
    #[error("TLS is disabled in the engine configuration")]
    TlsDisabled,
    /// Any other I/O failure reported by the network seam.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised when injecting a message from another thread.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BroadcastError {
    /// Payload exceeds `EngineConfig::max_broadcast_message`.
    #[error("broadcast message of {size} bytes exceeds limit of {max}")]
    TooLarge {
        /// Size of the rejected payload.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
    /// The manager owning the channel has been dropped.
    #[error("manager is gone")]
    Closed,
    /// The manager was built with `multithreading` disabled.
    #[error("broadcast channel is disabled")]
    Disabled,
    /// The reactor could not be woken.
    #[error("failed to wake the reactor: {0}")]
    Wake(io::ErrorKind),
}
