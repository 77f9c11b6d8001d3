//! Seam between the reactor and real sockets.
//!
//! The [`Manager`](crate::Manager) never touches the operating system
//! directly. It drives a [`NetworkInterface`], issuing non-blocking requests
//! and collecting completions as [`NetEvent`]s from [`NetworkInterface::poll`].
//!
//! Both connect and accept are two-phase. A connect request returns at once
//! and its outcome arrives later as [`NetEvent::Connected`]. An incoming peer
//! is first announced with [`NetEvent::Incoming`]; the manager allocates a
//! connection and hands its id back through [`NetworkInterface::accept`], and
//! the seam confirms with [`NetEvent::Accepted`] once the peer address is
//! known.

mod mio_backend;

use std::{
    io,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
pub use mio_backend::MioNetwork;

use crate::{config::EngineConfig, connection::ConnId};

/// Completion reported by a [`NetworkInterface`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetEvent {
    /// A TCP listener has a peer waiting; `pending` identifies it until the
    /// manager calls [`NetworkInterface::accept`].
    Incoming { listener: ConnId, pending: u64 },
    /// Second phase of accept: the peer now belongs to `id`.
    Accepted { id: ConnId, peer: SocketAddr },
    /// Outcome of [`NetworkInterface::connect`].
    Connected {
        id: ConnId,
        result: Result<SocketAddr, io::ErrorKind>,
    },
    /// Bytes read from a stream or connected datagram socket.
    Received { id: ConnId, data: Bytes },
    /// One datagram arrived on a UDP listener.
    Datagram {
        listener: ConnId,
        peer: SocketAddr,
        data: Bytes,
    },
    /// The transport can take more bytes.
    Writable { id: ConnId },
    /// The peer closed the connection or the transport failed.
    Closed { id: ConnId },
}

/// Options applied when creating a listener.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BindOptions {
    /// Wrap accepted connections in TLS.
    pub tls: bool,
}

/// Wakes a blocked [`NetworkInterface::poll`] from another thread.
pub trait Wake: Send + Sync {
    /// Interrupt the current or next wait.
    ///
    /// # Errors
    ///
    /// Returns the error reported by the wake primitive.
    fn wake(&self) -> io::Result<()>;
}

impl Wake for mio::Waker {
    fn wake(&self) -> io::Result<()> { mio::Waker::wake(self) }
}

/// Non-blocking socket operations driven by the manager.
///
/// Every method returns immediately. Implementations queue completions and
/// report them from the next [`poll`](Self::poll) call, never inline.
pub trait NetworkInterface {
    /// Apply engine settings such as read sizes before any socket exists.
    fn configure(&mut self, _config: &EngineConfig) {}

    /// Open a TCP listener for `id`, returning the bound address.
    ///
    /// # Errors
    ///
    /// Returns the socket error, or [`io::ErrorKind::Unsupported`] when the
    /// backend cannot honour `opts`.
    fn listen_tcp(
        &mut self,
        id: ConnId,
        addr: SocketAddr,
        opts: &BindOptions,
    ) -> io::Result<SocketAddr>;

    /// Open a UDP socket receiving datagrams for listener `id`.
    ///
    /// # Errors
    ///
    /// Returns the socket error.
    fn listen_udp(&mut self, id: ConnId, addr: SocketAddr) -> io::Result<SocketAddr>;

    /// Start connecting `id` to `addr`. Completion arrives as
    /// [`NetEvent::Connected`].
    ///
    /// # Errors
    ///
    /// Returns an error only when the request cannot even be issued.
    fn connect(&mut self, id: ConnId, addr: SocketAddr, udp: bool) -> io::Result<()>;

    /// Confirm a peer announced by [`NetEvent::Incoming`] as connection
    /// `child`.
    fn accept(&mut self, listener: ConnId, pending: u64, child: ConnId);

    /// Write as much of `data` as the transport takes right now.
    ///
    /// Returns the number of bytes written; zero means try again later.
    ///
    /// # Errors
    ///
    /// Returns a transport error; the manager closes the connection.
    fn send(&mut self, id: ConnId, data: &[u8]) -> io::Result<usize>;

    /// Send one datagram from UDP listener `listener` to `peer`.
    ///
    /// # Errors
    ///
    /// Returns a transport error.
    fn send_to(&mut self, listener: ConnId, peer: SocketAddr, data: &[u8]) -> io::Result<usize>;

    /// Acknowledge that `consumed` received bytes have been processed.
    fn recved(&mut self, id: ConnId, consumed: usize);

    /// Release every resource held for `id`.
    fn destroy(&mut self, id: ConnId);

    /// Wait up to `timeout` for readiness and append completions to `events`.
    ///
    /// # Errors
    ///
    /// Returns the error reported by the readiness primitive.
    fn poll(&mut self, timeout: Duration, events: &mut Vec<NetEvent>) -> io::Result<()>;

    /// Whether completions are queued, so the next poll must not block.
    fn has_pending(&self) -> bool;

    /// Primitive used by broadcasters to interrupt [`poll`](Self::poll).
    fn waker(&self) -> Option<Arc<dyn Wake>>;
}
