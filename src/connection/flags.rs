//! Connection status flags.

use bitflags::bitflags;

bitflags! {
    /// Status bits carried by every [`Connection`](super::Connection).
    ///
    /// The `USER_*` bits are never touched by the engine.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ConnFlags: u32 {
        /// Accepts incoming peers.
        const LISTENING = 1 << 0;
        /// Datagram transport.
        const UDP = 1 << 1;
        /// Waiting for the resolver before connecting.
        const RESOLVING = 1 << 2;
        /// Outbound connect in progress.
        const CONNECTING = 1 << 3;
        /// TLS requested for this connection.
        const TLS = 1 << 4;
        /// TLS handshake finished.
        const TLS_HANDSHAKE_DONE = 1 << 5;
        /// The transport wants to read before it can continue.
        const WANT_READ = 1 << 6;
        /// The transport wants to write before it can continue.
        const WANT_WRITE = 1 << 7;
        /// Upgraded to WebSocket framing.
        const WEBSOCKET = 1 << 8;
        /// Close once the send buffer has drained.
        const SEND_AND_CLOSE = 1 << 10;
        /// Close at the end of the current poll pass.
        const CLOSE_IMMEDIATELY = 1 << 11;
        /// Deliver WebSocket fragments without reassembling them.
        const WEBSOCKET_NO_DEFRAG = 1 << 12;
        /// Discard the HTTP chunk just delivered.
        const DELETE_CHUNK = 1 << 13;
        /// Free for the application.
        const USER_1 = 1 << 20;
        /// Free for the application.
        const USER_2 = 1 << 21;
        /// Free for the application.
        const USER_3 = 1 << 22;
        /// Free for the application.
        const USER_4 = 1 << 23;
        /// Free for the application.
        const USER_5 = 1 << 24;
        /// Free for the application.
        const USER_6 = 1 << 25;
    }
}

impl ConnFlags {
    /// Whether the connection is due to be torn down.
    #[must_use]
    pub fn is_closing(self) -> bool { self.contains(ConnFlags::CLOSE_IMMEDIATELY) }

    /// Whether outbound bytes may be handed to the transport.
    #[must_use]
    pub fn can_write(self) -> bool {
        !self.intersects(
            ConnFlags::LISTENING
                | ConnFlags::RESOLVING
                | ConnFlags::CONNECTING
                | ConnFlags::CLOSE_IMMEDIATELY,
        )
    }
}
