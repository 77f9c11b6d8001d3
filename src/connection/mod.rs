//! Per-peer connection state.
//!
//! A [`Connection`] owns its receive and send [`Buffer`]s, status flags,
//! timer deadline and protocol state. The [`Manager`](crate::Manager) owns
//! every connection; callers refer to them through [`ConnId`] handles.

mod flags;

use std::{
    any::Any,
    fmt,
    net::SocketAddr,
    time::{Duration, Instant},
};

pub use flags::ConnFlags;
use slotmap::{Key, new_key_type};

use crate::{
    acl::{AclError, IpAcl},
    buffer::Buffer,
    protocol::Protocol,
};

new_key_type! {
    /// Stable handle to a connection owned by the manager.
    pub struct ConnId;
    /// Handle to an event handler registered with the manager.
    pub struct HandlerId;
}

fn fmt_key(f: &mut fmt::Formatter<'_>, prefix: &str, key: impl Key) -> fmt::Result {
    let raw = key.data().as_ffi();
    write!(f, "{prefix}#{}v{}", raw & 0xffff_ffff, raw >> 32)
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt_key(f, "conn", *self) }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt_key(f, "handler", *self) }
}

/// State of one socket, listener or UDP peer.
pub struct Connection {
    pub(crate) id: ConnId,
    pub(crate) listener: Option<ConnId>,
    pub(crate) handler: Option<HandlerId>,
    pub(crate) protocol: Protocol,
    pub(crate) recv: Buffer,
    pub(crate) send: Buffer,
    pub(crate) flags: ConnFlags,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) local: Option<SocketAddr>,
    pub(crate) last_io: Instant,
    pub(crate) timer: Option<Instant>,
    pub(crate) recv_limit: usize,
    /// Idle interval after which the MQTT layer sends PINGREQ.
    pub(crate) mqtt_keep_alive: Option<Duration>,
    /// Peers a listener admits.
    pub(crate) ip_acl: Option<IpAcl>,
    user_data: Option<Box<dyn Any>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("listener", &self.listener)
            .field("flags", &self.flags)
            .field("peer", &self.peer)
            .field("recv_len", &self.recv.len())
            .field("send_len", &self.send.len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(
        id: ConnId,
        handler: Option<HandlerId>,
        growth: f64,
        recv_limit: usize,
        now: Instant,
    ) -> Self {
        Self {
            id,
            listener: None,
            handler,
            protocol: Protocol::None,
            recv: Buffer::with_growth(growth),
            send: Buffer::with_growth(growth),
            flags: ConnFlags::empty(),
            peer: None,
            local: None,
            last_io: now,
            timer: None,
            recv_limit,
            mqtt_keep_alive: None,
            ip_acl: None,
            user_data: None,
        }
    }

    /// Handle of this connection.
    #[must_use]
    pub fn id(&self) -> ConnId { self.id }

    /// Listener that accepted this connection, if any.
    #[must_use]
    pub fn listener(&self) -> Option<ConnId> { self.listener }

    /// Whether this connection was opened by a local `connect`.
    #[must_use]
    pub fn is_client(&self) -> bool {
        self.listener.is_none() && !self.flags.contains(ConnFlags::LISTENING)
    }

    /// Handler receiving this connection's events.
    #[must_use]
    pub fn handler(&self) -> Option<HandlerId> { self.handler }

    /// Route future events to `handler`.
    pub fn set_handler(&mut self, handler: HandlerId) { self.handler = Some(handler); }

    /// Remote address, once known.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> { self.peer }

    /// Local address, once known.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> { self.local }

    /// Status flags.
    #[must_use]
    pub fn flags(&self) -> ConnFlags { self.flags }

    /// Mutable access to the status flags.
    pub fn flags_mut(&mut self) -> &mut ConnFlags { &mut self.flags }

    /// Bytes received and not yet consumed.
    #[must_use]
    pub fn recv_buffer(&self) -> &Buffer { &self.recv }

    /// Mutable receive buffer; remove bytes once they are processed.
    pub fn recv_buffer_mut(&mut self) -> &mut Buffer { &mut self.recv }

    /// Bytes queued for the transport.
    #[must_use]
    pub fn send_buffer(&self) -> &Buffer { &self.send }

    /// Ceiling on buffered inbound bytes.
    #[must_use]
    pub fn recv_limit(&self) -> usize { self.recv_limit }

    /// Change the ceiling on buffered inbound bytes.
    pub fn set_recv_limit(&mut self, limit: usize) { self.recv_limit = limit; }

    /// Time of the last successful read or write.
    #[must_use]
    pub fn last_io(&self) -> Instant { self.last_io }

    /// Queue `data` for sending. Nothing is written until the next poll pass.
    pub fn send(&mut self, data: &[u8]) { self.send.append(data); }

    /// Queue formatted text, as produced by [`format_args!`].
    pub fn send_fmt(&mut self, args: fmt::Arguments<'_>) {
        match args.as_str() {
            Some(s) => self.send(s.as_bytes()),
            None => self.send(args.to_string().as_bytes()),
        }
    }

    /// Arm (or with `None`, cancel) the timer and return the previous
    /// deadline.
    pub fn set_timer(&mut self, deadline: Option<Instant>) -> Option<Instant> {
        std::mem::replace(&mut self.timer, deadline)
    }

    /// Currently armed deadline.
    #[must_use]
    pub fn timer(&self) -> Option<Instant> { self.timer }

    /// Tear the connection down at the end of the current poll pass.
    pub fn close(&mut self) { self.flags.insert(ConnFlags::CLOSE_IMMEDIATELY); }

    /// Tear the connection down once queued bytes are written.
    pub fn close_after_send(&mut self) { self.flags.insert(ConnFlags::SEND_AND_CLOSE); }

    /// Restrict which peers a listener accepts; see [`IpAcl`].
    ///
    /// Refused TCP peers are dropped before `Accept` and refused UDP
    /// datagrams are discarded. An empty `acl` admits everyone.
    ///
    /// # Errors
    ///
    /// Returns an [`AclError`] if `acl` is malformed; the previous list
    /// stays in force.
    pub fn set_ip_acl(&mut self, acl: &str) -> Result<(), AclError> {
        self.ip_acl = Some(IpAcl::parse(acl)?);
        Ok(())
    }

    /// Attach arbitrary application data, replacing any previous value.
    pub fn set_user_data<T: Any>(&mut self, data: T) { self.user_data = Some(Box::new(data)); }

    /// Borrow application data of type `T`.
    #[must_use]
    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.user_data.as_ref()?.downcast_ref::<T>()
    }

    /// Mutably borrow application data of type `T`.
    pub fn user_data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.user_data.as_mut()?.downcast_mut::<T>()
    }

    /// Detach application data, whatever its type.
    pub fn take_user_data(&mut self) -> Option<Box<dyn Any>> { self.user_data.take() }

    pub(crate) fn set_boxed_user_data(&mut self, data: Option<Box<dyn Any>>) {
        self.user_data = data;
    }

    pub(crate) fn has_pending_send(&self) -> bool { !self.send.is_empty() }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use slotmap::SlotMap;

    use super::{ConnFlags, ConnId, Connection};

    fn conn() -> Connection {
        let mut ids: SlotMap<ConnId, ()> = SlotMap::with_key();
        Connection::new(ids.insert(()), None, 1.5, 1024, Instant::now())
    }

    #[test]
    fn set_timer_returns_previous_deadline() {
        let mut c = conn();
        let at = Instant::now() + Duration::from_secs(1);
        assert_eq!(c.set_timer(Some(at)), None);
        assert_eq!(c.set_timer(None), Some(at));
        assert_eq!(c.timer(), None);
    }

    #[test]
    fn send_fmt_queues_formatted_text() {
        let mut c = conn();
        c.send_fmt(format_args!("{}-{}", 4, "two"));
        assert_eq!(c.send_buffer().as_slice(), b"4-two");
    }

    #[test]
    fn user_data_downcasts_by_type() {
        let mut c = conn();
        c.set_user_data(42_u32);
        assert_eq!(c.user_data::<u32>(), Some(&42));
        assert!(c.user_data::<String>().is_none());
        if let Some(v) = c.user_data_mut::<u32>() {
            *v += 1;
        }
        assert_eq!(c.user_data::<u32>(), Some(&43));
    }

    #[test]
    fn closing_blocks_writes() {
        let mut c = conn();
        assert!(c.flags().can_write());
        c.close();
        assert!(c.flags().is_closing());
        assert!(!c.flags().can_write());
        c.flags_mut().insert(ConnFlags::USER_3);
        assert!(c.flags().contains(ConnFlags::USER_3));
    }
}
