//! Connection arena and dispatch shared by [`Manager`](super::Manager) and
//! [`Context`].

use std::{
    collections::{HashMap, VecDeque},
    io,
    mem,
    net::{IpAddr, SocketAddr},
    panic::{self, AssertUnwindSafe},
    time::Instant,
};

use bytes::Bytes;
use slotmap::SlotMap;
use tracing::{debug, warn};

use super::{ConnectOptions, Context};
use crate::{
    config::EngineConfig,
    connection::{ConnFlags, ConnId, Connection, HandlerId},
    dns::{self, DnsMessage, RecordType, ResolveCallback, ResolveError, ResolveOptions},
    error::NetmuxError,
    event::Event,
    handler::EventHandler,
    metrics::{self, Direction},
    net::{BindOptions, NetEvent, NetworkInterface},
    panic::format_panic,
    protocol::Protocol,
    uri::{Transport, parse_address},
};

/// Work queued for the next poll pass instead of running inline.
#[derive(Debug)]
pub(crate) enum Deferred {
    ConnectFailed(io::ErrorKind),
}

pub(crate) struct Core {
    pub(crate) conns: SlotMap<ConnId, Connection>,
    pub(crate) handlers: SlotMap<HandlerId, Option<Box<dyn EventHandler>>>,
    pub(crate) net: Box<dyn NetworkInterface>,
    pub(crate) config: EngineConfig,
    pub(crate) now: Instant,
    pub(crate) deferred: VecDeque<(ConnId, Deferred)>,
    pub(crate) default_nameserver: Option<String>,
    /// Live UDP children keyed by listener and peer.
    udp_children: HashMap<(ConnId, SocketAddr), ConnId>,
}

impl Core {
    pub(crate) fn new(config: EngineConfig, net: Box<dyn NetworkInterface>) -> Self {
        Self {
            conns: SlotMap::with_key(),
            handlers: SlotMap::with_key(),
            net,
            config,
            now: Instant::now(),
            deferred: VecDeque::new(),
            default_nameserver: None,
            udp_children: HashMap::new(),
        }
    }

    pub(crate) fn add_handler(&mut self, handler: Box<dyn EventHandler>) -> HandlerId {
        self.handlers.insert(Some(handler))
    }

    pub(crate) fn new_conn(&mut self, handler: Option<HandlerId>) -> ConnId {
        let growth = self.config.buffer_growth_factor;
        let limit = self.config.recv_buffer_limit;
        let now = self.now;
        let id = self
            .conns
            .insert_with_key(|id| Connection::new(id, handler, growth, limit, now));
        metrics::inc_connections();
        id
    }

    fn discard_conn(&mut self, id: ConnId) {
        let Some(conn) = self.conns.remove(id) else {
            return;
        };
        if let (Some(listener), Some(peer)) = (conn.listener, conn.peer) {
            if self.udp_children.get(&(listener, peer)) == Some(&id) {
                self.udp_children.remove(&(listener, peer));
            }
        }
        metrics::dec_connections();
    }

    fn host_to_ip(host: &str) -> Option<IpAddr> {
        host.parse::<IpAddr>().ok().or_else(|| dns::lookup_host(host))
    }

    pub(crate) fn bind(
        &mut self,
        addr: &str,
        handler: HandlerId,
        opts: &BindOptions,
    ) -> Result<ConnId, NetmuxError> {
        if !self.handlers.contains_key(handler) {
            return Err(NetmuxError::UnknownHandler(handler));
        }
        if opts.tls && !self.config.tls {
            return Err(NetmuxError::TlsDisabled);
        }
        let parsed = parse_address(addr)?;
        let socket_addr = match parsed.socket_addr() {
            Some(sa) => sa,
            None => {
                let host = parsed.host.as_deref().unwrap_or_default();
                let ip = Self::host_to_ip(host).ok_or_else(|| NetmuxError::Bind {
                    addr: addr.to_owned(),
                    source: io::Error::from(io::ErrorKind::NotFound),
                })?;
                SocketAddr::new(ip, parsed.port)
            }
        };
        let id = self.new_conn(Some(handler));
        let result = match parsed.transport {
            Transport::Tcp => self.net.listen_tcp(id, socket_addr, opts),
            Transport::Udp => self.net.listen_udp(id, socket_addr),
        };
        match result {
            Ok(local) => {
                let conn = &mut self.conns[id];
                conn.local = Some(local);
                conn.flags.insert(ConnFlags::LISTENING);
                conn.flags.set(ConnFlags::UDP, parsed.transport == Transport::Udp);
                conn.flags.set(ConnFlags::TLS, opts.tls);
                debug!(conn = %id, %local, "listening");
                Ok(id)
            }
            Err(source) => {
                self.discard_conn(id);
                Err(NetmuxError::Bind {
                    addr: addr.to_owned(),
                    source,
                })
            }
        }
    }

    pub(crate) fn connect(
        &mut self,
        addr: &str,
        handler: Option<HandlerId>,
        opts: ConnectOptions,
    ) -> Result<ConnId, NetmuxError> {
        if let Some(h) = handler {
            if !self.handlers.contains_key(h) {
                return Err(NetmuxError::UnknownHandler(h));
            }
        }
        let parsed = parse_address(addr)?;
        let id = self.new_conn(handler);
        {
            let conn = &mut self.conns[id];
            conn.flags.insert(opts.flags);
            conn.flags.set(ConnFlags::UDP, parsed.transport == Transport::Udp);
            conn.set_boxed_user_data(opts.user_data);
        }
        let port = parsed.port;
        let host = parsed.host.clone().unwrap_or_default();
        if let Some(sa) = parsed.socket_addr() {
            self.start_connect(id, sa);
        } else if let Some(ip) = dns::lookup_host(&host) {
            self.start_connect(id, SocketAddr::new(ip, port));
        } else {
            self.conns[id].flags.insert(ConnFlags::RESOLVING);
            let opts = ResolveOptions::from_config(&self.config.dns);
            let callback: ResolveCallback = Box::new(move |ctx, result| {
                ctx.core().finish_resolve(id, port, result);
            });
            if let Err(e) = self.resolve(&host, RecordType::A, opts, callback) {
                debug!(conn = %id, host = %host, error = %e, "resolver failed to start");
                self.defer(id, Deferred::ConnectFailed(io::ErrorKind::NotFound));
            }
        }
        Ok(id)
    }

    pub(crate) fn start_connect(&mut self, id: ConnId, addr: SocketAddr) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        conn.flags.remove(ConnFlags::RESOLVING);
        conn.flags.insert(ConnFlags::CONNECTING);
        conn.peer = Some(addr);
        let udp = conn.flags.contains(ConnFlags::UDP);
        debug!(conn = %id, peer = %addr, udp, "connecting");
        if let Err(e) = self.net.connect(id, addr, udp) {
            self.defer(id, Deferred::ConnectFailed(e.kind()));
        }
    }

    fn finish_resolve(&mut self, id: ConnId, port: u16, result: Result<&DnsMessage, ResolveError>) {
        let ip = result.ok().and_then(DnsMessage::first_address);
        match ip {
            Some(ip) => self.start_connect(id, SocketAddr::new(ip, port)),
            None => self.defer(id, Deferred::ConnectFailed(io::ErrorKind::NotFound)),
        }
    }

    pub(crate) fn defer(&mut self, id: ConnId, work: Deferred) { self.deferred.push_back((id, work)); }

    pub(crate) fn run_deferred(&mut self) {
        while let Some((id, work)) = self.deferred.pop_front() {
            match work {
                Deferred::ConnectFailed(kind) => self.connect_failed(id, kind),
            }
        }
    }

    fn connect_failed(&mut self, id: ConnId, kind: io::ErrorKind) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        conn.flags.remove(ConnFlags::RESOLVING | ConnFlags::CONNECTING);
        debug!(conn = %id, error = ?kind, "connect failed");
        self.dispatch(id, Event::Connect(Err(kind)));
        if let Some(conn) = self.conns.get_mut(id) {
            conn.close();
        }
    }

    /// Run the protocol layer and user handler of `id` for `event`.
    pub(crate) fn dispatch(&mut self, id: ConnId, event: Event<'_>) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        if conn.flags.is_closing() && !matches!(event, Event::Close) {
            return;
        }
        let mut protocol = mem::take(&mut conn.protocol);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            protocol.on_event(&mut Context::new(self, id), event);
        }));
        if let Some(conn) = self.conns.get_mut(id) {
            if matches!(conn.protocol, Protocol::None) {
                conn.protocol = protocol;
            }
            if let Err(payload) = outcome {
                let panic_msg = format_panic(payload);
                log::error!("protocol layer panicked: panic={panic_msg}, conn={id}");
                conn.close();
            }
        }
    }

    pub(crate) fn process(&mut self, event: NetEvent) {
        match event {
            NetEvent::Incoming { listener, pending } => self.incoming(listener, pending),
            NetEvent::Accepted { id, peer } => {
                let Some(listener) = self.conns.get(id).map(|c| c.listener) else {
                    return;
                };
                if !self.admits(listener, peer) {
                    debug!(conn = %id, %peer, "peer refused by ACL");
                    self.net.destroy(id);
                    self.discard_conn(id);
                    return;
                }
                let Some(conn) = self.conns.get_mut(id) else {
                    return;
                };
                conn.peer = Some(peer);
                conn.last_io = self.now;
                debug!(conn = %id, %peer, "accepted");
                self.dispatch(id, Event::Accept(peer));
            }
            NetEvent::Connected { id, result } => match result {
                Ok(local) => {
                    let Some(conn) = self.conns.get_mut(id) else {
                        return;
                    };
                    conn.flags.remove(ConnFlags::CONNECTING);
                    conn.local = Some(local);
                    conn.last_io = self.now;
                    self.dispatch(id, Event::Connect(Ok(())));
                }
                Err(kind) => self.connect_failed(id, kind),
            },
            NetEvent::Received { id, data } => self.received(id, &data),
            NetEvent::Datagram {
                listener,
                peer,
                data,
            } => self.datagram(listener, peer, data),
            NetEvent::Writable { .. } => {}
            NetEvent::Closed { id } => {
                if let Some(conn) = self.conns.get_mut(id) {
                    debug!(conn = %id, "peer closed");
                    conn.close();
                }
            }
        }
    }

    fn incoming(&mut self, listener: ConnId, pending: u64) {
        let Some(parent) = self.conns.get(listener) else {
            return;
        };
        let handler = parent.handler;
        let protocol = parent.protocol.for_accepted();
        let tls = parent.flags & ConnFlags::TLS;
        let child = self.new_conn(handler);
        let conn = &mut self.conns[child];
        conn.listener = Some(listener);
        conn.protocol = protocol;
        conn.flags.insert(tls);
        self.net.accept(listener, pending, child);
    }

    /// Whether `listener`'s ACL lets `peer` in.
    fn admits(&self, listener: Option<ConnId>, peer: SocketAddr) -> bool {
        listener
            .and_then(|l| self.conns.get(l))
            .and_then(|l| l.ip_acl.as_ref())
            .is_none_or(|acl| acl.allows(peer.ip()))
    }

    fn received(&mut self, id: ConnId, data: &[u8]) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        if conn.flags.is_closing() {
            return;
        }
        conn.recv.append(data);
        conn.last_io = self.now;
        metrics::add_bytes(Direction::Inbound, data.len());
        let before = conn.recv.len();
        self.dispatch(id, Event::Recv(data.len()));
        let after = self.conns.get(id).map_or(0, |c| c.recv.len());
        self.net.recved(id, before.saturating_sub(after));
    }

    fn datagram(&mut self, listener: ConnId, peer: SocketAddr, data: Bytes) {
        let Some(parent) = self.conns.get(listener) else {
            return;
        };
        let existing = self
            .udp_children
            .get(&(listener, peer))
            .copied()
            .filter(|&id| self.conns.get(id).is_some_and(|c| !c.flags.is_closing()));
        let child = match existing {
            Some(id) => id,
            None if !self.admits(Some(listener), peer) => {
                debug!(listener = %listener, %peer, "datagram refused by ACL");
                return;
            }
            None => {
                let handler = parent.handler;
                let protocol = parent.protocol.for_accepted();
                let id = self.new_conn(handler);
                let conn = &mut self.conns[id];
                conn.listener = Some(listener);
                conn.peer = Some(peer);
                conn.protocol = protocol;
                conn.flags.insert(ConnFlags::UDP | ConnFlags::SEND_AND_CLOSE);
                self.udp_children.insert((listener, peer), id);
                self.dispatch(id, Event::Accept(peer));
                id
            }
        };
        self.received(child, &data);
    }

    /// Write pending send buffers to the transport.
    pub(crate) fn flush(&mut self) {
        let ready: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, c)| c.has_pending_send() && c.flags.can_write())
            .map(|(id, _)| id)
            .collect();
        for id in ready {
            let Some(conn) = self.conns.get_mut(id) else {
                continue;
            };
            let data = conn.send.as_slice();
            let result = match (conn.listener, conn.peer) {
                (Some(listener), Some(peer)) if conn.flags.contains(ConnFlags::UDP) => {
                    self.net.send_to(listener, peer, data)
                }
                _ => self.net.send(id, data),
            };
            match result {
                Ok(0) => {}
                Ok(n) => {
                    conn.send.remove(n);
                    conn.last_io = self.now;
                    metrics::add_bytes(Direction::Outbound, n);
                    self.dispatch(id, Event::Send(n));
                }
                Err(e) => {
                    warn!(conn = %id, error = %e, "send failed");
                    conn.close();
                }
            }
        }
    }

    pub(crate) fn fire_timers(&mut self) {
        let now = self.now;
        let due: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, c)| c.timer.is_some_and(|t| t <= now))
            .map(|(id, _)| id)
            .collect();
        for id in due {
            if let Some(conn) = self.conns.get_mut(id) {
                conn.timer = None;
            }
            self.dispatch(id, Event::Timer(now));
        }
    }

    pub(crate) fn tick(&mut self) {
        let ids: Vec<ConnId> = self.conns.keys().collect();
        for id in ids {
            self.dispatch(id, Event::Poll);
        }
    }

    pub(crate) fn broadcast(&mut self, msg: &[u8]) {
        let ids: Vec<ConnId> = self.conns.keys().collect();
        for id in ids {
            self.dispatch(id, Event::Broadcast(msg));
        }
    }

    fn is_done(conn: &Connection) -> bool {
        conn.flags.is_closing()
            || (conn.flags.contains(ConnFlags::SEND_AND_CLOSE) && !conn.has_pending_send())
    }

    /// Destroy every connection marked for closing.
    pub(crate) fn reap(&mut self) {
        loop {
            let done: Vec<ConnId> = self
                .conns
                .iter()
                .filter(|(_, c)| Self::is_done(c))
                .map(|(id, _)| id)
                .collect();
            if done.is_empty() {
                return;
            }
            for id in done {
                self.destroy(id);
            }
        }
    }

    pub(crate) fn destroy(&mut self, id: ConnId) {
        if let Some(conn) = self.conns.get_mut(id) {
            conn.close();
        }
        self.dispatch(id, Event::Close);
        let udp_child = self
            .conns
            .get(id)
            .is_some_and(|c| c.listener.is_some() && c.flags.contains(ConnFlags::UDP));
        if !udp_child {
            self.net.destroy(id);
        }
        debug!(conn = %id, "closed");
        self.discard_conn(id);
    }

    /// Earliest armed timer, if any.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.conns.values().filter_map(|c| c.timer).min()
    }

    pub(crate) fn has_urgent_work(&self) -> bool {
        !self.deferred.is_empty() || self.conns.values().any(Self::is_done)
    }
}
