//! In-memory [`NetworkInterface`].

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use netmux::{BindOptions, ConnId, Manager, NetEvent, NetworkInterface, Wake};

const FIRST_EPHEMERAL_PORT: u16 = 40_000;

#[derive(Default)]
struct CountingWaker(AtomicUsize);

impl Wake for CountingWaker {
    fn wake(&self) -> io::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct State {
    next_port: u16,
    next_pending: u64,
    listeners: HashMap<ConnId, SocketAddr>,
    pending: HashMap<u64, SocketAddr>,
    events: VecDeque<NetEvent>,
    sent: HashMap<ConnId, Vec<u8>>,
    datagrams: Vec<(ConnId, SocketAddr, Vec<u8>)>,
    connects: Vec<(ConnId, SocketAddr, bool)>,
    destroyed: Vec<ConnId>,
    manual_connect: bool,
    write_limit: Option<usize>,
    waker: Arc<CountingWaker>,
}

impl State {
    fn local_addr(&mut self, requested: SocketAddr) -> SocketAddr {
        if requested.port() != 0 {
            return requested;
        }
        self.next_port += 1;
        SocketAddr::new(requested.ip(), FIRST_EPHEMERAL_PORT + self.next_port)
    }
}

/// Network seam that never touches the operating system.
pub struct MockNetwork {
    state: Rc<RefCell<State>>,
}

/// Test-side view of a [`MockNetwork`] owned by a manager.
#[derive(Clone)]
pub struct MockHandle {
    state: Rc<RefCell<State>>,
}

impl MockNetwork {
    /// Create a seam and the handle controlling it.
    #[must_use]
    pub fn new() -> (Self, MockHandle) {
        let state = Rc::new(RefCell::new(State::default()));
        (
            Self {
                state: Rc::clone(&state),
            },
            MockHandle { state },
        )
    }
}

impl NetworkInterface for MockNetwork {
    fn listen_tcp(
        &mut self,
        id: ConnId,
        addr: SocketAddr,
        opts: &BindOptions,
    ) -> io::Result<SocketAddr> {
        if opts.tls {
            return Err(io::ErrorKind::Unsupported.into());
        }
        let mut s = self.state.borrow_mut();
        let local = s.local_addr(addr);
        s.listeners.insert(id, local);
        Ok(local)
    }

    fn listen_udp(&mut self, id: ConnId, addr: SocketAddr) -> io::Result<SocketAddr> {
        let mut s = self.state.borrow_mut();
        let local = s.local_addr(addr);
        s.listeners.insert(id, local);
        Ok(local)
    }

    fn connect(&mut self, id: ConnId, addr: SocketAddr, udp: bool) -> io::Result<()> {
        let mut s = self.state.borrow_mut();
        s.connects.push((id, addr, udp));
        if !s.manual_connect {
            let local = s.local_addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0));
            s.events.push_back(NetEvent::Connected {
                id,
                result: Ok(local),
            });
        }
        Ok(())
    }

    fn accept(&mut self, _listener: ConnId, pending: u64, child: ConnId) {
        let mut s = self.state.borrow_mut();
        if let Some(peer) = s.pending.remove(&pending) {
            s.events.push_back(NetEvent::Accepted { id: child, peer });
        }
    }

    fn send(&mut self, id: ConnId, data: &[u8]) -> io::Result<usize> {
        let mut s = self.state.borrow_mut();
        let n = s.write_limit.map_or(data.len(), |limit| limit.min(data.len()));
        s.sent.entry(id).or_default().extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn send_to(&mut self, listener: ConnId, peer: SocketAddr, data: &[u8]) -> io::Result<usize> {
        self.state
            .borrow_mut()
            .datagrams
            .push((listener, peer, data.to_vec()));
        Ok(data.len())
    }

    fn recved(&mut self, _id: ConnId, _consumed: usize) {}

    fn destroy(&mut self, id: ConnId) {
        let mut s = self.state.borrow_mut();
        s.listeners.remove(&id);
        s.destroyed.push(id);
    }

    fn poll(&mut self, _timeout: Duration, events: &mut Vec<NetEvent>) -> io::Result<()> {
        events.extend(self.state.borrow_mut().events.drain(..));
        Ok(())
    }

    fn has_pending(&self) -> bool { !self.state.borrow().events.is_empty() }

    fn waker(&self) -> Option<Arc<dyn Wake>> {
        let waker: Arc<dyn Wake> = self.state.borrow().waker.clone();
        Some(waker)
    }
}

impl MockHandle {
    fn push(&self, event: NetEvent) { self.state.borrow_mut().events.push_back(event); }

    /// Announce a TCP peer at `peer` on `listener`.
    pub fn incoming(&self, listener: ConnId, peer: SocketAddr) {
        let mut s = self.state.borrow_mut();
        s.next_pending += 1;
        let pending = s.next_pending;
        s.pending.insert(pending, peer);
        s.events.push_back(NetEvent::Incoming { listener, pending });
    }

    /// Accept a peer on `listener` and return the new connection id.
    ///
    /// Runs poll passes until the accept completes.
    ///
    /// # Panics
    ///
    /// Panics if the manager did not create a connection for the peer.
    pub fn connect_peer(&self, mgr: &mut Manager, listener: ConnId) -> ConnId {
        let port = 50_000 + u16::try_from(self.state.borrow().next_pending % 10_000).unwrap_or(0);
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port);
        self.incoming(listener, peer);
        mgr.poll(Duration::ZERO);
        mgr.connections()
            .find(|c| c.listener() == Some(listener) && c.peer_addr() == Some(peer))
            .map(netmux::Connection::id)
            .expect("accepted connection")
    }

    /// Deliver stream bytes to `id`.
    pub fn receive(&self, id: ConnId, data: &[u8]) {
        self.push(NetEvent::Received {
            id,
            data: Bytes::copy_from_slice(data),
        });
    }

    /// Deliver one datagram from `peer` to the UDP listener `listener`.
    pub fn datagram(&self, listener: ConnId, peer: SocketAddr, data: &[u8]) {
        self.push(NetEvent::Datagram {
            listener,
            peer,
            data: Bytes::copy_from_slice(data),
        });
    }

    /// Report that the peer of `id` hung up.
    pub fn close_peer(&self, id: ConnId) { self.push(NetEvent::Closed { id }); }

    /// Stop completing connects automatically.
    pub fn set_manual_connect(&self, manual: bool) { self.state.borrow_mut().manual_connect = manual; }

    /// Complete a connect started while in manual mode.
    pub fn complete_connect(&self, id: ConnId, result: Result<SocketAddr, io::ErrorKind>) {
        self.push(NetEvent::Connected { id, result });
    }

    /// Accept at most `limit` bytes per write; `None` lifts the limit.
    pub fn set_write_limit(&self, limit: Option<usize>) { self.state.borrow_mut().write_limit = limit; }

    /// Remove and return the stream bytes written to `id`.
    #[must_use]
    pub fn take_sent(&self, id: ConnId) -> Vec<u8> {
        self.state.borrow_mut().sent.remove(&id).unwrap_or_default()
    }

    /// Remove and return datagrams sent as `(listener, peer, payload)`.
    #[must_use]
    pub fn take_datagrams(&self) -> Vec<(ConnId, SocketAddr, Vec<u8>)> {
        std::mem::take(&mut self.state.borrow_mut().datagrams)
    }

    /// Every connect request as `(id, address, udp)`.
    #[must_use]
    pub fn connects(&self) -> Vec<(ConnId, SocketAddr, bool)> { self.state.borrow().connects.clone() }

    /// Whether the seam released `id`.
    #[must_use]
    pub fn is_destroyed(&self, id: ConnId) -> bool { self.state.borrow().destroyed.contains(&id) }

    /// Address a listener was bound to.
    #[must_use]
    pub fn listener_addr(&self, id: ConnId) -> Option<SocketAddr> {
        self.state.borrow().listeners.get(&id).copied()
    }

    /// Number of times a broadcaster woke the seam.
    #[must_use]
    pub fn wake_count(&self) -> usize { self.state.borrow().waker.0.load(Ordering::SeqCst) }
}
