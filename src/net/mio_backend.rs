//! [`NetworkInterface`] backed by `mio`.

use std::{
    collections::{HashMap, VecDeque},
    io::{self, Read, Write},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use log::warn;
use mio::{
    Events,
    Interest,
    Poll,
    Token,
    Waker,
    net::{TcpListener, TcpStream, UdpSocket},
};

use super::{BindOptions, NetEvent, NetworkInterface, Wake};
use crate::{config::EngineConfig, connection::ConnId};

const WAKE_TOKEN: Token = Token(0);
const EVENT_CAPACITY: usize = 256;
const MAX_DATAGRAM: usize = 65_536;

enum Socket {
    Listener(TcpListener),
    Stream(TcpStream),
    Udp { socket: UdpSocket, listening: bool },
}

struct Entry {
    token: Token,
    socket: Socket,
    connecting: bool,
    unacked: usize,
    stalled: bool,
}

/// Non-blocking TCP and UDP sockets multiplexed with `mio::Poll`.
///
/// TLS is not implemented here; listeners requesting it are refused with
/// [`io::ErrorKind::Unsupported`].
pub struct MioNetwork {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    entries: HashMap<ConnId, Entry>,
    tokens: HashMap<Token, ConnId>,
    next_token: usize,
    backlog: HashMap<u64, (ConnId, TcpStream, SocketAddr)>,
    next_pending: u64,
    completions: VecDeque<NetEvent>,
    read_chunk: usize,
    recv_limit: usize,
}

impl MioNetwork {
    /// Create the poller and its cross-thread waker.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS poller or waker cannot be created.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let defaults = EngineConfig::default();
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            waker,
            entries: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 1,
            backlog: HashMap::new(),
            next_pending: 0,
            completions: VecDeque::new(),
            read_chunk: defaults.read_chunk_size,
            recv_limit: defaults.recv_buffer_limit,
        })
    }

    fn register(&mut self, id: ConnId, mut socket: Socket, connecting: bool) -> io::Result<()> {
        let token = Token(self.next_token);
        self.next_token += 1;
        let registry = self.poll.registry();
        match &mut socket {
            Socket::Listener(l) => registry.register(l, token, Interest::READABLE)?,
            Socket::Stream(s) => {
                registry.register(s, token, Interest::READABLE | Interest::WRITABLE)?;
            }
            Socket::Udp { socket, .. } => registry.register(socket, token, Interest::READABLE)?,
        }
        self.tokens.insert(token, id);
        self.entries.insert(
            id,
            Entry {
                token,
                socket,
                connecting,
                unacked: 0,
                stalled: false,
            },
        );
        Ok(())
    }

    fn ready(&mut self, id: ConnId, readable: bool, writable: bool, out: &mut Vec<NetEvent>) {
        let chunk = self.read_chunk;
        let limit = self.recv_limit;
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        match &mut entry.socket {
            Socket::Listener(listener) => loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        let pending = self.next_pending;
                        self.next_pending += 1;
                        self.backlog.insert(pending, (id, stream, peer));
                        out.push(NetEvent::Incoming {
                            listener: id,
                            pending,
                        });
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        warn!("accept failed: listener={id}, error={e}");
                        break;
                    }
                }
            },
            Socket::Stream(stream) => {
                if entry.connecting {
                    match connect_outcome(stream) {
                        None => return,
                        Some(result) => {
                            entry.connecting = false;
                            let failed = result.is_err();
                            out.push(NetEvent::Connected { id, result });
                            if failed {
                                return;
                            }
                        }
                    }
                }
                if readable {
                    drain_stream(id, entry, chunk, limit, out);
                }
                if writable {
                    out.push(NetEvent::Writable { id });
                }
            }
            Socket::Udp { socket, listening } => {
                if !readable {
                    return;
                }
                let mut buf = vec![0u8; MAX_DATAGRAM];
                loop {
                    let received = if *listening {
                        socket.recv_from(&mut buf).map(|(n, peer)| (n, Some(peer)))
                    } else {
                        socket.recv(&mut buf).map(|n| (n, None))
                    };
                    match received {
                        Ok((n, Some(peer))) => out.push(NetEvent::Datagram {
                            listener: id,
                            peer,
                            data: Bytes::copy_from_slice(&buf[..n]),
                        }),
                        Ok((n, None)) => out.push(NetEvent::Received {
                            id,
                            data: Bytes::copy_from_slice(&buf[..n]),
                        }),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            warn!("datagram receive failed: conn={id}, error={e}");
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn connect_outcome(stream: &TcpStream) -> Option<Result<SocketAddr, io::ErrorKind>> {
    match stream.take_error() {
        Ok(Some(e)) | Err(e) => return Some(Err(e.kind())),
        Ok(None) => {}
    }
    match stream.peer_addr() {
        Ok(_) => Some(stream.local_addr().map_err(|e| e.kind())),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => None,
        Err(e) => Some(Err(e.kind())),
    }
}

fn drain_stream(id: ConnId, entry: &mut Entry, chunk: usize, limit: usize, out: &mut Vec<NetEvent>) {
    let Socket::Stream(stream) = &mut entry.socket else {
        return;
    };
    let mut buf = vec![0u8; chunk];
    loop {
        if entry.unacked >= limit {
            entry.stalled = true;
            return;
        }
        match stream.read(&mut buf) {
            Ok(0) => {
                out.push(NetEvent::Closed { id });
                return;
            }
            Ok(n) => {
                entry.unacked += n;
                out.push(NetEvent::Received {
                    id,
                    data: Bytes::copy_from_slice(&buf[..n]),
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => {
                out.push(NetEvent::Closed { id });
                return;
            }
        }
    }
}

fn unspecified_for(addr: SocketAddr) -> SocketAddr {
    let ip = match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

fn would_block_as_zero(result: io::Result<usize>) -> io::Result<usize> {
    match result {
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
            Ok(0)
        }
        other => other,
    }
}

impl NetworkInterface for MioNetwork {
    fn configure(&mut self, config: &EngineConfig) {
        self.read_chunk = config.read_chunk_size;
        self.recv_limit = config.recv_buffer_limit;
    }

    fn listen_tcp(
        &mut self,
        id: ConnId,
        addr: SocketAddr,
        opts: &BindOptions,
    ) -> io::Result<SocketAddr> {
        if opts.tls {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "TLS is not available in the mio backend",
            ));
        }
        let listener = TcpListener::bind(addr)?;
        let local = listener.local_addr()?;
        self.register(id, Socket::Listener(listener), false)?;
        Ok(local)
    }

    fn listen_udp(&mut self, id: ConnId, addr: SocketAddr) -> io::Result<SocketAddr> {
        let socket = UdpSocket::bind(addr)?;
        let local = socket.local_addr()?;
        self.register(
            id,
            Socket::Udp {
                socket,
                listening: true,
            },
            false,
        )?;
        Ok(local)
    }

    fn connect(&mut self, id: ConnId, addr: SocketAddr, udp: bool) -> io::Result<()> {
        if udp {
            let socket = UdpSocket::bind(unspecified_for(addr))?;
            socket.connect(addr)?;
            let local = socket.local_addr()?;
            self.register(
                id,
                Socket::Udp {
                    socket,
                    listening: false,
                },
                false,
            )?;
            self.completions.push_back(NetEvent::Connected {
                id,
                result: Ok(local),
            });
        } else {
            let stream = TcpStream::connect(addr)?;
            self.register(id, Socket::Stream(stream), true)?;
        }
        Ok(())
    }

    fn accept(&mut self, listener: ConnId, pending: u64, child: ConnId) {
        let Some((owner, stream, peer)) = self.backlog.remove(&pending) else {
            self.completions.push_back(NetEvent::Closed { id: child });
            return;
        };
        debug_assert_eq!(owner, listener);
        match self.register(child, Socket::Stream(stream), false) {
            Ok(()) => self.completions.push_back(NetEvent::Accepted { id: child, peer }),
            Err(e) => {
                warn!("failed to register accepted stream: conn={child}, error={e}");
                self.completions.push_back(NetEvent::Closed { id: child });
            }
        }
    }

    fn send(&mut self, id: ConnId, data: &[u8]) -> io::Result<usize> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        match &mut entry.socket {
            Socket::Stream(stream) => would_block_as_zero(stream.write(data)),
            Socket::Udp {
                socket,
                listening: false,
            } => would_block_as_zero(socket.send(data)),
            _ => Err(io::Error::from(io::ErrorKind::InvalidInput)),
        }
    }

    fn send_to(&mut self, listener: ConnId, peer: SocketAddr, data: &[u8]) -> io::Result<usize> {
        match self.entries.get_mut(&listener).map(|e| &mut e.socket) {
            Some(Socket::Udp { socket, .. }) => would_block_as_zero(socket.send_to(data, peer)),
            Some(_) => Err(io::Error::from(io::ErrorKind::InvalidInput)),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    fn recved(&mut self, id: ConnId, consumed: usize) {
        let (chunk, limit) = (self.read_chunk, self.recv_limit);
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.unacked = entry.unacked.saturating_sub(consumed);
        if entry.stalled && entry.unacked < limit {
            entry.stalled = false;
            let mut resumed = Vec::new();
            drain_stream(id, entry, chunk, limit, &mut resumed);
            self.completions.extend(resumed);
        }
    }

    fn destroy(&mut self, id: ConnId) {
        self.backlog.retain(|_, (owner, _, _)| *owner != id);
        let Some(mut entry) = self.entries.remove(&id) else {
            return;
        };
        self.tokens.remove(&entry.token);
        let registry = self.poll.registry();
        let result = match &mut entry.socket {
            Socket::Listener(l) => registry.deregister(l),
            Socket::Stream(s) => registry.deregister(s),
            Socket::Udp { socket, .. } => registry.deregister(socket),
        };
        if let Err(e) = result {
            warn!("deregister failed: conn={id}, error={e}");
        }
    }

    fn poll(&mut self, timeout: Duration, out: &mut Vec<NetEvent>) -> io::Result<()> {
        let queued = !self.completions.is_empty();
        out.extend(self.completions.drain(..));
        let timeout = if queued { Duration::ZERO } else { timeout };
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|ev| {
                let readable = ev.is_readable() || ev.is_read_closed() || ev.is_error();
                let writable = ev.is_writable() || ev.is_error();
                (ev.token(), readable, writable)
            })
            .collect();
        for (token, readable, writable) in ready {
            if token == WAKE_TOKEN {
                continue;
            }
            if let Some(&id) = self.tokens.get(&token) {
                self.ready(id, readable, writable, out);
            }
        }
        Ok(())
    }

    fn has_pending(&self) -> bool { !self.completions.is_empty() }

    fn waker(&self) -> Option<Arc<dyn Wake>> {
        let waker: Arc<dyn Wake> = self.waker.clone();
        Some(waker)
    }
}
