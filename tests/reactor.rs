//! Reactor behaviour: dispatch order, closing, timers, UDP and broadcasts.

use std::{
    cell::RefCell,
    io,
    net::SocketAddr,
    rc::Rc,
    thread,
    time::Duration,
};

use netmux::{
    BindOptions,
    BroadcastError,
    ConnFlags,
    ConnId,
    EngineConfig,
    Event,
    HandlerId,
    Manager,
    NetmuxError,
};
use netmux_testing::{LoggerHandle, MockHandle, MockNetwork, logger};
use rstest::{fixture, rstest};

type Log = Rc<RefCell<Vec<String>>>;

struct Reactor {
    mgr: Manager,
    handle: MockHandle,
    handler: HandlerId,
    log: Log,
}

impl Reactor {
    fn lines(&self) -> Vec<String> { self.log.borrow().clone() }

    fn clear(&self) { self.log.borrow_mut().clear(); }
}

fn event_line(event: &Event<'_>) -> Option<String> {
    Some(match event {
        Event::Poll | Event::Send(_) => return None,
        Event::Accept(peer) => format!("accept {peer}"),
        Event::Connect(result) => format!("connect {result:?}"),
        Event::Recv(n) => format!("recv {n}"),
        Event::Close => "close".to_owned(),
        Event::Timer(_) => "timer".to_owned(),
        Event::Broadcast(msg) => format!("broadcast {}", String::from_utf8_lossy(msg)),
        other => other.name().to_owned(),
    })
}

/// Echo server: "boom" panics, "bye" replies and closes after sending,
/// "quit" closes at once, "later" arms a timer that answers "tick".
fn reactor_with(config: EngineConfig) -> Reactor {
    let (net, handle) = MockNetwork::new();
    let mut mgr = Manager::new(config, net);
    let log: Log = Rc::default();
    let seen = Rc::clone(&log);
    let handler = mgr.add_handler_fn(move |ctx, event| {
        if let Some(line) = event_line(&event) {
            seen.borrow_mut().push(line);
        }
        match event {
            Event::Recv(_) => {
                let recv = ctx.conn_mut().recv_buffer_mut();
                let n = recv.len();
                let data = recv.split_to(n);
                match &data[..] {
                    b"boom" => panic!("handler exploded"),
                    b"bye" => {
                        let conn = ctx.conn_mut();
                        conn.send(b"goodbye");
                        conn.close_after_send();
                    }
                    b"quit" => ctx.close(),
                    b"later" => {
                        let now = ctx.now();
                        ctx.conn_mut().set_timer(Some(now));
                    }
                    _ => ctx.conn_mut().send(&data),
                }
            }
            Event::Timer(_) => ctx.conn_mut().send(b"tick"),
            _ => {}
        }
    });
    Reactor {
        mgr,
        handle,
        handler,
        log,
    }
}

#[fixture]
fn reactor() -> Reactor { reactor_with(EngineConfig::default()) }

fn listen(r: &mut Reactor) -> ConnId { r.mgr.bind("tcp://127.0.0.1:7000", r.handler).expect("bind") }

fn pump(r: &mut Reactor, peer: ConnId, data: &[u8]) {
    r.handle.receive(peer, data);
    r.mgr.poll(Duration::ZERO);
}

#[rstest]
fn accepted_peer_is_echoed(mut reactor: Reactor) {
    let listener = listen(&mut reactor);
    assert_eq!(
        reactor.handle.listener_addr(listener),
        Some("127.0.0.1:7000".parse().expect("addr"))
    );
    let peer = reactor.handle.connect_peer(&mut reactor.mgr, listener);
    pump(&mut reactor, peer, b"hello");
    assert_eq!(reactor.handle.take_sent(peer), b"hello");
    assert_eq!(reactor.lines(), ["accept 10.0.0.1:50000", "recv 5"]);
    let conn = reactor.mgr.connection(peer).expect("live");
    assert_eq!(conn.listener(), Some(listener));
    assert!(!conn.is_client());
}

#[rstest]
fn panicking_handler_only_closes_its_connection(mut reactor: Reactor, mut logger: LoggerHandle) {
    let listener = listen(&mut reactor);
    let a = reactor.handle.connect_peer(&mut reactor.mgr, listener);
    let b = reactor.handle.connect_peer(&mut reactor.mgr, listener);
    pump(&mut reactor, a, b"boom");
    assert!(reactor.handle.is_destroyed(a));
    assert!(reactor.mgr.connection(a).is_none());
    assert!(logger.contains(log::Level::Error, "handler exploded"));

    pump(&mut reactor, b, b"still here");
    assert_eq!(reactor.handle.take_sent(b), b"still here");
}

#[rstest]
fn closing_inside_a_handler_spares_later_dispatch(mut reactor: Reactor) {
    let listener = listen(&mut reactor);
    let a = reactor.handle.connect_peer(&mut reactor.mgr, listener);
    let b = reactor.handle.connect_peer(&mut reactor.mgr, listener);
    reactor.clear();
    reactor.handle.receive(a, b"quit");
    reactor.handle.receive(b, b"ping");
    reactor.mgr.poll(Duration::ZERO);
    assert_eq!(reactor.lines(), ["recv 4", "recv 4", "close"]);
    assert!(reactor.handle.is_destroyed(a));
    assert!(reactor.mgr.connection(a).is_none());
    assert_eq!(reactor.handle.take_sent(b), b"ping");
    assert!(reactor.mgr.connection(b).is_some());
}

#[rstest]
fn close_after_send_flushes_first(mut reactor: Reactor) {
    let listener = listen(&mut reactor);
    let peer = reactor.handle.connect_peer(&mut reactor.mgr, listener);
    reactor.clear();
    pump(&mut reactor, peer, b"bye");
    assert_eq!(reactor.handle.take_sent(peer), b"goodbye");
    assert!(reactor.handle.is_destroyed(peer));
    assert_eq!(reactor.lines(), ["recv 3", "close"]);
}

#[rstest]
fn partial_writes_drain_over_several_passes(mut reactor: Reactor) {
    let listener = listen(&mut reactor);
    let peer = reactor.handle.connect_peer(&mut reactor.mgr, listener);
    reactor.handle.set_write_limit(Some(4));
    pump(&mut reactor, peer, b"0123456789");
    assert_eq!(reactor.handle.take_sent(peer), b"0123");
    let pending = |r: &Reactor| r.mgr.connection(peer).map_or(0, |c| c.send_buffer().len());
    assert_eq!(pending(&reactor), 6);
    reactor.mgr.poll(Duration::ZERO);
    reactor.mgr.poll(Duration::ZERO);
    assert_eq!(reactor.handle.take_sent(peer), b"456789");
    assert_eq!(pending(&reactor), 0);
}

#[rstest]
fn timer_fires_once(mut reactor: Reactor) {
    let listener = listen(&mut reactor);
    let peer = reactor.handle.connect_peer(&mut reactor.mgr, listener);
    pump(&mut reactor, peer, b"later");
    reactor.mgr.poll(Duration::ZERO);
    assert_eq!(reactor.handle.take_sent(peer), b"tick");
    let timers = reactor.lines().iter().filter(|l| *l == "timer").count();
    assert_eq!(timers, 1);
    assert!(reactor.mgr.connection(peer).is_some_and(|c| c.timer().is_none()));
}

#[rstest]
fn peer_hangup_delivers_close(mut reactor: Reactor) {
    let listener = listen(&mut reactor);
    let peer = reactor.handle.connect_peer(&mut reactor.mgr, listener);
    reactor.clear();
    reactor.handle.close_peer(peer);
    reactor.mgr.poll(Duration::ZERO);
    assert_eq!(reactor.lines(), ["close"]);
    assert!(reactor.handle.is_destroyed(peer));
}

#[rstest]
fn outbound_connect_reports_success(mut reactor: Reactor) {
    let id = reactor
        .mgr
        .connect("tcp://192.0.2.7:80", reactor.handler)
        .expect("connect");
    assert!(reactor.mgr.connection(id).is_some_and(|c| c.flags().contains(ConnFlags::CONNECTING)));
    reactor.mgr.poll(Duration::ZERO);
    assert_eq!(reactor.lines(), ["connect Ok(())"]);
    let conn = reactor.mgr.connection(id).expect("live");
    assert!(conn.is_client());
    assert_eq!(conn.peer_addr(), Some("192.0.2.7:80".parse().expect("addr")));
    assert!(!conn.flags().contains(ConnFlags::CONNECTING));
    assert_eq!(
        reactor.handle.connects(),
        [(id, "192.0.2.7:80".parse().expect("addr"), false)]
    );
}

#[rstest]
fn refused_connect_reports_error_then_closes(mut reactor: Reactor) {
    reactor.handle.set_manual_connect(true);
    let id = reactor
        .mgr
        .connect("udp://192.0.2.7:5683", reactor.handler)
        .expect("connect");
    reactor.mgr.poll(Duration::ZERO);
    assert!(reactor.lines().is_empty());
    reactor
        .handle
        .complete_connect(id, Err(io::ErrorKind::ConnectionRefused));
    reactor.mgr.poll(Duration::ZERO);
    assert_eq!(reactor.lines(), ["connect Err(ConnectionRefused)", "close"]);
    assert!(reactor.mgr.connection(id).is_none());
}

#[rstest]
fn udp_listener_replies_to_each_datagram(mut reactor: Reactor) {
    let listener = reactor
        .mgr
        .bind("udp://0.0.0.0:5683", reactor.handler)
        .expect("bind");
    let peer: SocketAddr = "192.0.2.9:40000".parse().expect("addr");
    reactor.handle.datagram(listener, peer, b"one");
    reactor.mgr.poll(Duration::ZERO);
    reactor.handle.datagram(listener, peer, b"two");
    reactor.mgr.poll(Duration::ZERO);
    assert_eq!(
        reactor.handle.take_datagrams(),
        [
            (listener, peer, b"one".to_vec()),
            (listener, peer, b"two".to_vec())
        ]
    );
    assert_eq!(
        reactor.lines(),
        [
            "accept 192.0.2.9:40000",
            "recv 3",
            "close",
            "accept 192.0.2.9:40000",
            "recv 3",
            "close"
        ]
    );
    assert_eq!(reactor.mgr.connections().count(), 1);
    assert!(!reactor.handle.is_destroyed(listener));
}

#[rstest]
fn datagrams_in_one_pass_share_a_child_per_peer(mut reactor: Reactor) {
    let listener = reactor
        .mgr
        .bind("udp://0.0.0.0:5683", reactor.handler)
        .expect("bind");
    let first: SocketAddr = "192.0.2.9:40000".parse().expect("addr");
    let second: SocketAddr = "192.0.2.10:40000".parse().expect("addr");
    reactor.handle.datagram(listener, first, b"one");
    reactor.handle.datagram(listener, second, b"two");
    reactor.handle.datagram(listener, first, b"three");
    reactor.mgr.poll(Duration::ZERO);
    assert_eq!(
        reactor.lines(),
        [
            "accept 192.0.2.9:40000",
            "recv 3",
            "accept 192.0.2.10:40000",
            "recv 3",
            "recv 5",
            "close",
            "close"
        ]
    );
    let mut replies = reactor.handle.take_datagrams();
    replies.sort_by_key(|(_, peer, _)| *peer);
    assert_eq!(
        replies,
        [
            (listener, first, b"onethree".to_vec()),
            (listener, second, b"two".to_vec())
        ]
    );
    assert_eq!(reactor.mgr.connections().count(), 1);
}

#[rstest]
fn binding_rejects_bad_requests(mut reactor: Reactor) {
    assert!(matches!(
        reactor.mgr.bind("tcp://127.0.0.1:7000", HandlerId::default()),
        Err(NetmuxError::UnknownHandler(_))
    ));
    assert!(matches!(
        reactor
            .mgr
            .bind_opt("tcp://127.0.0.1:443", reactor.handler, &BindOptions { tls: true }),
        Err(NetmuxError::TlsDisabled)
    ));
    assert!(matches!(
        reactor.mgr.bind("sctp://127.0.0.1:1", reactor.handler),
        Err(NetmuxError::Address(_))
    ));
    assert_eq!(reactor.mgr.connections().count(), 0);
}

#[rstest]
fn broadcast_reaches_every_connection(mut reactor: Reactor) {
    let listener = listen(&mut reactor);
    reactor.handle.connect_peer(&mut reactor.mgr, listener);
    reactor.handle.connect_peer(&mut reactor.mgr, listener);
    reactor.clear();
    let tx = reactor.mgr.broadcaster().expect("enabled");
    thread::spawn(move || tx.send(b"news"))
        .join()
        .expect("sender thread")
        .expect("queued");
    assert_eq!(reactor.handle.wake_count(), 1);
    reactor.mgr.poll(Duration::ZERO);
    assert_eq!(reactor.lines(), ["broadcast news"; 3]);
}

#[rstest]
fn broadcast_rejects_oversized_payloads(reactor: Reactor) {
    let tx = reactor.mgr.broadcaster().expect("enabled");
    let max = reactor.mgr.config().max_broadcast_message;
    assert_eq!(
        tx.send(&vec![0; max + 1]),
        Err(BroadcastError::TooLarge { size: max + 1, max })
    );
    assert_eq!(reactor.handle.wake_count(), 0);
}

#[test]
fn broadcast_requires_multithreading() {
    let r = reactor_with(EngineConfig::default().with_multithreading(false));
    assert_eq!(r.mgr.broadcaster().err(), Some(BroadcastError::Disabled));
}

#[rstest]
fn broadcast_after_drop_reports_closed(reactor: Reactor) {
    let tx = reactor.mgr.broadcaster().expect("enabled");
    drop(reactor);
    assert_eq!(tx.send(b"late"), Err(BroadcastError::Closed));
}

#[rstest]
fn shutdown_closes_everything(mut reactor: Reactor) {
    let listener = listen(&mut reactor);
    let peer = reactor.handle.connect_peer(&mut reactor.mgr, listener);
    reactor.clear();
    reactor.mgr.shutdown();
    assert_eq!(reactor.lines(), ["close", "close"]);
    assert!(reactor.handle.is_destroyed(peer));
    assert!(reactor.handle.is_destroyed(listener));
    assert_eq!(reactor.mgr.connections().count(), 0);
}

#[rstest]
fn acl_refuses_peers_before_accept(mut reactor: Reactor) {
    let listener = listen(&mut reactor);
    reactor
        .mgr
        .connection_mut(listener)
        .expect("listener")
        .set_ip_acl("-0.0.0.0/0,+10.0.0.0/8")
        .expect("valid acl");
    let outsider: SocketAddr = "192.0.2.1:1234".parse().expect("addr");
    reactor.handle.incoming(listener, outsider);
    reactor.mgr.poll(Duration::ZERO);
    assert!(reactor.lines().is_empty());
    assert_eq!(reactor.mgr.connections().count(), 1);

    let peer = reactor.handle.connect_peer(&mut reactor.mgr, listener);
    pump(&mut reactor, peer, b"hi");
    assert_eq!(reactor.handle.take_sent(peer), b"hi");
    assert_eq!(reactor.lines().last().map(String::as_str), Some("recv 2"));
}

#[rstest]
fn acl_drops_refused_datagrams(mut reactor: Reactor) {
    let listener = reactor
        .mgr
        .bind("udp://0.0.0.0:5683", reactor.handler)
        .expect("bind");
    reactor
        .mgr
        .connection_mut(listener)
        .expect("listener")
        .set_ip_acl("+192.0.2.9")
        .expect("valid acl");
    let allowed: SocketAddr = "192.0.2.9:40000".parse().expect("addr");
    let refused: SocketAddr = "192.0.2.10:40000".parse().expect("addr");
    reactor.handle.datagram(listener, refused, b"no");
    reactor.handle.datagram(listener, allowed, b"yes");
    reactor.mgr.poll(Duration::ZERO);
    assert_eq!(
        reactor.handle.take_datagrams(),
        [(listener, allowed, b"yes".to_vec())]
    );
    assert_eq!(reactor.lines(), ["accept 192.0.2.9:40000", "recv 3", "close"]);
}

#[rstest]
fn malformed_acl_keeps_the_previous_one(mut reactor: Reactor) {
    let listener = listen(&mut reactor);
    let conn = reactor.mgr.connection_mut(listener).expect("listener");
    conn.set_ip_acl("-0.0.0.0/0").expect("valid acl");
    assert!(conn.set_ip_acl("+300.0.0.1").is_err());
    reactor.handle.incoming(listener, "10.0.0.1:5000".parse().expect("addr"));
    reactor.mgr.poll(Duration::ZERO);
    assert!(reactor.lines().is_empty());
}
