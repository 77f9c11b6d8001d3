//! End-to-end checks over real loopback sockets.

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream, UdpSocket},
    thread,
    time::{Duration, Instant},
};

use netmux::{EngineConfig, Event, Manager};
use serial_test::serial;

fn echo_manager(addr: &str) -> (Manager, SocketAddr) {
    let mut mgr = Manager::with_mio(EngineConfig::default()).expect("poller");
    let echo = mgr.add_handler_fn(|ctx, event| match event {
        Event::Recv(_) => {
            let recv = ctx.conn_mut().recv_buffer_mut();
            let n = recv.len();
            let data = recv.split_to(n);
            ctx.conn_mut().send(&data);
        }
        Event::Broadcast(msg) if ctx.conn().listener().is_some() => ctx.conn_mut().send(msg),
        _ => {}
    });
    let listener = mgr.bind(addr, echo).expect("bind");
    let local = mgr
        .connection(listener)
        .and_then(netmux::Connection::local_addr)
        .expect("bound address");
    (mgr, local)
}

fn poll_until(mgr: &mut Manager, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out");
        mgr.poll(Duration::from_millis(10));
    }
}

#[test]
#[serial]
fn tcp_echo_over_loopback() {
    let (mut mgr, addr) = echo_manager("tcp://127.0.0.1:0");
    let mut client = TcpStream::connect(addr).expect("connect");
    client.set_nonblocking(true).expect("nonblocking");
    client.write_all(b"over the wire").expect("write");

    let mut got = Vec::new();
    poll_until(&mut mgr, || {
        let mut buf = [0u8; 64];
        if let Ok(n) = client.read(&mut buf) {
            got.extend_from_slice(&buf[..n]);
        }
        got.len() >= 13
    });
    assert_eq!(got, b"over the wire");
}

#[test]
#[serial]
fn udp_echo_over_loopback() {
    let (mut mgr, addr) = echo_manager("udp://127.0.0.1:0");
    let client = UdpSocket::bind("127.0.0.1:0").expect("bind client");
    client.set_nonblocking(true).expect("nonblocking");
    client.send_to(b"datagram", addr).expect("send");

    let mut got = None;
    poll_until(&mut mgr, || {
        let mut buf = [0u8; 64];
        if let Ok((n, from)) = client.recv_from(&mut buf) {
            got = Some((buf[..n].to_vec(), from));
        }
        got.is_some()
    });
    assert_eq!(got, Some((b"datagram".to_vec(), addr)));
}

#[test]
#[serial]
fn broadcast_wakes_a_blocked_poll() {
    let (mut mgr, addr) = echo_manager("tcp://127.0.0.1:0");
    let mut client = TcpStream::connect(addr).expect("connect");
    client.set_nonblocking(true).expect("nonblocking");
    let deadline = Instant::now() + Duration::from_secs(5);
    while mgr.connections().count() < 2 {
        assert!(Instant::now() < deadline, "peer never accepted");
        mgr.poll(Duration::from_millis(10));
    }

    let tx = mgr.broadcaster().expect("enabled");
    let sender = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        tx.send(b"wake up")
    });
    let started = Instant::now();
    mgr.poll(Duration::from_secs(10));
    assert!(started.elapsed() < Duration::from_secs(5));
    sender.join().expect("sender").expect("queued");

    let mut got = Vec::new();
    poll_until(&mut mgr, || {
        let mut buf = [0u8; 16];
        if let Ok(n) = client.read(&mut buf) {
            got.extend_from_slice(&buf[..n]);
        }
        got.len() >= 7
    });
    assert_eq!(got, b"wake up");
}
