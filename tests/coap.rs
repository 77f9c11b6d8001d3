//! CoAP layer on a UDP listener, plus option ordering properties.

use std::{net::SocketAddr, time::Duration};

use bytes::Bytes;
use netmux::{
    EngineConfig,
    Event,
    Manager,
    coap::{CODE_CLASS_RESP_OK, CoapError, CoapMessage, FieldFlags, MessageType, compose_coap, parse_coap},
};
use netmux_testing::{MockHandle, MockNetwork};
use proptest::prelude::*;

const URI_PATH: u16 = 11;

fn coap_server() -> (Manager, MockHandle, netmux::ConnId) {
    let (net, handle) = MockNetwork::new();
    let mut mgr = Manager::new(EngineConfig::default(), net);
    let handler = mgr.add_handler_fn(|ctx, event| {
        let Event::Coap(req) = event else {
            return;
        };
        let path: Vec<&[u8]> = req
            .options
            .iter()
            .filter(|o| o.number == URI_PATH)
            .map(|o| o.value.as_ref())
            .collect();
        let reply = CoapMessage {
            msg_type: if req.msg_type == MessageType::Confirmable {
                MessageType::Acknowledgement
            } else {
                MessageType::NonConfirmable
            },
            code_class: CODE_CLASS_RESP_OK,
            code_detail: 5,
            msg_id: req.msg_id,
            token: req.token.clone(),
            payload: Bytes::from(path.join(&b'/')),
            ..CoapMessage::default()
        };
        ctx.conn_mut().send_coap_message(&reply).expect("udp reply");
    });
    let listener = mgr.bind("udp://0.0.0.0:5683", handler).expect("bind");
    mgr.connection_mut(listener)
        .expect("listener")
        .set_protocol_coap()
        .expect("udp listener");
    (mgr, handle, listener)
}

fn peer() -> SocketAddr { "192.0.2.4:61000".parse().expect("addr") }

#[test]
fn confirmable_request_gets_piggybacked_response() {
    let (mut mgr, handle, listener) = coap_server();
    let mut req = CoapMessage {
        msg_id: 0x7d34,
        token: Bytes::from_static(&[0xaa, 0xbb]),
        code_class: 0,
        code_detail: 1,
        ..CoapMessage::default()
    };
    req.add_option(URI_PATH, &b"sensors"[..])
        .add_option(URI_PATH, &b"temp"[..]);
    let mut wire = Vec::new();
    compose_coap(&req, &mut wire).expect("composable");
    handle.datagram(listener, peer(), &wire);
    mgr.poll(Duration::ZERO);

    let out = handle.take_datagrams();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].1, peer());
    let reply = parse_coap(Bytes::from(out[0].2.clone())).expect("valid reply");
    assert_eq!(reply.msg_type, MessageType::Acknowledgement);
    assert_eq!((reply.code_class, reply.code_detail), (2, 5));
    assert_eq!(reply.msg_id, 0x7d34);
    assert_eq!(reply.token.as_ref(), [0xaa, 0xbb]);
    assert_eq!(reply.payload.as_ref(), b"sensors/temp");
    assert!(reply.fields.contains(FieldFlags::TOKEN | FieldFlags::PAYLOAD));
}

#[test]
fn malformed_and_foreign_datagrams_are_dropped() {
    let (mut mgr, handle, listener) = coap_server();
    // Version 2, token length 9, option nibble 15.
    for bad in [&[0x80, 0x01, 0, 1][..], &[0x49, 0x01, 0, 1], &[0x40, 0x01, 0, 1, 0xf0], &[0x40]] {
        handle.datagram(listener, peer(), bad);
    }
    mgr.poll(Duration::ZERO);
    assert!(handle.take_datagrams().is_empty());
    assert_eq!(mgr.connections().count(), 1);
}

#[test]
fn stream_connections_refuse_coap() {
    let (net, _handle) = MockNetwork::new();
    let mut mgr = Manager::new(EngineConfig::default(), net);
    let handler = mgr.add_handler_fn(|_, _| {});
    let listener = mgr.bind("tcp://0.0.0.0:5683", handler).expect("bind");
    let conn = mgr.connection_mut(listener).expect("listener");
    assert_eq!(conn.set_protocol_coap(), Err(CoapError::Network));
    assert_eq!(conn.send_coap_ack(1), Err(CoapError::Network));
}

proptest! {
    #[test]
    fn options_come_back_sorted_by_number(
        options in proptest::collection::vec((0u16..2000, proptest::collection::vec(any::<u8>(), 0..20)), 0..8),
        payload in proptest::collection::vec(any::<u8>(), 0..32),
    ) {
        let mut msg = CoapMessage {
            msg_type: MessageType::NonConfirmable,
            msg_id: 9,
            payload: Bytes::from(payload.clone()),
            ..CoapMessage::default()
        };
        for (number, value) in &options {
            msg.add_option(*number, Bytes::from(value.clone()));
        }
        let mut wire = Vec::new();
        compose_coap(&msg, &mut wire).expect("composable");
        let parsed = parse_coap(Bytes::from(wire)).expect("parsable");

        let mut expected = options.clone();
        expected.sort_by_key(|(number, _)| *number);
        let got: Vec<(u16, Vec<u8>)> = parsed
            .options
            .iter()
            .map(|o| (o.number, o.value.to_vec()))
            .collect();
        prop_assert_eq!(got, expected);
        prop_assert_eq!(parsed.payload.as_ref(), payload.as_slice());
        prop_assert_eq!(parsed.msg_type, MessageType::NonConfirmable);
    }
}
