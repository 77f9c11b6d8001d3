#![cfg(feature = "metrics")]
//! Tests for `netmux` metrics.
//!
//! Counters and gauges are observed through
//! `metrics_util::debugging::DebuggingRecorder` installed as a local recorder.

use std::time::Duration;

use metrics_util::debugging::{DebuggingRecorder, Snapshotter};
use netmux::{
    BYTES_TOTAL,
    CONNECTIONS_ACTIVE,
    EngineConfig,
    Event,
    Manager,
    PROTOCOL_ERRORS_TOTAL,
    metrics::{self, Direction, ProtocolKind},
};
use netmux_testing::{MockNetwork, counter_value, gauge_value};
use rstest::{fixture, rstest};

#[fixture]
fn recorder() -> (Snapshotter, DebuggingRecorder) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    (snapshotter, recorder)
}

#[rstest]
fn helpers_record_labelled_values(recorder: (Snapshotter, DebuggingRecorder)) {
    let (snapshotter, recorder) = recorder;
    ::metrics::with_local_recorder(&recorder, || {
        metrics::add_bytes(Direction::Outbound, 12);
        metrics::inc_protocol_errors(ProtocolKind::Mqtt);
        metrics::inc_connections();
    });
    assert_eq!(
        counter_value(&snapshotter, BYTES_TOTAL, &[("direction", "outbound")]),
        Some(12)
    );
    assert_eq!(
        counter_value(&snapshotter, PROTOCOL_ERRORS_TOTAL, &[("protocol", "mqtt")]),
        Some(1)
    );
    assert_eq!(gauge_value(&snapshotter, CONNECTIONS_ACTIVE), Some(1.0));
}

#[rstest]
fn reactor_tracks_connections_and_traffic(recorder: (Snapshotter, DebuggingRecorder)) {
    let (snapshotter, recorder) = recorder;
    ::metrics::with_local_recorder(&recorder, || {
        let (net, handle) = MockNetwork::new();
        let mut mgr = Manager::new(EngineConfig::default(), net);
        let echo = mgr.add_handler_fn(|ctx, event| {
            if let Event::Recv(_) = event {
                let recv = ctx.conn_mut().recv_buffer_mut();
                let n = recv.len();
                let data = recv.split_to(n);
                ctx.conn_mut().send(&data);
            }
        });
        let listener = mgr.bind("tcp://127.0.0.1:7000", echo).expect("bind");
        let peer = handle.connect_peer(&mut mgr, listener);
        handle.receive(peer, b"metrics");
        mgr.poll(Duration::ZERO);
        assert_eq!(gauge_value(&snapshotter, CONNECTIONS_ACTIVE), Some(2.0));

        mgr.shutdown();
        assert_eq!(gauge_value(&snapshotter, CONNECTIONS_ACTIVE), Some(0.0));
    });
    for direction in ["inbound", "outbound"] {
        assert_eq!(
            counter_value(&snapshotter, BYTES_TOTAL, &[("direction", direction)]),
            Some(7)
        );
    }
}

#[rstest]
fn malformed_input_counts_as_protocol_error(recorder: (Snapshotter, DebuggingRecorder)) {
    let (snapshotter, recorder) = recorder;
    ::metrics::with_local_recorder(&recorder, || {
        let (net, handle) = MockNetwork::new();
        let mut mgr = Manager::new(EngineConfig::default(), net);
        let handler = mgr.add_handler_fn(|_, _| {});
        let listener = mgr.bind("udp://0.0.0.0:5683", handler).expect("bind");
        mgr.connection_mut(listener)
            .expect("listener")
            .set_protocol_coap()
            .expect("udp");
        let peer = "192.0.2.4:1000".parse().expect("addr");
        handle.datagram(listener, peer, &[0x49, 0x01, 0x00, 0x01]);
        mgr.poll(Duration::ZERO);
    });
    assert_eq!(
        counter_value(&snapshotter, PROTOCOL_ERRORS_TOTAL, &[("protocol", "coap")]),
        Some(1)
    );
}
