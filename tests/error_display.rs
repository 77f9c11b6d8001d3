//! Tests for Display implementations on error types.

use netmux::{
    BroadcastError,
    NetmuxError,
    acl::AclError,
    coap::CoapError,
    dns::{DnsError, RecordType, ResolveError},
    mqtt::MqttError,
};

#[test]
fn broadcast_error_messages() {
    assert_eq!(
        BroadcastError::TooLarge { size: 9000, max: 8192 }.to_string(),
        "broadcast message of 9000 bytes exceeds limit of 8192"
    );
    assert_eq!(BroadcastError::Closed.to_string(), "manager is gone");
    assert_eq!(BroadcastError::Disabled.to_string(), "broadcast channel is disabled");
}

#[test]
fn netmux_error_messages() {
    let bind = NetmuxError::Bind {
        addr: "tcp://0.0.0.0:80".to_owned(),
        source: std::io::Error::other("permission denied"),
    };
    assert_eq!(bind.to_string(), "bind to tcp://0.0.0.0:80 failed: permission denied");
    assert_eq!(
        NetmuxError::TlsDisabled.to_string(),
        "TLS is disabled in the engine configuration"
    );
    let io = NetmuxError::from(std::io::Error::other("socket closed"));
    assert_eq!(io.to_string(), "transport error: socket closed");
}

#[test]
fn protocol_error_messages() {
    assert_eq!(DnsError::LabelTooLong(64).to_string(), "label of 64 bytes exceeds 63");
    assert_eq!(DnsError::BadLabel(0x40).to_string(), "unsupported label type 0x40");
    assert_eq!(
        DnsError::BadRecordData(RecordType::AAAA).to_string(),
        "malformed AAAA record data"
    );
    assert_eq!(ResolveError::ExceededRetryCount.to_string(), "no response after all retries");
    assert_eq!(CoapError::Ignore.to_string(), "datagram is not CoAP version 1");
    assert_eq!(
        MqttError::TooLarge { size: 300, max: 256 }.to_string(),
        "packet of 300 bytes exceeds limit of 256"
    );
}

#[test]
fn acl_error_messages() {
    assert_eq!(
        AclError::BadFlag("10.0.0.0/8".to_owned()).to_string(),
        "ACL entry \"10.0.0.0/8\" must start with '+' or '-'"
    );
    assert_eq!(
        AclError::BadNetwork("+1.2.3".to_owned()).to_string(),
        "invalid network in ACL entry \"+1.2.3\""
    );
}
