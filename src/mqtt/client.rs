//! Helpers queueing MQTT packets on a connection.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::warn;
use tokio_util::codec::Encoder;

use super::{
    MqttCodec,
    MqttError,
    packet::{ConnAck, ConnAckCode, Connect, Packet, Publish, Qos, SubAck, Subscribe, Unsubscribe, Will},
};
use crate::connection::Connection;

/// Options for [`Connection::send_mqtt_handshake`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeOptions {
    pub client_id: String,
    pub clean_session: bool,
    /// Seconds of idleness before a PINGREQ is sent; zero disables it.
    pub keep_alive: u16,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            clean_session: true,
            keep_alive: 60,
            will: None,
            username: None,
            password: None,
        }
    }
}

impl Connection {
    /// Encode `packet` into the send buffer.
    ///
    /// # Errors
    ///
    /// Returns an [`MqttError`] if a field does not fit the wire format;
    /// nothing is queued in that case.
    pub fn send_mqtt(&mut self, packet: &Packet) -> Result<(), MqttError> {
        let mut out = BytesMut::new();
        MqttCodec::default().encode(packet, &mut out)?;
        self.send(&out);
        Ok(())
    }

    /// Queue a packet that always fits the wire format.
    fn send_mqtt_control(&mut self, packet: &Packet) {
        if let Err(e) = self.send_mqtt(packet) {
            warn!("failed to encode MQTT packet: conn={}, error={e}", self.id);
        }
    }

    /// Send CONNECT and arm the keep-alive ping.
    ///
    /// # Errors
    ///
    /// Returns an [`MqttError`] if a field exceeds 65535 bytes.
    pub fn send_mqtt_handshake(&mut self, opts: &HandshakeOptions) -> Result<(), MqttError> {
        self.send_mqtt(&Packet::Connect(Connect {
            client_id: opts.client_id.clone(),
            clean_session: opts.clean_session,
            keep_alive: opts.keep_alive,
            will: opts.will.clone(),
            username: opts.username.clone(),
            password: opts.password.clone(),
            ..Connect::default()
        }))?;
        self.mqtt_keep_alive =
            (opts.keep_alive > 0).then(|| Duration::from_secs(u64::from(opts.keep_alive)));
        Ok(())
    }

    /// Publish `payload` to `topic`. `packet_id` is ignored at QoS 0.
    ///
    /// # Errors
    ///
    /// Returns an [`MqttError`] if the topic is longer than 65535 bytes or
    /// the packet exceeds the protocol maximum.
    pub fn mqtt_publish(
        &mut self,
        topic: &str,
        packet_id: u16,
        qos: Qos,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), MqttError> {
        self.send_mqtt(&Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic: topic.to_owned(),
            packet_id: (qos != Qos::AtMostOnce).then_some(packet_id),
            payload: Bytes::copy_from_slice(payload),
        }))
    }

    /// Subscribe to `topics`, each with a requested QoS.
    ///
    /// # Errors
    ///
    /// Returns an [`MqttError`] if a filter is longer than 65535 bytes.
    pub fn mqtt_subscribe(&mut self, topics: &[(&str, Qos)], packet_id: u16) -> Result<(), MqttError> {
        self.send_mqtt(&Packet::Subscribe(Subscribe {
            packet_id,
            topics: topics.iter().map(|&(t, q)| (t.to_owned(), q)).collect(),
        }))
    }

    /// Unsubscribe from `topics`.
    ///
    /// # Errors
    ///
    /// Returns an [`MqttError`] if a filter is longer than 65535 bytes.
    pub fn mqtt_unsubscribe(&mut self, topics: &[&str], packet_id: u16) -> Result<(), MqttError> {
        self.send_mqtt(&Packet::Unsubscribe(Unsubscribe {
            packet_id,
            topics: topics.iter().map(|&t| t.to_owned()).collect(),
        }))
    }

    pub fn mqtt_connack(&mut self, code: ConnAckCode) {
        self.send_mqtt_control(&Packet::ConnAck(ConnAck {
            session_present: false,
            code,
        }));
    }

    pub fn mqtt_puback(&mut self, packet_id: u16) { self.send_mqtt_control(&Packet::PubAck(packet_id)); }

    pub fn mqtt_pubrec(&mut self, packet_id: u16) { self.send_mqtt_control(&Packet::PubRec(packet_id)); }

    pub fn mqtt_pubrel(&mut self, packet_id: u16) { self.send_mqtt_control(&Packet::PubRel(packet_id)); }

    pub fn mqtt_pubcomp(&mut self, packet_id: u16) {
        self.send_mqtt_control(&Packet::PubComp(packet_id));
    }

    /// Acknowledge a SUBSCRIBE with one return code per filter.
    pub fn mqtt_suback(&mut self, return_codes: &[u8], packet_id: u16) {
        self.send_mqtt_control(&Packet::SubAck(SubAck {
            packet_id,
            return_codes: return_codes.to_vec(),
        }));
    }

    pub fn mqtt_unsuback(&mut self, packet_id: u16) {
        self.send_mqtt_control(&Packet::UnsubAck(packet_id));
    }

    pub fn mqtt_ping(&mut self) { self.send_mqtt_control(&Packet::PingReq); }

    pub fn mqtt_pong(&mut self) { self.send_mqtt_control(&Packet::PingResp); }

    pub fn mqtt_disconnect(&mut self) { self.send_mqtt_control(&Packet::Disconnect); }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use bytes::BytesMut;
    use slotmap::SlotMap;
    use tokio_util::codec::Decoder;

    use super::HandshakeOptions;
    use crate::{
        connection::{ConnId, Connection},
        mqtt::{MqttCodec, Packet, Qos},
    };

    fn conn() -> Connection {
        let mut ids: SlotMap<ConnId, ()> = SlotMap::with_key();
        Connection::new(ids.insert(()), None, 1.5, 4096, Instant::now())
    }

    fn sent_packets(conn: &Connection) -> Vec<Packet> {
        let mut buf = BytesMut::from(conn.send_buffer().as_slice());
        let mut codec = MqttCodec::default();
        let mut out = Vec::new();
        while let Some(p) = codec.decode(&mut buf).expect("valid packets") {
            out.push(p);
        }
        out
    }

    #[test]
    fn handshake_arms_keep_alive() {
        let mut c = conn();
        c.send_mqtt_handshake(&HandshakeOptions {
            client_id: "sensor-7".into(),
            keep_alive: 15,
            ..HandshakeOptions::default()
        })
        .expect("encodable");
        assert_eq!(c.mqtt_keep_alive, Some(Duration::from_secs(15)));
        let packets = sent_packets(&c);
        assert!(matches!(&packets[..], [Packet::Connect(p)] if p.client_id == "sensor-7"));
    }

    #[test]
    fn qos0_publish_drops_packet_id() {
        let mut c = conn();
        c.mqtt_publish("t", 42, Qos::AtMostOnce, false, b"x").expect("encodable");
        c.mqtt_publish("t", 43, Qos::AtLeastOnce, true, b"y").expect("encodable");
        let ids: Vec<_> = sent_packets(&c).iter().map(Packet::packet_id).collect();
        assert_eq!(ids, vec![None, Some(43)]);
    }

    #[test]
    fn control_helpers_queue_expected_commands() {
        let mut c = conn();
        c.mqtt_ping();
        c.mqtt_pubrel(3);
        c.mqtt_suback(&[1, 0x80], 4);
        c.mqtt_disconnect();
        let commands: Vec<u8> = sent_packets(&c).iter().map(Packet::command).collect();
        assert_eq!(commands, vec![12, 6, 9, 14]);
    }
}
