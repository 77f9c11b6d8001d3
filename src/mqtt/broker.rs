//! In-memory MQTT broker.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use super::{
    packet::{ConnAckCode, Connect, PROTOCOL_LEVEL, PROTOCOL_LEVEL_31, Packet, Publish, Qos, Subscribe},
    topic::{topic_matches, validate_filter, validate_topic},
};
use crate::{
    connection::{ConnId, HandlerId},
    error::NetmuxError,
    event::Event,
    handler::EventHandler,
    manager::{Context, Manager},
    metrics,
};

/// Broker-side state of one client connection.
#[derive(Debug, Default)]
pub struct Session {
    connected: bool,
    client_id: String,
    subscriptions: Vec<(String, Qos)>,
    next_packet_id: u16,
    awaiting_rel: HashSet<u16>,
}

impl Session {
    /// Whether CONNECT has been accepted.
    #[must_use]
    pub fn is_connected(&self) -> bool { self.connected }

    /// Client identifier from CONNECT.
    #[must_use]
    pub fn client_id(&self) -> &str { &self.client_id }

    /// Topic filters with their granted QoS, in subscription order.
    #[must_use]
    pub fn subscriptions(&self) -> &[(String, Qos)] { &self.subscriptions }

    fn next_packet_id(&mut self) -> u16 {
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        self.next_packet_id
    }

    fn granted_qos(&self, topic: &str) -> Option<Qos> {
        self.subscriptions
            .iter()
            .find(|(filter, _)| topic_matches(filter, topic))
            .map(|&(_, qos)| qos)
    }
}

/// Handler implementing a non-persistent MQTT broker.
///
/// Every connection accepted on the broker's listener gets a [`Session`],
/// dropped again when the connection closes. Published messages are
/// forwarded to every session with a matching filter, once per session, at
/// the lower of the publisher's and the granted QoS. Retained messages and
/// last-will delivery are not implemented.
///
/// # Examples
///
/// ```no_run
/// use netmux::{EngineConfig, Manager, mqtt::Broker};
///
/// let mut mgr = Manager::with_mio(EngineConfig::default()).expect("poller");
/// let (_listener, broker) = Broker::bind(&mut mgr, "tcp://0.0.0.0:1883").expect("bind");
/// mgr.poll(std::time::Duration::from_millis(100));
/// let sessions = mgr.handler_ref::<Broker>(broker).map_or(0, |b| b.sessions().count());
/// println!("{sessions} sessions");
/// ```
#[derive(Debug, Default)]
pub struct Broker {
    sessions: BTreeMap<ConnId, Session>,
}

impl Broker {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Register a broker and listen on `addr` with the MQTT layer attached.
    ///
    /// # Errors
    ///
    /// Returns a [`NetmuxError`] if the listener cannot be created.
    pub fn bind(mgr: &mut Manager, addr: &str) -> Result<(ConnId, HandlerId), NetmuxError> {
        let handler = mgr.add_handler(Broker::new());
        let listener = mgr.bind(addr, handler)?;
        if let Some(conn) = mgr.connection_mut(listener) {
            conn.set_protocol_mqtt();
        }
        Ok((listener, handler))
    }

    /// Live sessions keyed by connection.
    pub fn sessions(&self) -> impl Iterator<Item = (ConnId, &Session)> {
        self.sessions.iter().map(|(&id, s)| (id, s))
    }

    /// Session of connection `id`.
    #[must_use]
    pub fn session(&self, id: ConnId) -> Option<&Session> { self.sessions.get(&id) }

    fn on_packet(&mut self, ctx: &mut Context<'_>, packet: &Packet) {
        let id = ctx.id();
        let session = self.sessions.entry(id).or_default();
        if let Packet::Connect(connect) = packet {
            Self::on_connect(ctx, session, connect);
            return;
        }
        if !session.connected {
            warn!(conn = %id, command = packet.command(), "packet before CONNECT");
            ctx.close();
            return;
        }
        match packet {
            Packet::Subscribe(sub) => Self::on_subscribe(ctx, session, sub),
            Packet::Unsubscribe(unsub) => {
                session
                    .subscriptions
                    .retain(|(filter, _)| !unsub.topics.contains(filter));
                ctx.conn_mut().mqtt_unsuback(unsub.packet_id);
            }
            Packet::Publish(publish) => self.on_publish(ctx, publish),
            Packet::PubRel(pid) => {
                session.awaiting_rel.remove(pid);
                ctx.conn_mut().mqtt_pubcomp(*pid);
            }
            Packet::PubRec(pid) => ctx.conn_mut().mqtt_pubrel(*pid),
            Packet::PingReq => ctx.conn_mut().mqtt_pong(),
            Packet::Disconnect => ctx.close(),
            _ => {}
        }
    }

    fn on_connect(ctx: &mut Context<'_>, session: &mut Session, connect: &Connect) {
        if session.connected {
            warn!(conn = %ctx.id(), "second CONNECT");
            ctx.close();
            return;
        }
        if !matches!(connect.protocol_level, PROTOCOL_LEVEL | PROTOCOL_LEVEL_31) {
            let conn = ctx.conn_mut();
            conn.mqtt_connack(ConnAckCode::UnacceptableProtocolVersion);
            conn.close_after_send();
            return;
        }
        session.connected = true;
        session.client_id.clone_from(&connect.client_id);
        debug!(conn = %ctx.id(), client_id = %connect.client_id, "session connected");
        ctx.conn_mut().mqtt_connack(ConnAckCode::Accepted);
    }

    fn on_subscribe(ctx: &mut Context<'_>, session: &mut Session, sub: &Subscribe) {
        if let Some((bad, _)) = sub.topics.iter().find(|(f, _)| validate_filter(f).is_err()) {
            warn!(conn = %ctx.id(), filter = %bad, "invalid topic filter");
            ctx.close();
            return;
        }
        let max = Qos::from_u8(ctx.config().mqtt_max_qos).unwrap_or(Qos::ExactlyOnce);
        let mut granted = Vec::with_capacity(sub.topics.len());
        for (filter, requested) in &sub.topics {
            let qos = (*requested).min(max);
            match session.subscriptions.iter_mut().find(|(f, _)| f == filter) {
                Some(existing) => existing.1 = qos,
                None => session.subscriptions.push((filter.clone(), qos)),
            }
            granted.push(qos.as_u8());
        }
        ctx.conn_mut().mqtt_suback(&granted, sub.packet_id);
    }

    fn on_publish(&mut self, ctx: &mut Context<'_>, publish: &Publish) {
        let id = ctx.id();
        if let Err(e) = validate_topic(&publish.topic) {
            warn!(conn = %id, error = %e, "invalid publish topic");
            ctx.close();
            return;
        }
        match (publish.qos, publish.packet_id) {
            (Qos::AtMostOnce, _) => self.forward(ctx, publish),
            (Qos::AtLeastOnce, Some(pid)) => {
                self.forward(ctx, publish);
                ctx.conn_mut().mqtt_puback(pid);
            }
            (Qos::ExactlyOnce, Some(pid)) => {
                let first = self
                    .sessions
                    .get_mut(&id)
                    .is_some_and(|s| s.awaiting_rel.insert(pid));
                if first {
                    self.forward(ctx, publish);
                }
                ctx.conn_mut().mqtt_pubrec(pid);
            }
            (_, None) => ctx.close(),
        }
    }

    /// Send `publish` to every session with a matching filter.
    fn forward(&mut self, ctx: &mut Context<'_>, publish: &Publish) {
        for (&target, session) in &mut self.sessions {
            if !session.connected {
                continue;
            }
            let Some(granted) = session.granted_qos(&publish.topic) else {
                continue;
            };
            let Some(conn) = ctx.connection_mut(target) else {
                continue;
            };
            if conn.flags().is_closing() {
                continue;
            }
            let qos = publish.qos.min(granted);
            let out = Packet::Publish(Publish {
                dup: false,
                qos,
                retain: false,
                topic: publish.topic.clone(),
                packet_id: (qos != Qos::AtMostOnce).then(|| session.next_packet_id()),
                payload: publish.payload.clone(),
            });
            match conn.send_mqtt(&out) {
                Ok(()) => metrics::inc_broker_forwarded(),
                Err(e) => warn!(conn = %target, error = %e, "forward failed"),
            }
        }
    }
}

impl EventHandler for Broker {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event<'_>) {
        match event {
            Event::Accept(_) => {
                self.sessions.insert(ctx.id(), Session::default());
            }
            Event::Mqtt(packet) => self.on_packet(ctx, packet),
            Event::Close => {
                if self.sessions.remove(&ctx.id()).is_some() {
                    debug!(conn = %ctx.id(), "session removed");
                }
            }
            _ => {}
        }
    }
}
