#![doc(html_root_url = "https://docs.rs/netmux/latest")]
//! Public API for the `netmux` library.
//!
//! `netmux` is a single-threaded, event-driven network engine. A
//! [`Manager`] owns every connection and runs the poll loop; handlers react
//! to [`Event`]s. Connections may carry a protocol layer (HTTP with
//! WebSocket upgrade, MQTT, DNS or CoAP) that parses inbound bytes before
//! the handler sees them.

pub mod acl;
pub mod buffer;
pub mod byte_order;
pub mod coap;
pub mod config;
pub mod connection;
pub mod dns;
pub mod error;
pub mod event;
pub mod handler;
pub mod http;
pub mod manager;
pub mod metrics;
pub mod mqtt;
pub mod net;
pub mod panic;
mod protocol;
pub mod uri;

pub use buffer::Buffer;
pub use config::{DnsConfig, EngineConfig};
pub use connection::{ConnFlags, ConnId, Connection, HandlerId};
pub use error::{BroadcastError, NetmuxError};
pub use event::Event;
pub use handler::EventHandler;
pub use manager::{Broadcaster, ConnectOptions, Context, Manager};
pub use metrics::{BYTES_TOTAL, CONNECTIONS_ACTIVE, Direction, PROTOCOL_ERRORS_TOTAL};
pub use net::{BindOptions, MioNetwork, NetEvent, NetworkInterface, Wake};
