//! Utilities for driving a [`netmux::Manager`] without real sockets.
//!
//! [`MockNetwork`] implements [`netmux::NetworkInterface`] entirely in
//! memory. Tests keep the paired [`MockHandle`] to inject peer activity and
//! inspect what the engine wrote.
//!
//! ```rust
//! use std::time::Duration;
//!
//! use netmux::{EngineConfig, Manager};
//! use netmux_testing::MockNetwork;
//!
//! let (net, handle) = MockNetwork::new();
//! let mut mgr = Manager::new(EngineConfig::default(), net);
//! let echo = mgr.add_handler_fn(|ctx, _| {
//!     let data = ctx.conn_mut().recv_buffer_mut().as_bytes_mut().split().freeze();
//!     ctx.conn_mut().send(&data);
//! });
//! let listener = mgr.bind("tcp://127.0.0.1:0", echo).unwrap();
//! let peer = handle.connect_peer(&mut mgr, listener);
//! handle.receive(peer, b"ping");
//! mgr.poll(Duration::ZERO);
//! assert_eq!(handle.take_sent(peer), b"ping");
//! ```

mod logging;
mod mock;
mod recorder;

pub use logging::{LoggerHandle, logger};
pub use mock::{MockHandle, MockNetwork};
pub use recorder::{counter_value, gauge_value};
