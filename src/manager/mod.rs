//! The reactor.
//!
//! [`Manager`] owns every connection and handler, runs the poll loop and
//! dispatches events. It is single-threaded: all handlers run on the thread
//! calling [`Manager::poll`]. The one operation other threads may perform is
//! sending through a [`Broadcaster`].

mod broadcast;
mod context;
pub(crate) mod core;

use std::{
    any::Any,
    fmt,
    time::{Duration, Instant},
};

pub use broadcast::Broadcaster;
pub use context::Context;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::warn;

use self::core::Core;
use crate::{
    config::EngineConfig,
    connection::{ConnFlags, ConnId, Connection, HandlerId},
    error::{BroadcastError, NetmuxError},
    event::Event,
    handler::EventHandler,
    net::{BindOptions, MioNetwork, NetworkInterface},
};

/// Completion rounds drained per pass after the blocking wait.
const COMPLETION_ROUNDS: usize = 4;

/// Options for [`Manager::connect_opt`].
#[derive(Default)]
pub struct ConnectOptions {
    /// Flags set on the new connection before anything else happens.
    pub flags: ConnFlags,
    /// Application data attached to the new connection.
    pub user_data: Option<Box<dyn Any>>,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("flags", &self.flags)
            .field("user_data", &self.user_data.is_some())
            .finish()
    }
}

/// Owner of all connections and the poll loop.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
///
/// use netmux::{EngineConfig, Event, Manager};
///
/// let mut mgr = Manager::with_mio(EngineConfig::default()).expect("poller");
/// let echo = mgr.add_handler_fn(|ctx, event| {
///     if let Event::Recv(_) = event {
///         let conn = ctx.conn_mut();
///         let data = conn.recv_buffer().as_slice().to_vec();
///         conn.recv_buffer_mut().clear();
///         conn.send(&data);
///     }
/// });
/// mgr.bind("tcp://127.0.0.1:7000", echo).expect("bind");
/// loop {
///     mgr.poll(Duration::from_millis(100));
/// }
/// ```
pub struct Manager {
    pub(crate) core: Core,
    broadcast_rx: Option<UnboundedReceiver<Vec<u8>>>,
    broadcaster: Option<Broadcaster>,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("connections", &self.core.conns.len())
            .field("handlers", &self.core.handlers.len())
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Create a manager driving `net`.
    #[must_use]
    pub fn new(config: EngineConfig, net: impl NetworkInterface + 'static) -> Self {
        let config = config.normalized();
        let mut net: Box<dyn NetworkInterface> = Box::new(net);
        net.configure(&config);
        let (broadcast_rx, broadcaster) = if config.multithreading {
            let (tx, rx) = mpsc::unbounded_channel();
            let b = Broadcaster::new(tx, net.waker(), config.max_broadcast_message);
            (Some(rx), Some(b))
        } else {
            (None, None)
        };
        Self {
            core: Core::new(config, net),
            broadcast_rx,
            broadcaster,
        }
    }

    /// Create a manager on top of real sockets.
    ///
    /// # Errors
    ///
    /// Returns [`NetmuxError::Io`] if the OS poller cannot be created.
    pub fn with_mio(config: EngineConfig) -> Result<Self, NetmuxError> {
        Ok(Self::new(config, MioNetwork::new()?))
    }

    /// Engine configuration in effect.
    #[must_use]
    pub fn config(&self) -> &EngineConfig { &self.core.config }

    /// Time at the start of the most recent poll pass.
    #[must_use]
    pub fn now(&self) -> Instant { self.core.now }

    /// Register a handler and return its id.
    pub fn add_handler<H: EventHandler>(&mut self, handler: H) -> HandlerId {
        self.core.add_handler(Box::new(handler))
    }

    /// Register a closure as a handler.
    pub fn add_handler_fn<F>(&mut self, f: F) -> HandlerId
    where
        F: FnMut(&mut Context<'_>, Event<'_>) + 'static,
    {
        self.core.add_handler(Box::new(f))
    }

    /// Borrow a registered handler as its concrete type.
    ///
    /// Returns `None` for unknown ids and mismatched types.
    #[must_use]
    pub fn handler_ref<H: EventHandler>(&self, id: HandlerId) -> Option<&H> {
        let handler: &dyn Any = self.core.handlers.get(id)?.as_deref()?;
        handler.downcast_ref::<H>()
    }

    /// Mutably borrow a registered handler as its concrete type.
    pub fn handler_mut<H: EventHandler>(&mut self, id: HandlerId) -> Option<&mut H> {
        let handler: &mut dyn Any = self.core.handlers.get_mut(id)?.as_deref_mut()?;
        handler.downcast_mut::<H>()
    }

    /// Listen on `addr` (`[tcp|udp://][host]:port`).
    ///
    /// Accepted peers inherit `handler` and the listener's protocol.
    ///
    /// # Errors
    ///
    /// Returns a [`NetmuxError`] for invalid addresses, unknown handlers or
    /// socket failures.
    pub fn bind(&mut self, addr: &str, handler: HandlerId) -> Result<ConnId, NetmuxError> {
        self.core.bind(addr, handler, &BindOptions::default())
    }

    /// Listen on `addr` with explicit options.
    ///
    /// # Errors
    ///
    /// As for [`Manager::bind`], plus [`NetmuxError::TlsDisabled`].
    pub fn bind_opt(
        &mut self,
        addr: &str,
        handler: HandlerId,
        opts: &BindOptions,
    ) -> Result<ConnId, NetmuxError> {
        self.core.bind(addr, handler, opts)
    }

    /// Connect to `addr`. The outcome arrives later as [`Event::Connect`].
    ///
    /// Host names are looked up in `/etc/hosts` and then through the DNS
    /// resolver; the connection carries [`ConnFlags::RESOLVING`] meanwhile.
    ///
    /// # Errors
    ///
    /// Returns a [`NetmuxError`] for invalid addresses or unknown handlers.
    pub fn connect(&mut self, addr: &str, handler: HandlerId) -> Result<ConnId, NetmuxError> {
        self.core.connect(addr, Some(handler), ConnectOptions::default())
    }

    /// Connect with explicit options.
    ///
    /// # Errors
    ///
    /// As for [`Manager::connect`].
    pub fn connect_opt(
        &mut self,
        addr: &str,
        handler: HandlerId,
        opts: ConnectOptions,
    ) -> Result<ConnId, NetmuxError> {
        self.core.connect(addr, Some(handler), opts)
    }

    /// Borrow a live connection.
    #[must_use]
    pub fn connection(&self, id: ConnId) -> Option<&Connection> { self.core.conns.get(id) }

    /// Mutably borrow a live connection.
    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.core.conns.get_mut(id)
    }

    /// Iterate over every live connection, listeners included.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> { self.core.conns.values() }

    /// Handle for injecting messages from other threads.
    ///
    /// # Errors
    ///
    /// Returns [`BroadcastError::Disabled`] when `multithreading` is off.
    pub fn broadcaster(&self) -> Result<Broadcaster, BroadcastError> {
        self.broadcaster.clone().ok_or(BroadcastError::Disabled)
    }

    /// Run one pass of the reactor and return the pass timestamp.
    ///
    /// Blocks for at most `timeout`, less if a timer falls due or work is
    /// already queued. Then delivers network completions, broadcasts, timer
    /// events and a [`Event::Poll`] tick, writes queued output and finally
    /// destroys every connection marked for closing.
    pub fn poll(&mut self, timeout: Duration) -> Instant {
        let wait = self.wait_budget(timeout);
        let mut events = Vec::new();
        if let Err(e) = self.core.net.poll(wait, &mut events) {
            warn!(error = %e, "network poll failed");
        }
        self.core.now = Instant::now();
        for event in events.drain(..) {
            self.core.process(event);
        }
        for _ in 0..COMPLETION_ROUNDS {
            if !self.core.net.has_pending() {
                break;
            }
            if let Err(e) = self.core.net.poll(Duration::ZERO, &mut events) {
                warn!(error = %e, "network poll failed");
            }
            for event in events.drain(..) {
                self.core.process(event);
            }
        }
        self.core.run_deferred();
        self.drain_broadcasts();
        self.core.fire_timers();
        self.core.tick();
        self.core.flush();
        self.core.reap();
        self.core.now
    }

    fn wait_budget(&self, timeout: Duration) -> Duration {
        if self.core.has_urgent_work() {
            return Duration::ZERO;
        }
        let now = Instant::now();
        match self.core.next_deadline() {
            Some(deadline) => timeout.min(deadline.saturating_duration_since(now)),
            None => timeout,
        }
    }

    fn drain_broadcasts(&mut self) {
        let Some(rx) = self.broadcast_rx.as_mut() else {
            return;
        };
        let mut messages = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            messages.push(msg);
        }
        for msg in messages {
            self.core.broadcast(&msg);
        }
    }

    /// Close every connection, delivering [`Event::Close`] to each.
    pub fn shutdown(&mut self) {
        let ids: Vec<ConnId> = self.core.conns.keys().collect();
        for id in ids {
            self.core.destroy(id);
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) { self.shutdown(); }
}
