//! Handler-facing view of the manager.

use std::{
    panic::{self, AssertUnwindSafe},
    time::Instant,
};

use tracing::error;

use super::{ConnectOptions, core::Core};
use crate::{
    config::EngineConfig,
    connection::{ConnId, Connection, HandlerId},
    error::NetmuxError,
    event::Event,
    handler::EventHandler,
    net::BindOptions,
    panic::format_panic,
};

/// Access to the engine from inside an event handler.
///
/// A `Context` is bound to the connection whose event is being dispatched,
/// but may also reach other connections and create new ones. Connections are
/// only destroyed at the end of a poll pass, so the current connection is
/// always present while a handler runs.
pub struct Context<'m> {
    core: &'m mut Core,
    id: ConnId,
    /// Handler overriding the connection's own for protocol events.
    route: Option<HandlerId>,
}

impl<'m> Context<'m> {
    pub(crate) fn new(core: &'m mut Core, id: ConnId) -> Self {
        Self {
            core,
            id,
            route: None,
        }
    }

    pub(crate) fn set_route(&mut self, route: Option<HandlerId>) { self.route = route; }

    pub(crate) fn core(&mut self) -> &mut Core { self.core }

    /// Connection this event belongs to.
    #[must_use]
    pub fn id(&self) -> ConnId { self.id }

    /// The connection this event belongs to.
    ///
    /// # Panics
    ///
    /// Never while dispatching: the connection is removed only after its
    /// `Close` event has been handled.
    #[must_use]
    pub fn conn(&self) -> &Connection { &self.core.conns[self.id] }

    /// Mutable access to the connection this event belongs to.
    ///
    /// # Panics
    ///
    /// Never while dispatching; see [`Context::conn`].
    pub fn conn_mut(&mut self) -> &mut Connection { &mut self.core.conns[self.id] }

    /// Another live connection.
    #[must_use]
    pub fn connection(&self, id: ConnId) -> Option<&Connection> { self.core.conns.get(id) }

    /// Mutable access to another live connection.
    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.core.conns.get_mut(id)
    }

    /// Snapshot of every live connection id.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnId> { self.core.conns.keys().collect() }

    /// Time at the start of the current poll pass.
    #[must_use]
    pub fn now(&self) -> Instant { self.core.now }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig { &self.core.config }

    /// Register a handler.
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

    /// Create a listener; see [`Manager::bind`](crate::Manager::bind).
    ///
    /// # Errors
    ///
    /// Returns a [`NetmuxError`] if the address is invalid or the socket
    /// cannot be opened.
    pub fn bind(&mut self, addr: &str, handler: HandlerId) -> Result<ConnId, NetmuxError> {
        self.core.bind(addr, handler, &BindOptions::default())
    }

    /// Create an outbound connection; see
    /// [`Manager::connect`](crate::Manager::connect).
    ///
    /// # Errors
    ///
    /// Returns a [`NetmuxError`] if the address is invalid.
    pub fn connect(&mut self, addr: &str, handler: HandlerId) -> Result<ConnId, NetmuxError> {
        self.core.connect(addr, Some(handler), ConnectOptions::default())
    }

    /// Create an outbound connection with explicit options.
    ///
    /// # Errors
    ///
    /// Returns a [`NetmuxError`] if the address is invalid.
    pub fn connect_opt(
        &mut self,
        addr: &str,
        handler: HandlerId,
        opts: ConnectOptions,
    ) -> Result<ConnId, NetmuxError> {
        self.core.connect(addr, Some(handler), opts)
    }

    /// Mark the current connection for closing at the end of the pass.
    pub fn close(&mut self) { self.conn_mut().close(); }

    /// Hand `event` to the routed handler, or else the user handler of the
    /// current connection.
    ///
    /// A panicking handler closes its own connection; other connections are
    /// unaffected.
    pub(crate) fn deliver(&mut self, event: Event<'_>) {
        let Some(hid) = self.route.or(self.conn().handler) else {
            return;
        };
        let Some(mut handler) = self.core.handlers.get_mut(hid).and_then(Option::take) else {
            tracing::debug!(conn = %self.id, handler = %hid, "handler busy or missing");
            return;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(self, event)));
        if let Some(slot) = self.core.handlers.get_mut(hid) {
            *slot = Some(handler);
        }
        if let Err(payload) = outcome {
            let panic_msg = format_panic(payload);
            log::error!("handler panicked: panic={panic_msg}, conn={}", self.id);
            error!(panic = %panic_msg, conn = %self.id, event = event.name(), "handler panicked");
            self.conn_mut().close();
        }
    }
}
