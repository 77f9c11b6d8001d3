//! Event handler trait.

use std::any::Any;

use crate::{event::Event, manager::Context};

/// Receives events for the connections it is attached to.
///
/// Any `FnMut(&mut Context<'_>, Event<'_>)` closure is a handler. Types that
/// keep state across connections, such as the MQTT
/// [`Broker`](crate::mqtt::Broker), implement the trait directly and can be
/// inspected later with [`Manager::handler_ref`](crate::Manager::handler_ref).
///
/// Handlers must not block: the whole engine runs on the thread calling
/// [`Manager::poll`](crate::Manager::poll).
pub trait EventHandler: Any {
    /// Handle one event for the connection identified by `ctx.id()`.
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event<'_>);
}

impl<F> EventHandler for F
where
    F: FnMut(&mut Context<'_>, Event<'_>) + 'static,
{
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event<'_>) { self(ctx, event); }
}
