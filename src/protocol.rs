//! Protocol state attached to a connection.

use crate::{
    coap,
    dns::{self, DnsState},
    event::Event,
    http::{self, HttpState},
    manager::Context,
    mqtt,
};

/// Protocol layer owning a connection's parser state.
///
/// The state is created when a protocol is attached and dropped together
/// with the connection.
#[derive(Debug, Default)]
pub(crate) enum Protocol {
    #[default]
    None,
    Http(Box<HttpState>),
    Mqtt,
    Dns(Box<DnsState>),
    Coap,
}

impl Protocol {
    /// Fresh state of the same kind for a peer accepted by a listener.
    pub(crate) fn for_accepted(&self) -> Protocol {
        match self {
            Protocol::None => Protocol::None,
            Protocol::Http(_) => Protocol::Http(Box::default()),
            Protocol::Mqtt => Protocol::Mqtt,
            Protocol::Dns(state) => Protocol::Dns(Box::new(DnsState::server(state.is_tcp()))),
            Protocol::Coap => Protocol::Coap,
        }
    }

    /// Run the protocol layer for `event`; it forwards to the user handler.
    pub(crate) fn on_event(&mut self, ctx: &mut Context<'_>, event: Event<'_>) {
        match self {
            Protocol::None => ctx.deliver(event),
            Protocol::Http(state) => http::on_event(ctx, state, event),
            Protocol::Mqtt => mqtt::on_event(ctx, event),
            Protocol::Dns(state) => dns::on_event(ctx, state, event),
            Protocol::Coap => coap::on_event(ctx, event),
        }
    }
}
