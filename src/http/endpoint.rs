//! Per-URI handlers on HTTP listeners.
//!
//! A request whose URI starts with a registered prefix is delivered to that
//! endpoint's handler instead of the connection's own. The longest matching
//! prefix wins; prefixes are compared byte for byte, so `/api` also covers
//! `/apis`.

use std::time::SystemTime;

use super::{DigestAuth, HttpMessage, HttpState, check_digest_auth};
use crate::{
    connection::{ConnId, HandlerId},
    error::NetmuxError,
    manager::{Context, Manager, core::Core},
    protocol::Protocol,
};

/// Options for [`Manager::register_http_endpoint_opt`].
#[derive(Clone, Debug, Default)]
pub struct EndpointOptions {
    /// Digest credentials required before requests reach the handler.
    pub auth: Option<DigestAuth>,
}

#[derive(Clone, Debug)]
pub(crate) struct Endpoint {
    prefix: String,
    pub(crate) handler: HandlerId,
    auth: Option<DigestAuth>,
}

impl Endpoint {
    /// Whether `msg` may reach the handler.
    pub(crate) fn admits(&self, msg: &HttpMessage<'_>, now: SystemTime) -> bool {
        self.auth
            .as_ref()
            .is_none_or(|a| check_digest_auth(msg, &a.realm, &a.passwords, now))
    }

    pub(crate) fn realm(&self) -> &str { self.auth.as_ref().map_or("", |a| a.realm.as_str()) }
}

fn longest_match<'e>(endpoints: &'e [Endpoint], uri: &str) -> Option<&'e Endpoint> {
    endpoints
        .iter()
        .filter(|e| uri.starts_with(e.prefix.as_str()))
        .max_by_key(|e| e.prefix.len())
}

/// Endpoint for `uri` on the current connection.
///
/// Accepted peers use the table of their listener, so endpoints registered
/// after a peer connected still apply to its next request.
pub(crate) fn find(ctx: &Context<'_>, state: &HttpState, uri: &str) -> Option<Endpoint> {
    let table = match ctx.conn().listener() {
        Some(listener) => match ctx.connection(listener).map(|c| &c.protocol) {
            Some(Protocol::Http(owner)) => &owner.endpoints,
            _ => return None,
        },
        None => &state.endpoints,
    };
    longest_match(table, uri).cloned()
}

impl Core {
    fn register_http_endpoint(
        &mut self,
        listener: ConnId,
        prefix: &str,
        handler: HandlerId,
        opts: EndpointOptions,
    ) -> Result<(), NetmuxError> {
        if !self.handlers.contains_key(handler) {
            return Err(NetmuxError::UnknownHandler(handler));
        }
        let conn = self
            .conns
            .get_mut(listener)
            .ok_or(NetmuxError::UnknownConnection(listener))?;
        if !matches!(conn.protocol, Protocol::Http(_)) {
            conn.set_protocol_http_websocket();
        }
        if let Protocol::Http(state) = &mut conn.protocol {
            state.endpoints.retain(|e| e.prefix != prefix);
            state.endpoints.push(Endpoint {
                prefix: prefix.to_owned(),
                handler,
                auth: opts.auth,
            });
        }
        Ok(())
    }
}

impl Manager {
    /// Deliver HTTP requests on `listener` whose URI starts with `prefix`
    /// to `handler`.
    ///
    /// Attaches the HTTP layer to `listener` if needed. Registering the same
    /// prefix again replaces the earlier endpoint. When a routed request
    /// upgrades to WebSocket, `handler` becomes the connection's handler.
    ///
    /// # Errors
    ///
    /// Returns [`NetmuxError::UnknownConnection`] or
    /// [`NetmuxError::UnknownHandler`] for stale ids.
    pub fn register_http_endpoint(
        &mut self,
        listener: ConnId,
        prefix: &str,
        handler: HandlerId,
    ) -> Result<(), NetmuxError> {
        self.core
            .register_http_endpoint(listener, prefix, handler, EndpointOptions::default())
    }

    /// Register an endpoint with explicit options.
    ///
    /// With [`EndpointOptions::auth`] set, requests lacking valid Digest
    /// credentials are answered with `401` and the connection is closed
    /// once the challenge is written; `handler` never sees them.
    ///
    /// # Errors
    ///
    /// As for [`Manager::register_http_endpoint`].
    pub fn register_http_endpoint_opt(
        &mut self,
        listener: ConnId,
        prefix: &str,
        handler: HandlerId,
        opts: EndpointOptions,
    ) -> Result<(), NetmuxError> {
        self.core.register_http_endpoint(listener, prefix, handler, opts)
    }
}

#[cfg(test)]
mod tests {
    use slotmap::SlotMap;

    use super::{Endpoint, longest_match};
    use crate::connection::HandlerId;

    #[test]
    fn longest_prefix_wins() {
        let mut ids: SlotMap<HandlerId, ()> = SlotMap::with_key();
        let (root, api, v2) = (ids.insert(()), ids.insert(()), ids.insert(()));
        let table: Vec<Endpoint> = [("/", root), ("/api/v2", v2), ("/api", api)]
            .into_iter()
            .map(|(prefix, handler)| Endpoint {
                prefix: prefix.to_owned(),
                handler,
                auth: None,
            })
            .collect();
        let pick = |uri| longest_match(&table, uri).map(|e| e.handler);
        assert_eq!(pick("/api/v2/items"), Some(v2));
        assert_eq!(pick("/api/v1"), Some(api));
        assert_eq!(pick("/index.html"), Some(root));
        assert_eq!(pick("relative"), None);
    }
}
