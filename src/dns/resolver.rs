//! Asynchronous resolver running on its own manager connection.
//!
//! Each lookup opens a connection to the nameserver with the DNS layer in
//! resolver mode. The query is sent once the connection is up and re-sent
//! whenever the timer fires, until an answer arrives or the retry budget is
//! spent. The callback runs exactly once.

use std::{fmt, io, net::IpAddr, time::Duration};

use thiserror::Error;
use tracing::debug;

use super::{
    DnsState,
    hosts::system_nameserver,
    message::{DnsMessage, RecordType, encode_query},
};
use crate::{
    config::DnsConfig,
    connection::ConnId,
    manager::{ConnectOptions, Context, Manager, core::Core},
    protocol::Protocol,
    uri::{Transport, parse_address},
};

/// Completion callback of [`Manager::resolve`].
///
/// It runs on the resolver connection; use the context to reach other
/// connections.
pub type ResolveCallback = Box<dyn FnOnce(&mut Context<'_>, Result<&DnsMessage, ResolveError>)>;

/// Reasons a lookup fails.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// The nameserver answered without any records.
    #[error("response carried no answers")]
    NoAnswers,
    /// Every retry timed out.
    #[error("no response after all retries")]
    ExceededRetryCount,
    /// The resolver connection closed before an answer arrived.
    #[error("resolver connection closed before an answer arrived")]
    Timeout,
    /// `only_literal` was set and the name is not an IP address.
    #[error("name is not an IP address literal")]
    NotLiteral,
    /// The nameserver could not be reached.
    #[error("network error: {0:?}")]
    Network(io::ErrorKind),
    /// The name cannot be encoded in a query.
    #[error("name cannot be encoded as a DNS query")]
    InvalidName,
}

/// Per-lookup settings.
///
/// # Default Values
/// Taken from [`DnsConfig::default`]; both literal switches are off.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Nameserver address; `None` uses `/etc/resolv.conf`.
    pub nameserver: Option<String>,
    /// Retransmissions after the first query.
    pub max_retries: u32,
    /// Wait per attempt.
    pub timeout: Duration,
    /// Resolve IP address literals without a query.
    pub accept_literal: bool,
    /// Fail unless the name is an IP address literal.
    pub only_literal: bool,
}

impl ResolveOptions {
    /// Options carrying the manager's resolver defaults.
    #[must_use]
    pub fn from_config(cfg: &DnsConfig) -> Self {
        Self {
            nameserver: cfg.nameserver.clone(),
            max_retries: cfg.max_retries,
            timeout: cfg.timeout,
            accept_literal: false,
            only_literal: false,
        }
    }
}

impl Default for ResolveOptions {
    fn default() -> Self { Self::from_config(&DnsConfig::default()) }
}

/// How a lookup was started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolve {
    /// The name was an address literal; the callback is not invoked.
    Literal(IpAddr),
    /// A query is in flight on this connection.
    Pending(ConnId),
}

pub(crate) struct PendingQuery {
    name: String,
    qtype: RecordType,
    transaction_id: u16,
    packet: Vec<u8>,
    sent: u32,
    max_retries: u32,
    timeout: Duration,
    callback: Option<ResolveCallback>,
}

impl fmt::Debug for PendingQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingQuery")
            .field("name", &self.name)
            .field("qtype", &self.qtype)
            .field("transaction_id", &self.transaction_id)
            .field("sent", &self.sent)
            .field("done", &self.callback.is_none())
            .finish_non_exhaustive()
    }
}

impl Core {
    pub(crate) fn resolve(
        &mut self,
        name: &str,
        qtype: RecordType,
        opts: ResolveOptions,
        callback: ResolveCallback,
    ) -> Result<Resolve, ResolveError> {
        if opts.accept_literal || opts.only_literal {
            if let Ok(ip) = name.parse::<IpAddr>() {
                return Ok(Resolve::Literal(ip));
            }
            if opts.only_literal {
                return Err(ResolveError::NotLiteral);
            }
        }
        let transaction_id = rand::random::<u16>();
        let packet =
            encode_query(transaction_id, name, qtype).map_err(|_| ResolveError::InvalidName)?;
        let nameserver = match opts.nameserver {
            Some(ns) => ns,
            None => self
                .default_nameserver
                .get_or_insert_with(system_nameserver)
                .clone(),
        };
        let addr = parse_address(&nameserver)
            .map_err(|_| ResolveError::Network(io::ErrorKind::InvalidInput))?;
        // A nameserver given by name would need a lookup of its own.
        if addr.socket_addr().is_none() {
            return Err(ResolveError::Network(io::ErrorKind::InvalidInput));
        }
        let id = self
            .connect(&nameserver, None, ConnectOptions::default())
            .map_err(|_| ResolveError::Network(io::ErrorKind::InvalidInput))?;
        let query = PendingQuery {
            name: name.to_owned(),
            qtype,
            transaction_id,
            packet,
            sent: 0,
            max_retries: opts.max_retries,
            timeout: opts.timeout,
            callback: Some(callback),
        };
        let tcp = addr.transport == Transport::Tcp;
        self.conns[id].protocol = Protocol::Dns(Box::new(DnsState::resolver(tcp, query)));
        debug!(conn = %id, name, qtype = %qtype, %nameserver, "resolving");
        Ok(Resolve::Pending(id))
    }
}

impl Manager {
    /// Look `name` up and run `callback` with the outcome.
    ///
    /// # Errors
    ///
    /// Returns a [`ResolveError`] when the lookup cannot start; the callback
    /// is then dropped without running.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use netmux::{
    ///     EngineConfig,
    ///     Manager,
    ///     dns::{RecordType, ResolveOptions},
    /// };
    ///
    /// let mut mgr = Manager::with_mio(EngineConfig::default()).expect("poller");
    /// mgr.resolve("example.com", RecordType::A, ResolveOptions::default(), |_, result| {
    ///     match result {
    ///         Ok(msg) => println!("{:?}", msg.first_address()),
    ///         Err(e) => eprintln!("lookup failed: {e}"),
    ///     }
    /// })
    /// .expect("resolver started");
    /// ```
    pub fn resolve<F>(
        &mut self,
        name: &str,
        qtype: RecordType,
        opts: ResolveOptions,
        callback: F,
    ) -> Result<Resolve, ResolveError>
    where
        F: FnOnce(&mut Context<'_>, Result<&DnsMessage, ResolveError>) + 'static,
    {
        self.core.resolve(name, qtype, opts, Box::new(callback))
    }
}

impl Context<'_> {
    /// Start a lookup from inside a handler; see [`Manager::resolve`].
    ///
    /// # Errors
    ///
    /// As for [`Manager::resolve`].
    pub fn resolve<F>(
        &mut self,
        name: &str,
        qtype: RecordType,
        opts: ResolveOptions,
        callback: F,
    ) -> Result<Resolve, ResolveError>
    where
        F: FnOnce(&mut Context<'_>, Result<&DnsMessage, ResolveError>) + 'static,
    {
        self.core().resolve(name, qtype, opts, Box::new(callback))
    }
}

fn send_query(ctx: &mut Context<'_>, query: &mut PendingQuery) {
    query.sent += 1;
    let deadline = ctx.now() + query.timeout;
    let conn = ctx.conn_mut();
    conn.send_dns_packet(&query.packet);
    conn.set_timer(Some(deadline));
}

fn complete(ctx: &mut Context<'_>, query: &mut PendingQuery, result: Result<&DnsMessage, ResolveError>) {
    let Some(callback) = query.callback.take() else {
        return;
    };
    if let Err(e) = result {
        debug!(conn = %ctx.id(), name = %query.name, error = %e, "lookup failed");
    }
    ctx.conn_mut().set_timer(None);
    callback(ctx, result);
    ctx.close();
}

pub(super) fn on_connect(
    ctx: &mut Context<'_>,
    query: &mut PendingQuery,
    result: Result<(), io::ErrorKind>,
) {
    match result {
        Ok(()) => send_query(ctx, query),
        Err(kind) => complete(ctx, query, Err(ResolveError::Network(kind))),
    }
}

pub(super) fn on_timer(ctx: &mut Context<'_>, query: &mut PendingQuery) {
    if query.callback.is_none() {
        return;
    }
    if query.sent > query.max_retries {
        complete(ctx, query, Err(ResolveError::ExceededRetryCount));
    } else {
        debug!(conn = %ctx.id(), name = %query.name, attempt = query.sent + 1, "retrying query");
        send_query(ctx, query);
    }
}

pub(super) fn on_message(ctx: &mut Context<'_>, query: &mut PendingQuery, msg: &DnsMessage) {
    if msg.transaction_id != query.transaction_id || !msg.is_response() {
        debug!(conn = %ctx.id(), id = msg.transaction_id, "ignoring unrelated DNS message");
        return;
    }
    if msg.answers.is_empty() {
        complete(ctx, query, Err(ResolveError::NoAnswers));
    } else {
        complete(ctx, query, Ok(msg));
    }
}

pub(super) fn on_close(ctx: &mut Context<'_>, query: &mut PendingQuery) {
    complete(ctx, query, Err(ResolveError::Timeout));
}
