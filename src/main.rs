//! Demo binary for the `netmux` engine.
//!
//! Runs an MQTT broker, an HTTP/WebSocket echo server or a one-shot DNS
//! lookup, depending on the subcommand.

mod cli;

use std::{cell::RefCell, error::Error, fs, net::IpAddr, rc::Rc, time::Duration};

use clap::Parser;
use cli::{Cli, Command};
use netmux::{
    EngineConfig,
    Event,
    Manager,
    dns::{DnsMessage, RecordType, Resolve, ResolveError, ResolveOptions},
    http::{HttpEvent, WsEvent},
    mqtt::Broker,
};
use tracing::info;

type Lookup = Rc<RefCell<Option<Result<Option<IpAddr>, ResolveError>>>>;

fn load_config(cli: &Cli) -> Result<EngineConfig, Box<dyn Error>> {
    match &cli.config {
        Some(path) => Ok(EngineConfig::from_toml(&fs::read_to_string(path)?)?),
        None => Ok(EngineConfig::default()),
    }
}

fn install_exporter(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let Some(addr) = cli.metrics_listen else {
        return Ok(());
    };
    #[cfg(feature = "metrics")]
    {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        info!(%addr, "serving metrics");
    }
    #[cfg(not(feature = "metrics"))]
    tracing::warn!(%addr, "built without the metrics feature; exporter disabled");
    Ok(())
}

fn http_echo(mgr: &mut Manager, listen: &str) -> Result<(), Box<dyn Error>> {
    let handler = mgr.add_handler_fn(|ctx, event| match event {
        Event::Http(HttpEvent::Request(req)) => {
            let body = if req.body.is_empty() { req.uri.as_bytes() } else { req.body };
            let conn = ctx.conn_mut();
            conn.send_head(200, Some(body.len()), Some("Content-Type: text/plain"));
            conn.send(body);
        }
        Event::WebSocket(WsEvent::Frame(frame)) => {
            ctx.conn_mut().send_websocket_frame(frame.opcode, frame.data);
        }
        _ => {}
    });
    let id = mgr.bind(listen, handler)?;
    if let Some(conn) = mgr.connection_mut(id) {
        conn.set_protocol_http_websocket();
    }
    info!(listen, "http echo server running");
    Ok(())
}

fn resolve(
    mgr: &mut Manager,
    name: &str,
    nameserver: Option<String>,
    poll: Duration,
) -> Result<(), Box<dyn Error>> {
    let mut opts = ResolveOptions::from_config(&mgr.config().dns);
    opts.accept_literal = true;
    if nameserver.is_some() {
        opts.nameserver = nameserver;
    }
    let slot: Lookup = Rc::default();
    let out = Rc::clone(&slot);
    let started = mgr.resolve(name, RecordType::A, opts, move |_, result| {
        *out.borrow_mut() = Some(result.map(DnsMessage::first_address));
    })?;
    if let Resolve::Literal(ip) = started {
        println!("{ip}");
        return Ok(());
    }
    let outcome = loop {
        if let Some(outcome) = slot.borrow_mut().take() {
            break outcome;
        }
        mgr.poll(poll);
    };
    match outcome? {
        Some(ip) => println!("{ip}"),
        None => println!("{name}: no address records"),
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    install_exporter(&cli)?;
    let poll = Duration::from_millis(cli.poll_ms);
    let mut mgr = Manager::with_mio(config)?;

    match cli.command {
        Command::Broker { listen } => {
            Broker::bind(&mut mgr, &listen)?;
            info!(listen, "mqtt broker running");
        }
        Command::HttpEcho { listen } => http_echo(&mut mgr, &listen)?,
        Command::Resolve { name, nameserver } => return resolve(&mut mgr, &name, nameserver, poll),
    }
    loop {
        mgr.poll(poll);
    }
}
