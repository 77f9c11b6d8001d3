//! Command line interface for the `netmux` binary.
//!
//! Shared with `build.rs`, which renders the man page from it.

use std::{net::SocketAddr, path::PathBuf};

use clap::{Parser, Subcommand};

/// Command line arguments for the `netmux` binary.
#[derive(Debug, Parser)]
#[command(name = "netmux", version, about = "Event-driven network engine demos")]
pub struct Cli {
    /// TOML file with engine settings.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
    /// Upper bound on one poll wait, in milliseconds.
    #[arg(long, global = true, default_value_t = 100)]
    pub poll_ms: u64,
    /// Serve Prometheus metrics on this address.
    #[arg(long, global = true)]
    pub metrics_listen: Option<SocketAddr>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run an MQTT broker.
    Broker {
        /// Listening address.
        #[arg(short, long, default_value = "tcp://0.0.0.0:1883")]
        listen: String,
    },
    /// Serve HTTP, echoing each request and WebSocket message back.
    HttpEcho {
        /// Listening address.
        #[arg(short, long, default_value = "tcp://0.0.0.0:8000")]
        listen: String,
    },
    /// Resolve a host name and print the first address.
    Resolve {
        /// Name to look up.
        name: String,
        /// Nameserver address, such as `udp://1.1.1.1:53`.
        #[arg(short, long)]
        nameserver: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Command};

    #[test]
    fn parses_broker_listen_address() {
        let cli = Cli::parse_from(["netmux", "broker", "--listen", "tcp://127.0.0.1:1884"]);
        assert!(matches!(cli.command, Command::Broker { ref listen } if listen == "tcp://127.0.0.1:1884"));
        assert_eq!(cli.poll_ms, 100);
    }

    #[test]
    fn global_options_follow_the_subcommand() {
        let cli = Cli::parse_from(["netmux", "resolve", "example.com", "--poll-ms", "20", "-n", "udp://9.9.9.9:53"]);
        assert_eq!(cli.poll_ms, 20);
        match cli.command {
            Command::Resolve { name, nameserver } => {
                assert_eq!(name, "example.com");
                assert_eq!(nameserver.as_deref(), Some("udp://9.9.9.9:53"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
