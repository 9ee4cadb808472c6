//! Command-line interface for chanrelay.

use crate::protocol::DEFAULT_PORT;
use crate::server::{DEFAULT_MAX_PENDING, RelayOptions, ServerConfig};
use clap::{Args, Parser, Subcommand};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Minimal line-oriented chat relay.
#[derive(Debug, Parser)]
#[command(name = "chanrelay", version, about)]
pub struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Run the relay daemon.
    Serve(ServeArgs),

    /// Connect to a relay and chat from the terminal.
    ///
    /// Type `/nick NAME`, `/join #CHANNEL`, `/part #CHANNEL` or `/list`;
    /// anything else is sent to the most recently joined channel.
    Chat {
        /// Relay host.
        #[arg(long, default_value = "127.0.0.1", env = "CHANRELAY_HOST")]
        host: String,

        /// Relay port.
        #[arg(long, short, default_value_t = DEFAULT_PORT, env = "CHANRELAY_PORT")]
        port: u16,

        /// Nick to register on connect.
        #[arg(long, short)]
        nick: Option<String>,

        /// Channel to join on connect.
        #[arg(long, short)]
        join: Option<String>,
    },
}

/// Options for `chanrelay serve`.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to bind.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST), env = "CHANRELAY_BIND")]
    pub bind: IpAddr,

    /// Port to listen on.
    #[arg(long, short, default_value_t = DEFAULT_PORT, env = "CHANRELAY_PORT")]
    pub port: u16,

    /// Maximum bytes of unterminated input per connection (0 = unlimited).
    #[arg(long, default_value_t = DEFAULT_MAX_PENDING, env = "CHANRELAY_MAX_PENDING")]
    pub max_pending: usize,

    /// Do not echo channel messages back to their sender.
    #[arg(long)]
    pub exclude_sender: bool,

    /// Prefix broadcast messages with the sender's nick.
    #[arg(long)]
    pub tag_sender: bool,

    /// Poll timeout in milliseconds.
    #[arg(long, default_value_t = 1000, value_name = "MILLIS")]
    pub poll_timeout_ms: u64,
}

impl ServeArgs {
    /// Build the server configuration these options describe.
    #[must_use]
    pub const fn to_config(&self) -> ServerConfig {
        ServerConfig {
            addr: SocketAddr::new(self.bind, self.port),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            relay: RelayOptions {
                echo_to_sender: !self.exclude_sender,
                tag_sender: self.tag_sender,
                max_pending: self.max_pending,
            },
        }
    }
}
