//! chanrelay: minimal line-oriented chat relay
//!
//! Clients connect over TCP, register a nick, join channels and broadcast
//! lines to everyone in a channel. The server is a single-threaded
//! readiness loop; the protocol engine behind it can also be driven
//! directly through [`Relay`].

// Error documentation is deferred - the errors are self-explanatory from types
#![allow(clippy::missing_errors_doc)]

pub mod cli;
pub mod client;
pub mod protocol;
pub mod server;
pub mod testing;

pub use cli::{Cli, CliCommand, ServeArgs};
pub use client::{Client, ClientError, run_chat, translate_input};
pub use protocol::{Command, ErrorCode, Reply};
pub use server::{ConnId, Relay, RelayOptions, Server, ServerConfig, ServerError, ShutdownHandle};
pub use testing::{TestClient, TestError, TestHarness};
