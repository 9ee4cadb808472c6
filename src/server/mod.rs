//! The chanrelay server.
//!
//! A single-threaded reactor: one readiness multiplexer watches the
//! listening socket and every client socket. Readable sockets are drained
//! into the [`Relay`], which queues replies and broadcasts; the reactor then
//! arms write interest for every connection with pending output and flushes
//! it as the sockets become writable.

mod channels;
mod connection;
mod frame;
mod registry;
mod relay;

pub use channels::ChannelDirectory;
pub use connection::{ConnId, Connection, Interest};
pub use frame::{FrameBuffer, FrameError};
pub use registry::NickRegistry;
pub use relay::{DEFAULT_MAX_PENDING, Relay, RelayOptions, Touched};

use crate::protocol::DEFAULT_PORT;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll, Token, Waker};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
/// Connection tokens are offset past the reserved ones.
const FIRST_CONN_TOKEN: usize = 2;

const READ_CHUNK: usize = 4096;
const EVENT_CAPACITY: usize = 256;

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("readiness poll failed: {0}")]
    Poll(#[source] std::io::Error),

    #[error("failed to register with the poller: {0}")]
    Register(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// Server settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to listen on.
    pub addr: SocketAddr,
    /// How long one poll may wait before the housekeeping tick.
    pub poll_timeout: Duration,
    /// Relay behavior.
    pub relay: RelayOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            poll_timeout: Duration::from_secs(1),
            relay: RelayOptions::default(),
        }
    }
}

/// Stops a running [`Server`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Ask the server to stop after the current batch of events.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake server for shutdown: {e}");
        }
    }
}

/// A client socket and the interest it is registered with.
struct Peer {
    stream: TcpStream,
    addr: SocketAddr,
    interest: Interest,
}

/// What a readable event did to a connection.
enum ReadOutcome {
    Open(Touched),
    Closed,
}

/// The chanrelay server.
pub struct Server {
    config: ServerConfig,
    poll: Poll,
    listener: TcpListener,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    relay: Relay,
    peers: HashMap<ConnId, Peer>,
    /// Set when accepting failed with connections possibly still queued.
    retry_accept: bool,
}

impl Server {
    /// Bind the listening socket and set up the poller.
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let poll = Poll::new().map_err(ServerError::Poll)?;
        let mut listener = TcpListener::bind(config.addr).map_err(|source| ServerError::Bind {
            addr: config.addr,
            source,
        })?;
        poll.registry()
            .register(&mut listener, LISTENER, mio::Interest::READABLE)
            .map_err(ServerError::Register)?;
        let waker = Waker::new(poll.registry(), WAKER).map_err(ServerError::Register)?;

        Ok(Self {
            config,
            poll,
            listener,
            stop: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(waker),
            relay: Relay::new(config.relay),
            peers: HashMap::new(),
            retry_accept: false,
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(ServerError::Io)
    }

    /// A handle that can stop [`Server::run`] from another thread.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    /// The relay state.
    #[must_use]
    pub const fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Run the event loop until shut down.
    pub fn run(&mut self) -> Result<(), ServerError> {
        info!("Server listening on {}", self.local_addr()?);
        let mut events = Events::with_capacity(EVENT_CAPACITY);

        while !self.stop.load(Ordering::SeqCst) {
            match self.poll.poll(&mut events, Some(self.config.poll_timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ServerError::Poll(e)),
            }

            if events.is_empty() {
                self.housekeeping();
            }

            for event in &events {
                match event.token() {
                    LISTENER => self.accept_all(),
                    WAKER => {}
                    token => self.handle_peer_event(conn_id(token), event),
                }
            }

            // The listener will not report readiness again for connections
            // already in the backlog.
            if self.retry_accept {
                self.accept_all();
            }
        }

        self.close_all();
        info!("Server shut down");
        Ok(())
    }

    fn housekeeping(&self) {
        debug!(
            connections = self.relay.connection_count(),
            channels = self.relay.channel_count(),
            nicks = self.relay.nick_count(),
            "Idle tick"
        );
    }

    /// Accept until the listener would block. mio readiness is
    /// edge-triggered, so stopping early would strand queued connections
    /// unless `retry_accept` is set.
    fn accept_all(&mut self) {
        self.retry_accept = false;
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => self.add_peer(stream, addr),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("Accept error, retrying next iteration: {e}");
                    self.retry_accept = true;
                    break;
                }
            }
        }
    }

    fn add_peer(&mut self, mut stream: TcpStream, addr: SocketAddr) {
        let id = self.relay.open();
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut stream, token(id), mio::Interest::READABLE)
        {
            warn!(conn = %id, %addr, "Failed to register connection: {e}");
            self.relay.close(id);
            return;
        }
        info!(conn = %id, %addr, "Accepted connection");
        self.peers.insert(
            id,
            Peer {
                stream,
                addr,
                interest: Interest::Read,
            },
        );
    }

    fn handle_peer_event(&mut self, id: ConnId, event: &Event) {
        // Already torn down earlier in this batch.
        if !self.peers.contains_key(&id) {
            return;
        }

        if event.is_error() || (event.is_read_closed() && !event.is_readable()) {
            debug!(conn = %id, "Peer hung up");
            self.teardown(id);
            return;
        }

        if event.is_readable() {
            match self.read_peer(id) {
                ReadOutcome::Open(touched) => self.apply_interest(&touched),
                ReadOutcome::Closed => {
                    self.teardown(id);
                    return;
                }
            }
        }

        if event.is_writable() && !self.flush_peer(id) {
            self.teardown(id);
        }
    }

    /// Drain the socket into the relay. Lines are dispatched as they
    /// complete, so a peer that sends a final line and closes still has it
    /// handled.
    fn read_peer(&mut self, id: ConnId) -> ReadOutcome {
        let mut touched = Touched::new();
        let mut buf = [0u8; READ_CHUNK];

        loop {
            let Some(peer) = self.peers.get_mut(&id) else {
                return ReadOutcome::Closed;
            };
            let n = match peer.stream.read(&mut buf) {
                Ok(0) => {
                    debug!(conn = %id, addr = %peer.addr, "Peer closed connection");
                    self.apply_interest(&touched);
                    return ReadOutcome::Closed;
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(conn = %id, addr = %peer.addr, "Read error: {e}");
                    self.apply_interest(&touched);
                    return ReadOutcome::Closed;
                }
            };
            trace!(conn = %id, len = n, "Read from socket");

            match self.relay.submit(id, &buf[..n]) {
                Ok(more) => touched.extend(more),
                Err(e) => {
                    warn!(conn = %id, "Dropping connection: {e}");
                    self.apply_interest(&touched);
                    return ReadOutcome::Closed;
                }
            }
        }

        ReadOutcome::Open(touched)
    }

    /// Write as much queued output as the socket takes. Returns `false` if
    /// the connection failed.
    fn flush_peer(&mut self, id: ConnId) -> bool {
        let Some(peer) = self.peers.get_mut(&id) else {
            return true;
        };

        loop {
            let pending = self.relay.outbound(id);
            if pending.is_empty() {
                break;
            }
            match peer.stream.write(pending) {
                Ok(0) => {
                    // Leave the registration alone and retry on the next event.
                    debug!(conn = %id, "Socket accepted zero bytes");
                    return true;
                }
                Ok(n) => {
                    trace!(conn = %id, len = n, "Wrote to socket");
                    self.relay.consume_outbound(id, n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(conn = %id, addr = %peer.addr, "Write error: {e}");
                    return false;
                }
            }
        }

        self.update_interest(id)
    }

    fn apply_interest(&mut self, touched: &Touched) {
        for &id in touched {
            if !self.update_interest(id) {
                self.teardown(id);
            }
        }
    }

    /// Re-register `id` if the readiness it needs changed. Returns `false`
    /// if the poller rejected the change.
    fn update_interest(&mut self, id: ConnId) -> bool {
        let (Some(peer), Some(wanted)) = (self.peers.get_mut(&id), self.relay.interest(id)) else {
            return true;
        };
        if peer.interest == wanted {
            return true;
        }

        let interest = match wanted {
            Interest::Read => mio::Interest::READABLE,
            Interest::ReadWrite => mio::Interest::READABLE | mio::Interest::WRITABLE,
        };
        match self
            .poll
            .registry()
            .reregister(&mut peer.stream, token(id), interest)
        {
            Ok(()) => {
                debug!(conn = %id, ?wanted, "Interest changed");
                peer.interest = wanted;
                true
            }
            Err(e) => {
                warn!(conn = %id, "Failed to update interest: {e}");
                false
            }
        }
    }

    /// Remove a connection from the poller and the relay in one step.
    /// Tearing down an unknown connection does nothing.
    fn teardown(&mut self, id: ConnId) {
        if let Some(mut peer) = self.peers.remove(&id) {
            if let Err(e) = self.poll.registry().deregister(&mut peer.stream) {
                debug!(conn = %id, "Deregister failed: {e}");
            }
            info!(conn = %id, addr = %peer.addr, "Closed connection");
        }
        self.relay.close(id);
    }

    fn close_all(&mut self) {
        let ids: Vec<ConnId> = self.peers.keys().copied().collect();
        for id in ids {
            self.teardown(id);
        }
        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            debug!("Deregister listener failed: {e}");
        }
    }
}

const fn token(id: ConnId) -> Token {
    Token(id.get() + FIRST_CONN_TOKEN)
}

const fn conn_id(token: Token) -> ConnId {
    ConnId::new(token.0 - FIRST_CONN_TOKEN)
}
