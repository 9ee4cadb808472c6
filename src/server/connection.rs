//! Per-connection state.

use super::frame::FrameBuffer;
use std::collections::HashSet;
use std::fmt;

/// Identifies a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(usize);

impl ConnId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Readiness a connection needs from the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Waiting for input only.
    Read,
    /// Output is queued as well.
    ReadWrite,
}

/// State for one client connection.
#[derive(Debug)]
pub struct Connection {
    /// Nick, once registered.
    pub nick: Option<String>,
    /// Channels this connection has joined.
    pub joined: HashSet<String>,
    /// Partial inbound data.
    pub inbound: FrameBuffer,
    /// Bytes waiting to be written.
    pub outbound: Vec<u8>,
}

impl Connection {
    /// Create an unregistered connection.
    #[must_use]
    pub fn new(max_pending: usize) -> Self {
        Self {
            nick: None,
            joined: HashSet::new(),
            inbound: FrameBuffer::new(max_pending),
            outbound: Vec::new(),
        }
    }

    /// Check if the connection has claimed a nick.
    #[must_use]
    pub const fn is_registered(&self) -> bool {
        self.nick.is_some()
    }

    /// Queue bytes for the peer.
    pub fn queue(&mut self, bytes: &[u8]) {
        self.outbound.extend_from_slice(bytes);
    }

    /// The readiness this connection currently needs.
    #[must_use]
    pub fn interest(&self) -> Interest {
        if self.outbound.is_empty() {
            Interest::Read
        } else {
            Interest::ReadWrite
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_follows_outbound_queue() {
        let mut conn = Connection::new(0);
        assert_eq!(conn.interest(), Interest::Read);
        conn.queue(b"ERROR 2\r\n");
        assert_eq!(conn.interest(), Interest::ReadWrite);
        conn.outbound.clear();
        assert_eq!(conn.interest(), Interest::Read);
    }

    #[test]
    fn test_starts_unregistered() {
        let conn = Connection::new(0);
        assert!(!conn.is_registered());
        assert!(conn.joined.is_empty());
    }
}
