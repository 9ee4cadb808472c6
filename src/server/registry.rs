//! Nick registry.

use super::connection::ConnId;
use std::collections::HashMap;

/// Tracks which connection holds each nick. A nick maps to exactly one
/// live connection.
#[derive(Debug, Default)]
pub struct NickRegistry {
    holders: HashMap<String, ConnId>,
}

impl NickRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The connection currently holding `nick`.
    #[must_use]
    pub fn holder(&self, nick: &str) -> Option<ConnId> {
        self.holders.get(nick).copied()
    }

    /// Claim `nick` for `conn`. Returns `false` and changes nothing if a
    /// different connection holds it. Claiming a nick the connection
    /// already holds succeeds.
    pub fn claim(&mut self, nick: &str, conn: ConnId) -> bool {
        match self.holders.get(nick) {
            Some(&holder) => holder == conn,
            None => {
                self.holders.insert(nick.to_owned(), conn);
                true
            }
        }
    }

    /// Release `nick` if `conn` holds it.
    pub fn release(&mut self, nick: &str, conn: ConnId) {
        if self.holder(nick) == Some(conn) {
            self.holders.remove(nick);
        }
    }

    /// Number of claimed nicks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.holders.len()
    }

    /// Check if no nicks are claimed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }
}
