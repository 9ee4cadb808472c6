//! Channel directory.

use super::connection::ConnId;
use std::collections::{BTreeMap, BTreeSet};

/// Maps channel names to their members.
///
/// A channel exists only while it has members: the entry is created by the
/// first join and removed when the last member leaves, so a missing key is
/// the only representation of "no such channel".
#[derive(Debug, Default)]
pub struct ChannelDirectory {
    channels: BTreeMap<String, BTreeSet<ConnId>>,
}

impl ChannelDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to `channel`, creating the channel if needed. Returns
    /// `false` if it was already a member.
    pub fn join(&mut self, channel: &str, conn: ConnId) -> bool {
        self.channels
            .entry(channel.to_owned())
            .or_default()
            .insert(conn)
    }

    /// Remove `conn` from `channel`, dropping the channel once empty.
    /// Returns `false` if it was not a member.
    pub fn part(&mut self, channel: &str, conn: ConnId) -> bool {
        let Some(members) = self.channels.get_mut(channel) else {
            return false;
        };
        let removed = members.remove(&conn);
        if members.is_empty() {
            self.channels.remove(channel);
        }
        removed
    }

    /// Members of `channel`, or `None` if it does not exist.
    #[must_use]
    pub fn members(&self, channel: &str) -> Option<&BTreeSet<ConnId>> {
        self.channels.get(channel)
    }

    /// Check if `conn` is a member of `channel`.
    #[must_use]
    pub fn is_member(&self, channel: &str, conn: ConnId) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|members| members.contains(&conn))
    }

    /// Names of all existing channels, in lexicographic order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// Number of existing channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Check if there are no channels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
