//! Transport-free relay engine.
//!
//! Owns the protocol state of every connection along with the nick registry
//! and the channel directory. The reactor feeds it raw bytes and writes out
//! whatever it queues; a local front-end can drive it directly through
//! [`Relay::submit_line`] and [`Relay::on_outbound`].

use super::channels::ChannelDirectory;
use super::connection::{ConnId, Connection, Interest};
use super::frame::FrameError;
use super::registry::NickRegistry;
use crate::protocol::{Command, DELIMITER, ErrorCode, Reply};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Default cap on undelimited inbound bytes per connection.
pub const DEFAULT_MAX_PENDING: usize = 4096;

/// Connections whose outbound queue grew while handling some input.
pub type Touched = BTreeSet<ConnId>;

/// Relay behavior switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    /// Deliver a channel message back to its sender too.
    pub echo_to_sender: bool,
    /// Prefix broadcast bodies with `<nick>: `.
    pub tag_sender: bool,
    /// Cap on undelimited inbound bytes per connection (0 = unbounded).
    pub max_pending: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            echo_to_sender: true,
            tag_sender: false,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

/// The relay state machine.
#[derive(Debug, Default)]
pub struct Relay {
    options: RelayOptions,
    connections: HashMap<ConnId, Connection>,
    nicks: NickRegistry,
    channels: ChannelDirectory,
    next_id: usize,
}

impl Relay {
    /// Create an empty relay.
    #[must_use]
    pub fn new(options: RelayOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// The options this relay was built with.
    #[must_use]
    pub const fn options(&self) -> &RelayOptions {
        &self.options
    }

    /// Register a new, unregistered connection.
    pub fn open(&mut self) -> ConnId {
        let id = ConnId::new(self.next_id);
        self.next_id += 1;
        self.connections
            .insert(id, Connection::new(self.options.max_pending));
        id
    }

    /// Feed bytes read from `id`'s transport. Every complete line is
    /// dispatched in order.
    ///
    /// If the undelimited remainder exceeds the configured cap, nothing from
    /// this call is dispatched and the caller is expected to close `id`.
    pub fn submit(&mut self, id: ConnId, bytes: &[u8]) -> Result<Touched, FrameError> {
        let mut touched = Touched::new();
        let Some(conn) = self.connections.get_mut(&id) else {
            return Ok(touched);
        };

        conn.inbound.append(bytes);
        let lines = conn.inbound.drain_complete_messages();
        conn.inbound.check_limit()?;

        for line in lines {
            self.dispatch(id, Command::from_bytes(&line), &mut touched);
        }
        Ok(touched)
    }

    /// Dispatch one already-framed line from `id`.
    pub fn submit_line(&mut self, id: ConnId, line: &str) -> Touched {
        let mut touched = Touched::new();
        self.dispatch(id, Command::parse(line), &mut touched);
        touched
    }

    fn dispatch(&mut self, id: ConnId, command: Command, touched: &mut Touched) {
        let Some(conn) = self.connections.get(&id) else {
            return;
        };
        debug!(conn = %id, command = command.keyword(), "Dispatching");

        // Only NICK means anything before registration.
        let is_nick = matches!(
            command,
            Command::Nick(_) | Command::Invalid(ErrorCode::NickRejected)
        );
        if !conn.is_registered() && !is_nick {
            return;
        }

        match command {
            Command::Nick(nick) => self.handle_nick(id, &nick, touched),
            Command::Join(channel) => self.handle_join(id, &channel, touched),
            Command::Part(channel) => self.handle_part(id, &channel, touched),
            Command::List => self.handle_list(id, touched),
            Command::Message { channel, body } => {
                self.handle_message(id, &channel, &body, touched);
            }
            Command::Invalid(code) => self.reply(id, &Reply::Error(code), touched),
            Command::Unrecognized => {}
        }
    }

    fn handle_nick(&mut self, id: ConnId, nick: &str, touched: &mut Touched) {
        if !self.nicks.claim(nick, id) {
            self.reply(id, &Reply::Error(ErrorCode::NickRejected), touched);
            return;
        }
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if let Some(previous) = conn.nick.replace(nick.to_owned())
            && previous != nick
        {
            self.nicks.release(&previous, id);
        }
    }

    fn handle_join(&mut self, id: ConnId, channel: &str, touched: &mut Touched) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.joined.insert(channel.to_owned()) {
            self.channels.join(channel, id);
        } else {
            self.reply(id, &Reply::Error(ErrorCode::ChannelViolation), touched);
        }
    }

    fn handle_part(&mut self, id: ConnId, channel: &str, touched: &mut Touched) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.joined.remove(channel) {
            self.channels.part(channel, id);
        } else {
            self.reply(id, &Reply::Error(ErrorCode::ChannelViolation), touched);
        }
    }

    fn handle_list(&mut self, id: ConnId, touched: &mut Touched) {
        let notices: Vec<Reply> = self.channels.names().map(Reply::status).collect();
        for notice in &notices {
            self.reply(id, notice, touched);
        }
    }

    fn handle_message(&mut self, id: ConnId, channel: &str, body: &str, touched: &mut Touched) {
        let Some(members) = self
            .channels
            .members(channel)
            .filter(|members| members.contains(&id))
        else {
            self.reply(id, &Reply::Error(ErrorCode::ChannelViolation), touched);
            return;
        };

        let recipients: Vec<ConnId> = members
            .iter()
            .copied()
            .filter(|&member| self.options.echo_to_sender || member != id)
            .collect();

        let body = match (self.options.tag_sender, self.nick_of(id)) {
            (true, Some(nick)) => format!("{nick}: {body}"),
            _ => body.to_owned(),
        };
        let line = Reply::Message {
            channel: channel.to_owned(),
            body,
        }
        .to_wire();

        for member in recipients {
            if let Some(conn) = self.connections.get_mut(&member) {
                conn.queue(&line);
                touched.insert(member);
            }
        }
    }

    fn reply(&mut self, id: ConnId, reply: &Reply, touched: &mut Touched) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.queue(&reply.to_wire());
            touched.insert(id);
        }
    }

    /// Tear down `id`: release its nick and leave every channel it joined.
    /// Returns `false` if the connection was already gone.
    pub fn close(&mut self, id: ConnId) -> bool {
        let Some(conn) = self.connections.remove(&id) else {
            return false;
        };
        if let Some(nick) = &conn.nick {
            self.nicks.release(nick, id);
        }
        for channel in &conn.joined {
            self.channels.part(channel, id);
        }
        debug!(conn = %id, nick = ?conn.nick, channels = conn.joined.len(), "Closed connection state");
        true
    }

    /// Bytes queued for `id`.
    #[must_use]
    pub fn outbound(&self, id: ConnId) -> &[u8] {
        self.connections
            .get(&id)
            .map_or(&[], |conn| conn.outbound.as_slice())
    }

    /// Drop the first `n` queued bytes after they were written.
    pub fn consume_outbound(&mut self, id: ConnId, n: usize) {
        if let Some(conn) = self.connections.get_mut(&id) {
            let n = n.min(conn.outbound.len());
            conn.outbound.drain(..n);
        }
    }

    /// Take every complete queued line for `id`, without delimiters.
    pub fn take_outbound(&mut self, id: ConnId) -> Vec<String> {
        let Some(conn) = self.connections.get_mut(&id) else {
            return Vec::new();
        };
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = conn.outbound[start..]
            .windows(DELIMITER.len())
            .position(|window| window == DELIMITER)
        {
            lines.push(String::from_utf8_lossy(&conn.outbound[start..start + pos]).into_owned());
            start += pos + DELIMITER.len();
        }
        conn.outbound.drain(..start);
        lines
    }

    /// Hand every complete queued line for `id` to `sink`.
    pub fn on_outbound(&mut self, id: ConnId, mut sink: impl FnMut(&str)) {
        for line in self.take_outbound(id) {
            sink(&line);
        }
    }

    /// Readiness `id` needs, or `None` if it is not open.
    #[must_use]
    pub fn interest(&self, id: ConnId) -> Option<Interest> {
        self.connections.get(&id).map(Connection::interest)
    }

    /// Check if `id` is open.
    #[must_use]
    pub fn is_open(&self, id: ConnId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Nick held by `id`.
    #[must_use]
    pub fn nick_of(&self, id: ConnId) -> Option<&str> {
        self.connections.get(&id)?.nick.as_deref()
    }

    /// Connection holding `nick`.
    #[must_use]
    pub fn holder_of(&self, nick: &str) -> Option<ConnId> {
        self.nicks.holder(nick)
    }

    /// Channels `id` has joined.
    #[must_use]
    pub fn joined(&self, id: ConnId) -> Option<&HashSet<String>> {
        self.connections.get(&id).map(|conn| &conn.joined)
    }

    /// Members of `channel`, empty if it does not exist.
    #[must_use]
    pub fn members(&self, channel: &str) -> Vec<ConnId> {
        self.channels
            .members(channel)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Names of all existing channels, sorted.
    #[must_use]
    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.names().collect()
    }

    /// Ids of every open connection.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnId> {
        self.connections.keys().copied().collect()
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of existing channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of claimed nicks.
    #[must_use]
    pub fn nick_count(&self) -> usize {
        self.nicks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay() -> Relay {
        Relay::new(RelayOptions::default())
    }

    fn registered(relay: &mut Relay, nick: &str) -> ConnId {
        let id = relay.open();
        relay.submit_line(id, &format!("NICK {nick}"));
        assert_eq!(relay.nick_of(id), Some(nick));
        id
    }

    /// Joined sets and member sets must mirror each other.
    fn assert_consistent(relay: &Relay) {
        for id in relay.connection_ids() {
            for channel in relay.joined(id).expect("open connection") {
                assert!(relay.members(channel).contains(&id), "{id} missing from {channel}");
            }
            if let Some(nick) = relay.nick_of(id) {
                assert_eq!(relay.holder_of(nick), Some(id));
            }
        }
        for channel in relay.channel_names() {
            let members = relay.members(channel);
            assert!(!members.is_empty(), "{channel} exists without members");
            for id in members {
                assert!(relay.joined(id).is_some_and(|joined| joined.contains(channel)));
            }
        }
    }

    #[test]
    fn test_duplicate_nick_is_rejected() {
        let mut relay = relay();
        let alice = registered(&mut relay, "alice");
        let other = relay.open();

        let touched = relay.submit_line(other, "NICK alice");
        assert_eq!(touched, Touched::from([other]));
        assert_eq!(relay.take_outbound(other), vec!["ERROR 1"]);
        assert_eq!(relay.nick_of(other), None);
        assert_eq!(relay.holder_of("alice"), Some(alice));
    }

    #[test]
    fn test_nick_change_releases_previous() {
        let mut relay = relay();
        let id = registered(&mut relay, "alice");

        assert!(relay.submit_line(id, "NICK alicia").is_empty());
        assert_eq!(relay.nick_of(id), Some("alicia"));
        assert_eq!(relay.holder_of("alice"), None);
        assert_eq!(relay.nick_count(), 1);

        // The old handle is free for someone else now.
        let other = registered(&mut relay, "alice");
        assert_eq!(relay.holder_of("alice"), Some(other));
    }

    #[test]
    fn test_failed_nick_change_keeps_old_nick() {
        let mut relay = relay();
        registered(&mut relay, "bob");
        let id = registered(&mut relay, "alice");

        relay.submit_line(id, "NICK bob");
        assert_eq!(relay.take_outbound(id), vec!["ERROR 1"]);
        assert_eq!(relay.nick_of(id), Some("alice"));
        assert_eq!(relay.holder_of("alice"), Some(id));
    }

    #[test]
    fn test_renick_to_same_handle_is_silent() {
        let mut relay = relay();
        let id = registered(&mut relay, "alice");
        assert!(relay.submit_line(id, "NICK alice").is_empty());
        assert_eq!(relay.holder_of("alice"), Some(id));
    }

    #[test]
    fn test_unregistered_commands_are_dropped() {
        let mut relay = relay();
        let id = relay.open();

        for line in ["JOIN #a", "PART #a", "LIST", "PRVMSG #a hi", "garbage"] {
            assert!(relay.submit_line(id, line).is_empty(), "{line} produced output");
        }
        assert!(relay.outbound(id).is_empty());
        assert_eq!(relay.channel_count(), 0);
        assert!(relay.joined(id).is_some_and(HashSet::is_empty));
    }

    #[test]
    fn test_join_and_duplicate_join() {
        let mut relay = relay();
        let id = registered(&mut relay, "alice");

        assert!(relay.submit_line(id, "JOIN #a").is_empty());
        assert_eq!(relay.members("#a"), vec![id]);

        relay.submit_line(id, "JOIN #a");
        assert_eq!(relay.take_outbound(id), vec!["ERROR 2"]);
        assert_eq!(relay.members("#a"), vec![id]);
        assert_consistent(&relay);
    }

    #[test]
    fn test_part_without_join_is_an_error() {
        let mut relay = relay();
        let alice = registered(&mut relay, "alice");
        let bob = registered(&mut relay, "bob");
        relay.submit_line(alice, "JOIN #a");

        relay.submit_line(bob, "PART #a");
        assert_eq!(relay.take_outbound(bob), vec!["ERROR 2"]);
        assert_eq!(relay.members("#a"), vec![alice]);
        assert_consistent(&relay);
    }

    #[test]
    fn test_last_part_removes_channel_from_list() {
        let mut relay = relay();
        let alice = registered(&mut relay, "alice");
        let bob = registered(&mut relay, "bob");
        relay.submit_line(alice, "JOIN #a");
        relay.submit_line(bob, "JOIN #a");
        relay.submit_line(bob, "JOIN #b");

        relay.submit_line(alice, "LIST");
        assert_eq!(
            relay.take_outbound(alice),
            vec!["PRVMSG #status #a", "PRVMSG #status #b"]
        );

        relay.submit_line(alice, "PART #a");
        relay.submit_line(bob, "PART #a");
        relay.submit_line(alice, "LIST");
        assert_eq!(relay.take_outbound(alice), vec!["PRVMSG #status #b"]);
        assert_consistent(&relay);
    }

    #[test]
    fn test_list_with_no_channels_is_silent() {
        let mut relay = relay();
        let id = registered(&mut relay, "alice");
        assert!(relay.submit_line(id, "LIST").is_empty());
    }

    #[test]
    fn test_broadcast_includes_sender_by_default() {
        let mut relay = relay();
        let alice = registered(&mut relay, "alice");
        let bob = registered(&mut relay, "bob");
        let carol = registered(&mut relay, "carol");
        relay.submit_line(alice, "JOIN #x");
        relay.submit_line(bob, "JOIN #x");

        let touched = relay.submit_line(alice, "PRVMSG #x hello");
        assert_eq!(touched, Touched::from([alice, bob]));
        assert_eq!(relay.take_outbound(alice), vec!["PRVMSG #x hello"]);
        assert_eq!(relay.take_outbound(bob), vec!["PRVMSG #x hello"]);
        assert!(relay.take_outbound(carol).is_empty());
    }

    #[test]
    fn test_broadcast_can_exclude_sender() {
        let mut relay = Relay::new(RelayOptions {
            echo_to_sender: false,
            ..RelayOptions::default()
        });
        let alice = registered(&mut relay, "alice");
        let bob = registered(&mut relay, "bob");
        relay.submit_line(alice, "JOIN #x");
        relay.submit_line(bob, "JOIN #x");

        let touched = relay.submit_line(alice, "PRVMSG #x hello");
        assert_eq!(touched, Touched::from([bob]));
        assert!(relay.outbound(alice).is_empty());
    }

    #[test]
    fn test_broadcast_sender_tag() {
        let mut relay = Relay::new(RelayOptions {
            tag_sender: true,
            ..RelayOptions::default()
        });
        let alice = registered(&mut relay, "alice");
        relay.submit_line(alice, "JOIN #x");
        relay.submit_line(alice, "PRVMSG #x hi there");
        assert_eq!(relay.take_outbound(alice), vec!["PRVMSG #x alice: hi there"]);
    }

    #[test]
    fn test_message_to_unknown_or_unjoined_channel() {
        let mut relay = relay();
        let alice = registered(&mut relay, "alice");
        let bob = registered(&mut relay, "bob");
        relay.submit_line(bob, "JOIN #x");

        relay.submit_line(alice, "PRVMSG #nowhere hi");
        relay.submit_line(alice, "PRVMSG #x hi");
        assert_eq!(relay.take_outbound(alice), vec!["ERROR 2", "ERROR 2"]);
        assert!(relay.outbound(bob).is_empty());
    }

    #[test]
    fn test_unrecognized_lines_are_ignored() {
        let mut relay = relay();
        let id = registered(&mut relay, "alice");
        for line in ["", "HELLO", "LIST now", "PRVMSG nohash hi", "PRVMSG #a"] {
            assert!(relay.submit_line(id, line).is_empty(), "{line} produced output");
        }
        assert_eq!(relay.channel_count(), 0);
    }

    #[test]
    fn test_malformed_nick_is_rejected_in_any_state() {
        let mut relay = relay();
        let id = relay.open();

        assert_eq!(relay.submit_line(id, "NICK bad-name"), Touched::from([id]));
        assert_eq!(relay.take_outbound(id), vec!["ERROR 1"]);
        assert_eq!(relay.nick_of(id), None);

        relay.submit_line(id, "NICK alice");
        relay.submit_line(id, "NICK way_too_long_nick");
        assert_eq!(relay.take_outbound(id), vec!["ERROR 1"]);
        assert_eq!(relay.nick_of(id), Some("alice"));
        assert_eq!(relay.nick_count(), 1);
    }

    #[test]
    fn test_malformed_channel_is_rejected_once_registered() {
        let mut relay = relay();
        let id = relay.open();

        // Channel commands stay gated before registration.
        assert!(relay.submit_line(id, "JOIN general").is_empty());
        assert!(relay.outbound(id).is_empty());

        relay.submit_line(id, "NICK alice");
        relay.submit_line(id, "JOIN general");
        relay.submit_line(id, "PART general");
        assert_eq!(relay.take_outbound(id), vec!["ERROR 2", "ERROR 2"]);
        assert_eq!(relay.channel_count(), 0);
        assert_consistent(&relay);
    }

    #[test]
    fn test_submit_frames_partial_input() {
        let mut relay = relay();
        let id = relay.open();

        assert!(relay.submit(id, b"NICK al").expect("submit").is_empty());
        assert_eq!(relay.nick_of(id), None);

        relay.submit(id, b"ice\r\nJOIN #a\r\n").expect("submit");
        assert_eq!(relay.nick_of(id), Some("alice"));
        assert_eq!(relay.members("#a"), vec![id]);
    }

    #[test]
    fn test_submit_overflow() {
        let mut relay = Relay::new(RelayOptions {
            max_pending: 16,
            ..RelayOptions::default()
        });
        let id = relay.open();
        let err = relay
            .submit(id, b"NICK alice\r\nxxxxxxxxxxxxxxxxxxxx")
            .expect_err("should overflow");
        assert_eq!(err, FrameError::Overflow { limit: 16 });
        // Nothing from the rejected read was applied.
        assert_eq!(relay.nick_of(id), None);
    }

    #[test]
    fn test_close_releases_everything() {
        let mut relay = relay();
        let alice = registered(&mut relay, "alice");
        let bob = registered(&mut relay, "bob");
        relay.submit_line(alice, "JOIN #a");
        relay.submit_line(alice, "JOIN #b");
        relay.submit_line(bob, "JOIN #b");

        assert!(relay.close(alice));
        assert_eq!(relay.holder_of("alice"), None);
        assert!(relay.members("#a").is_empty());
        assert_eq!(relay.members("#b"), vec![bob]);
        assert_eq!(relay.channel_names(), vec!["#b"]);
        assert_consistent(&relay);

        // A different connection can take the freed handle.
        let other = registered(&mut relay, "alice");
        assert_eq!(relay.holder_of("alice"), Some(other));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut relay = relay();
        let id = registered(&mut relay, "alice");
        assert!(relay.is_open(id));
        assert!(relay.close(id));
        assert!(!relay.is_open(id));
        assert!(!relay.close(id));
        assert!(relay.submit(id, b"LIST\r\n").expect("submit").is_empty());
        assert!(relay.outbound(id).is_empty());
    }

    #[test]
    fn test_consume_outbound_partial_write() {
        let mut relay = relay();
        let id = relay.open();
        relay.submit_line(id, "NICK alice");
        relay.submit_line(id, "PART #a");
        assert_eq!(relay.outbound(id), b"ERROR 2\r\n");
        assert_eq!(relay.interest(id), Some(Interest::ReadWrite));

        relay.consume_outbound(id, 3);
        assert_eq!(relay.outbound(id), b"OR 2\r\n");
        relay.consume_outbound(id, 100);
        assert_eq!(relay.interest(id), Some(Interest::Read));
    }

    #[test]
    fn test_on_outbound_delivers_lines() {
        let mut relay = relay();
        let id = registered(&mut relay, "alice");
        relay.submit_line(id, "JOIN #a");
        relay.submit_line(id, "PRVMSG #a one");
        relay.submit_line(id, "PRVMSG #a two");

        let mut seen = Vec::new();
        relay.on_outbound(id, |line| seen.push(line.to_owned()));
        assert_eq!(seen, vec!["PRVMSG #a one", "PRVMSG #a two"]);
        assert!(relay.outbound(id).is_empty());
    }

    #[test]
    fn test_membership_stays_consistent_under_churn() {
        let mut relay = relay();
        let ids: Vec<ConnId> = (0..4)
            .map(|n| registered(&mut relay, &format!("user{n}")))
            .collect();
        let script = [
            (0, "JOIN #a"),
            (1, "JOIN #a"),
            (2, "JOIN #b"),
            (1, "PART #a"),
            (3, "JOIN #a"),
            (0, "PART #b"),
            (2, "JOIN #a"),
            (3, "PART #a"),
        ];
        for (who, line) in script {
            relay.submit_line(ids[who], line);
            assert_consistent(&relay);
        }
        relay.close(ids[2]);
        assert_consistent(&relay);
        assert_eq!(relay.channel_names(), vec!["#a"]);
        assert_eq!(relay.members("#a"), vec![ids[0]]);
    }
}
