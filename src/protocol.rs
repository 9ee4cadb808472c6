//! Wire protocol spoken between chat clients and the relay.
//!
//! Every message is one line of text terminated by `\r\n`. Clients send
//! `NICK`, `JOIN`, `PART`, `LIST` and `PRVMSG`; the server answers with
//! `PRVMSG` lines and the two-valued `ERROR` notice. Keywords are
//! case-sensitive and arguments are separated by a single space.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Line terminator on the wire.
pub const DELIMITER: &[u8] = b"\r\n";

/// Destination used for server-generated notices such as `LIST` replies.
pub const STATUS_CHANNEL: &str = "#status";

/// Default TCP port for the relay.
pub const DEFAULT_PORT: u16 = 42424;

static NICK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]{1,9}$").expect("nick pattern is valid"));

static CHANNEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#[A-Za-z0-9_]{0,199}$").expect("channel pattern is valid"));

/// Check whether `s` is a valid handle: 1 to 9 word characters.
#[must_use]
pub fn is_valid_nick(s: &str) -> bool {
    NICK.is_match(s)
}

/// Check whether `s` is a valid channel name: `#` followed by up to 199
/// word characters.
#[must_use]
pub fn is_valid_channel(s: &str) -> bool {
    CHANNEL.is_match(s)
}

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `NICK <handle>`
    Nick(String),
    /// `JOIN <#channel>`
    Join(String),
    /// `PART <#channel>`
    Part(String),
    /// `LIST`
    List,
    /// `PRVMSG <#channel> <body>`
    Message {
        /// Target channel.
        channel: String,
        /// Remainder of the line, spaces included.
        body: String,
    },
    /// `NICK`, `JOIN` or `PART` with a missing or malformed argument,
    /// answered with the given code.
    Invalid(ErrorCode),
    /// Anything else that does not match the grammar above. Never answered.
    Unrecognized,
}

impl Command {
    /// Parse one line (without its delimiter).
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let (keyword, arg) = match line.split_once(' ') {
            Some((keyword, arg)) => (keyword, Some(arg)),
            None => (line, None),
        };

        match (keyword, arg) {
            ("NICK", Some(handle)) if is_valid_nick(handle) => Self::Nick(handle.to_owned()),
            ("NICK", _) => Self::Invalid(ErrorCode::NickRejected),
            ("JOIN", Some(channel)) if is_valid_channel(channel) => Self::Join(channel.to_owned()),
            ("PART", Some(channel)) if is_valid_channel(channel) => Self::Part(channel.to_owned()),
            ("JOIN" | "PART", _) => Self::Invalid(ErrorCode::ChannelViolation),
            ("LIST", None) => Self::List,
            ("PRVMSG", Some(rest)) => match rest.split_once(' ') {
                Some((channel, body)) if is_valid_channel(channel) && !body.contains('\n') => {
                    Self::Message {
                        channel: channel.to_owned(),
                        body: body.to_owned(),
                    }
                }
                _ => Self::Unrecognized,
            },
            _ => Self::Unrecognized,
        }
    }

    /// Parse one raw line. Bytes that are not UTF-8 are unrecognized.
    #[must_use]
    pub fn from_bytes(line: &[u8]) -> Self {
        std::str::from_utf8(line).map_or(Self::Unrecognized, Self::parse)
    }

    /// The protocol keyword, for logging.
    #[must_use]
    pub const fn keyword(&self) -> &'static str {
        match self {
            Self::Nick(_) => "NICK",
            Self::Join(_) => "JOIN",
            Self::Part(_) => "PART",
            Self::List => "LIST",
            Self::Message { .. } => "PRVMSG",
            Self::Invalid(ErrorCode::NickRejected) => "NICK?",
            Self::Invalid(ErrorCode::ChannelViolation) => "JOIN/PART?",
            Self::Unrecognized => "?",
        }
    }
}

/// Error codes carried by `ERROR` notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The requested nick is malformed or held by another connection.
    NickRejected = 1,
    /// Malformed or unknown channel, not a member, duplicate join, or a
    /// part from a channel not joined.
    ChannelViolation = 2,
}

impl ErrorCode {
    /// Numeric code as sent on the wire.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Look up a code received on the wire.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::NickRejected),
            2 => Some(Self::ChannelViolation),
            _ => None,
        }
    }
}

/// A line sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `PRVMSG <channel> <body>`, used for broadcasts and status notices.
    Message {
        /// Channel the line belongs to.
        channel: String,
        /// Message text.
        body: String,
    },
    /// `ERROR <code>`
    Error(ErrorCode),
}

impl Reply {
    /// Build a notice addressed to [`STATUS_CHANNEL`].
    pub fn status(body: impl Into<String>) -> Self {
        Self::Message {
            channel: STATUS_CHANNEL.to_owned(),
            body: body.into(),
        }
    }

    /// Render the reply including its trailing delimiter.
    #[must_use]
    pub fn to_wire(&self) -> Vec<u8> {
        let mut bytes = self.to_string().into_bytes();
        bytes.extend_from_slice(DELIMITER);
        bytes
    }

    /// Parse a server line (without its delimiter). Used by clients.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let (keyword, rest) = line.split_once(' ')?;
        match keyword {
            "PRVMSG" => {
                let (channel, body) = rest.split_once(' ')?;
                Some(Self::Message {
                    channel: channel.to_owned(),
                    body: body.to_owned(),
                })
            }
            "ERROR" => rest.parse().ok().and_then(ErrorCode::from_code).map(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message { channel, body } => write!(f, "PRVMSG {channel} {body}"),
            Self::Error(code) => write!(f, "ERROR {}", code.code()),
        }
    }
}
