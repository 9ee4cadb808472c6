//! Inbound line framing.

use crate::protocol::DELIMITER;
use thiserror::Error;

/// Framing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("undelimited input exceeds {limit} bytes")]
    Overflow { limit: usize },
}

/// Accumulates bytes from non-blocking reads and splits off complete
/// `\r\n`-terminated messages.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    /// Maximum undelimited bytes held between drains. Zero means unbounded.
    limit: usize,
}

impl FrameBuffer {
    /// Create a buffer that holds at most `limit` undelimited bytes
    /// (`0` disables the cap).
    #[must_use]
    pub const fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    /// Add newly read bytes.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Remove and return every complete message, in arrival order, without
    /// its delimiter. A trailing fragment stays buffered for the next call.
    pub fn drain_complete_messages(&mut self) -> Vec<Vec<u8>> {
        let mut messages = Vec::new();
        let mut start = 0;
        while let Some(pos) = find_delimiter(&self.buf[start..]) {
            messages.push(self.buf[start..start + pos].to_vec());
            start += pos + DELIMITER.len();
        }
        self.buf.drain(..start);
        messages
    }

    /// Check the buffered remainder against the cap. Call after draining,
    /// when everything still held is undelimited.
    pub fn check_limit(&self) -> Result<(), FrameError> {
        if self.limit > 0 && self.buf.len() > self.limit {
            return Err(FrameError::Overflow { limit: self.limit });
        }
        Ok(())
    }

    /// Number of bytes currently buffered.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn find_delimiter(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(DELIMITER.len())
        .position(|window| window == DELIMITER)
}
