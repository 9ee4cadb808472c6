//! Client for talking to a chanrelay server.
//!
//! [`Client`] speaks the wire protocol over TCP. [`run_chat`] wraps it in a
//! small terminal front-end that turns slash commands into protocol lines.

use crate::protocol::{DELIMITER, Reply, STATUS_CHANNEL};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info};

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to server: {0}")]
    Connect(#[source] std::io::Error),

    #[error("failed to send: {0}")]
    Send(#[source] std::io::Error),

    #[error("failed to receive: {0}")]
    Receive(#[source] std::io::Error),

    #[error("failed to read terminal input: {0}")]
    Input(#[source] std::io::Error),

    #[error("connection lost")]
    ConnectionLost,
}

/// A connection to a chanrelay server.
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    /// Connect to the server at `addr`.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Connect)?;
        stream.set_nodelay(true).map_err(ClientError::Connect)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Send one protocol line; the delimiter is appended.
    pub async fn send_line(&mut self, line: &str) -> Result<(), ClientError> {
        let mut bytes = Vec::with_capacity(line.len() + DELIMITER.len());
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(DELIMITER);
        self.send_raw(&bytes).await
    }

    /// Send bytes exactly as given.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.writer.write_all(bytes).await.map_err(ClientError::Send)?;
        self.writer.flush().await.map_err(ClientError::Send)
    }

    /// Receive the next line from the server, without its delimiter.
    /// Returns `None` once the server closes the connection.
    ///
    /// Not cancel-safe: a partially read line is lost if the future is
    /// dropped.
    pub async fn recv_line(&mut self) -> Result<Option<String>, ClientError> {
        let mut line = Vec::new();
        loop {
            let n = self
                .reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(ClientError::Receive)?;
            if n == 0 {
                if line.is_empty() {
                    return Ok(None);
                }
                return Err(ClientError::ConnectionLost);
            }
            if line.ends_with(DELIMITER) {
                line.truncate(line.len() - DELIMITER.len());
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
        }
    }

    /// Shut down the sending side of the connection.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        self.writer.shutdown().await.map_err(ClientError::Send)
    }
}

/// Translate one line of terminal input into a protocol line.
///
/// `/nick`, `/join`, `/part` and `/list` map onto their commands; anything
/// else becomes a message to `current_channel`. Joining a channel makes it
/// current and parting the current channel clears it. Returns `None` when
/// there is nothing to send, including `/join` or `/part` without a channel.
pub fn translate_input(current_channel: &mut Option<String>, input: &str) -> Option<String> {
    let input = input.trim_end_matches(['\r', '\n']);
    if input.is_empty() {
        return None;
    }

    let (word, arg) = match input.split_once(' ') {
        Some((word, arg)) => (word, arg.trim()),
        None => (input, ""),
    };

    match word {
        "/nick" => Some(format!("NICK {arg}")),
        "/join" | "/part" if arg.is_empty() => None,
        "/join" => {
            *current_channel = Some(arg.to_owned());
            Some(format!("JOIN {arg}"))
        }
        "/part" => {
            if current_channel.as_deref() == Some(arg) {
                *current_channel = None;
            }
            Some(format!("PART {arg}"))
        }
        "/list" => Some("LIST".to_owned()),
        _ => current_channel
            .as_deref()
            .map(|channel| format!("PRVMSG {channel} {input}")),
    }
}

/// Format a server line for the terminal.
#[must_use]
pub fn describe_reply(line: &str) -> String {
    match Reply::parse(line) {
        Some(Reply::Message { channel, body }) if channel == STATUS_CHANNEL => {
            format!("* channel {body}")
        }
        Some(Reply::Message { channel, body }) => format!("[{channel}] {body}"),
        Some(Reply::Error(code)) => format!("! error {}", code.code()),
        None => line.to_owned(),
    }
}

/// Interactive chat: stdin lines go to the server, server lines go to
/// stdout.
pub async fn run_chat(
    addr: impl ToSocketAddrs,
    nick: Option<String>,
    join: Option<String>,
) -> Result<(), ClientError> {
    let mut client = Client::connect(addr).await?;
    info!("Connected");

    let mut current_channel = None;
    for input in [nick.map(|n| format!("/nick {n}")), join.map(|c| format!("/join {c}"))]
        .into_iter()
        .flatten()
    {
        if let Some(line) = translate_input(&mut current_channel, &input) {
            client.send_line(&line).await?;
        }
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let (reader, writer) = (&mut client.reader, &mut client.writer);
    let mut incoming = reader.lines();

    loop {
        tokio::select! {
            input = stdin.next_line() => {
                let Some(input) = input.map_err(ClientError::Input)? else {
                    debug!("Terminal input closed");
                    break;
                };
                match translate_input(&mut current_channel, &input) {
                    Some(line) => {
                        writer.write_all(line.as_bytes()).await.map_err(ClientError::Send)?;
                        writer.write_all(DELIMITER).await.map_err(ClientError::Send)?;
                    }
                    None if !input.trim().is_empty() => {
                        let note = "* join a channel first (/join #name)\n";
                        stdout.write_all(note.as_bytes()).await.map_err(ClientError::Input)?;
                    }
                    None => {}
                }
            }
            line = incoming.next_line() => {
                let Some(line) = line.map_err(ClientError::Receive)? else {
                    return Err(ClientError::ConnectionLost);
                };
                let line = line.trim_end_matches('\r');
                let text = format!("{}\n", describe_reply(line));
                stdout.write_all(text.as_bytes()).await.map_err(ClientError::Input)?;
                stdout.flush().await.map_err(ClientError::Input)?;
            }
        }
    }

    Ok(())
}
