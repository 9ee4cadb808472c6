//! Test harness for relay scenarios.
//!
//! Runs a [`Server`] on an ephemeral port in a background thread and hands
//! out line-oriented clients:
//!
//! ```ignore
//! let harness = TestHarness::start()?;
//! let mut alice = harness.connect().await?;
//!
//! alice.send("NICK alice").await?;
//! alice.send("JOIN #general").await?;
//! alice.send("PRVMSG #general hi").await?;
//! assert_eq!(alice.expect_line().await?, "PRVMSG #general hi");
//! ```

use crate::client::{Client, ClientError};
use crate::server::{RelayOptions, Server, ServerConfig, ServerError, ShutdownHandle};
use std::net::SocketAddr;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

/// How long [`TestClient::expect_line`] waits by default.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Channel name the sync barrier parts from. Tests must not join it.
const SYNC_CHANNEL: &str = "#__sync";

/// Errors from the test harness.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("timeout waiting for server")]
    Timeout,

    #[error("server closed the connection")]
    ConnectionClosed,

    #[error("unexpected line: {0}")]
    Unexpected(String),

    #[error("failed to start server: {0}")]
    Start(#[source] ServerError),

    #[error("server thread panicked")]
    Panicked,

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Owns a running server for the duration of a test.
pub struct TestHarness {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    thread: Option<JoinHandle<Result<(), ServerError>>>,
}

impl TestHarness {
    /// Start a server with default relay options.
    pub fn start() -> Result<Self, TestError> {
        Self::with_options(RelayOptions::default())
    }

    /// Start a server with the given relay options.
    pub fn with_options(relay: RelayOptions) -> Result<Self, TestError> {
        let config = ServerConfig {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            poll_timeout: Duration::from_millis(50),
            relay,
        };
        let mut server = Server::bind(config).map_err(TestError::Start)?;
        let addr = server.local_addr().map_err(TestError::Start)?;
        let shutdown = server.shutdown_handle();
        let thread = std::thread::spawn(move || server.run());

        Ok(Self {
            addr,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Address the server listens on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Open a new client connection.
    pub async fn connect(&self) -> Result<TestClient, TestError> {
        let client = Client::connect(self.addr).await?;
        Ok(TestClient { client })
    }

    /// Stop the server and wait for its thread.
    pub fn shutdown(mut self) -> Result<(), TestError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), TestError> {
        self.shutdown.shutdown();
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| TestError::Panicked)?
                .map_err(TestError::Start),
            None => Ok(()),
        }
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        // Best effort cleanup
        let _ = self.stop();
    }
}

/// A connected test client.
pub struct TestClient {
    client: Client,
}

impl TestClient {
    /// Send one protocol line.
    pub async fn send(&mut self, line: &str) -> Result<(), TestError> {
        Ok(self.client.send_line(line).await?)
    }

    /// Send raw bytes, for framing tests.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), TestError> {
        Ok(self.client.send_raw(bytes).await?)
    }

    /// Register a nick and wait until the server has processed it.
    pub async fn register(&mut self, nick: &str) -> Result<(), TestError> {
        self.send(&format!("NICK {nick}")).await?;
        self.sync().await
    }

    /// Wait for the next line, up to [`DEFAULT_TIMEOUT`].
    pub async fn expect_line(&mut self) -> Result<String, TestError> {
        self.expect_line_within(DEFAULT_TIMEOUT).await
    }

    /// Wait up to `limit` for the next line.
    pub async fn expect_line_within(&mut self, limit: Duration) -> Result<String, TestError> {
        match timeout(limit, self.client.recv_line()).await {
            Ok(Ok(Some(line))) => Ok(line),
            Ok(Ok(None)) => Err(TestError::ConnectionClosed),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TestError::Timeout),
        }
    }

    /// Assert that nothing arrives for `window`.
    pub async fn expect_silence(&mut self, window: Duration) -> Result<(), TestError> {
        match self.expect_line_within(window).await {
            Err(TestError::Timeout) => Ok(()),
            Ok(line) => Err(TestError::Unexpected(line)),
            Err(e) => Err(e),
        }
    }

    /// Wait until the server has processed every line sent so far.
    ///
    /// Parts a channel this client never joined; the server answers with
    /// `ERROR 2` once it reaches that line. Only works after registration.
    pub async fn sync(&mut self) -> Result<(), TestError> {
        self.send(&format!("PART {SYNC_CHANNEL}")).await?;
        let line = self.expect_line().await?;
        if line == "ERROR 2" {
            Ok(())
        } else {
            Err(TestError::Unexpected(line))
        }
    }

    /// Wait for the server to close this connection.
    pub async fn expect_closed(&mut self) -> Result<(), TestError> {
        loop {
            match self.expect_line().await {
                Err(TestError::ConnectionClosed) => return Ok(()),
                Err(TestError::Client(ClientError::Receive(_) | ClientError::ConnectionLost)) => {
                    return Ok(());
                }
                Err(e) => return Err(e),
                Ok(_) => {}
            }
        }
    }

    /// Close the sending side, as a client that hangs up would.
    pub async fn hang_up(mut self) -> Result<(), TestError> {
        Ok(self.client.close().await?)
    }
}
