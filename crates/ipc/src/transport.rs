//! The transport contract shared by both backends.
//!
//! A backend owns the listening endpoint and serves one client at a time: it
//! reads one request, hands it to a [`CommandHandler`], and delivers whatever
//! the handler wrote to its [`ReplyWriter`]. Handlers never see the
//! connection itself, so the same handler runs unchanged on every platform.

use crate::{Endpoint, IpcError};
use std::fmt::Display;
use std::future::Future;
use std::io;
use std::time::Duration;

/// How long the accept loop waits before re-arming.
pub const DEFAULT_LISTEN_TIMEOUT: Duration = Duration::from_secs(50);

/// How long the server waits for a connected client to send its request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a client waits for each part of a reply.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a client keeps retrying a busy endpoint.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// What the accept loop should do after a request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Keep serving clients.
    Continue,
    /// Close this connection and stop listening.
    Quit,
}

/// Sink for reply chunks.
///
/// Each chunk becomes one packet on the socket backend and one NUL-terminated
/// write on the pipe backend.
pub trait ReplyWriter {
    fn write(&mut self, chunk: &[u8]) -> io::Result<()>;
}

/// Business logic invoked once per request.
pub trait CommandHandler {
    type Error: Display;

    fn handle(&mut self, request: &[u8], reply: &mut dyn ReplyWriter)
    -> Result<Outcome, Self::Error>;
}

impl<F, E> CommandHandler for F
where
    F: FnMut(&[u8], &mut dyn ReplyWriter) -> Result<Outcome, E>,
    E: Display,
{
    type Error = E;

    fn handle(
        &mut self,
        request: &[u8],
        reply: &mut dyn ReplyWriter,
    ) -> Result<Outcome, Self::Error> {
        self(request, reply)
    }
}

/// Collects reply chunks while the handler runs.
///
/// Backends deliver the chunks after the handler returned, which keeps any
/// lock the handler took out of the network write path.
#[derive(Debug, Default)]
pub struct ReplyBuffer {
    chunks: Vec<Vec<u8>>,
}

impl ReplyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }

    pub fn into_chunks(self) -> Vec<Vec<u8>> {
        self.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl ReplyWriter for ReplyBuffer {
    fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.chunks.push(chunk.to_vec());
        Ok(())
    }
}

/// Timeouts used by the backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    pub listen_timeout: Duration,
    pub request_timeout: Duration,
    pub response_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            listen_timeout: DEFAULT_LISTEN_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// A local IPC backend.
pub trait Transport: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    fn options(&self) -> &TransportOptions;

    /// Whether a server currently owns the endpoint.
    ///
    /// Never opens a connection the server would have to serve.
    fn is_active(&self) -> bool;

    /// Whether a server answers on the endpoint.
    ///
    /// Unlike [`Transport::is_active`] this may connect, so a live server sees
    /// an empty connection. Meant for refusing to start a second server; a
    /// leftover endpoint nobody answers on is not live.
    fn is_live(&self) -> impl Future<Output = bool> + Send;

    /// Serve clients one at a time until the handler returns [`Outcome::Quit`].
    ///
    /// Fails up front with [`IpcError::AlreadyRunning`] or [`IpcError::Bind`].
    /// Errors of individual clients or of the handler are logged and the loop
    /// moves on to the next client.
    fn listen<H>(&self, handler: &mut H) -> impl Future<Output = Result<(), IpcError>> + Send
    where
        H: CommandHandler + Send;

    /// Send one request and, when `wait` is set, collect the reply.
    ///
    /// The reply is returned as chunks each followed by a NUL byte. A server
    /// that closes without answering yields an empty reply.
    fn send_command(
        &self,
        message: &[u8],
        wait: Option<Duration>,
    ) -> impl Future<Output = Result<Vec<u8>, IpcError>> + Send;
}

/// Run the handler for one request and collect its reply.
///
/// Handler errors are logged; the client still gets whatever was written.
pub(crate) fn run_handler<H>(
    handler: &mut H,
    request: &[u8],
    endpoint: &Endpoint,
) -> (Outcome, Vec<Vec<u8>>)
where
    H: CommandHandler,
{
    let mut reply = ReplyBuffer::new();
    let outcome = match handler.handle(request, &mut reply) {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(
                endpoint = %endpoint,
                request = %String::from_utf8_lossy(request),
                error = %e,
                "Could not handle client"
            );
            Outcome::Continue
        }
    };
    (outcome, reply.into_chunks())
}

/// Split a reply returned by [`Transport::send_command`] into its chunks.
pub fn split_reply(reply: &[u8]) -> Vec<&[u8]> {
    let mut chunks: Vec<&[u8]> = reply.split(|&b| b == 0).collect();
    if chunks.last().is_some_and(|last| last.is_empty()) {
        chunks.pop();
    }
    chunks
}
