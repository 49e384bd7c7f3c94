//! Windows named pipe backend.
//!
//! The pipe name is derived from the canonical endpoint path. A single pipe
//! instance serves every client in turn: connect, read one NUL-terminated
//! request, reply, flush, disconnect.

use crate::nul_frame::{self, FrameError, REQUEST_BUFFER_SIZE};
use crate::transport::{CommandHandler, Outcome, Transport, TransportOptions, run_handler};
use crate::{Endpoint, IpcError};
use std::ffi::OsStr;
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::windows::named_pipe::{
    ClientOptions, NamedPipeClient, NamedPipeServer, PipeMode, ServerOptions,
};
use tokio::time::timeout;
use windows_sys::Win32::Foundation::{
    ERROR_BROKEN_PIPE, ERROR_FILE_NOT_FOUND, ERROR_MORE_DATA, ERROR_PIPE_BUSY,
    ERROR_PIPE_NOT_CONNECTED,
};
use windows_sys::Win32::System::Pipes::WaitNamedPipeW;

/// Wait used by the liveness check, in milliseconds.
const EXISTS_TIMEOUT_MS: u32 = 1;

/// Pause between attempts to open a busy pipe.
const BUSY_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Named pipe transport bound to one endpoint.
#[derive(Debug, Clone)]
pub struct PipeTransport {
    endpoint: Endpoint,
    options: TransportOptions,
}

impl PipeTransport {
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_options(endpoint, TransportOptions::default())
    }

    pub fn with_options(endpoint: Endpoint, options: TransportOptions) -> Self {
        Self { endpoint, options }
    }

    async fn serve_client<H>(&self, server: &mut NamedPipeServer, handler: &mut H) -> Outcome
    where
        H: CommandHandler + Send,
    {
        let read = nul_frame::read_request(server, REQUEST_BUFFER_SIZE);
        let request = match timeout(self.options.request_timeout, read).await {
            Ok(Ok(Some(request))) => request,
            Ok(Ok(None)) => {
                tracing::trace!("Client closed without a command");
                return Outcome::Continue;
            }
            Ok(Err(FrameError::Io(e))) if is_disconnect(&e) => {
                tracing::trace!("Client disconnected before sending a command");
                return Outcome::Continue;
            }
            Ok(Err(FrameError::Io(e))) if e.raw_os_error() == Some(ERROR_MORE_DATA as i32) => {
                tracing::warn!(max = REQUEST_BUFFER_SIZE, "Client message too long");
                return Outcome::Continue;
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Could not read client request");
                return Outcome::Continue;
            }
            Err(_) => {
                tracing::debug!(
                    timeout = ?self.options.request_timeout,
                    "Client sent no request in time"
                );
                return Outcome::Continue;
            }
        };

        let (outcome, chunks) = run_handler(handler, &request, &self.endpoint);

        // A client that stops reading must not hold up everybody queued behind it.
        let deliver = async {
            for chunk in &chunks {
                nul_frame::write_terminated(&mut *server, chunk).await?;
            }
            Ok::<_, io::Error>(())
        };
        match timeout(self.options.request_timeout, deliver).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Client went away during reply"),
            Err(_) => tracing::warn!(
                timeout = ?self.options.request_timeout,
                "Client stopped reading its reply, dropping it"
            ),
        }

        outcome
    }

    fn open_client(&self, pipe_name: &str) -> io::Result<NamedPipeClient> {
        ClientOptions::new().pipe_mode(PipeMode::Byte).open(pipe_name)
    }
}

impl Transport for PipeTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn options(&self) -> &TransportOptions {
        &self.options
    }

    fn is_active(&self) -> bool {
        match self.endpoint.pipe_name() {
            Ok(name) => pipe_exists(&name),
            Err(_) => false,
        }
    }

    async fn is_live(&self) -> bool {
        // Pipes vanish with their server, so existence already means live.
        self.is_active()
    }

    async fn listen<H>(&self, handler: &mut H) -> Result<(), IpcError>
    where
        H: CommandHandler + Send,
    {
        let pipe_name = self.endpoint.pipe_name()?;
        if pipe_exists(&pipe_name) {
            return Err(IpcError::AlreadyRunning {
                endpoint: self.endpoint.path().to_path_buf(),
            });
        }

        let mut server = ServerOptions::new()
            .first_pipe_instance(true)
            .pipe_mode(PipeMode::Message)
            .in_buffer_size(REQUEST_BUFFER_SIZE as u32)
            .out_buffer_size(REQUEST_BUFFER_SIZE as u32)
            .create(&pipe_name)
            .map_err(|source| IpcError::Bind {
                endpoint: self.endpoint.path().to_path_buf(),
                source,
            })?;
        tracing::info!(pipe = %pipe_name, "Listening for commands");

        loop {
            if let Err(e) = server.connect().await {
                tracing::warn!(error = %e, "Could not connect to client");
                let _ = server.disconnect();
                continue;
            }

            let outcome = self.serve_client(&mut server, handler).await;

            let _ = server.flush().await;
            if let Err(e) = server.disconnect() {
                tracing::debug!(error = %e, "Disconnect failed");
            }

            if outcome == Outcome::Quit {
                tracing::info!(pipe = %pipe_name, "Quit requested, no longer listening");
                break;
            }
        }

        Ok(())
    }

    async fn send_command(
        &self,
        message: &[u8],
        wait: Option<Duration>,
    ) -> Result<Vec<u8>, IpcError> {
        let path = self.endpoint.path();
        let pipe_name = self.endpoint.pipe_name()?;
        tracing::debug!(
            pipe = %pipe_name,
            message = %String::from_utf8_lossy(message),
            "Sending command"
        );

        if message.len() + 1 > REQUEST_BUFFER_SIZE {
            return Err(IpcError::MessageTooLong {
                endpoint: path.to_path_buf(),
                len: message.len(),
                max: REQUEST_BUFFER_SIZE - 1,
            });
        }

        let deadline = Instant::now() + self.options.connect_timeout;
        let mut client = loop {
            match self.open_client(&pipe_name) {
                Ok(client) => break client,
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY as i32) => {
                    if Instant::now() >= deadline {
                        return Err(IpcError::Timeout {
                            endpoint: path.to_path_buf(),
                            after: self.options.connect_timeout,
                        });
                    }
                    tokio::time::sleep(BUSY_RETRY_INTERVAL).await;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(IpcError::NotListening {
                        endpoint: path.to_path_buf(),
                        source: e,
                    });
                }
                Err(e) => return Err(IpcError::io(path, e)),
            }
        };

        nul_frame::write_terminated(&mut client, message)
            .await
            .map_err(|e| IpcError::io(path, e))?;
        client.flush().await.map_err(|e| IpcError::io(path, e))?;

        let Some(wait) = wait else {
            return Ok(Vec::new());
        };

        let answer = timeout(wait, nul_frame::read_reply(&mut client, is_disconnect))
            .await
            .map_err(|_| IpcError::Timeout {
                endpoint: path.to_path_buf(),
                after: wait,
            })?
            .map_err(|e| IpcError::io(path, e))?;

        tracing::debug!(pipe = %pipe_name, bytes = answer.len(), "Received reply");
        Ok(answer)
    }
}

/// Whether a pipe with this name currently exists.
///
/// `WaitNamedPipeW` does not connect, so the server never sees the check.
fn pipe_exists(pipe_name: &str) -> bool {
    let wide: Vec<u16> = OsStr::new(pipe_name)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();
    // SAFETY: `wide` is NUL-terminated and outlives the call.
    let available = unsafe { WaitNamedPipeW(wide.as_ptr(), EXISTS_TIMEOUT_MS) } != 0;
    available || io::Error::last_os_error().raw_os_error() != Some(ERROR_FILE_NOT_FOUND as i32)
}

fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(code) if code == ERROR_BROKEN_PIPE as i32 || code == ERROR_PIPE_NOT_CONNECTED as i32
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ReplyWriter;

    const WAIT: Option<Duration> = Some(Duration::from_secs(2));

    fn echo(request: &[u8], reply: &mut dyn ReplyWriter) -> Result<Outcome, String> {
        if request == b"quit" {
            return Ok(Outcome::Quit);
        }
        reply.write(request).map_err(|e| e.to_string())?;
        Ok(Outcome::Continue)
    }

    #[tokio::test]
    async fn test_pipe_round_trip_and_quit() {
        let dir = tempfile::tempdir().unwrap();
        let server = PipeTransport::new(Endpoint::new(dir.path().join("fsmonitor.ipc")));
        let client = server.clone();
        assert!(!client.is_active());

        let task = tokio::spawn(async move {
            let mut handler = echo;
            server.listen(&mut handler).await
        });

        let start = Instant::now();
        while !client.is_active() {
            assert!(start.elapsed() < Duration::from_secs(2));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(client.send_command(b"1 42", WAIT).await.unwrap(), b"1 42\0");
        client.send_command(b"quit", WAIT).await.unwrap();
        task.await.unwrap().unwrap();
        assert!(!client.is_active());
    }

    #[tokio::test]
    async fn test_pipe_client_that_stops_reading_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let options = TransportOptions {
            request_timeout: Duration::from_millis(200),
            ..TransportOptions::default()
        };
        let server =
            PipeTransport::with_options(Endpoint::new(dir.path().join("fsmonitor.ipc")), options);
        let client = server.clone();

        let task = tokio::spawn(async move {
            let mut handler =
                |request: &[u8], reply: &mut dyn ReplyWriter| -> Result<Outcome, String> {
                    if request == b"flood" {
                        let path = [b'x'; 95];
                        for _ in 0..30_000 {
                            reply.write(&path).map_err(|e| e.to_string())?;
                        }
                        return Ok(Outcome::Continue);
                    }
                    echo(request, reply)
                };
            server.listen(&mut handler).await
        });

        let start = Instant::now();
        while !client.is_active() {
            assert!(start.elapsed() < Duration::from_secs(2));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Ask for the big reply, then never read it.
        let pipe_name = client.endpoint().pipe_name().unwrap();
        let mut stalled = client.open_client(&pipe_name).unwrap();
        nul_frame::write_terminated(&mut stalled, b"flood").await.unwrap();

        assert_eq!(client.send_command(b"after", WAIT).await.unwrap(), b"after\0");

        drop(stalled);
        client.send_command(b"quit", WAIT).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pipe_not_listening() {
        let dir = tempfile::tempdir().unwrap();
        let client = PipeTransport::new(Endpoint::new(dir.path().join("nobody.ipc")));
        let err = client.send_command(b"1 1", WAIT).await.unwrap_err();
        assert!(err.is_not_listening(), "unexpected error: {err}");
    }
}
