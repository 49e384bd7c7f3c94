//! Unix domain socket backend.
//!
//! The endpoint path is the bind address. Requests and replies are pkt-line
//! framed; every reply chunk travels as its own packet and the server closes
//! the connection when the reply is complete.

use crate::pkt_line::{self, Packet, PacketError};
use crate::transport::{CommandHandler, Outcome, Transport, TransportOptions, run_handler};
use crate::{Endpoint, IpcError};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;

/// Largest request payload the server reads.
pub const MAX_REQUEST_SIZE: usize = 4096;

/// Socket transport bound to one endpoint.
#[derive(Debug, Clone)]
pub struct SocketTransport {
    endpoint: Endpoint,
    options: TransportOptions,
}

impl SocketTransport {
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_options(endpoint, TransportOptions::default())
    }

    pub fn with_options(endpoint: Endpoint, options: TransportOptions) -> Self {
        Self { endpoint, options }
    }

    /// Bind the endpoint, taking over a stale socket if nobody answers on it.
    ///
    /// The check for a stale socket, its removal and the bind all happen
    /// under a lock on the socket's directory, so two servers starting at
    /// once cannot unlink each other's socket.
    async fn bind(&self) -> Result<(UnixListener, SocketGuard), IpcError> {
        let path = self.endpoint.path();
        let bind_error = |source: io::Error| IpcError::Bind {
            endpoint: path.to_path_buf(),
            source,
        };

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        if !dir.exists() {
            std::fs::create_dir_all(dir).map_err(bind_error)?;
        }
        let _lock = DirLock::acquire(dir.to_path_buf()).await.map_err(bind_error)?;

        if is_socket(path) {
            match UnixStream::connect(path).await {
                Ok(_) => {
                    return Err(IpcError::AlreadyRunning {
                        endpoint: path.to_path_buf(),
                    });
                }
                Err(e) => {
                    tracing::debug!(
                        socket = %path.display(),
                        error = %e,
                        "Removing stale socket"
                    );
                    std::fs::remove_file(path).map_err(bind_error)?;
                }
            }
        }

        let listener = UnixListener::bind(path).map_err(bind_error)?;
        Ok((
            listener,
            SocketGuard {
                path: path.to_path_buf(),
            },
        ))
    }

    /// Read one request from a connected client, dispatch it and reply.
    async fn serve_client<H>(&self, mut stream: UnixStream, handler: &mut H) -> Outcome
    where
        H: CommandHandler + Send,
    {
        let read = pkt_line::read_packet(&mut stream, MAX_REQUEST_SIZE);
        let request = match timeout(self.options.request_timeout, read).await {
            Ok(Ok(Packet::Data(request))) if !request.is_empty() => request,
            Ok(Ok(_)) => {
                // Nothing sent: a liveness check or a client that gave up.
                tracing::trace!("Client closed without a command");
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
                pkt_line::write_packet(&mut stream, chunk).await?;
            }
            Ok::<_, PacketError>(())
        };
        match timeout(self.options.request_timeout, deliver).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Client went away during reply"),
            Err(_) => tracing::warn!(
                timeout = ?self.options.request_timeout,
                "Client stopped reading its reply, dropping it"
            ),
        }
        let _ = stream.shutdown().await;

        outcome
    }

    fn map_packet_error(&self, error: PacketError) -> IpcError {
        match error {
            PacketError::Io(source) => IpcError::io(self.endpoint.path(), source),
            other => IpcError::Malformed {
                endpoint: self.endpoint.path().to_path_buf(),
                reason: other.to_string(),
            },
        }
    }
}

impl Transport for SocketTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn options(&self) -> &TransportOptions {
        &self.options
    }

    fn is_active(&self) -> bool {
        is_socket(self.endpoint.path())
    }

    async fn is_live(&self) -> bool {
        let path = self.endpoint.path();
        is_socket(path) && UnixStream::connect(path).await.is_ok()
    }

    async fn listen<H>(&self, handler: &mut H) -> Result<(), IpcError>
    where
        H: CommandHandler + Send,
    {
        let (listener, _guard) = self.bind().await?;
        tracing::info!(socket = %self.endpoint, "Listening for commands");

        loop {
            let stream = match timeout(self.options.listen_timeout, listener.accept()).await {
                Ok(Ok((stream, _addr))) => stream,
                Ok(Err(e)) => {
                    // Most likely the peer dropped the connection already.
                    tracing::debug!(error = %e, "Accept failed");
                    continue;
                }
                Err(_) => continue,
            };

            if self.serve_client(stream, handler).await == Outcome::Quit {
                tracing::info!(socket = %self.endpoint, "Quit requested, no longer listening");
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
        tracing::debug!(
            socket = %self.endpoint,
            message = %String::from_utf8_lossy(message),
            "Sending command"
        );

        if message.len() > MAX_REQUEST_SIZE {
            return Err(IpcError::MessageTooLong {
                endpoint: path.to_path_buf(),
                len: message.len(),
                max: MAX_REQUEST_SIZE,
            });
        }

        let mut stream = UnixStream::connect(path)
            .await
            .map_err(|e| classify_connect_error(path, e))?;

        let _sigpipe = SigpipeGuard::ignore();

        pkt_line::write_packet(&mut stream, message)
            .await
            .map_err(|e| self.map_packet_error(e))?;

        let Some(wait) = wait else {
            return Ok(Vec::new());
        };

        let mut answer = Vec::new();
        loop {
            let read = pkt_line::read_packet(&mut stream, pkt_line::MAX_PAYLOAD);
            let packet = timeout(wait, read)
                .await
                .map_err(|_| IpcError::Timeout {
                    endpoint: path.to_path_buf(),
                    after: wait,
                })?
                .map_err(|e| self.map_packet_error(e))?;

            match packet {
                Packet::Data(chunk) => {
                    answer.extend_from_slice(&chunk);
                    answer.push(0);
                }
                Packet::Flush | Packet::Eof => break,
            }
        }

        tracing::debug!(socket = %self.endpoint, bytes = answer.len(), "Received reply");
        Ok(answer)
    }
}

/// Whether `path` exists and is a socket.
pub fn is_socket(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_socket())
        .unwrap_or(false)
}

fn classify_connect_error(path: &Path, error: io::Error) -> IpcError {
    match error.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => IpcError::NotListening {
            endpoint: path.to_path_buf(),
            source: error,
        },
        _ => IpcError::io(path, error),
    }
}

/// Removes the socket file when the listener goes away.
struct SocketGuard {
    path: PathBuf,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        if is_socket(&self.path) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Exclusive `flock` on a directory, released when dropped.
struct DirLock {
    _dir: File,
}

impl DirLock {
    async fn acquire(dir: PathBuf) -> io::Result<Self> {
        tokio::task::spawn_blocking(move || {
            let dir = File::open(&dir)?;
            // SAFETY: the descriptor belongs to `dir`, which is open for the call.
            if unsafe { libc::flock(dir.as_raw_fd(), libc::LOCK_EX) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { _dir: dir })
        })
        .await
        .map_err(io::Error::other)?
    }
}

/// SIGPIPE disposition shared by every live [`SigpipeGuard`].
struct SigpipeState {
    guards: usize,
    previous: libc::sighandler_t,
}

static SIGPIPE: Mutex<SigpipeState> = Mutex::new(SigpipeState {
    guards: 0,
    previous: libc::SIG_DFL,
});

fn sigpipe_state() -> MutexGuard<'static, SigpipeState> {
    SIGPIPE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ignores SIGPIPE while any guard is alive.
///
/// A server that hangs up mid-exchange then shows up as an `EPIPE` write
/// error instead of killing the client. The disposition is process-wide, so
/// guards are counted and the last one restores what was installed before
/// the first. Rust binaries ignore SIGPIPE already; this matters when the
/// crate is embedded in a host that does not.
struct SigpipeGuard;

impl SigpipeGuard {
    fn ignore() -> Self {
        let mut state = sigpipe_state();
        if state.guards == 0 {
            // SAFETY: SIG_IGN installs no handler code.
            state.previous = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
        }
        state.guards += 1;
        Self
    }
}

impl Drop for SigpipeGuard {
    fn drop(&mut self) {
        let mut state = sigpipe_state();
        state.guards -= 1;
        if state.guards == 0 && state.previous != libc::SIG_ERR {
            // SAFETY: restores the disposition that was installed before the first guard.
            unsafe {
                libc::signal(libc::SIGPIPE, state.previous);
            }
        }
    }
}
