//! fsmonitor IPC - local request/response transport between a daemon and its clients.
//!
//! This crate provides:
//! - [`Transport`], the backend-neutral contract: serve one client at a time,
//!   send one request and collect its reply, check whether a server is alive
//! - [`SocketTransport`] on Unix, speaking pkt-line over a Unix domain socket
//! - [`PipeTransport`] on Windows, speaking NUL-terminated messages over a
//!   named pipe
//! - [`Endpoint`] for deriving the published address from a worktree
//!
//! # Example
//!
//! ```no_run
//! use fsmonitor_ipc::{Endpoint, NativeTransport, Transport};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), fsmonitor_ipc::IpcError> {
//! let transport = NativeTransport::new(Endpoint::new("/tmp/repo/.git/fsmonitor--daemon.ipc"));
//! if transport.is_active() {
//!     let reply = transport.send_command(b"1 0", Some(Duration::from_secs(1))).await?;
//!     for path in fsmonitor_ipc::split_reply(&reply) {
//!         println!("{}", String::from_utf8_lossy(path));
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod endpoint;
mod error;
pub mod nul_frame;
pub mod pkt_line;
mod transport;

#[cfg(windows)]
mod pipe;
#[cfg(unix)]
mod socket;

pub use endpoint::{
    ENDPOINT_ENV_VAR, ENDPOINT_FILE_NAME, Endpoint, PIPE_PREFIX, pipe_name_from_canonical,
};
pub use error::IpcError;
pub use transport::{
    CommandHandler, DEFAULT_CONNECT_TIMEOUT, DEFAULT_LISTEN_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_RESPONSE_TIMEOUT, Outcome, ReplyBuffer, ReplyWriter, Transport, TransportOptions,
    split_reply,
};

#[cfg(windows)]
pub use pipe::PipeTransport;
#[cfg(unix)]
pub use socket::{SocketTransport, is_socket};

/// The backend for the current platform.
#[cfg(unix)]
pub type NativeTransport = SocketTransport;

/// The backend for the current platform.
#[cfg(windows)]
pub type NativeTransport = PipeTransport;

/// Whether this build has a transport backend at all.
pub const HAS_NATIVE_TRANSPORT: bool = cfg!(any(unix, windows));
