//! Error types for the IPC transports.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Error type for transport operations.
///
/// Every variant names the endpoint so callers can tell "nobody is
/// listening" apart from "listening but slow" and "answered garbage".
#[derive(Debug, Error)]
pub enum IpcError {
    /// Another live server already owns the endpoint.
    #[error("server already running at {endpoint}")]
    AlreadyRunning { endpoint: PathBuf },

    /// The endpoint could not be created or bound.
    #[error("could not set up endpoint {endpoint}: {source}")]
    Bind {
        endpoint: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The endpoint path could not be turned into a platform address.
    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: PathBuf, reason: String },

    /// Nothing is listening at the endpoint.
    #[error("no server listening at {endpoint}: {source}")]
    NotListening {
        endpoint: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The server did not answer within the allowed window.
    #[error("timed out after {after:?} waiting for {endpoint}")]
    Timeout { endpoint: PathBuf, after: Duration },

    /// The peer sent bytes that do not follow the framing.
    #[error("malformed message from {endpoint}: {reason}")]
    Malformed { endpoint: PathBuf, reason: String },

    /// A request exceeded what the transport can carry in one message.
    #[error("message for {endpoint} too long ({len} bytes, max {max})")]
    MessageTooLong {
        endpoint: PathBuf,
        len: usize,
        max: usize,
    },

    /// Any other I/O failure while talking to the endpoint.
    #[error("io error on {endpoint}: {source}")]
    Io {
        endpoint: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl IpcError {
    pub(crate) fn io(endpoint: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// Whether the error means no server is reachable at all.
    #[must_use]
    pub fn is_not_listening(&self) -> bool {
        matches!(self, Self::NotListening { .. })
    }

    /// Whether the error is a timeout while waiting on a live server.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
