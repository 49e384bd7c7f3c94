//! One-shot client operations against a running daemon.

use crate::query::{QUIT_COMMAND, Query, QueryReply};
use fsmonitor_ipc::{IpcError, Transport};
use thiserror::Error;

/// Error type for client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error("malformed reply from daemon: {0}")]
    Malformed(String),
}

impl ClientError {
    /// Whether no daemon is listening at all.
    pub fn is_not_running(&self) -> bool {
        matches!(self, Self::Ipc(e) if e.is_not_listening())
    }
}

/// Whether a daemon currently owns the transport's endpoint.
pub fn is_running<T: Transport>(transport: &T) -> bool {
    transport.is_active()
}

/// Ask for the paths changed at or after `since`.
pub async fn query_changes<T: Transport>(
    transport: &T,
    since: u64,
) -> Result<QueryReply, ClientError> {
    send_query(transport, Query::new(since)).await
}

/// Send an arbitrary query, including ones with a foreign protocol version.
pub async fn send_query<T: Transport>(
    transport: &T,
    query: Query,
) -> Result<QueryReply, ClientError> {
    let wait = transport.options().response_timeout;
    let reply = transport.send_command(&query.to_bytes(), Some(wait)).await?;

    if let Err(e) = std::str::from_utf8(&reply) {
        return Err(ClientError::Malformed(format!("reply is not UTF-8: {e}")));
    }

    let reply = QueryReply::parse(&reply);
    tracing::debug!(since = query.since, ?reply, "Query answered");
    Ok(reply)
}

/// Ask the daemon to stop, waiting until it closed the connection.
pub async fn request_quit<T: Transport>(transport: &T) -> Result<(), ClientError> {
    let wait = transport.options().response_timeout;
    let reply = transport.send_command(QUIT_COMMAND, Some(wait)).await?;
    if !reply.is_empty() {
        tracing::debug!(bytes = reply.len(), "Unexpected reply to quit");
    }
    Ok(())
}
