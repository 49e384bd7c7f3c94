//! fsmonitord - a filesystem-change daemon answering "what changed since T" queries.
//!
//! This crate provides:
//! - [`EventStore`], the in-memory log of path changes
//! - [`Dispatcher`], the fsmonitor query protocol over any IPC transport
//! - [`Daemon`], which ties a change source, the store and a transport together
//! - [`client`] helpers for short-lived processes asking the daemon
//!
//! # Example
//!
//! ```no_run
//! use fsmonitor_ipc::{Endpoint, NativeTransport};
//! use fsmonitord::{Daemon, NotifyWatcher};
//!
//! # async fn run() -> Result<(), fsmonitord::DaemonError> {
//! let transport = NativeTransport::new(Endpoint::for_worktree(std::path::Path::new(".")));
//! let watcher = NotifyWatcher::new(".").with_ignore(vec![".git".to_string()]);
//! Daemon::new(transport).run(watcher).await
//! # }
//! ```

pub mod client;
pub mod config;
pub mod daemon;
pub mod dispatcher;
pub mod query;
pub mod store;
pub mod watcher;

pub use client::ClientError;
pub use config::Config;
pub use daemon::{Daemon, DaemonError};
pub use dispatcher::Dispatcher;
pub use query::{PROTOCOL_VERSION, Query, QueryError, QueryReply};
pub use store::{EventStore, QueueEvent};
pub use watcher::{ChangeSource, NotifyWatcher, ReadySignal, StopToken, WatchError, now_nanos};
