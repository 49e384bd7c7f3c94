//! Daemon lifecycle.
//!
//! Startup order:
//! 1. Refuse to start if a daemon answers on the endpoint; a leftover
//!    endpoint from a crashed daemon is taken over by `listen`
//! 2. Start the change source on its own thread and wait until it is ready
//! 3. Serve queries until a client sends `quit`
//! 4. Stop the change source and join its thread

use crate::dispatcher::Dispatcher;
use crate::store::EventStore;
use crate::watcher::{ChangeSource, ReadySignal, StopToken, WatchError};
use fsmonitor_ipc::{IpcError, Transport};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;

/// Name of the change source thread.
pub const WATCHER_THREAD_NAME: &str = "fsmonitor-watcher";

/// Error type for running the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("fsmonitor daemon already running at {endpoint}")]
    AlreadyRunning { endpoint: PathBuf },

    #[error("could not start watcher thread: {0}")]
    WatcherSpawn(#[source] std::io::Error),

    #[error("watcher failed before it was ready: {reason}")]
    WatcherFailed { reason: String },

    #[error(transparent)]
    Ipc(IpcError),
}

impl From<IpcError> for DaemonError {
    fn from(error: IpcError) -> Self {
        match error {
            IpcError::AlreadyRunning { endpoint } => Self::AlreadyRunning { endpoint },
            other => Self::Ipc(other),
        }
    }
}

/// A daemon serving one store over one transport.
pub struct Daemon<T> {
    transport: T,
    store: Arc<EventStore>,
}

impl<T: Transport> Daemon<T> {
    pub fn new(transport: T) -> Self {
        Self::with_store(transport, Arc::new(EventStore::new()))
    }

    pub fn with_store(transport: T, store: Arc<EventStore>) -> Self {
        Self { transport, store }
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// Run until a client asks the daemon to quit.
    ///
    /// Dropping the returned future stops the change source too; its thread
    /// is then left to wind down on its own.
    pub async fn run<S: ChangeSource>(self, source: S) -> Result<(), DaemonError> {
        if self.transport.is_live().await {
            return Err(DaemonError::AlreadyRunning {
                endpoint: self.transport.endpoint().path().to_path_buf(),
            });
        }

        let stop = StopOnDrop(StopToken::new());
        let (ready, ready_rx) = ReadySignal::channel();
        let thread = {
            let store = Arc::clone(&self.store);
            let stop = stop.0.clone();
            std::thread::Builder::new()
                .name(WATCHER_THREAD_NAME.to_string())
                .spawn(move || source.run(store, ready, stop))
                .map_err(DaemonError::WatcherSpawn)?
        };

        if ready_rx.await.is_err() {
            stop.0.stop();
            let reason = match join_watcher(thread).await {
                Err(reason) => reason,
                Ok(()) => "watcher exited without signalling readiness".to_string(),
            };
            tracing::error!(%reason, "Watcher failed to start");
            return Err(DaemonError::WatcherFailed { reason });
        }
        tracing::info!(
            endpoint = %self.transport.endpoint(),
            "Watcher ready, accepting queries"
        );

        let mut dispatcher = Dispatcher::new(Arc::clone(&self.store));
        let result = self.transport.listen(&mut dispatcher).await;

        stop.0.stop();
        if let Err(reason) = join_watcher(thread).await {
            tracing::warn!(%reason, "Watcher ended with an error");
        }
        tracing::info!(events = self.store.len(), "Daemon stopped");

        result.map_err(DaemonError::from)
    }
}

/// Raises the stop token when the daemon future goes away.
struct StopOnDrop(StopToken);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.stop();
    }
}

async fn join_watcher(thread: JoinHandle<Result<(), WatchError>>) -> Result<(), String> {
    match tokio::task::spawn_blocking(move || thread.join()).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(e.to_string()),
        Ok(Err(_)) => Err("watcher thread panicked".to_string()),
        Err(e) => Err(e.to_string()),
    }
}
