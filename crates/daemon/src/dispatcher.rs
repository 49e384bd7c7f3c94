//! Command dispatcher: answers fsmonitor queries from the event store.

use crate::query::{QueryError, RESCAN, Request};
use crate::store::EventStore;
use fsmonitor_ipc::{CommandHandler, Outcome, ReplyWriter};
use std::sync::Arc;

/// Handles one client request at a time against a shared store.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    store: Arc<EventStore>,
}

impl Dispatcher {
    pub fn new(store: Arc<EventStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }
}

impl CommandHandler for Dispatcher {
    type Error = QueryError;

    fn handle(
        &mut self,
        request: &[u8],
        reply: &mut dyn ReplyWriter,
    ) -> Result<Outcome, QueryError> {
        let query = match Request::parse(request) {
            Ok(Request::Quit) => {
                tracing::info!("Received quit request");
                return Ok(Outcome::Quit);
            }
            Ok(Request::Query(query)) => query,
            Err(e) => {
                // The client learns nothing but "rescan"; the reason goes to the log.
                let _ = reply.write(RESCAN.as_bytes());
                return Err(e);
            }
        };

        // Snapshot under the lock; the lock is released before any reply is written.
        let changed = self.store.changed_since(query.since);
        tracing::debug!(since = query.since, paths = changed.len(), "Answering query");

        for path in &changed {
            if let Err(e) = reply.write(path.as_bytes()) {
                tracing::debug!(error = %e, "Stopped replying");
                break;
            }
        }

        Ok(Outcome::Continue)
    }
}
