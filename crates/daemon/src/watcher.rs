//! Filesystem watcher feeding the event store.
//!
//! Uses the `notify` crate: the platform's recommended backend by default,
//! or `PollWatcher` when a poll interval is configured (network filesystems
//! where native events do not arrive).

use crate::store::EventStore;
use notify::{
    Config, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher,
    event::{AccessKind, AccessMode, MetadataKind, ModifyKind},
};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::oneshot;

/// How often the watcher loop checks its stop token.
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Error type for change sources.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("cannot watch {path}: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("watcher error: {0}")]
    Notify(#[from] notify::Error),
}

/// Anything that produces path changes into an [`EventStore`].
///
/// `run` is called on a dedicated thread. It must call
/// [`ReadySignal::signal`] once it is watching, then keep inserting until
/// the stop token is raised.
pub trait ChangeSource: Send + 'static {
    fn run(
        self,
        store: Arc<EventStore>,
        ready: ReadySignal,
        stop: StopToken,
    ) -> Result<(), WatchError>;
}

/// One-shot "watcher is ready" notification.
///
/// Consumed by [`ReadySignal::signal`], so it fires at most once. Dropping it
/// unsignalled tells the waiting side that startup failed.
#[derive(Debug)]
pub struct ReadySignal {
    tx: oneshot::Sender<()>,
}

impl ReadySignal {
    pub fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn signal(self) {
        // The receiver is gone only if the daemon already gave up.
        let _ = self.tx.send(());
    }
}

/// Cooperative stop flag shared between the daemon and its watcher.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Current time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Whether a notify event describes a change to file contents or layout.
fn is_change(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) | EventKind::Remove(_) => true,
        EventKind::Modify(modify_kind) => {
            !matches!(modify_kind, ModifyKind::Metadata(MetadataKind::AccessTime))
        }
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        EventKind::Access(_) => false,
        EventKind::Other => false,
        EventKind::Any => true,
    }
}

/// `path` relative to `root`, `/`-separated. `None` outside the root or for
/// the root itself.
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Change source backed by `notify`.
#[derive(Debug, Clone)]
pub struct NotifyWatcher {
    /// Worktree root
    root: PathBuf,
    /// Use polling at this interval instead of native events
    poll_interval: Option<Duration>,
    /// Top-level path components whose events are dropped
    ignore: Vec<String>,
}

impl NotifyWatcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            poll_interval: None,
            ignore: Vec::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_ignore(mut self, ignore: Vec<String>) -> Self {
        self.ignore = ignore;
        self
    }

    fn is_ignored(&self, relative: &str) -> bool {
        let top = relative.split('/').next().unwrap_or(relative);
        self.ignore.iter().any(|ignored| ignored == top)
    }

    fn record(&self, root: &Path, store: &EventStore, event: notify::Event) {
        if !is_change(&event.kind) {
            return;
        }

        let time = now_nanos();
        for path in &event.paths {
            let Some(relative) = relative_path(root, path) else {
                tracing::trace!(path = %path.display(), "Event outside worktree");
                continue;
            };
            if self.is_ignored(&relative) {
                continue;
            }
            store.insert(&relative, time);
            tracing::trace!(path = %relative, kind = ?event.kind, "Recorded change");
        }
    }
}

impl ChangeSource for NotifyWatcher {
    fn run(
        self,
        store: Arc<EventStore>,
        ready: ReadySignal,
        stop: StopToken,
    ) -> Result<(), WatchError> {
        let root = self.root.canonicalize().map_err(|source| WatchError::Root {
            path: self.root.clone(),
            source,
        })?;

        let (event_tx, event_rx) = mpsc::channel::<notify::Result<notify::Event>>();
        let mut watcher: Box<dyn Watcher> = match self.poll_interval {
            Some(interval) => {
                let config = Config::default()
                    .with_poll_interval(interval)
                    .with_compare_contents(false); // Use mtime, not content hashing
                Box::new(PollWatcher::new(event_tx, config)?)
            }
            None => Box::new(RecommendedWatcher::new(event_tx, Config::default())?),
        };
        watcher.watch(&root, RecursiveMode::Recursive)?;

        tracing::info!(
            root = %root.display(),
            poll_interval = ?self.poll_interval,
            "Watching worktree"
        );
        ready.signal();

        while !stop.is_stopped() {
            match event_rx.recv_timeout(STOP_CHECK_INTERVAL) {
                Ok(Ok(event)) => self.record(&root, &store, event),
                Ok(Err(e)) => tracing::warn!(error = %e, "Watch error"),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::warn!("Watcher backend went away");
                    break;
                }
            }
        }

        tracing::info!("Watcher stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind, RenameMode};
    use std::time::Instant;

    #[test]
    fn test_is_change_create_and_remove() {
        assert!(is_change(&EventKind::Create(CreateKind::File)));
        assert!(is_change(&EventKind::Create(CreateKind::Folder)));
        assert!(is_change(&EventKind::Remove(RemoveKind::File)));
    }

    #[test]
    fn test_is_change_modify() {
        assert!(is_change(&EventKind::Modify(ModifyKind::Data(DataChange::Any))));
        assert!(is_change(&EventKind::Modify(ModifyKind::Name(RenameMode::Both))));
        assert!(is_change(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions))));
        assert!(!is_change(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime))));
    }

    #[test]
    fn test_is_change_access() {
        assert!(!is_change(&EventKind::Access(AccessKind::Read)));
        assert!(is_change(&EventKind::Access(AccessKind::Close(AccessMode::Write))));
        assert!(!is_change(&EventKind::Other));
    }

    #[test]
    fn test_relative_path() {
        let root = Path::new("/work/repo");
        assert_eq!(
            relative_path(root, Path::new("/work/repo/src/main.rs")).as_deref(),
            Some("src/main.rs")
        );
        assert_eq!(relative_path(root, Path::new("/work/repo")), None);
        assert_eq!(relative_path(root, Path::new("/work/other/file")), None);
    }

    #[test]
    fn test_ignore_matches_top_level_component() {
        let watcher = NotifyWatcher::new("/work/repo").with_ignore(vec![".git".to_string()]);
        assert!(watcher.is_ignored(".git"));
        assert!(watcher.is_ignored(".git/index.lock"));
        assert!(!watcher.is_ignored("src/.git"));
        assert!(!watcher.is_ignored(".github/workflows/ci.yml"));
    }

    #[test]
    fn test_stop_token_shared_between_clones() {
        let token = StopToken::new();
        let clone = token.clone();
        assert!(!clone.is_stopped());
        token.stop();
        assert!(clone.is_stopped());
    }

    #[test]
    fn test_ready_signal_fires_once() {
        let (ready, mut rx) = ReadySignal::channel();
        ready.signal();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_dropped_ready_signal_is_observable() {
        let (ready, rx) = ReadySignal::channel();
        drop(ready);
        assert!(rx.blocking_recv().is_err());
    }

    #[test]
    fn test_now_nanos_is_after_2020() {
        assert!(now_nanos() > 1_577_836_800_000_000_000);
    }

    #[test]
    fn test_missing_root_fails_without_signalling() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = NotifyWatcher::new(dir.path().join("missing"));
        let (ready, rx) = ReadySignal::channel();
        let err = watcher
            .run(Arc::new(EventStore::new()), ready, StopToken::new())
            .unwrap_err();
        assert!(matches!(err, WatchError::Root { .. }));
        assert!(rx.blocking_recv().is_err());
    }

    #[test]
    fn test_poll_watcher_records_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();

        let store = Arc::new(EventStore::new());
        let stop = StopToken::new();
        let (ready, rx) = ReadySignal::channel();
        let watcher = NotifyWatcher::new(dir.path())
            .with_poll_interval(Some(Duration::from_millis(50)))
            .with_ignore(vec![".git".to_string()]);

        let thread = {
            let store = Arc::clone(&store);
            let stop = stop.clone();
            std::thread::spawn(move || watcher.run(store, ready, stop))
        };
        rx.blocking_recv().unwrap();

        std::fs::write(dir.path().join(".git/index"), b"ignored").unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), b"pub fn f() {}").unwrap();

        let start = Instant::now();
        while !store.changed_since(1).iter().any(|p| &**p == "src/lib.rs") {
            assert!(start.elapsed() < Duration::from_secs(5), "change never recorded");
            std::thread::sleep(Duration::from_millis(20));
        }

        stop.stop();
        thread.join().unwrap().unwrap();
        assert!(store.changed_since(1).iter().all(|p| !p.starts_with(".git")));
    }
}
