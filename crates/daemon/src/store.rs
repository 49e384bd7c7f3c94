//! In-memory event store for the daemon.
//!
//! This module manages:
//! - The path interning table (one shared record per distinct path)
//! - The time-ordered event log, read newest first

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// One recorded change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEvent {
    /// Interned path, shared with every other event for the same path
    pub path: Arc<str>,
    /// Nanoseconds since the Unix epoch
    pub time: u64,
}

#[derive(Debug, Default)]
struct Inner {
    /// Every path ever seen; never shrinks
    paths: HashSet<Arc<str>>,
    /// Append-only log, oldest first
    events: Vec<QueueEvent>,
}

impl Inner {
    fn intern(&mut self, path: &str) -> Arc<str> {
        if let Some(existing) = self.paths.get(path) {
            return Arc::clone(existing);
        }
        let record: Arc<str> = Arc::from(path);
        self.paths.insert(Arc::clone(&record));
        record
    }
}

/// Shared store of path-change events.
///
/// Walking the log newest first always yields non-increasing times: an
/// insert older than the newest event is recorded at the newest time, so a
/// late-arriving event is never hidden from a query.
#[derive(Debug, Default)]
pub struct EventStore {
    inner: Mutex<Inner>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change of `path` at `time`.
    ///
    /// Returns the time the event was recorded at.
    pub fn insert(&self, path: &str, time: u64) -> u64 {
        let mut inner = self.inner.lock();

        let newest = inner.events.last().map_or(0, |event| event.time);
        let time = if time < newest {
            tracing::trace!(path, time, newest, "Clamping out-of-order event");
            newest
        } else {
            time
        };

        let path = inner.intern(path);
        inner.events.push(QueueEvent { path, time });
        time
    }

    /// Paths changed at or after `since`, newest first, each reported once.
    pub fn changed_since(&self, since: u64) -> Vec<Arc<str>> {
        let inner = self.inner.lock();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut changed = Vec::new();

        for event in inner.events.iter().rev() {
            if event.time < since {
                break;
            }
            if seen.insert(&event.path) {
                changed.push(Arc::clone(&event.path));
            }
        }
        changed
    }

    /// Snapshot of the whole log, newest first.
    pub fn events(&self) -> Vec<QueueEvent> {
        self.inner.lock().events.iter().rev().cloned().collect()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }

    /// Number of interned paths.
    pub fn distinct_paths(&self) -> usize {
        self.inner.lock().paths.len()
    }

    /// Time of the newest event, if any.
    pub fn newest_time(&self) -> Option<u64> {
        self.inner.lock().events.last().map(|event| event.time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EventStore {
        let store = EventStore::new();
        store.insert("a", 10);
        store.insert("b", 20);
        store.insert("c", 20);
        store.insert("d", 30);
        store
    }

    fn names(paths: &[Arc<str>]) -> Vec<&str> {
        paths.iter().map(|p| &**p).collect()
    }

    #[test]
    fn test_event_store_new() {
        let store = EventStore::new();
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
        assert_eq!(store.distinct_paths(), 0);
        assert_eq!(store.newest_time(), None);
        assert!(store.changed_since(1).is_empty());
    }

    #[test]
    fn test_changed_since_boundary_is_inclusive() {
        let store = sample();
        assert_eq!(names(&store.changed_since(20)), ["d", "c", "b"]);
        assert_eq!(names(&store.changed_since(30)), ["d"]);
        assert!(store.changed_since(31).is_empty());
        assert_eq!(names(&store.changed_since(1)), ["d", "c", "b", "a"]);
    }

    #[test]
    fn test_repeated_path_is_interned_once() {
        let store = EventStore::new();
        store.insert("src/main.rs", 1);
        store.insert("README.md", 2);
        store.insert("src/main.rs", 3);

        assert_eq!(store.len(), 3);
        assert_eq!(store.distinct_paths(), 2);

        let events = store.events();
        assert_eq!(&*events[0].path, "src/main.rs");
        assert!(Arc::ptr_eq(&events[0].path, &events[2].path));
        assert!(!Arc::ptr_eq(&events[0].path, &events[1].path));
    }

    #[test]
    fn test_repeated_path_reported_once() {
        let store = EventStore::new();
        store.insert("x", 5);
        store.insert("y", 6);
        store.insert("x", 7);
        assert_eq!(names(&store.changed_since(5)), ["x", "y"]);
    }

    #[test]
    fn test_out_of_order_insert_is_clamped() {
        let store = EventStore::new();
        assert_eq!(store.insert("late", 50), 50);
        assert_eq!(store.insert("early", 10), 50);
        assert_eq!(store.newest_time(), Some(50));

        let times: Vec<u64> = store.events().iter().map(|e| e.time).collect();
        assert_eq!(times, [50, 50]);
        assert_eq!(names(&store.changed_since(50)), ["early", "late"]);
    }

    #[test]
    fn test_events_newest_first_is_non_increasing() {
        let store = EventStore::new();
        for (i, time) in [5u64, 9, 3, 9, 12, 1, 12, 40].into_iter().enumerate() {
            store.insert(&format!("f{i}"), time);
        }
        let events = store.events();
        assert_eq!(events.len(), 8);
        assert!(events.windows(2).all(|w| w[0].time >= w[1].time));
    }

    #[test]
    fn test_concurrent_insert_and_read() {
        let store = EventStore::new();

        std::thread::scope(|scope| {
            for writer in 0..4u64 {
                let store = &store;
                scope.spawn(move || {
                    for i in 0..500u64 {
                        store.insert(&format!("w{writer}/{}", i % 50), writer * 1000 + i + 1);
                    }
                });
            }
            scope.spawn(|| {
                for _ in 0..200 {
                    let events = store.events();
                    assert!(events.windows(2).all(|w| w[0].time >= w[1].time));
                    let _ = store.changed_since(1);
                }
            });
        });

        assert_eq!(store.len(), 2000);
        assert_eq!(store.distinct_paths(), 200);
        assert!(store.events().windows(2).all(|w| w[0].time >= w[1].time));
    }
}
