//! Directory change monitoring
//!
//! [`FileMonitor`] turns raw `notify` events for one directory into
//! create/change/delete callbacks, split into file and directory events.
//! Each watch owns a thread that rescans the directory whenever the OS
//! reports activity and diffs the result against the previous scan, so a
//! listener always sees the net effect even when events are coalesced.
//!
//! Delivery is prompt and at-least-once. Listeners that react to bursts
//! put a [`Debouncer`] in front of their expensive work.

use crate::error::{RaspError, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Receives change notifications for one watched directory
///
/// Callbacks run on the watch thread (or on the caller of
/// [`FileMonitor::watch`] for the initial scan). They must tolerate
/// duplicate notifications.
pub trait FileListener: Send + Sync {
    fn on_file_create(&self, path: &Path);

    fn on_file_change(&self, path: &Path);

    fn on_file_delete(&self, path: &Path);

    fn on_directory_create(&self, _path: &Path) {}

    fn on_directory_delete(&self, _path: &Path) {}
}

/// Identifies one active watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(u64);

struct ActiveWatch {
    path: PathBuf,
    stop: std_mpsc::SyncSender<()>,
}

/// Owns every directory watch of an agent
pub struct FileMonitor {
    next_id: AtomicU64,
    watches: Mutex<HashMap<u64, ActiveWatch>>,
}

impl FileMonitor {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching `dir` (non-recursive)
    ///
    /// The listener first receives a create notification for every existing
    /// entry, then incremental notifications from a background thread.
    pub fn watch(&self, dir: impl AsRef<Path>, listener: Arc<dyn FileListener>) -> Result<WatchHandle> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(RaspError::Watch {
                path: dir,
                reason: "not a directory".to_string(),
            });
        }

        let (raw_tx, raw_rx) = std_mpsc::channel::<notify::Result<Event>>();
        let mut watcher =
            RecommendedWatcher::new(raw_tx, notify::Config::default()).map_err(|e| RaspError::Watch {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| RaspError::Watch {
                path: dir.clone(),
                reason: e.to_string(),
            })?;

        // Subscribed before scanning so nothing between the two is lost
        let snapshot = scan(&dir);
        let mut initial: Vec<_> = snapshot.iter().collect();
        initial.sort_by(|a, b| a.0.cmp(b.0));
        for (path, entry) in initial {
            let change = if entry.is_dir {
                Change::DirectoryCreate
            } else {
                Change::FileCreate
            };
            deliver(listener.as_ref(), change, path);
        }

        let (stop_tx, stop_rx) = std_mpsc::sync_channel::<()>(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let thread_dir = dir.clone();

        std::thread::spawn(move || {
            // Dropping the watcher ends the raw event stream
            let _watcher = watcher;
            run_watch_loop(&thread_dir, snapshot, listener.as_ref(), &raw_rx, &stop_rx);
            tracing::debug!(path = %thread_dir.display(), "Watch stopped");
        });

        tracing::debug!(path = %dir.display(), watch_id = id, "Watching directory");
        self.watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, ActiveWatch { path: dir, stop: stop_tx });
        Ok(WatchHandle(id))
    }

    /// Stop a watch
    ///
    /// Returns false if the handle was already unwatched. The watch thread
    /// exits within one poll interval; this call does not wait for it.
    pub fn unwatch(&self, handle: WatchHandle) -> bool {
        let removed = self
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.0);
        match removed {
            Some(watch) => {
                let _ = watch.stop.try_send(());
                tracing::debug!(path = %watch.path.display(), "Unwatching directory");
                true
            }
            None => false,
        }
    }

    /// Stop every watch
    pub fn unwatch_all(&self) {
        let drained: Vec<_> = self
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, watch) in drained {
            let _ = watch.stop.try_send(());
        }
    }

    /// Directories currently watched
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|w| w.path.clone())
            .collect()
    }
}

impl Default for FileMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FileMonitor {
    fn drop(&mut self) {
        self.unwatch_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EntryMeta {
    is_dir: bool,
    modified: Option<SystemTime>,
    len: u64,
}

type Snapshot = HashMap<PathBuf, EntryMeta>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    FileCreate,
    FileChange,
    FileDelete,
    DirectoryCreate,
    DirectoryDelete,
}

fn scan(dir: &Path) -> Snapshot {
    let mut snapshot = Snapshot::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(path = %dir.display(), error = %e, "Cannot scan watched directory");
            return snapshot;
        }
    };
    for entry in entries.flatten() {
        // Entry may vanish between listing and stat
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        snapshot.insert(
            entry.path(),
            EntryMeta {
                is_dir: meta.is_dir(),
                modified: meta.modified().ok(),
                len: meta.len(),
            },
        );
    }
    snapshot
}

/// Net changes between two scans, deletes first
fn diff(old: &Snapshot, new: &Snapshot) -> Vec<(Change, PathBuf)> {
    let mut changes = Vec::new();

    for (path, before) in old {
        match new.get(path) {
            None => changes.push((delete_of(before), path.clone())),
            Some(after) if after.is_dir != before.is_dir => {
                changes.push((delete_of(before), path.clone()));
                changes.push((create_of(after), path.clone()));
            }
            Some(after) if !after.is_dir && after != before => {
                changes.push((Change::FileChange, path.clone()));
            }
            Some(_) => {}
        }
    }
    for (path, after) in new {
        if !old.contains_key(path) {
            changes.push((create_of(after), path.clone()));
        }
    }

    changes.sort_by_key(|(change, path)| {
        let rank = match change {
            Change::FileDelete | Change::DirectoryDelete => 0,
            Change::FileCreate | Change::DirectoryCreate => 1,
            Change::FileChange => 2,
        };
        (rank, path.clone())
    });
    changes
}

fn create_of(meta: &EntryMeta) -> Change {
    if meta.is_dir {
        Change::DirectoryCreate
    } else {
        Change::FileCreate
    }
}

fn delete_of(meta: &EntryMeta) -> Change {
    if meta.is_dir {
        Change::DirectoryDelete
    } else {
        Change::FileDelete
    }
}

fn deliver(listener: &dyn FileListener, change: Change, path: &Path) {
    let result = catch_unwind(AssertUnwindSafe(|| match change {
        Change::FileCreate => listener.on_file_create(path),
        Change::FileChange => listener.on_file_change(path),
        Change::FileDelete => listener.on_file_delete(path),
        Change::DirectoryCreate => listener.on_directory_create(path),
        Change::DirectoryDelete => listener.on_directory_delete(path),
    }));
    if result.is_err() {
        tracing::error!(path = %path.display(), change = ?change, "File listener panicked");
    }
}

fn run_watch_loop(
    dir: &Path,
    mut snapshot: Snapshot,
    listener: &dyn FileListener,
    raw_rx: &std_mpsc::Receiver<notify::Result<Event>>,
    stop_rx: &std_mpsc::Receiver<()>,
) {
    loop {
        if !matches!(stop_rx.try_recv(), Err(std_mpsc::TryRecvError::Empty)) {
            break;
        }

        let first = match raw_rx.recv_timeout(POLL_INTERVAL) {
            Ok(event) => event,
            Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        };

        // Coalesce whatever else is already queued into one rescan
        let mut touched = HashSet::new();
        let mut relevant = false;
        for event in std::iter::once(first).chain(raw_rx.try_iter()) {
            match event {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        continue;
                    }
                    relevant = true;
                    if matches!(event.kind, EventKind::Modify(_) | EventKind::Any) {
                        touched.extend(event.paths.into_iter().filter(|p| p.parent() == Some(dir)));
                    }
                }
                Err(e) => tracing::warn!(path = %dir.display(), error = %e, "Watch error"),
            }
        }
        if !relevant {
            continue;
        }

        let next = scan(dir);
        let changes = diff(&snapshot, &next);
        let reported: HashSet<PathBuf> = changes.iter().map(|(_, p)| p.clone()).collect();
        for (change, path) in &changes {
            deliver(listener, *change, path);
        }
        // Writes that left size and mtime unchanged still count as a change
        let mut unchanged: Vec<_> = touched
            .into_iter()
            .filter(|p| !reported.contains(p))
            .filter(|p| next.get(p).is_some_and(|m| !m.is_dir))
            .collect();
        unchanged.sort();
        for path in unchanged {
            deliver(listener, Change::FileChange, &path);
        }
        snapshot = next;
    }
}

/// Collapses bursts of triggers into one action
///
/// Each [`trigger`](Debouncer::trigger) restarts the quiet window; the
/// action runs once on the debouncer's own thread after `window` passes
/// with no further trigger. Dropping the debouncer stops the thread
/// without running a pending action.
pub struct Debouncer {
    tx: Mutex<std_mpsc::Sender<()>>,
    window: Duration,
}

impl Debouncer {
    pub fn new<F>(window: Duration, action: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let (tx, rx) = std_mpsc::channel::<()>();

        std::thread::spawn(move || {
            while rx.recv().is_ok() {
                loop {
                    match rx.recv_timeout(window) {
                        Ok(()) => continue,
                        Err(std_mpsc::RecvTimeoutError::Timeout) => {
                            if catch_unwind(AssertUnwindSafe(&action)).is_err() {
                                tracing::error!("Debounced action panicked");
                            }
                            break;
                        }
                        Err(std_mpsc::RecvTimeoutError::Disconnected) => return,
                    }
                }
            }
        });

        Self {
            tx: Mutex::new(tx),
            window,
        }
    }

    /// Start or restart the quiet window
    pub fn trigger(&self) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if tx.send(()).is_err() {
            tracing::warn!("Debouncer thread is gone, trigger dropped");
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}
