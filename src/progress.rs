//! Per-file progress tracking.
//!
//! [`ProgressStore`] holds the ordered [`FileEntry`] records of the current
//! batch. Every mutation publishes a fresh immutable snapshot over a
//! `tokio::sync::watch` channel, so a renderer always reads a consistent
//! collection while the orchestrator keeps updating it.
//!
//! [`BatchProgressCallback`] is the push-style alternative: inject an
//! `Arc<dyn BatchProgressCallback>` via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive one
//! event per state change.
//!
//! # Example
//!
//! ```rust
//! use filekiln::{BatchProgressCallback, EntryId, PipelineConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl BatchProgressCallback for CountingCallback {
//!     fn on_file_complete(&self, _id: EntryId, name: &str, output_len: usize) {
//!         let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("#{done} {name} ({output_len} bytes)");
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { completed: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::OutputFile;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

// ── Entries ──────────────────────────────────────────────────────────────

/// Opaque identifier minted at intake, stable for the entry's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell entries apart in logs.
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// Where a file is in its `pending → processing → done | error` journey.
///
/// Output and error live inside the terminal variants, so an entry can never
/// carry both, and non-terminal entries carry neither.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Processing { progress: u8 },
    Done { output: OutputFile },
    #[serde(rename = "error")]
    Failed { error: String },
}

impl FileStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FileStatus::Done { .. } | FileStatus::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Processing { .. } => "processing",
            FileStatus::Done { .. } => "done",
            FileStatus::Failed { .. } => "error",
        }
    }
}

/// One file's record in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub id: EntryId,
    pub name: String,
    pub size: u64,
    #[serde(flatten)]
    pub status: FileStatus,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            id: EntryId::new(),
            name: name.into(),
            size,
            status: FileStatus::Pending,
        }
    }

    /// 0–100 while processing, 100 when done, 0 otherwise.
    pub fn progress(&self) -> u8 {
        match self.status {
            FileStatus::Processing { progress } => progress,
            FileStatus::Done { .. } => 100,
            _ => 0,
        }
    }

    pub fn output(&self) -> Option<&OutputFile> {
        match &self.status {
            FileStatus::Done { output } => Some(output),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.status {
            FileStatus::Failed { error } => Some(error),
            _ => None,
        }
    }

    /// Apply a partial update. Returns `false` when the transition is not
    /// legal from the current state; the entry is left unchanged.
    pub fn apply(&mut self, update: EntryUpdate) -> bool {
        let next = match (&self.status, update) {
            (FileStatus::Pending, EntryUpdate::Started) => FileStatus::Processing { progress: 0 },
            (FileStatus::Processing { progress }, EntryUpdate::Progress(p)) => {
                let p = p.min(100);
                if p <= *progress {
                    return false;
                }
                FileStatus::Processing { progress: p }
            }
            (FileStatus::Processing { .. }, EntryUpdate::Completed(output)) => {
                FileStatus::Done { output }
            }
            (FileStatus::Pending | FileStatus::Processing { .. }, EntryUpdate::Failed(error)) => {
                FileStatus::Failed { error }
            }
            (status, update) => {
                debug!(entry = %self.id, from = status.label(), ?update, "ignoring invalid transition");
                return false;
            }
        };
        self.status = next;
        true
    }
}

/// A partial change to one entry.
#[derive(Debug, Clone)]
pub enum EntryUpdate {
    Started,
    /// Progress never moves backwards; lower values are ignored.
    Progress(u8),
    Completed(OutputFile),
    Failed(String),
}

// ── Store ────────────────────────────────────────────────────────────────

/// Immutable view of the store at one point in time.
pub type Snapshot = Arc<Vec<FileEntry>>;

/// Observable, insertion-ordered collection of [`FileEntry`] records.
///
/// Clones share the same underlying collection.
#[derive(Clone)]
pub struct ProgressStore {
    tx: Arc<watch::Sender<Snapshot>>,
}

impl Default for ProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProgressStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressStore")
            .field("entries", &self.tx.borrow().len())
            .finish()
    }
}

impl ProgressStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Vec::new()));
        Self { tx: Arc::new(tx) }
    }

    /// Append one entry and return its id.
    pub fn add(&self, entry: FileEntry) -> EntryId {
        let id = entry.id;
        self.tx.send_modify(|v| Arc::make_mut(v).push(entry));
        id
    }

    /// Append several entries in order with a single snapshot.
    pub fn add_all(&self, entries: impl IntoIterator<Item = FileEntry>) -> Vec<EntryId> {
        let entries: Vec<FileEntry> = entries.into_iter().collect();
        let ids = entries.iter().map(|e| e.id).collect();
        if !entries.is_empty() {
            self.tx.send_modify(|v| Arc::make_mut(v).extend(entries));
        }
        ids
    }

    /// Merge `update` into the matching entry. Unknown ids are a no-op.
    ///
    /// Returns whether a new snapshot was published.
    pub fn update(&self, id: EntryId, update: EntryUpdate) -> bool {
        self.tx.send_if_modified(|v| {
            let Some(pos) = v.iter().position(|e| e.id == id) else {
                return false;
            };
            // Check on a copy first so a rejected update never clones the vec.
            let mut entry = v[pos].clone();
            if !entry.apply(update) {
                return false;
            }
            Arc::make_mut(v)[pos] = entry;
            true
        })
    }

    /// Drop one entry (and its output). Returns whether it existed.
    pub fn remove(&self, id: EntryId) -> bool {
        self.tx.send_if_modified(|v| match v.iter().position(|e| e.id == id) {
            Some(pos) => {
                Arc::make_mut(v).remove(pos);
                true
            }
            None => false,
        })
    }

    pub fn clear(&self) {
        self.tx.send_if_modified(|v| {
            if v.is_empty() {
                return false;
            }
            *v = Arc::new(Vec::new());
            true
        });
    }

    pub fn get(&self, id: EntryId) -> Option<FileEntry> {
        self.tx.borrow().iter().find(|e| e.id == id).cloned()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.tx.borrow().clone()
    }

    /// A receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }
}

// ── Callbacks ────────────────────────────────────────────────────────────

/// Called by the batch orchestrator as each file moves through the pipeline.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Events for one file arrive in order; the worker
/// calls these from a Tokio task, hence `Send + Sync`.
pub trait BatchProgressCallback: Send + Sync {
    /// Called when `count` files are queued.
    fn on_batch_start(&self, count: usize) {
        let _ = count;
    }

    fn on_file_start(&self, id: EntryId, name: &str) {
        let _ = (id, name);
    }

    /// Called for each forward progress step (0–100).
    fn on_file_progress(&self, id: EntryId, name: &str, percent: u8) {
        let _ = (id, name, percent);
    }

    fn on_file_complete(&self, id: EntryId, name: &str, output_len: usize) {
        let _ = (id, name, output_len);
    }

    /// Called with the same message that is stored on the entry.
    fn on_file_error(&self, id: EntryId, name: &str, error: &str) {
        let _ = (id, name, error);
    }

    /// Called once the queue has drained.
    fn on_batch_complete(&self, total: usize, success_count: usize) {
        let _ = (total, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;

    fn out() -> OutputFile {
        OutputFile::new("a.jpg", vec![0xFF, 0xD8], "image/jpeg")
    }

    #[test]
    fn entry_walks_happy_path() {
        let mut e = FileEntry::new("a.png", 10);
        assert!(e.apply(EntryUpdate::Started));
        assert!(e.apply(EntryUpdate::Progress(40)));
        assert!(!e.apply(EntryUpdate::Progress(20)), "progress must not regress");
        assert_eq!(e.progress(), 40);
        assert!(e.apply(EntryUpdate::Completed(out())));
        assert_eq!(e.output().unwrap().name, "a.jpg");
        assert!(e.error().is_none());
    }

    #[test]
    fn terminal_entries_ignore_updates() {
        let mut e = FileEntry::new("a.png", 10);
        e.apply(EntryUpdate::Failed("boom".into()));
        assert!(!e.apply(EntryUpdate::Started));
        assert!(!e.apply(EntryUpdate::Completed(out())));
        assert_eq!(e.error(), Some("boom"));
    }

    #[test]
    fn cannot_complete_without_starting() {
        let mut e = FileEntry::new("a.png", 10);
        assert!(!e.apply(EntryUpdate::Completed(out())));
        assert_eq!(e.status, FileStatus::Pending);
    }

    #[test]
    fn store_keeps_insertion_order() {
        let store = ProgressStore::new();
        let ids = store.add_all(["a", "b", "c"].map(|n| FileEntry::new(n, 1)));
        let names: Vec<_> = store.snapshot().iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(store.snapshot()[1].id, ids[1]);
    }

    #[test]
    fn update_unknown_id_is_noop() {
        let store = ProgressStore::new();
        store.add(FileEntry::new("a", 1));
        let before = store.snapshot();
        assert!(!store.update(EntryId::new(), EntryUpdate::Started));
        assert!(Arc::ptr_eq(&before, &store.snapshot()));
    }

    #[test]
    fn old_snapshots_are_immutable() {
        let store = ProgressStore::new();
        let id = store.add(FileEntry::new("a", 1));
        let before = store.snapshot();
        store.update(id, EntryUpdate::Started);
        assert_eq!(before[0].status, FileStatus::Pending);
        assert_eq!(store.snapshot()[0].status, FileStatus::Processing { progress: 0 });
    }

    #[test]
    fn remove_and_clear() {
        let store = ProgressStore::new();
        let a = store.add(FileEntry::new("a", 1));
        store.add(FileEntry::new("b", 1));
        assert!(store.remove(a));
        assert!(!store.remove(a));
        assert_eq!(store.snapshot().len(), 1);
        store.clear();
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_updates() {
        let store = ProgressStore::new();
        let mut rx = store.subscribe();
        let id = store.add(FileEntry::new("a", 1));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update()[0].id, id);
    }

    #[test]
    fn status_serialises_with_label() {
        let mut e = FileEntry::new("a.png", 3);
        e.apply(EntryUpdate::Failed("bad".into()));
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["status"], "error");
        assert_eq!(v["error"], "bad");
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        let id = EntryId::new();
        cb.on_batch_start(2);
        cb.on_file_start(id, "a");
        cb.on_file_progress(id, "a", 50);
        cb.on_file_complete(id, "a", 10);
        cb.on_file_error(id, "b", "x");
        cb.on_batch_complete(2, 1);
    }
}
