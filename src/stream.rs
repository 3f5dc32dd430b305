//! Streaming views of a [`ProgressStore`].
//!
//! A renderer that prefers pulling to callbacks can consume
//! [`snapshot_stream`]: it yields the current snapshot immediately, then one
//! snapshot per published change. Intermediate snapshots may be skipped when
//! the consumer is slower than the worker; the latest state is never lost.

use crate::progress::{ProgressStore, Snapshot};
use futures::StreamExt;
use std::pin::Pin;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::Stream;

/// A boxed stream of store snapshots.
pub type SnapshotStream = Pin<Box<dyn Stream<Item = Snapshot> + Send>>;

/// Current snapshot first, then every change.
pub fn snapshot_stream(store: &ProgressStore) -> SnapshotStream {
    Box::pin(WatchStream::new(store.subscribe()))
}

/// Resolve with the first snapshot in which every entry is terminal.
///
/// An empty store counts as settled.
pub async fn settled(store: &ProgressStore) -> Snapshot {
    let mut stream = snapshot_stream(store);
    while let Some(snapshot) = stream.next().await {
        if snapshot.iter().all(|e| e.status.is_terminal()) {
            return snapshot;
        }
    }
    // The sender lives inside `store`, so the stream cannot end first.
    store.snapshot()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputFile;
    use crate::progress::{EntryUpdate, FileEntry};
    use std::time::Duration;

    #[tokio::test]
    async fn stream_starts_with_current_state() {
        let store = ProgressStore::new();
        store.add(FileEntry::new("a.png", 1));
        let mut stream = snapshot_stream(&store);
        let first = stream.next().await.unwrap();
        assert_eq!(first.len(), 1);
    }

    #[tokio::test]
    async fn stream_sees_updates() {
        let store = ProgressStore::new();
        let mut stream = snapshot_stream(&store);
        assert!(stream.next().await.unwrap().is_empty());

        let id = store.add(FileEntry::new("a.png", 1));
        let next = stream.next().await.unwrap();
        assert_eq!(next[0].id, id);
    }

    #[tokio::test]
    async fn settled_waits_for_terminal_entries() {
        let store = ProgressStore::new();
        let id = store.add(FileEntry::new("a.wav", 1));
        store.update(id, EntryUpdate::Started);

        let worker = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            worker.update(id, EntryUpdate::Progress(60));
            worker.update(
                id,
                EntryUpdate::Completed(OutputFile::new("a.mp3", vec![1], "audio/mpeg")),
            );
        });

        let snap = tokio::time::timeout(Duration::from_secs(5), settled(&store))
            .await
            .unwrap();
        assert_eq!(snap[0].output().unwrap().name, "a.mp3");
    }

    #[tokio::test]
    async fn empty_store_is_settled() {
        assert!(settled(&ProgressStore::new()).await.is_empty());
    }
}
