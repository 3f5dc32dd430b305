//! Batch orchestrator: one worker, one file at a time.
//!
//! Jobs go through an unbounded `mpsc` queue drained by a single Tokio task,
//! so no two adapter calls ever overlap. That keeps the non-reentrant
//! transcoder safe without a lock and bounds memory for image batches.
//!
//! Each job walks its entry `pending → processing → done | error`. A failing
//! (or panicking) file only marks its own entry; the worker moves on.
//!
//! Cancellation is a flag checked between files. Jobs dequeued after
//! [`BatchOrchestrator::cancel`] are marked `cancelled` without running, and
//! a result that arrives after the flag was raised is discarded. The running
//! engine call itself is not interrupted. Dropping the orchestrator without
//! calling [`BatchOrchestrator::finish`] raises the flag too.

use crate::error::{FileError, KilnError};
use crate::pipeline::intake::QueuedFile;
use crate::pipeline::{ConversionAdapter, ProgressTicker};
use crate::progress::{EntryId, EntryUpdate, ProgressCallback, ProgressStore, Snapshot};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Job {
    adapter: Arc<dyn ConversionAdapter>,
    file: QueuedFile,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    total: usize,
    succeeded: usize,
}

/// Sequential executor for conversion jobs, reporting into a [`ProgressStore`].
///
/// Must be created inside a Tokio runtime.
pub struct BatchOrchestrator {
    store: ProgressStore,
    callback: Option<ProgressCallback>,
    tx: Option<mpsc::UnboundedSender<Job>>,
    worker: Option<JoinHandle<Tally>>,
    cancelled: Arc<AtomicBool>,
    started: Instant,
}

impl BatchOrchestrator {
    /// Start the worker task.
    pub fn spawn(store: ProgressStore, callback: Option<ProgressCallback>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let worker = tokio::spawn(run_worker(
            rx,
            store.clone(),
            callback.clone(),
            cancelled.clone(),
        ));
        Self {
            store,
            callback,
            tx: Some(tx),
            worker: Some(worker),
            cancelled,
            started: Instant::now(),
        }
    }

    pub fn store(&self) -> &ProgressStore {
        &self.store
    }

    /// Add the files' pending entries to the store and queue them, in order.
    pub fn submit(
        &self,
        adapter: Arc<dyn ConversionAdapter>,
        files: Vec<QueuedFile>,
    ) -> Result<Vec<EntryId>, KilnError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| KilnError::Internal("batch queue already closed".into()))?;

        let ids = self.store.add_all(files.iter().map(|f| f.entry.clone()));
        if let Some(cb) = &self.callback {
            cb.on_batch_start(files.len());
        }
        debug!(count = files.len(), adapter = %adapter.label(), "queued files");

        for file in files {
            tx.send(Job {
                adapter: adapter.clone(),
                file,
            })
            .map_err(|_| KilnError::Internal("batch worker stopped unexpectedly".into()))?;
        }
        Ok(ids)
    }

    /// Skip queued files and discard results that have not landed yet.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            info!("batch cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Close the queue, wait for every job to settle and return the final snapshot.
    pub async fn finish(mut self) -> Result<Snapshot, KilnError> {
        drop(self.tx.take());
        let tally = match self.worker.take() {
            Some(worker) => worker
                .await
                .map_err(|e| KilnError::Internal(format!("batch worker panicked: {e}")))?,
            None => Tally::default(),
        };

        if let Some(cb) = &self.callback {
            cb.on_batch_complete(tally.total, tally.succeeded);
        }
        info!(
            total = tally.total,
            succeeded = tally.succeeded,
            failed = tally.total - tally.succeeded,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "batch finished"
        );
        Ok(self.store.snapshot())
    }
}

impl Drop for BatchOrchestrator {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.cancelled.store(true, Ordering::Release);
        }
    }
}

/// Queue `files` on a fresh orchestrator and wait for all of them.
pub async fn run_batch(
    adapter: Arc<dyn ConversionAdapter>,
    files: Vec<QueuedFile>,
    store: ProgressStore,
    callback: Option<ProgressCallback>,
) -> Result<Snapshot, KilnError> {
    let orchestrator = BatchOrchestrator::spawn(store, callback);
    orchestrator.submit(adapter, files)?;
    orchestrator.finish().await
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Job>,
    store: ProgressStore,
    callback: Option<ProgressCallback>,
    cancelled: Arc<AtomicBool>,
) -> Tally {
    let mut tally = Tally::default();

    while let Some(Job { adapter, file }) = rx.recv().await {
        tally.total += 1;
        let id = file.entry.id;
        let name = file.source.name.clone();

        if cancelled.load(Ordering::Acquire) {
            record_failure(&store, &callback, id, &name, FileError::Cancelled);
            continue;
        }

        store.update(id, EntryUpdate::Started);
        if let Some(cb) = &callback {
            cb.on_file_start(id, &name);
        }
        debug!(file = %name, adapter = %adapter.label(), "processing");

        let ticker = ProgressTicker::for_entry(store.clone(), id, name.clone(), callback.clone());
        let result = AssertUnwindSafe(adapter.convert(&file.source, &ticker))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(FileError::Panicked {
                    name: name.clone(),
                    detail: panic_message(panic.as_ref()),
                })
            });

        let result = if cancelled.load(Ordering::Acquire) {
            debug!(file = %name, "discarding result of cancelled batch");
            Err(FileError::Cancelled)
        } else {
            result
        };

        match result {
            Ok(output) => {
                let len = output.blob.len();
                info!(file = %name, output = %output.name, bytes = len, "file done");
                store.update(id, EntryUpdate::Completed(output));
                if let Some(cb) = &callback {
                    cb.on_file_complete(id, &name, len);
                }
                tally.succeeded += 1;
            }
            Err(err) => record_failure(&store, &callback, id, &name, err),
        }
    }

    tally
}

fn record_failure(
    store: &ProgressStore,
    callback: &Option<ProgressCallback>,
    id: EntryId,
    name: &str,
    err: FileError,
) {
    let message = err.to_string();
    match err {
        FileError::Cancelled => debug!(file = %name, "skipped: cancelled"),
        _ => warn!(file = %name, error = %message, "file failed"),
    }
    store.update(id, EntryUpdate::Failed(message.clone()));
    if let Some(cb) = callback {
        cb.on_file_error(id, name, &message);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}
