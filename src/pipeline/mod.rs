//! Pipeline stages for batch file conversion.
//!
//! ## Data Flow
//!
//! ```text
//! intake ──▶ ProgressStore ──▶ BatchOrchestrator ──▶ ConversionAdapter ──▶ ProgressStore
//! (accept)    (pending)        (one worker)          (canvas/ffmpeg/pdf)   (done/error)
//! ```
//!
//! 1. [`intake`]: filter a selection against an [`intake::AcceptPolicy`]
//!    and mint a pending entry per accepted file
//! 2. [`canvas`]: decode → optional crop/resize → re-encode, dropping metadata
//!    (HEIC stills are decoded by ffmpeg first)
//! 3. [`transcode`]: ffmpeg remux with re-encode fallback, in a scratch dir
//! 4. [`document`]: lopdf merge/split/compress, pdfium rasterise/text
//! 5. [`pages`]: page-range expressions for split

pub mod canvas;
pub mod document;
pub mod intake;
pub mod pages;
pub mod transcode;

use crate::config::PipelineConfig;
use crate::engine::Engines;
use crate::error::FileError;
use crate::output::OutputFile;
use crate::progress::{EntryId, EntryUpdate, ProgressCallback, ProgressStore};
use crate::registry::{ConversionConfig, EngineKind, EngineSpec};
use async_trait::async_trait;
use intake::SourceFile;
use std::sync::Arc;

/// One engine-backed way of turning a source file into an output file.
///
/// Implementations must be `Send + Sync`; the orchestrator holds them as
/// `Arc<dyn ConversionAdapter>` and drives one file at a time.
#[async_trait]
pub trait ConversionAdapter: Send + Sync {
    fn engine(&self) -> EngineKind;

    /// Short label for logs, e.g. `"png-to-jpg"` or `"resize 800x600"`.
    fn label(&self) -> String;

    async fn convert(
        &self,
        source: &SourceFile,
        progress: &ProgressTicker,
    ) -> Result<OutputFile, FileError>;
}

/// Progress sink handed to an adapter for one file.
///
/// Forwards forward-moving percentages to the store and the callback.
/// Regressions are dropped by the store.
pub struct ProgressTicker {
    sink: Option<TickSink>,
}

struct TickSink {
    store: ProgressStore,
    id: EntryId,
    name: String,
    callback: Option<ProgressCallback>,
}

impl ProgressTicker {
    /// A ticker that discards everything, for direct adapter calls.
    pub fn noop() -> Self {
        Self { sink: None }
    }

    pub(crate) fn for_entry(
        store: ProgressStore,
        id: EntryId,
        name: String,
        callback: Option<ProgressCallback>,
    ) -> Self {
        Self {
            sink: Some(TickSink {
                store,
                id,
                name,
                callback,
            }),
        }
    }

    pub fn tick(&self, percent: u8) {
        let Some(s) = &self.sink else { return };
        let percent = percent.min(100);
        if s.store.update(s.id, EntryUpdate::Progress(percent)) {
            if let Some(cb) = &s.callback {
                cb.on_file_progress(s.id, &s.name, percent);
            }
        }
    }
}

/// Build the adapter for a registered conversion.
pub fn adapter_for(
    conversion: &'static ConversionConfig,
    engines: &Arc<Engines>,
    config: &PipelineConfig,
) -> Arc<dyn ConversionAdapter> {
    match conversion.engine {
        EngineSpec::Canvas(params) => Arc::new(
            canvas::CanvasAdapter::convert_to(
                conversion,
                params.quality.unwrap_or(config.canvas_quality),
            )
            .with_engines(engines.clone()),
        ),
        EngineSpec::Transcode(params) => Arc::new(transcode::TranscodeAdapter::new(
            engines.clone(),
            conversion,
            params,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{FileEntry, FileStatus};
    use crate::registry;

    #[test]
    fn adapter_kind_follows_registry() {
        let config = PipelineConfig::default();
        let engines = Engines::new(&config);
        for c in registry::conversions() {
            let adapter = adapter_for(c, &engines, &config);
            assert_eq!(adapter.engine(), c.engine.kind(), "{}", c.slug);
            assert_eq!(adapter.label(), c.slug);
        }
    }

    #[test]
    fn ticker_moves_entry_forward_only() {
        let store = ProgressStore::new();
        let id = store.add(FileEntry::new("a.wav", 1));
        store.update(id, EntryUpdate::Started);
        let ticker = ProgressTicker::for_entry(store.clone(), id, "a.wav".into(), None);
        ticker.tick(30);
        ticker.tick(10);
        ticker.tick(250);
        assert_eq!(store.get(id).unwrap().status, FileStatus::Processing { progress: 100 });
    }

    #[test]
    fn noop_ticker_is_silent() {
        ProgressTicker::noop().tick(50);
    }
}
