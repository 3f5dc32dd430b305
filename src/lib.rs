//! # filekiln
//!
//! Local batch conversion of video, audio, images and PDFs.
//!
//! Every file goes through the same small pipeline: intake filters the
//! selection, the orchestrator feeds accepted files one at a time to an
//! engine adapter, and a progress store records each file's journey from
//! `pending` to `done` or `error`. Finished outputs are written directly, or
//! zipped when there are two or more.
//!
//! ## Pipeline Overview
//!
//! ```text
//! files
//!  │
//!  ├─ 1. Intake    accept by MIME / extension, size cap, single-file mode
//!  ├─ 2. Store     one pending FileEntry per accepted file
//!  ├─ 3. Batch     single worker, strictly sequential, per-file isolation
//!  ├─ 4. Adapter   canvas (image) · ffmpeg (audio/video) · lopdf/pdfium (PDF)
//!  └─ 5. Export    direct file, or a zip bundle for ≥ 2 outputs
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use filekiln::{convert_paths, write_outputs, PipelineConfig};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::default();
//!     let outcome = convert_paths("png-to-jpg", &["a.png", "b.png"], &config).await?;
//!     for entry in &outcome.entries {
//!         eprintln!("{}: {}", entry.name, entry.status.label());
//!     }
//!     write_outputs(&outcome, Path::new("out"), "photos.zip").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Engines
//!
//! | Engine  | Used for                        | Provided by                                   |
//! |---------|---------------------------------|-----------------------------------------------|
//! | canvas  | image conversions and tools     | `image` + `resvg`, in process                 |
//! | ffmpeg  | audio/video conversions         | `ffmpeg` / `ffprobe` on PATH (`KILN_FFMPEG`)  |
//! | lopdf   | merge, split, compress          | in process                                    |
//! | pdfium  | page rendering, text extraction | libpdfium, downloaded and cached on first use |
//!
//! Engines are loaded lazily, once, and shared by every job of a [`Kiln`].
//! A failed load is retried on the next use.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `kiln` binary (clap + anyhow + indicatif + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod batch;
pub mod bundle;
pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use batch::{run_batch, BatchOrchestrator};
pub use bundle::{plan_download, DownloadPlan};
pub use config::{PipelineConfig, PipelineConfigBuilder, RasterFormat};
pub use convert::{
    convert_paths, convert_sources, load_sources, write_files, write_outputs, BatchOutcome,
    BatchStats, ImageTool, Kiln,
};
pub use engine::{EngineReport, EngineStatus, Engines};
pub use error::{FileError, KilnError};
pub use output::{OutputBlob, OutputFile};
pub use pipeline::canvas::CropRect;
pub use pipeline::intake::{AcceptPolicy, SourceFile};
pub use progress::{
    BatchProgressCallback, EntryId, FileEntry, FileStatus, NoopProgressCallback,
    ProgressCallback, ProgressStore, Snapshot,
};
pub use stream::{settled, snapshot_stream};
