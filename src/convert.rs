//! High-level entry points.
//!
//! A [`Kiln`] owns one [`PipelineConfig`] and one set of [`Engines`], so
//! every call made through it shares the same engine instances. The free
//! functions [`convert_paths`] and [`convert_sources`] build a throwaway
//! `Kiln` for one-off use.
//!
//! Per-file operations (format conversions, image tools, PDF compress and
//! text extraction) run as a batch and return a [`BatchOutcome`]. Each file
//! succeeds or fails on its own, and `Err` means nothing could start. Merge,
//! split and page rendering turn one job into several outputs and return
//! them directly.

use crate::batch::run_batch;
use crate::bundle::{export, DownloadPlan};
use crate::config::PipelineConfig;
use crate::engine::{EngineReport, Engines};
use crate::error::KilnError;
use crate::output::OutputFile;
use crate::pipeline::canvas::{CanvasAdapter, CropRect};
use crate::pipeline::document::{self, DocumentAdapter, DocumentOp};
use crate::pipeline::intake::{intake, AcceptPolicy, Rejection, SourceFile};
use crate::pipeline::{adapter_for, pages, ConversionAdapter};
use crate::progress::{FileEntry, FileStatus, ProgressStore};
use crate::registry::{self, ToolCategory, ToolConfig};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

// ── Results ──────────────────────────────────────────────────────────────

/// Aggregate counters for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BatchStats {
    /// Files that passed intake.
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

/// Final state of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    /// One entry per accepted file, in input order, all terminal.
    pub entries: Vec<FileEntry>,
    /// Files turned away at intake, with reasons.
    pub rejected: Vec<Rejection>,
    pub stats: BatchStats,
}

impl BatchOutcome {
    fn new(entries: Vec<FileEntry>, rejected: Vec<Rejection>, elapsed: Duration) -> Self {
        let succeeded = entries
            .iter()
            .filter(|e| matches!(e.status, FileStatus::Done { .. }))
            .count();
        let stats = BatchStats {
            total: entries.len(),
            succeeded,
            failed: entries.len() - succeeded,
            duration_ms: elapsed.as_millis() as u64,
        };
        Self {
            entries,
            rejected,
            stats,
        }
    }

    pub fn outputs(&self) -> Vec<OutputFile> {
        crate::bundle::completed_outputs(&self.entries)
    }

    /// Single download for one output, a zip named `bundle_name` for more.
    pub fn download_plan(&self, bundle_name: &str) -> DownloadPlan {
        crate::bundle::plan_download(&self.entries, bundle_name)
    }
}

/// Image tools, see [`registry::image_tools`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ImageTool {
    /// At least one side should be set; a missing side keeps the aspect ratio.
    Resize {
        width: Option<u32>,
        height: Option<u32>,
    },
    /// `None` uses [`PipelineConfig::compress_quality`].
    Compress { quality: Option<f32> },
    StripMetadata,
}

impl ImageTool {
    pub fn id(&self) -> &'static str {
        match self {
            ImageTool::Resize { .. } => "resize",
            ImageTool::Compress { .. } => "compress",
            ImageTool::StripMetadata => "strip-metadata",
        }
    }
}

// ── Kiln ─────────────────────────────────────────────────────────────────

/// A configured pipeline with its shared engines.
#[derive(Debug, Clone)]
pub struct Kiln {
    config: PipelineConfig,
    engines: Arc<Engines>,
}

impl Kiln {
    pub fn new(config: PipelineConfig) -> Self {
        let engines = Engines::new(&config);
        Self { config, engines }
    }

    /// Use engines shared with another pipeline.
    pub fn with_engines(config: PipelineConfig, engines: Arc<Engines>) -> Self {
        Self { config, engines }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn engines(&self) -> &Arc<Engines> {
        &self.engines
    }

    /// Load every engine now instead of on first use. Failures are reported,
    /// not returned; the next use retries them.
    pub async fn warm_up(&self) -> Vec<EngineReport> {
        let (transcoder, documents) = tokio::join!(
            self.engines.transcoder.get(),
            self.engines.documents.get()
        );
        debug!(
            ffmpeg = transcoder.is_ok(),
            pdfium = documents.is_ok(),
            "engine warm-up finished"
        );
        self.engines.report()
    }

    // ── Batches ──────────────────────────────────────────────────────────

    /// Run a registered conversion (`"png-to-jpg"`, `"mkv-to-mp4"`, ...).
    pub async fn convert(
        &self,
        slug: &str,
        sources: Vec<SourceFile>,
    ) -> Result<BatchOutcome, KilnError> {
        let conversion = registry::conversion(slug).ok_or_else(|| KilnError::UnknownConversion {
            slug: slug.to_string(),
        })?;
        let adapter = adapter_for(conversion, &self.engines, &self.config);
        self.run(adapter, sources, AcceptPolicy::from_conversion(conversion))
            .await
    }

    /// Apply an image tool to every accepted file, optionally cropping first.
    pub async fn run_image_tool(
        &self,
        tool: ImageTool,
        crop: Option<CropRect>,
        sources: Vec<SourceFile>,
    ) -> Result<BatchOutcome, KilnError> {
        let config = tool_config(ToolCategory::Image, tool.id())?;
        let adapter = match tool {
            ImageTool::Resize { width, height } => CanvasAdapter::resize(width, height),
            ImageTool::Compress { quality } => {
                CanvasAdapter::compress(quality.unwrap_or(self.config.compress_quality))
            }
            ImageTool::StripMetadata => CanvasAdapter::strip_metadata(),
        };
        let adapter = match crop {
            Some(rect) => adapter.with_crop(rect),
            None => adapter,
        };
        self.run(Arc::new(adapter), sources, batch_policy(config))
            .await
    }

    /// Re-save each PDF without unreferenced objects.
    pub async fn pdf_compress(&self, sources: Vec<SourceFile>) -> Result<BatchOutcome, KilnError> {
        self.document_batch(DocumentOp::Compress, "compress", sources)
            .await
    }

    /// Extract the text of each PDF into a `.txt` output.
    pub async fn pdf_extract_text(
        &self,
        sources: Vec<SourceFile>,
    ) -> Result<BatchOutcome, KilnError> {
        self.document_batch(DocumentOp::ExtractText, "extract-text", sources)
            .await
    }

    async fn document_batch(
        &self,
        op: DocumentOp,
        tool: &str,
        sources: Vec<SourceFile>,
    ) -> Result<BatchOutcome, KilnError> {
        let config = tool_config(ToolCategory::Pdf, tool)?;
        let adapter = DocumentAdapter::new(self.engines.clone(), op);
        self.run(Arc::new(adapter), sources, batch_policy(config))
            .await
    }

    async fn run(
        &self,
        adapter: Arc<dyn ConversionAdapter>,
        sources: Vec<SourceFile>,
        policy: AcceptPolicy,
    ) -> Result<BatchOutcome, KilnError> {
        let start = Instant::now();
        let policy = policy.max_size(self.config.max_file_size);
        let report = intake(sources, &policy).require_any()?;
        info!(
            adapter = %adapter.label(),
            accepted = report.accepted.len(),
            rejected = report.rejected.len(),
            "starting batch"
        );

        let snapshot = run_batch(
            adapter,
            report.accepted,
            ProgressStore::new(),
            self.config.progress_callback.clone(),
        )
        .await?;
        Ok(BatchOutcome::new(
            snapshot.to_vec(),
            report.rejected,
            start.elapsed(),
        ))
    }

    // ── Multi-output PDF jobs ────────────────────────────────────────────

    /// Concatenate the accepted PDFs, in input order, into `merged.pdf`.
    pub async fn pdf_merge(&self, sources: Vec<SourceFile>) -> Result<OutputFile, KilnError> {
        let config = tool_config(ToolCategory::Pdf, "merge")?;
        let policy = AcceptPolicy::from_tool(config).max_size(self.config.max_file_size);
        let report = intake(sources, &policy);
        let accepted: Vec<SourceFile> = report.accepted.into_iter().map(|q| q.source).collect();
        if accepted.len() < 2 {
            return Err(KilnError::NotEnoughInputs {
                needed: 2,
                got: accepted.len(),
            });
        }
        blocking(move || document::merge(&accepted)).await
    }

    /// One PDF per range of `ranges` (e.g. `"1-3,7"`).
    pub async fn pdf_split(
        &self,
        source: SourceFile,
        ranges: &str,
    ) -> Result<Vec<OutputFile>, KilnError> {
        let source = self.single_pdf("split", source)?;
        let ranges = ranges.to_string();
        blocking(move || {
            let total = document::page_count(&source)?;
            let ranges = pages::require_ranges(&ranges, total)?;
            debug!(file = %source.name, total, ranges = ranges.len(), "splitting");
            document::split(&source, &ranges)
        })
        .await
    }

    /// Render every page with the configured scale and format.
    pub async fn pdf_to_images(&self, source: SourceFile) -> Result<Vec<OutputFile>, KilnError> {
        let source = self.single_pdf("to-image", source)?;
        let engine = self.engines.documents.get().await?;
        let scale = self.config.raster_scale;
        let format = self.config.raster_format;
        let quality = self.config.canvas_quality;
        blocking(move || {
            document::rasterize(&engine, &source, scale, format, quality).map_err(|e| {
                KilnError::Document {
                    detail: e.to_string(),
                }
            })
        })
        .await
    }

    fn single_pdf(&self, tool: &str, source: SourceFile) -> Result<SourceFile, KilnError> {
        let config = tool_config(ToolCategory::Pdf, tool)?;
        let policy = AcceptPolicy::from_tool(config).max_size(self.config.max_file_size);
        let mut report = intake(vec![source], &policy).require_any()?;
        Ok(report.accepted.remove(0).source)
    }
}

fn tool_config(category: ToolCategory, id: &str) -> Result<&'static ToolConfig, KilnError> {
    let found = match category {
        ToolCategory::Image => registry::image_tool(id),
        ToolCategory::Pdf => registry::pdf_tool(id),
    };
    found.ok_or_else(|| KilnError::UnknownTool {
        category: category.to_string(),
        id: id.to_string(),
    })
}

// Batch entry points process every accepted file, even for single-file tools.
fn batch_policy(config: &ToolConfig) -> AcceptPolicy {
    AcceptPolicy::from_tool(config).multiple(true)
}

async fn blocking<T, F>(f: F) -> Result<T, KilnError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, KilnError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KilnError::Internal(format!("document task panicked: {e}")))?
}

// ── Free functions ───────────────────────────────────────────────────────

/// Read `paths` into memory, in order.
pub async fn load_sources(paths: &[impl AsRef<Path>]) -> Result<Vec<SourceFile>, KilnError> {
    let mut sources = Vec::with_capacity(paths.len());
    for path in paths {
        sources.push(SourceFile::from_path(path.as_ref()).await?);
    }
    Ok(sources)
}

/// Run the conversion `slug` over files on disk.
pub async fn convert_paths(
    slug: &str,
    paths: &[impl AsRef<Path>],
    config: &PipelineConfig,
) -> Result<BatchOutcome, KilnError> {
    let sources = load_sources(paths).await?;
    convert_sources(slug, sources, config).await
}

/// Run the conversion `slug` over in-memory files.
pub async fn convert_sources(
    slug: &str,
    sources: Vec<SourceFile>,
    config: &PipelineConfig,
) -> Result<BatchOutcome, KilnError> {
    Kiln::new(config.clone()).convert(slug, sources).await
}

/// Write a batch's outputs into `dir`: one file directly, several as a zip.
pub async fn write_outputs(
    outcome: &BatchOutcome,
    dir: &Path,
    bundle_name: &str,
) -> Result<Vec<PathBuf>, KilnError> {
    export(outcome.download_plan(bundle_name), dir).await
}

/// Write job outputs into `dir`, bundling when there are several.
pub async fn write_files(
    files: Vec<OutputFile>,
    dir: &Path,
    bundle_name: &str,
) -> Result<Vec<PathBuf>, KilnError> {
    export(DownloadPlan::for_outputs(files, bundle_name), dir).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png(name: &str) -> SourceFile {
        let img = image::RgbaImage::from_pixel(8, 4, image::Rgba([10, 200, 30, 255]));
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        SourceFile::new(name, buf.into_inner())
    }

    #[tokio::test]
    async fn unknown_slug_is_fatal() {
        let err = convert_sources("png-to-docx", vec![png("a.png")], &PipelineConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::UnknownConversion { .. }));
    }

    #[tokio::test]
    async fn outcome_counts_and_rejections() {
        let sources = vec![
            png("a.png"),
            SourceFile::new("notes.txt", b"hi".to_vec()),
            SourceFile::new("broken.png", b"nope".to_vec()),
        ];
        let outcome = convert_sources("png-to-jpg", sources, &PipelineConfig::default())
            .await
            .unwrap();

        assert_eq!(outcome.stats.total, 2);
        assert_eq!(outcome.stats.succeeded, 1);
        assert_eq!(outcome.stats.failed, 1);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].name, "notes.txt");
        assert_eq!(outcome.outputs()[0].name, "a.jpg");
    }

    #[tokio::test]
    async fn single_file_tools_accept_batches() {
        let kiln = Kiln::new(PipelineConfig::default());
        let outcome = kiln
            .run_image_tool(ImageTool::StripMetadata, None, vec![png("a.png"), png("b.png")])
            .await
            .unwrap();
        assert_eq!(outcome.stats.succeeded, 2);
        assert!(matches!(outcome.download_plan("clean.zip"), DownloadPlan::Bundle { .. }));
    }

    #[tokio::test]
    async fn merge_counts_only_accepted_pdfs() {
        let kiln = Kiln::new(PipelineConfig::default());
        let err = kiln
            .pdf_merge(vec![
                SourceFile::new("a.pdf", document::tests::sample_pdf("a", 1)),
                png("b.png"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::NotEnoughInputs { needed: 2, got: 1 }));
    }

    #[tokio::test]
    async fn split_rejects_empty_ranges() {
        let kiln = Kiln::new(PipelineConfig::default());
        let source = SourceFile::new("r.pdf", document::tests::sample_pdf("r", 3));
        let err = kiln.pdf_split(source, "9-12").await.unwrap_err();
        assert!(matches!(err, KilnError::InvalidPageRanges { total: 3, .. }));
    }

    #[tokio::test]
    async fn write_outputs_bundles_several() {
        let kiln = Kiln::new(PipelineConfig::default());
        let outcome = kiln
            .run_image_tool(
                ImageTool::Resize {
                    width: Some(4),
                    height: None,
                },
                None,
                vec![png("a.png"), png("b.png")],
            )
            .await
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let written = write_outputs(&outcome, dir.path(), "resized.zip").await.unwrap();
        assert_eq!(written, [dir.path().join("resized.zip")]);
    }
}
