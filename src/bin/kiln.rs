//! CLI binary for filekiln.
//!
//! A thin shim over the library crate: maps flags to a `PipelineConfig`,
//! runs one conversion or tool, writes the outputs and prints a summary.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use filekiln::bundle::{bundle_name, DEFAULT_BUNDLE_NAME};
use filekiln::registry::{self, MediaKind};
use filekiln::{
    load_sources, write_files, write_outputs, BatchOutcome, BatchProgressCallback, CropRect,
    EngineStatus, EntryId, ImageTool, Kiln, OutputFile, PipelineConfig, ProgressCallback,
    RasterFormat,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn truncate(msg: &str, max: usize) -> String {
    if msg.chars().count() > max {
        let head: String = msg.chars().take(max - 1).collect();
        format!("{head}\u{2026}")
    } else {
        msg.to_string()
    }
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar for the batch, one log line per file.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<EntryId, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    /// Spinner only; `on_batch_start` switches to a counted bar.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Reading files…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} files  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Converting");
        self.bar.reset_eta();
    }

    fn elapsed(&self, id: EntryId) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&id))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, count: usize) {
        self.activate_bar(count);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Converting {count} file(s)…"))
        ));
    }

    fn on_file_start(&self, id: EntryId, name: &str) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(id, Instant::now());
        }
        self.bar.set_message(truncate(name, 40));
    }

    fn on_file_progress(&self, _id: EntryId, name: &str, percent: u8) {
        self.bar
            .set_message(format!("{}  {}", truncate(name, 40), dim(&format!("{percent:>3}%"))));
    }

    fn on_file_complete(&self, id: EntryId, name: &str, output_len: usize) {
        let secs = self.elapsed(id);
        self.bar.println(format!(
            "  {} {:<40}  {:>10}  {}",
            green("✓"),
            truncate(name, 40),
            dim(&human_size(output_len as u64)),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_file_error(&self, id: EntryId, name: &str, error: &str) {
        let secs = self.elapsed(id);
        self.errors.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {:<40}  {}  {}",
            red("✗"),
            truncate(name, 40),
            red(&truncate(error, 80)),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total: usize, success_count: usize) {
        let failed = total.saturating_sub(success_count);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} file(s) converted successfully",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} file(s) converted  ({} failed)",
                if failed == total { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total,
                red(&failed.to_string()),
            );
        }
    }
}

/// Spinner for jobs that produce their outputs in one go (merge, split, ...).
fn job_spinner(show: bool, prefix: &'static str, msg: String) -> Option<ProgressBar> {
    if !show {
        return None;
    }
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  ⏱ {elapsed}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS),
    );
    bar.set_prefix(prefix);
    bar.set_message(msg);
    bar.enable_steady_tick(Duration::from_millis(80));
    Some(bar)
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # List every conversion, or only the audio ones
  kiln list
  kiln list --kind audio

  # Convert a batch; several outputs are zipped
  kiln convert png-to-jpg *.png -o out/
  kiln convert mkv-to-mp4 talk.mkv -o out/

  # Image tools (crop is x,y,width,height, applied first)
  kiln image resize --width 800 photos/*.jpg -o small/
  kiln image compress --quality 0.6 hero.png
  kiln image strip-metadata --crop 0,0,1200,630 banner.jpg

  # PDF tools
  kiln pdf merge a.pdf b.pdf c.pdf -o out/
  kiln pdf split report.pdf --ranges 1-3,7
  kiln pdf to-image slides.pdf --scale 1.5 --format jpeg
  kiln pdf extract-text paper.pdf

  # Check which engines load on this machine
  kiln engines --load

ENVIRONMENT VARIABLES:
  KILN_FFMPEG             ffmpeg binary (default: ffmpeg on PATH)
  KILN_FFPROBE            ffprobe binary (default: ffprobe on PATH)
  KILN_OUTPUT             Output directory (default: current directory)
  KILN_MAX_SIZE           Per-file size cap in bytes
  PDFIUM_LIB_PATH         Path to an existing libpdfium; skips auto-download
  RUST_LOG                Overrides the log filter

SETUP:
  Audio and video conversions need ffmpeg and ffprobe.
  PDFium (~30 MB) is downloaded on first use of `pdf to-image` or
  `pdf extract-text` and cached under ~/.cache/filekiln/.
"#;

/// Batch-convert video, audio, images and PDFs locally.
#[derive(Parser, Debug)]
#[command(
    name = "kiln",
    version,
    about = "Batch-convert video, audio, images and PDFs locally",
    long_about = "Convert files between formats and run image and PDF tools without \
uploading anything. Audio and video go through ffmpeg, images are handled in process, \
and PDFs use lopdf and PDFium.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Print a JSON report on stdout instead of the human summary.
    #[arg(long, global = true, env = "KILN_JSON")]
    json: bool,

    /// Disable progress bars.
    #[arg(long, global = true, env = "KILN_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "KILN_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "KILN_QUIET")]
    quiet: bool,

    /// ffmpeg binary.
    #[arg(long, global = true, env = "KILN_FFMPEG", default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    /// ffprobe binary.
    #[arg(long, global = true, env = "KILN_FFPROBE", default_value = "ffprobe")]
    ffprobe: PathBuf,

    /// Reject input files larger than this many bytes.
    #[arg(long, global = true, env = "KILN_MAX_SIZE")]
    max_size: Option<u64>,
}

impl Cli {
    fn show_progress(&self) -> bool {
        !self.quiet && !self.no_progress && !self.json
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered conversions and tools.
    List {
        /// Only show conversions from this media family.
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
    },

    /// Run a registered conversion (e.g. png-to-jpg) over files.
    Convert {
        /// Conversion slug, see `kiln list`.
        slug: String,

        #[command(flatten)]
        inputs: Inputs,

        /// Lossy encode quality (0.1–1.0).
        #[arg(long, env = "KILN_QUALITY")]
        quality: Option<f32>,
    },

    /// Image tools.
    #[command(subcommand)]
    Image(ImageCommand),

    /// PDF tools.
    #[command(subcommand)]
    Pdf(PdfCommand),

    /// Show engine status.
    Engines {
        /// Load every engine first (may download PDFium).
        #[arg(long)]
        load: bool,
    },
}

#[derive(Args, Debug)]
struct Inputs {
    /// Input files.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Directory to write outputs into.
    #[arg(short, long, env = "KILN_OUTPUT", default_value = ".")]
    output: PathBuf,

    /// Name of the zip written when there are several outputs.
    #[arg(long)]
    bundle: Option<String>,
}

impl Inputs {
    fn bundle_or(&self, default: impl FnOnce() -> String) -> String {
        self.bundle.clone().unwrap_or_else(default)
    }
}

#[derive(Subcommand, Debug)]
enum ImageCommand {
    /// Resize; give one side to keep the aspect ratio.
    Resize {
        #[command(flatten)]
        inputs: Inputs,
        #[arg(long, required_unless_present = "height")]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
        /// Crop x,y,width,height before resizing.
        #[arg(long, value_parser = parse_crop)]
        crop: Option<CropRect>,
    },

    /// Re-encode at a lower quality.
    Compress {
        #[command(flatten)]
        inputs: Inputs,
        /// Quality (0.1–1.0). Default: 0.7.
        #[arg(long)]
        quality: Option<f32>,
        #[arg(long, value_parser = parse_crop)]
        crop: Option<CropRect>,
    },

    /// Re-encode without EXIF and other metadata.
    StripMetadata {
        #[command(flatten)]
        inputs: Inputs,
        #[arg(long, value_parser = parse_crop)]
        crop: Option<CropRect>,
    },
}

#[derive(Subcommand, Debug)]
enum PdfCommand {
    /// Concatenate PDFs in the given order into merged.pdf.
    Merge {
        #[command(flatten)]
        inputs: Inputs,
    },

    /// Split one PDF into one file per page range.
    Split {
        file: PathBuf,
        /// Comma-separated ranges, e.g. "1-3,5,8-10".
        #[arg(long, short)]
        ranges: String,
        #[arg(short, long, env = "KILN_OUTPUT", default_value = ".")]
        output: PathBuf,
    },

    /// Drop unreferenced objects and recompress streams.
    Compress {
        #[command(flatten)]
        inputs: Inputs,
    },

    /// Render every page to an image.
    ToImage {
        file: PathBuf,
        /// Render scale (1.0 = 72 DPI, 0.5–4.0).
        #[arg(long, env = "KILN_RASTER_SCALE", default_value_t = 2.0)]
        scale: f32,
        #[arg(long, value_enum, env = "KILN_RASTER_FORMAT", default_value = "png")]
        format: FormatArg,
        #[arg(short, long, env = "KILN_OUTPUT", default_value = ".")]
        output: PathBuf,
    },

    /// Extract the text layer into a .txt file.
    ExtractText {
        #[command(flatten)]
        inputs: Inputs,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Video,
    Audio,
    Image,
    Document,
}

impl From<KindArg> for MediaKind {
    fn from(v: KindArg) -> Self {
        match v {
            KindArg::Video => MediaKind::Video,
            KindArg::Audio => MediaKind::Audio,
            KindArg::Image => MediaKind::Image,
            KindArg::Document => MediaKind::Document,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Png,
    Jpeg,
}

impl From<FormatArg> for RasterFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Png => RasterFormat::Png,
            FormatArg::Jpeg => RasterFormat::Jpeg,
        }
    }
}

/// Parse `x,y,width,height`.
fn parse_crop(s: &str) -> Result<CropRect, String> {
    let parts: Vec<u32> = s
        .split(',')
        .map(|p| p.trim().parse::<u32>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("invalid crop '{s}': {e}"))?;
    match parts[..] {
        [x, y, width, height] if width > 0 && height > 0 => Ok(CropRect {
            x,
            y,
            width,
            height,
        }),
        [_, _, _, _] => Err(format!("crop '{s}' has an empty area")),
        _ => Err(format!("crop '{s}' must be x,y,width,height")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless --verbose asks for them.
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || cli.show_progress() {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // Dropping the in-flight job on Ctrl-C cancels its queued files.
    let finished = tokio::select! {
        res = run(&cli) => Some(res),
        _ = tokio::signal::ctrl_c() => None,
    };
    match finished {
        Some(res) => res,
        None => {
            eprintln!("{} interrupted", red("✘"));
            std::process::exit(130);
        }
    }
}

async fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::List { kind } => list(cli, *kind),
        Command::Engines { load } => engines(cli, *load).await,
        Command::Convert {
            slug,
            inputs,
            quality,
        } => {
            let kiln = Kiln::new(build_config(cli, |b| match quality {
                Some(q) => b.canvas_quality(*q),
                None => b,
            })?);
            let sources = load_sources(&inputs.files).await?;
            let outcome = kiln
                .convert(slug, sources)
                .await
                .with_context(|| format!("Conversion '{slug}' failed"))?;
            let bundle = inputs.bundle_or(|| DEFAULT_BUNDLE_NAME.to_string());
            finish_batch(cli, outcome, &inputs.output, &bundle).await
        }
        Command::Image(cmd) => image(cli, cmd).await,
        Command::Pdf(cmd) => pdf(cli, cmd).await,
    }
}

async fn image(cli: &Cli, cmd: &ImageCommand) -> Result<()> {
    let (tool, crop, inputs) = match cmd {
        ImageCommand::Resize {
            inputs,
            width,
            height,
            crop,
        } => (
            ImageTool::Resize {
                width: *width,
                height: *height,
            },
            *crop,
            inputs,
        ),
        ImageCommand::Compress {
            inputs,
            quality,
            crop,
        } => (ImageTool::Compress { quality: *quality }, *crop, inputs),
        ImageCommand::StripMetadata { inputs, crop } => (ImageTool::StripMetadata, *crop, inputs),
    };

    let kiln = Kiln::new(build_config(cli, |b| b)?);
    let sources = load_sources(&inputs.files).await?;
    let outcome = kiln
        .run_image_tool(tool, crop, sources)
        .await
        .with_context(|| format!("Image tool '{}' failed", tool.id()))?;
    let bundle = inputs.bundle_or(|| format!("kiln-{}.zip", tool.id()));
    finish_batch(cli, outcome, &inputs.output, &bundle).await
}

async fn pdf(cli: &Cli, cmd: &PdfCommand) -> Result<()> {
    match cmd {
        PdfCommand::Merge { inputs } => {
            let kiln = Kiln::new(build_config(cli, |b| b)?);
            let sources = load_sources(&inputs.files).await?;
            let spinner = job_spinner(
                cli.show_progress(),
                "Merging",
                format!("{} files", sources.len()),
            );
            let merged = kiln.pdf_merge(sources).await;
            clear(spinner);
            let merged = merged.context("Merge failed")?;
            finish_job(cli, vec![merged], &inputs.output, DEFAULT_BUNDLE_NAME).await
        }
        PdfCommand::Split {
            file,
            ranges,
            output,
        } => {
            let kiln = Kiln::new(build_config(cli, |b| b)?);
            let source = load_one(file).await?;
            let bundle = bundle_name(&source.name, "split");
            let spinner = job_spinner(cli.show_progress(), "Splitting", source.name.clone());
            let parts = kiln.pdf_split(source, ranges).await;
            clear(spinner);
            finish_job(cli, parts.context("Split failed")?, output, &bundle).await
        }
        PdfCommand::ToImage {
            file,
            scale,
            format,
            output,
        } => {
            ensure_pdfium(cli)?;
            let kiln = Kiln::new(build_config(cli, |b| {
                b.raster_scale(*scale).raster_format((*format).into())
            })?);
            let source = load_one(file).await?;
            let bundle = bundle_name(&source.name, "images");
            let spinner = job_spinner(cli.show_progress(), "Rendering", source.name.clone());
            let pages = kiln.pdf_to_images(source).await;
            clear(spinner);
            finish_job(cli, pages.context("Rendering failed")?, output, &bundle).await
        }
        PdfCommand::Compress { inputs } => {
            let kiln = Kiln::new(build_config(cli, |b| b)?);
            let sources = load_sources(&inputs.files).await?;
            let outcome = kiln.pdf_compress(sources).await.context("Compress failed")?;
            let bundle = inputs.bundle_or(|| "kiln-compressed.zip".to_string());
            finish_batch(cli, outcome, &inputs.output, &bundle).await
        }
        PdfCommand::ExtractText { inputs } => {
            ensure_pdfium(cli)?;
            let kiln = Kiln::new(build_config(cli, |b| b)?);
            let sources = load_sources(&inputs.files).await?;
            let outcome = kiln
                .pdf_extract_text(sources)
                .await
                .context("Text extraction failed")?;
            let bundle = inputs.bundle_or(|| "kiln-text.zip".to_string());
            finish_batch(cli, outcome, &inputs.output, &bundle).await
        }
    }
}

// ── Commands without a batch ─────────────────────────────────────────────────

#[derive(Serialize)]
struct Listing<'a> {
    conversions: Vec<&'a registry::ConversionConfig>,
    image_tools: &'a [registry::ToolConfig],
    pdf_tools: &'a [registry::ToolConfig],
}

fn list(cli: &Cli, kind: Option<KindArg>) -> Result<()> {
    let conversions: Vec<_> = match kind {
        Some(k) => registry::conversions_by_kind(k.into()).collect(),
        None => registry::conversions().iter().collect(),
    };

    if cli.json {
        let listing = Listing {
            conversions,
            image_tools: registry::image_tools(),
            pdf_tools: registry::pdf_tools(),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&listing).context("Failed to serialise listing")?
        );
        return Ok(());
    }

    println!("{}", bold("CONVERSIONS"));
    for c in &conversions {
        println!(
            "  {:<16} {:<9} {} → {}  {}",
            c.slug,
            c.from.kind.to_string(),
            c.from.format,
            c.to.format,
            dim(&c.engine.kind().to_string()),
        );
    }
    if kind.is_none() {
        println!();
        println!("{}", bold("TOOLS"));
        for t in registry::image_tools().iter().chain(registry::pdf_tools()) {
            println!(
                "  {:<5} {:<16} {}",
                t.category.to_string(),
                t.id,
                dim(&t.accepted_types.join(", ")),
            );
        }
    }
    Ok(())
}

async fn engines(cli: &Cli, load: bool) -> Result<()> {
    if load {
        ensure_pdfium(cli)?;
    }
    let kiln = Kiln::new(build_config(cli, |b| b)?);
    let reports = if load {
        kiln.warm_up().await
    } else {
        kiln.engines().report()
    };

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&reports).context("Failed to serialise engine report")?
        );
        return Ok(());
    }
    for r in &reports {
        let status = match r.status {
            EngineStatus::Ready => green(&r.status.to_string()),
            EngineStatus::Failed => red(&r.status.to_string()),
            _ => dim(&r.status.to_string()),
        };
        println!("  {:<8} {}", r.name, status);
        if let Some(ref err) = r.error {
            println!("           {}", dim(&truncate(err.lines().next().unwrap_or(""), 100)));
        }
    }
    if !load {
        println!("{}", dim("  (engines load on first use; pass --load to try now)"));
    }
    Ok(())
}

// ── Config & engines ─────────────────────────────────────────────────────────

/// Map global flags to a `PipelineConfig`; `tweak` adds command-specific settings.
fn build_config(
    cli: &Cli,
    tweak: impl FnOnce(filekiln::PipelineConfigBuilder) -> filekiln::PipelineConfigBuilder,
) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .ffmpeg_path(&cli.ffmpeg)
        .ffprobe_path(&cli.ffprobe);
    if let Some(cap) = cli.max_size {
        builder = builder.max_file_size(cap);
    }
    if cli.show_progress() {
        let cb: ProgressCallback = CliProgressCallback::new_dynamic();
        builder = builder.progress_callback(cb);
    }
    tweak(builder).build().context("Invalid configuration")
}

/// Fetch libpdfium up front so the download gets its own progress bar.
fn ensure_pdfium(cli: &Cli) -> Result<()> {
    let asset = engine_fetch::pdfium();
    if engine_fetch::is_cached(asset) {
        return Ok(());
    }
    if cli.quiet || cli.json {
        tokio::task::block_in_place(|| engine_fetch::ensure_asset(asset, None))
            .context("Failed to download PDFium engine")?;
        return Ok(());
    }

    let dl_bar = ProgressBar::new(0);
    dl_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS),
    );
    dl_bar.set_prefix("PDF engine");
    dl_bar.set_message("Connecting…");
    dl_bar.enable_steady_tick(Duration::from_millis(80));

    let bar = dl_bar.clone();
    tokio::task::block_in_place(|| {
        engine_fetch::ensure_asset(
            asset,
            Some(&|downloaded, total| {
                if let Some(t) = total {
                    if bar.length().unwrap_or(0) != t {
                        bar.set_length(t);
                    }
                }
                bar.set_position(downloaded);
            }),
        )
    })
    .context("Failed to download PDFium engine")?;

    dl_bar.finish_with_message("ready ✓");
    Ok(())
}

// ── Output & reporting ───────────────────────────────────────────────────────

async fn load_one(path: &Path) -> Result<filekiln::SourceFile> {
    let mut sources = load_sources(&[path]).await?;
    sources
        .pop()
        .with_context(|| format!("Failed to read {}", path.display()))
}

fn clear(spinner: Option<ProgressBar>) {
    if let Some(bar) = spinner {
        bar.finish_and_clear();
    }
}

#[derive(Serialize)]
struct BatchReport<'a> {
    #[serde(flatten)]
    outcome: &'a BatchOutcome,
    written: &'a [PathBuf],
}

#[derive(Serialize)]
struct JobReport<'a> {
    outputs: &'a [OutputFile],
    written: &'a [PathBuf],
}

async fn finish_batch(cli: &Cli, outcome: BatchOutcome, dir: &Path, bundle: &str) -> Result<()> {
    let written = write_outputs(&outcome, dir, bundle)
        .await
        .context("Failed to write outputs")?;

    if cli.json {
        let report = BatchReport {
            outcome: &outcome,
            written: &written,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
    } else if !cli.quiet {
        for r in &outcome.rejected {
            eprintln!("  {} {:<40}  {}", dim("⊘"), truncate(&r.name, 40), dim(&r.reason.to_string()));
        }
        // The progress callback already logged each file.
        if !cli.show_progress() {
            for e in &outcome.entries {
                match e.error() {
                    Some(err) => eprintln!("  {} {}  {}", red("✗"), e.name, red(err)),
                    None => eprintln!("  {} {}", green("✓"), e.name),
                }
            }
        }
        let stats = outcome.stats;
        eprintln!(
            "{}  {}/{} files  {}ms{}",
            if stats.failed == 0 { green("✔") } else { cyan("⚠") },
            stats.succeeded,
            stats.total,
            stats.duration_ms,
            written_suffix(&written),
        );
    }

    if outcome.stats.succeeded == 0 {
        anyhow::bail!("No file was converted");
    }
    Ok(())
}

async fn finish_job(cli: &Cli, files: Vec<OutputFile>, dir: &Path, bundle: &str) -> Result<()> {
    let written = write_files(files.clone(), dir, bundle)
        .await
        .context("Failed to write outputs")?;

    if cli.json {
        let report = JobReport {
            outputs: &files,
            written: &written,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
    } else if !cli.quiet {
        let total: u64 = files.iter().map(|f| f.bytes().len() as u64).sum();
        eprintln!(
            "{}  {} file(s)  {}{}",
            green("✔"),
            files.len(),
            dim(&human_size(total)),
            written_suffix(&written),
        );
    }
    Ok(())
}

fn written_suffix(written: &[PathBuf]) -> String {
    match written {
        [] => String::new(),
        [one] => format!("  →  {}", bold(&one.display().to_string())),
        many => format!("  →  {} paths", many.len()),
    }
}
