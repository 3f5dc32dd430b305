//! Static registry of formats, conversions and tools.
//!
//! Everything here is built from fixed tables at compile time and never
//! mutated. Pipeline instances share it read-only.

use serde::Serialize;
use std::fmt;

// ── Formats ──────────────────────────────────────────────────────────────

/// Broad media family of a format, used to group conversions in listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Image,
    Document,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Image => "image",
            MediaKind::Document => "document",
        })
    }
}

/// One file format: its short name, MIME type and canonical extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FormatInfo {
    pub format: &'static str,
    pub kind: MediaKind,
    pub mime: &'static str,
    /// Includes the leading dot, e.g. `".mp4"`.
    pub extension: &'static str,
}

/// The known formats.
pub mod formats {
    use super::{FormatInfo, MediaKind};

    const fn f(format: &'static str, kind: MediaKind, mime: &'static str, extension: &'static str) -> FormatInfo {
        FormatInfo { format, kind, mime, extension }
    }

    pub const MP4: FormatInfo = f("mp4", MediaKind::Video, "video/mp4", ".mp4");
    pub const MP3: FormatInfo = f("mp3", MediaKind::Audio, "audio/mpeg", ".mp3");
    pub const WEBM: FormatInfo = f("webm", MediaKind::Video, "video/webm", ".webm");
    pub const GIF: FormatInfo = f("gif", MediaKind::Image, "image/gif", ".gif");
    pub const MKV: FormatInfo = f("mkv", MediaKind::Video, "video/x-matroska", ".mkv");
    pub const MOV: FormatInfo = f("mov", MediaKind::Video, "video/quicktime", ".mov");
    pub const WAV: FormatInfo = f("wav", MediaKind::Audio, "audio/wav", ".wav");
    pub const FLAC: FormatInfo = f("flac", MediaKind::Audio, "audio/flac", ".flac");
    pub const OGG: FormatInfo = f("ogg", MediaKind::Audio, "audio/ogg", ".ogg");
    pub const M4A: FormatInfo = f("m4a", MediaKind::Audio, "audio/mp4", ".m4a");
    pub const HEIC: FormatInfo = f("heic", MediaKind::Image, "image/heic", ".heic");
    pub const JPG: FormatInfo = f("jpg", MediaKind::Image, "image/jpeg", ".jpg");
    pub const WEBP: FormatInfo = f("webp", MediaKind::Image, "image/webp", ".webp");
    pub const PNG: FormatInfo = f("png", MediaKind::Image, "image/png", ".png");
    pub const SVG: FormatInfo = f("svg", MediaKind::Image, "image/svg+xml", ".svg");
    pub const TIFF: FormatInfo = f("tiff", MediaKind::Image, "image/tiff", ".tiff");
    pub const PDF: FormatInfo = f("pdf", MediaKind::Document, "application/pdf", ".pdf");
    pub const TXT: FormatInfo = f("txt", MediaKind::Document, "text/plain;charset=utf-8", ".txt");
    pub const ZIP: FormatInfo = f("zip", MediaKind::Document, "application/zip", ".zip");

    pub(crate) const ALL: &[FormatInfo] = &[
        MP4, MP3, WEBM, GIF, MKV, MOV, WAV, FLAC, OGG, M4A, HEIC, JPG, WEBP, PNG, SVG, TIFF, PDF,
        TXT, ZIP,
    ];
}

/// Look up a format by file extension (with or without the dot, any case).
///
/// Accepts the common aliases `jpeg` and `tif`.
pub fn format_for_extension(ext: &str) -> Option<&'static FormatInfo> {
    let ext = ext.trim_start_matches('.').to_ascii_lowercase();
    let ext = match ext.as_str() {
        "jpeg" => "jpg",
        "tif" => "tiff",
        other => other,
    };
    formats::ALL.iter().find(|f| &f.extension[1..] == ext)
}

/// Guess the MIME type of a file from its name.
pub fn mime_for_name(name: &str) -> Option<&'static str> {
    let (_, ext) = name.rsplit_once('.')?;
    format_for_extension(ext).map(|f| f.mime)
}

// ── Conversions ──────────────────────────────────────────────────────────

/// Default encoder arguments when a transcode entry sets none.
pub const DEFAULT_ENCODER_ARGS: &[&str] = &["-preset", "ultrafast"];

/// Parameters for the canvas (decode → redraw → encode) engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CanvasParams {
    /// Lossy encode quality in `0.0..=1.0`; `None` uses the pipeline default.
    pub quality: Option<f32>,
}

/// Parameters for the ffmpeg transcode engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TranscodeParams {
    /// Arguments inserted between the input and the output path.
    /// Empty means [`DEFAULT_ENCODER_ARGS`].
    pub encoder_args: &'static [&'static str],
    /// Try a stream copy (`-c copy`) before re-encoding.
    pub try_remux: bool,
}

impl TranscodeParams {
    pub fn effective_args(&self) -> &'static [&'static str] {
        if self.encoder_args.is_empty() {
            DEFAULT_ENCODER_ARGS
        } else {
            self.encoder_args
        }
    }
}

/// Engine kind a conversion runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Canvas,
    Transcode,
    Document,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineKind::Canvas => "canvas",
            EngineKind::Transcode => "ffmpeg",
            EngineKind::Document => "pdfium",
        })
    }
}

/// Engine selection plus its engine-specific parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "engine", rename_all = "lowercase")]
pub enum EngineSpec {
    Canvas(CanvasParams),
    Transcode(TranscodeParams),
}

impl EngineSpec {
    pub fn kind(&self) -> EngineKind {
        match self {
            EngineSpec::Canvas(_) => EngineKind::Canvas,
            EngineSpec::Transcode(_) => EngineKind::Transcode,
        }
    }
}

/// A source/target format pair mapped to the engine that converts it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConversionConfig {
    pub slug: &'static str,
    pub from: FormatInfo,
    pub to: FormatInfo,
    pub engine: EngineSpec,
}

const fn transcode(
    slug: &'static str,
    from: FormatInfo,
    to: FormatInfo,
    encoder_args: &'static [&'static str],
    try_remux: bool,
) -> ConversionConfig {
    ConversionConfig {
        slug,
        from,
        to,
        engine: EngineSpec::Transcode(TranscodeParams { encoder_args, try_remux }),
    }
}

const fn canvas(slug: &'static str, from: FormatInfo, to: FormatInfo) -> ConversionConfig {
    ConversionConfig {
        slug,
        from,
        to,
        engine: EngineSpec::Canvas(CanvasParams { quality: None }),
    }
}

const TO_MP3: &[&str] = &["-vn", "-c:a", "libmp3lame", "-b:a", "192k"];
const TO_GIF: &[&str] = &["-vf", "fps=10,scale=480:-1:flags=lanczos", "-loop", "0"];
const TO_WEBM: &[&str] = &["-c:v", "libvpx-vp9", "-deadline", "realtime", "-cpu-used", "8", "-c:a", "libopus"];
const TO_WAV: &[&str] = &["-c:a", "pcm_s16le"];

static CONVERSIONS: &[ConversionConfig] = &[
    // video
    transcode("mp4-to-mp3", formats::MP4, formats::MP3, TO_MP3, false),
    transcode("mp4-to-webm", formats::MP4, formats::WEBM, TO_WEBM, false),
    transcode("mp4-to-gif", formats::MP4, formats::GIF, TO_GIF, false),
    transcode("mkv-to-mp4", formats::MKV, formats::MP4, &[], true),
    transcode("mov-to-mp4", formats::MOV, formats::MP4, &[], true),
    // audio
    transcode("wav-to-mp3", formats::WAV, formats::MP3, TO_MP3, false),
    transcode("flac-to-mp3", formats::FLAC, formats::MP3, TO_MP3, false),
    transcode("ogg-to-mp3", formats::OGG, formats::MP3, TO_MP3, false),
    transcode("m4a-to-mp3", formats::M4A, formats::MP3, TO_MP3, false),
    transcode("mp3-to-wav", formats::MP3, formats::WAV, TO_WAV, false),
    // image
    canvas("heic-to-jpg", formats::HEIC, formats::JPG),
    canvas("webp-to-png", formats::WEBP, formats::PNG),
    canvas("png-to-jpg", formats::PNG, formats::JPG),
    canvas("jpg-to-webp", formats::JPG, formats::WEBP),
    canvas("svg-to-png", formats::SVG, formats::PNG),
];

/// Look up a conversion by slug, e.g. `"png-to-jpg"`.
pub fn conversion(slug: &str) -> Option<&'static ConversionConfig> {
    CONVERSIONS.iter().find(|c| c.slug == slug)
}

/// All registered conversions in table order.
pub fn conversions() -> &'static [ConversionConfig] {
    CONVERSIONS
}

pub fn conversion_slugs() -> impl Iterator<Item = &'static str> {
    CONVERSIONS.iter().map(|c| c.slug)
}

/// Conversions whose *source* format belongs to `kind`.
pub fn conversions_by_kind(kind: MediaKind) -> impl Iterator<Item = &'static ConversionConfig> {
    CONVERSIONS.iter().filter(move |c| c.from.kind == kind)
}

// ── Tools ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    Image,
    Pdf,
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ToolCategory::Image => "image",
            ToolCategory::Pdf => "pdf",
        })
    }
}

/// A single-purpose tool (resize, merge, ...) and its intake rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ToolConfig {
    pub id: &'static str,
    pub category: ToolCategory,
    pub accepted_types: &'static [&'static str],
    pub max_file_size: Option<u64>,
    /// Whether the tool takes several files in one run.
    pub multiple: bool,
}

const PNG_JPEG_WEBP: &[&str] = &["image/png", "image/jpeg", "image/webp"];
const PDF_ONLY: &[&str] = &["application/pdf"];

static IMAGE_TOOLS: &[ToolConfig] = &[
    ToolConfig {
        id: "resize",
        category: ToolCategory::Image,
        accepted_types: &["image/png", "image/jpeg", "image/webp", "image/gif"],
        max_file_size: None,
        multiple: false,
    },
    ToolConfig {
        id: "compress",
        category: ToolCategory::Image,
        accepted_types: PNG_JPEG_WEBP,
        max_file_size: None,
        multiple: false,
    },
    ToolConfig {
        id: "strip-metadata",
        category: ToolCategory::Image,
        accepted_types: &["image/png", "image/jpeg", "image/webp", "image/tiff"],
        max_file_size: None,
        multiple: false,
    },
];

const fn pdf_tool_entry(id: &'static str, multiple: bool) -> ToolConfig {
    ToolConfig {
        id,
        category: ToolCategory::Pdf,
        accepted_types: PDF_ONLY,
        max_file_size: None,
        multiple,
    }
}

static PDF_TOOLS: &[ToolConfig] = &[
    pdf_tool_entry("merge", true),
    pdf_tool_entry("split", false),
    pdf_tool_entry("compress", false),
    pdf_tool_entry("to-image", false),
    pdf_tool_entry("extract-text", false),
];

pub fn image_tool(id: &str) -> Option<&'static ToolConfig> {
    IMAGE_TOOLS.iter().find(|t| t.id == id)
}

pub fn image_tools() -> &'static [ToolConfig] {
    IMAGE_TOOLS
}

pub fn pdf_tool(id: &str) -> Option<&'static ToolConfig> {
    PDF_TOOLS.iter().find(|t| t.id == id)
}

pub fn pdf_tools() -> &'static [ToolConfig] {
    PDF_TOOLS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn slugs_are_unique_and_match_formats() {
        let mut seen = HashSet::new();
        for c in conversions() {
            assert!(seen.insert(c.slug), "duplicate slug {}", c.slug);
            assert_eq!(c.slug, format!("{}-to-{}", c.from.format, c.to.format));
        }
    }

    #[test]
    fn remux_only_on_container_changes() {
        let remuxing: Vec<_> = conversions()
            .iter()
            .filter(|c| matches!(c.engine, EngineSpec::Transcode(p) if p.try_remux))
            .map(|c| c.slug)
            .collect();
        assert_eq!(remuxing, ["mkv-to-mp4", "mov-to-mp4"]);
    }

    #[test]
    fn empty_encoder_args_fall_back_to_default() {
        let EngineSpec::Transcode(p) = conversion("mkv-to-mp4").unwrap().engine else {
            panic!("mkv-to-mp4 should be a transcode");
        };
        assert_eq!(p.effective_args(), DEFAULT_ENCODER_ARGS);
    }

    #[test]
    fn png_to_jpg_targets_jpeg_mime() {
        let c = conversion("png-to-jpg").unwrap();
        assert_eq!(c.to.mime, "image/jpeg");
        assert_eq!(c.engine.kind(), EngineKind::Canvas);
    }

    #[test]
    fn by_kind_groups_on_source_format() {
        let audio: Vec<_> = conversions_by_kind(MediaKind::Audio).map(|c| c.slug).collect();
        assert!(audio.contains(&"mp3-to-wav"));
        assert!(!audio.contains(&"mp4-to-mp3"));
    }

    #[test]
    fn extension_lookup_handles_aliases() {
        assert_eq!(format_for_extension("JPEG").unwrap().format, "jpg");
        assert_eq!(format_for_extension(".tif").unwrap().format, "tiff");
        assert!(format_for_extension("docx").is_none());
        assert_eq!(mime_for_name("Scan.PDF"), Some("application/pdf"));
        assert_eq!(mime_for_name("README"), None);
    }

    #[test]
    fn only_merge_takes_multiple_files() {
        let multi: Vec<_> = pdf_tools().iter().filter(|t| t.multiple).map(|t| t.id).collect();
        assert_eq!(multi, ["merge"]);
        assert!(image_tool("remove-bg").is_none());
        assert_eq!(image_tool("strip-metadata").unwrap().accepted_types.len(), 4);
    }
}
