//! Canvas adapter: decode → optional crop/resize → re-encode.
//!
//! Every output is produced by drawing decoded pixels into a fresh buffer and
//! encoding that buffer, so EXIF, XMP, ICC and any other ancillary chunks of
//! the input never reach the output. Strip-metadata is just a lossless
//! re-encode for that reason.
//!
//! Decoding and encoding run on the blocking pool. HEIC/HEIF photos are
//! first decoded to a still frame by the ffmpeg engine, when one is attached.

use super::intake::SourceFile;
use super::{transcode, ConversionAdapter, ProgressTicker};
use crate::engine::Engines;
use crate::error::FileError;
use crate::output::{replace_extension, suffixed_name, OutputFile};
use crate::registry::{formats, ConversionConfig, EngineKind, FormatInfo};
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, RgbaImage};
use once_cell::sync::Lazy;
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

/// Rectangle in source-image pixels, as produced by a crop selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    /// Intersect with a `w`×`h` image. `None` when nothing remains.
    pub fn clamp_to(self, w: u32, h: u32) -> Option<CropRect> {
        if self.x >= w || self.y >= h {
            return None;
        }
        let width = self.width.min(w - self.x);
        let height = self.height.min(h - self.y);
        (width > 0 && height > 0).then_some(CropRect {
            x: self.x,
            y: self.y,
            width,
            height,
        })
    }
}

/// What the canvas adapter does with each image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CanvasOp {
    /// Re-encode to a registered target format.
    Convert { target: FormatInfo },
    /// Resize, output as PNG. A missing side follows the image's aspect ratio.
    Resize {
        width: Option<u32>,
        height: Option<u32>,
    },
    /// Lossy re-encode: JPEG, or WebP when the input is WebP.
    Compress,
    /// Lossless re-encode: PNG, or WebP when the input is WebP.
    StripMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Encoding {
    Png,
    Jpeg,
    WebP,
    Gif,
}

impl Encoding {
    fn for_format(f: &FormatInfo) -> Option<Self> {
        match f.format {
            "png" => Some(Encoding::Png),
            "jpg" => Some(Encoding::Jpeg),
            "webp" => Some(Encoding::WebP),
            "gif" => Some(Encoding::Gif),
            _ => None,
        }
    }

    fn format(self) -> FormatInfo {
        match self {
            Encoding::Png => formats::PNG,
            Encoding::Jpeg => formats::JPG,
            Encoding::WebP => formats::WEBP,
            Encoding::Gif => formats::GIF,
        }
    }
}

/// Largest side a resize may produce.
pub const MAX_CANVAS_SIDE: u32 = 16_384;
/// Largest pixel count a resize may produce.
pub const MAX_CANVAS_PIXELS: u64 = 100_000_000;

/// Image adapter for format conversions and the image tools.
#[derive(Debug, Clone)]
pub struct CanvasAdapter {
    op: CanvasOp,
    quality: f32,
    crop: Option<CropRect>,
    label: String,
    engines: Option<Arc<Engines>>,
}

impl CanvasAdapter {
    pub fn convert_to(conversion: &ConversionConfig, quality: f32) -> Self {
        Self {
            op: CanvasOp::Convert {
                target: conversion.to,
            },
            quality,
            crop: None,
            label: conversion.slug.to_string(),
            engines: None,
        }
    }

    pub fn resize(width: Option<u32>, height: Option<u32>) -> Self {
        let side = |v: Option<u32>| v.map_or_else(|| "auto".to_string(), |v| v.to_string());
        Self {
            op: CanvasOp::Resize { width, height },
            quality: 1.0,
            crop: None,
            label: format!("resize {}x{}", side(width), side(height)),
            engines: None,
        }
    }

    pub fn compress(quality: f32) -> Self {
        Self {
            op: CanvasOp::Compress,
            quality,
            crop: None,
            label: "compress".into(),
            engines: None,
        }
    }

    pub fn strip_metadata() -> Self {
        Self {
            op: CanvasOp::StripMetadata,
            quality: 1.0,
            crop: None,
            label: "strip-metadata".into(),
            engines: None,
        }
    }

    /// Crop every image to `rect` (clamped) before any scaling.
    pub fn with_crop(mut self, rect: CropRect) -> Self {
        self.crop = Some(rect);
        self
    }

    /// Engines used for inputs the image decoders cannot read (HEIC).
    pub fn with_engines(mut self, engines: Arc<Engines>) -> Self {
        self.engines = Some(engines);
        self
    }

    pub fn op(&self) -> CanvasOp {
        self.op
    }

    /// Run the whole operation synchronously.
    pub fn process(&self, source: &SourceFile) -> Result<OutputFile, FileError> {
        let img = decode(source)?;
        self.render(source, img)
    }

    /// Crop, resize and encode an already decoded image.
    fn render(&self, source: &SourceFile, img: DynamicImage) -> Result<OutputFile, FileError> {
        let name = &source.name;
        debug!(file = %name, w = img.width(), h = img.height(), "decoded");

        let img = match self.crop {
            Some(rect) => {
                let r = rect.clamp_to(img.width(), img.height()).ok_or_else(|| {
                    FileError::Encode {
                        name: name.clone(),
                        detail: format!(
                            "crop {rect:?} lies outside the {}x{} image",
                            img.width(),
                            img.height()
                        ),
                    }
                })?;
                img.crop_imm(r.x, r.y, r.width, r.height)
            }
            None => img,
        };

        let input_is_webp = source.mime.as_deref() == Some(formats::WEBP.mime)
            || source.extension().as_deref() == Some(formats::WEBP.extension);

        let (img, encoding, out_name) = match self.op {
            CanvasOp::Convert { target } => {
                let enc = Encoding::for_format(&target).ok_or_else(|| FileError::Encode {
                    name: name.clone(),
                    detail: format!("cannot encode to {}", target.format),
                })?;
                (img, enc, replace_extension(name, target.extension))
            }
            CanvasOp::Resize { width, height } => {
                let (width, height) = fit_dimensions(img.width(), img.height(), width, height);
                check_canvas_size(width, height).map_err(|detail| FileError::Encode {
                    name: name.clone(),
                    detail,
                })?;
                let resized = img.resize_exact(width, height, FilterType::Lanczos3);
                let out = suffixed_name(name, &format!("{width}x{height}"), formats::PNG.extension);
                (resized, Encoding::Png, out)
            }
            CanvasOp::Compress => {
                let enc = if input_is_webp { Encoding::WebP } else { Encoding::Jpeg };
                let out = suffixed_name(name, "compressed", enc.format().extension);
                (img, enc, out)
            }
            CanvasOp::StripMetadata => {
                let enc = if input_is_webp { Encoding::WebP } else { Encoding::Png };
                let out = suffixed_name(name, "clean", enc.format().extension);
                (img, enc, out)
            }
        };

        let bytes = encode(&img, encoding, self.quality).map_err(|detail| FileError::Encode {
            name: name.clone(),
            detail,
        })?;
        Ok(OutputFile::new(out_name, bytes, encoding.format().mime))
    }
}

#[async_trait]
impl ConversionAdapter for CanvasAdapter {
    fn engine(&self) -> EngineKind {
        EngineKind::Canvas
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    async fn convert(
        &self,
        source: &SourceFile,
        progress: &ProgressTicker,
    ) -> Result<OutputFile, FileError> {
        let still = if is_heic(source) {
            let engines = self.engines.as_ref().ok_or_else(|| FileError::Decode {
                name: source.name.clone(),
                detail: "HEIC/HEIF input needs the ffmpeg engine".into(),
            })?;
            let engine = engines
                .transcoder
                .get()
                .await
                .map_err(|e| e.into_file_error(&source.name))?;
            Some(transcode::extract_still(&engine, source).await?)
        } else {
            None
        };
        progress.tick(10);

        let this = self.clone();
        let src = source.clone();
        let out = tokio::task::spawn_blocking(move || match still {
            Some(png) => {
                let img = image::load_from_memory(&png).map_err(|e| FileError::Decode {
                    name: src.name.clone(),
                    detail: e.to_string(),
                })?;
                this.render(&src, img)
            }
            None => this.process(&src),
        })
        .await
        .map_err(|e| FileError::Panicked {
            name: source.name.clone(),
            detail: e.to_string(),
        })??;
        progress.tick(100);
        Ok(out)
    }
}

/// Aspect-preserving size when only one side is given.
///
/// Both given: used as-is. Neither: the source size.
pub fn fit_dimensions(src_w: u32, src_h: u32, width: Option<u32>, height: Option<u32>) -> (u32, u32) {
    let scale = |len: u32, num: u32, den: u32| -> u32 {
        ((len as f64 * num as f64 / den.max(1) as f64).round() as u32).max(1)
    };
    match (width, height) {
        (Some(w), Some(h)) => (w.max(1), h.max(1)),
        (Some(w), None) => (w.max(1), scale(src_h, w, src_w)),
        (None, Some(h)) => (scale(src_w, h, src_h), h.max(1)),
        (None, None) => (src_w, src_h),
    }
}

fn check_canvas_size(width: u32, height: u32) -> Result<(), String> {
    if width > MAX_CANVAS_SIDE
        || height > MAX_CANVAS_SIDE
        || u64::from(width) * u64::from(height) > MAX_CANVAS_PIXELS
    {
        return Err(format!(
            "{width}x{height} exceeds the {MAX_CANVAS_SIDE}px side / {MAX_CANVAS_PIXELS}-pixel limit"
        ));
    }
    Ok(())
}

// ── Decode ───────────────────────────────────────────────────────────────

fn is_kind(source: &SourceFile, f: &FormatInfo, aliases: &[&str]) -> bool {
    source.mime.as_deref() == Some(f.mime)
        || source
            .extension()
            .is_some_and(|e| e == f.extension || aliases.contains(&e.as_str()))
}

fn is_heic(source: &SourceFile) -> bool {
    is_kind(source, &formats::HEIC, &[".heif"]) || source.mime.as_deref() == Some("image/heif")
}

fn decode(source: &SourceFile) -> Result<DynamicImage, FileError> {
    let err = |detail: String| FileError::Decode {
        name: source.name.clone(),
        detail,
    };

    if is_heic(source) {
        return Err(err("HEIC/HEIF input needs the ffmpeg engine".into()));
    }
    if is_kind(source, &formats::SVG, &[]) {
        return rasterize_svg(&source.data).map_err(err);
    }
    image::load_from_memory(&source.data).map_err(|e| err(e.to_string()))
}

static SVG_FONTS: Lazy<Arc<usvg::fontdb::Database>> = Lazy::new(|| {
    let mut db = usvg::fontdb::Database::new();
    db.load_system_fonts();
    Arc::new(db)
});

const MAX_SVG_DIM: u32 = 16_384;

/// Render an SVG at its intrinsic size into straight-alpha RGBA.
fn rasterize_svg(data: &[u8]) -> Result<DynamicImage, String> {
    let opts = usvg::Options {
        fontdb: SVG_FONTS.clone(),
        ..Default::default()
    };
    let tree = usvg::Tree::from_data(data, &opts).map_err(|e| format!("parse svg: {e}"))?;

    let size = tree.size();
    let to_px = |v: f32| -> Result<u32, String> {
        if !v.is_finite() || v <= 0.0 {
            return Err("svg has invalid width/height".into());
        }
        Ok((v.ceil() as u32).clamp(1, MAX_SVG_DIM))
    };
    let (w, h) = (to_px(size.width())?, to_px(size.height())?);

    let mut pixmap =
        resvg::tiny_skia::Pixmap::new(w, h).ok_or("failed to allocate svg pixmap")?;
    let xform = resvg::tiny_skia::Transform::from_scale(
        w as f32 / size.width(),
        h as f32 / size.height(),
    );
    resvg::render(&tree, xform, &mut pixmap.as_mut());

    let mut rgba = Vec::with_capacity((w * h * 4) as usize);
    for px in pixmap.pixels() {
        let c = px.demultiply();
        rgba.extend_from_slice(&[c.red(), c.green(), c.blue(), c.alpha()]);
    }
    RgbaImage::from_raw(w, h, rgba)
        .map(DynamicImage::ImageRgba8)
        .ok_or_else(|| "svg pixel buffer size mismatch".into())
}

// ── Encode ───────────────────────────────────────────────────────────────

pub(crate) fn encode(img: &DynamicImage, encoding: Encoding, quality: f32) -> Result<Vec<u8>, String> {
    let mut buf = Cursor::new(Vec::new());
    match encoding {
        Encoding::Jpeg => {
            // JPEG has no alpha; flatten like a canvas export does.
            let q = (quality.clamp(0.0, 1.0) * 100.0).round().clamp(1.0, 100.0) as u8;
            DynamicImage::ImageRgb8(img.to_rgb8())
                .write_with_encoder(JpegEncoder::new_with_quality(&mut buf, q))
                .map_err(|e| e.to_string())?;
        }
        Encoding::Png => img
            .write_to(&mut buf, ImageFormat::Png)
            .map_err(|e| e.to_string())?,
        // The webp encoder is lossless only, so quality does not apply.
        Encoding::WebP => DynamicImage::ImageRgba8(img.to_rgba8())
            .write_to(&mut buf, ImageFormat::WebP)
            .map_err(|e| e.to_string())?,
        Encoding::Gif => DynamicImage::ImageRgba8(img.to_rgba8())
            .write_to(&mut buf, ImageFormat::Gif)
            .map_err(|e| e.to_string())?,
    }
    Ok(buf.into_inner())
}
