//! Pipeline configuration.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. Setters clamp out-of-range values; `build()`
//! rejects anything that still cannot work.

use crate::error::KilnError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Configuration shared by every adapter in a pipeline.
///
/// # Example
/// ```rust
/// use filekiln::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .canvas_quality(0.8)
///     .raster_scale(1.5)
///     .build()
///     .unwrap();
/// assert_eq!(config.raster_scale, 1.5);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// ffmpeg binary used by the transcode adapter. Default: `ffmpeg` from PATH.
    pub ffmpeg_path: PathBuf,

    /// ffprobe binary used to estimate duration for progress. Default: `ffprobe`.
    pub ffprobe_path: PathBuf,

    /// Lossy encode quality for format conversions. Range: 0.1–1.0. Default: 0.92.
    pub canvas_quality: f32,

    /// Quality for the image compress tool. Range: 0.1–1.0. Default: 0.7.
    pub compress_quality: f32,

    /// PDF page render scale (1.0 = 72 DPI). Range: 0.5–4.0. Default: 2.0.
    pub raster_scale: f32,

    /// Image format for rendered PDF pages. Default: PNG.
    pub raster_format: RasterFormat,

    /// Intake size cap in bytes. `None` defers to the tool's own limit.
    pub max_file_size: Option<u64>,

    /// Receives per-file events from the batch orchestrator.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            canvas_quality: 0.92,
            compress_quality: 0.7,
            raster_scale: 2.0,
            raster_format: RasterFormat::default(),
            max_file_size: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("ffmpeg_path", &self.ffmpeg_path)
            .field("ffprobe_path", &self.ffprobe_path)
            .field("canvas_quality", &self.canvas_quality)
            .field("compress_quality", &self.compress_quality)
            .field("raster_scale", &self.raster_scale)
            .field("raster_format", &self.raster_format)
            .field("max_file_size", &self.max_file_size)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn BatchProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn ffmpeg_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ffmpeg_path = path.into();
        self
    }

    pub fn ffprobe_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ffprobe_path = path.into();
        self
    }

    pub fn canvas_quality(mut self, q: f32) -> Self {
        self.config.canvas_quality = clamp_quality(q);
        self
    }

    pub fn compress_quality(mut self, q: f32) -> Self {
        self.config.compress_quality = clamp_quality(q);
        self
    }

    pub fn raster_scale(mut self, scale: f32) -> Self {
        self.config.raster_scale = if scale.is_finite() {
            scale.clamp(0.5, 4.0)
        } else {
            scale
        };
        self
    }

    pub fn raster_format(mut self, format: RasterFormat) -> Self {
        self.config.raster_format = format;
        self
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.config.max_file_size = Some(bytes);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, KilnError> {
        let c = &self.config;
        for (name, q) in [
            ("canvas_quality", c.canvas_quality),
            ("compress_quality", c.compress_quality),
        ] {
            if !(0.1..=1.0).contains(&q) {
                return Err(KilnError::InvalidConfig(format!(
                    "{name} must be 0.1–1.0, got {q}"
                )));
            }
        }
        if !(0.5..=4.0).contains(&c.raster_scale) {
            return Err(KilnError::InvalidConfig(format!(
                "raster_scale must be 0.5–4.0, got {}",
                c.raster_scale
            )));
        }
        if c.max_file_size == Some(0) {
            return Err(KilnError::InvalidConfig(
                "max_file_size must be > 0".into(),
            ));
        }
        if c.ffmpeg_path.as_os_str().is_empty() {
            return Err(KilnError::InvalidConfig("ffmpeg_path is empty".into()));
        }
        Ok(self.config)
    }
}

// NaN passes through so build() can reject it.
fn clamp_quality(q: f32) -> f32 {
    if q.is_finite() {
        q.clamp(0.1, 1.0)
    } else {
        q
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Encoding for rendered PDF pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RasterFormat {
    #[default]
    Png,
    Jpeg,
}

impl RasterFormat {
    pub fn extension(self) -> &'static str {
        match self {
            RasterFormat::Png => ".png",
            RasterFormat::Jpeg => ".jpg",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            RasterFormat::Png => "image/png",
            RasterFormat::Jpeg => "image/jpeg",
        }
    }
}

impl std::str::FromStr for RasterFormat {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(RasterFormat::Png),
            "jpg" | "jpeg" => Ok(RasterFormat::Jpeg),
            other => Err(KilnError::InvalidConfig(format!(
                "unknown raster format '{other}' (expected png or jpeg)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = PipelineConfig::default();
        assert_eq!(c.canvas_quality, 0.92);
        assert_eq!(c.compress_quality, 0.7);
        assert_eq!(c.raster_scale, 2.0);
        assert_eq!(c.raster_format, RasterFormat::Png);
        assert!(c.max_file_size.is_none());
    }

    #[test]
    fn setters_clamp() {
        let c = PipelineConfig::builder()
            .canvas_quality(3.0)
            .compress_quality(0.0)
            .raster_scale(10.0)
            .build()
            .unwrap();
        assert_eq!(c.canvas_quality, 1.0);
        assert_eq!(c.compress_quality, 0.1);
        assert_eq!(c.raster_scale, 4.0);
    }

    #[test]
    fn nan_quality_is_rejected() {
        let err = PipelineConfig::builder().canvas_quality(f32::NAN).build().unwrap_err();
        assert!(matches!(err, KilnError::InvalidConfig(_)));
    }

    #[test]
    fn zero_size_cap_is_rejected() {
        assert!(PipelineConfig::builder().max_file_size(0).build().is_err());
    }

    #[test]
    fn raster_format_parses_aliases() {
        assert_eq!("JPG".parse::<RasterFormat>().unwrap(), RasterFormat::Jpeg);
        assert!("bmp".parse::<RasterFormat>().is_err());
    }

    #[test]
    fn debug_hides_callback() {
        let c = PipelineConfig::builder()
            .progress_callback(std::sync::Arc::new(crate::progress::NoopProgressCallback))
            .build()
            .unwrap();
        assert!(format!("{c:?}").contains("<dyn BatchProgressCallback>"));
    }
}
