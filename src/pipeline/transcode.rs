//! Transcode adapter: audio/video conversion through ffmpeg.
//!
//! Each file gets its own scratch directory holding `input.<ext>` and
//! `output.<ext>`. The directory is a [`tempfile::TempDir`], so it is removed
//! when the call returns on every path, including errors and cancellation.
//!
//! When the conversion allows it, a stream copy (`-c copy`) is tried first.
//! A remux only counts as successful if ffmpeg exits with status 0 *and*
//! leaves a non-empty output file. Anything else deletes the partial output
//! and falls back to a full re-encode.

use super::intake::SourceFile;
use super::{ConversionAdapter, ProgressTicker};
use crate::engine::{Engines, FfmpegEngine};
use crate::error::FileError;
use crate::output::{replace_extension, OutputFile};
use crate::registry::{ConversionConfig, EngineKind, TranscodeParams};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// `out_time_ms` is in microseconds despite its name; newer builds also
/// print `out_time_us`.
static OUT_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^out_time_(?:ms|us)=(\d+)\s*$").unwrap());

/// stderr lines kept for error messages.
const STDERR_TAIL: usize = 12;
const MAX_LINE_CHARS: usize = 240;

pub struct TranscodeAdapter {
    engines: Arc<Engines>,
    conversion: &'static ConversionConfig,
    params: TranscodeParams,
}

impl TranscodeAdapter {
    pub fn new(
        engines: Arc<Engines>,
        conversion: &'static ConversionConfig,
        params: TranscodeParams,
    ) -> Self {
        Self {
            engines,
            conversion,
            params,
        }
    }

    async fn run(
        &self,
        engine: &FfmpegEngine,
        source: &SourceFile,
        progress: &ProgressTicker,
    ) -> Result<Vec<u8>, FileError> {
        let name = &source.name;
        let io_err = |e: std::io::Error| FileError::Io {
            name: name.clone(),
            detail: e.to_string(),
        };

        let dir = tempfile::Builder::new()
            .prefix("kiln-")
            .tempdir()
            .map_err(io_err)?;
        let in_ext = source
            .extension()
            .unwrap_or_else(|| self.conversion.from.extension.to_string());
        let input = dir.path().join(format!("input{in_ext}"));
        let output = dir.path().join(format!("output{}", self.conversion.to.extension));
        tokio::fs::write(&input, &source.data).await.map_err(io_err)?;

        let duration = engine.probe_duration(&input).await;
        debug!(file = %name, ?duration, "probed duration");

        if self.params.try_remux {
            let mut args = base_args(&input);
            args.extend(["-c", "copy"].map(OsString::from));
            args.push(output.clone().into());
            match run_ffmpeg(engine, args, None).await {
                Ok(()) => {
                    if non_empty(&output).await {
                        debug!(file = %name, "remux succeeded");
                        return tokio::fs::read(&output).await.map_err(io_err);
                    }
                    warn!(file = %name, "remux produced no output; re-encoding");
                }
                Err(detail) => warn!(file = %name, %detail, "remux failed; re-encoding"),
            }
            if let Err(e) = tokio::fs::remove_file(&output).await {
                debug!(file = %name, error = %e, "no partial remux output to remove");
            }
        }

        let mut args = base_args(&input);
        args.extend(self.params.effective_args().iter().map(OsString::from));
        args.extend(["-progress", "pipe:2", "-nostats"].map(OsString::from));
        args.push(output.clone().into());

        let report: &(dyn Fn(u8) + Sync) = &|pct| progress.tick(pct);
        run_ffmpeg(engine, args, Some((duration, report)))
            .await
            .map_err(|detail| FileError::Transcode {
                name: name.clone(),
                detail,
            })?;

        if !non_empty(&output).await {
            return Err(FileError::Transcode {
                name: name.clone(),
                detail: "ffmpeg exited successfully but wrote no output".into(),
            });
        }
        tokio::fs::read(&output).await.map_err(io_err)
    }
}

#[async_trait]
impl ConversionAdapter for TranscodeAdapter {
    fn engine(&self) -> EngineKind {
        EngineKind::Transcode
    }

    fn label(&self) -> String {
        self.conversion.slug.to_string()
    }

    async fn convert(
        &self,
        source: &SourceFile,
        progress: &ProgressTicker,
    ) -> Result<OutputFile, FileError> {
        let engine = self
            .engines
            .transcoder
            .get()
            .await
            .map_err(|e| e.into_file_error(&source.name))?;

        progress.tick(0);
        let data = self.run(&engine, source, progress).await?;
        progress.tick(100);

        let to = &self.conversion.to;
        info!(file = %source.name, bytes = data.len(), conversion = self.conversion.slug, "transcoded");
        Ok(OutputFile::new(
            replace_extension(&source.name, to.extension),
            data,
            to.mime,
        ))
    }
}

/// Decode the first video frame of `source` (a HEIC photo, say) to PNG bytes.
pub(crate) async fn extract_still(
    engine: &FfmpegEngine,
    source: &SourceFile,
) -> Result<Vec<u8>, FileError> {
    let name = &source.name;
    let decode_err = |detail: String| FileError::Decode {
        name: name.clone(),
        detail,
    };
    let io_err = |e: std::io::Error| FileError::Io {
        name: name.clone(),
        detail: e.to_string(),
    };

    let dir = tempfile::Builder::new()
        .prefix("kiln-")
        .tempdir()
        .map_err(io_err)?;
    let input = dir
        .path()
        .join(format!("input{}", source.extension().unwrap_or_default()));
    let output = dir.path().join("still.png");
    tokio::fs::write(&input, &source.data).await.map_err(io_err)?;

    let mut args = base_args(&input);
    args.extend(["-frames:v", "1", "-c:v", "png", "-f", "image2"].map(OsString::from));
    args.push(output.clone().into());
    run_ffmpeg(engine, args, None).await.map_err(decode_err)?;

    if !non_empty(&output).await {
        return Err(decode_err("ffmpeg produced no frame".into()));
    }
    let png = tokio::fs::read(&output).await.map_err(io_err)?;
    debug!(file = %name, bytes = png.len(), "decoded still through ffmpeg");
    Ok(png)
}

fn base_args(input: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-y", "-loglevel", "error", "-i"]
        .map(OsString::from)
        .to_vec();
    args.push(input.into());
    args
}

async fn non_empty(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len() > 0)
        .unwrap_or(false)
}

type ProgressSink<'a> = (Option<f64>, &'a (dyn Fn(u8) + Sync));

/// Run ffmpeg to completion. `Err` carries the exit status and stderr tail.
async fn run_ffmpeg(
    engine: &FfmpegEngine,
    args: Vec<OsString>,
    progress: Option<ProgressSink<'_>>,
) -> Result<(), String> {
    debug!(ffmpeg = %engine.ffmpeg.display(), ?args, "running ffmpeg");
    let mut child = Command::new(&engine.ffmpeg)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("could not start ffmpeg: {e}"))?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "ffmpeg stderr was not captured".to_string())?;
    let mut reader = BufReader::new(stderr);
    let mut raw = Vec::new();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL);

    // ffmpeg writes file names and codec text verbatim, so lines are not
    // guaranteed UTF-8. The pipe must be drained to EOF either way.
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "reading ffmpeg stderr failed; stopping ffmpeg");
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "ffmpeg already exited");
                }
                break;
            }
        }
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some((duration, report)) = progress {
            if let Some(pct) = progress_percent(line, duration) {
                report(pct);
                continue;
            }
        }
        if line.is_empty() || is_progress_key(line) {
            continue;
        }
        if tail.len() == STDERR_TAIL {
            tail.pop_front();
        }
        tail.push_back(truncate_line(line));
    }

    let status = child
        .wait()
        .await
        .map_err(|e| format!("waiting for ffmpeg: {e}"))?;
    if status.success() {
        return Ok(());
    }

    let tail: Vec<String> = tail.into();
    Err(if tail.is_empty() {
        format!("ffmpeg exited with {status}")
    } else {
        format!("ffmpeg exited with {status}: {}", tail.join("\n"))
    })
}

/// Keep error text readable when ffmpeg dumps one enormous line.
fn truncate_line(line: &str) -> String {
    match line.char_indices().nth(MAX_LINE_CHARS) {
        Some((cut, _)) => format!("{}…", &line[..cut]),
        None => line.to_string(),
    }
}

/// Map one `-progress` line to 0–99, given the input duration in seconds.
fn progress_percent(line: &str, duration: Option<f64>) -> Option<u8> {
    let caps = OUT_TIME.captures(line.trim())?;
    let micros: f64 = caps.get(1)?.as_str().parse().ok()?;
    let duration = duration.filter(|d| *d > 0.0)?;
    let pct = (micros / 1_000_000.0 / duration * 100.0).clamp(0.0, 99.0);
    Some(pct as u8)
}

/// The `key=value` block ffmpeg writes for `-progress`.
fn is_progress_key(line: &str) -> bool {
    line.split_once('=').is_some_and(|(k, _)| {
        matches!(
            k,
            "frame" | "fps" | "bitrate" | "total_size" | "out_time" | "out_time_ms"
                | "out_time_us" | "dup_frames" | "drop_frames" | "speed" | "progress"
        ) || k.starts_with("stream_")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::registry;

    #[test]
    fn progress_maps_microseconds_to_percent() {
        assert_eq!(progress_percent("out_time_ms=5000000", Some(10.0)), Some(50));
        assert_eq!(progress_percent("out_time_us=2500000\n", Some(10.0)), Some(25));
    }

    #[test]
    fn progress_never_reports_completion() {
        assert_eq!(progress_percent("out_time_ms=99000000", Some(10.0)), Some(99));
    }

    #[test]
    fn progress_needs_duration() {
        assert_eq!(progress_percent("out_time_ms=5000000", None), None);
        assert_eq!(progress_percent("out_time_ms=5000000", Some(0.0)), None);
        assert_eq!(progress_percent("frame=10", Some(10.0)), None);
    }

    #[test]
    fn progress_block_is_not_kept_as_error_text() {
        assert!(is_progress_key("progress=continue"));
        assert!(is_progress_key("stream_0_0_q=28.0"));
        assert!(!is_progress_key("Error while decoding stream #0:0"));
    }

    #[test]
    fn long_stderr_lines_are_cut() {
        let line = "x".repeat(MAX_LINE_CHARS + 50);
        let cut = truncate_line(&line);
        assert_eq!(cut.chars().count(), MAX_LINE_CHARS + 1);
        assert!(cut.ends_with('…'));
        assert_eq!(truncate_line("short"), "short");
    }

    #[tokio::test]
    async fn missing_engine_is_an_engine_load_error() {
        let config = PipelineConfig::builder()
            .ffmpeg_path("/nonexistent/kiln-ffmpeg")
            .build()
            .unwrap();
        let engines = Engines::new(&config);
        let conv = registry::conversion("wav-to-mp3").unwrap();
        let registry::EngineSpec::Transcode(params) = conv.engine else {
            panic!("wav-to-mp3 should be a transcode");
        };
        let adapter = TranscodeAdapter::new(engines.clone(), conv, params);
        let err = adapter
            .convert(&SourceFile::new("a.wav", vec![0; 8]), &ProgressTicker::noop())
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::EngineLoad { .. }), "got: {err:?}");
        assert_eq!(engines.transcoder.status(), crate::engine::EngineStatus::Failed);
    }
}
