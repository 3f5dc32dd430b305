//! Lazily loaded, shared conversion engines.
//!
//! An [`EngineLoader`] owns at most one live instance of an engine. The first
//! [`EngineLoader::get`] starts the load; callers arriving while it runs await
//! the same in-flight future. A failed load is forgotten so the next call
//! tries again, and a successful one is kept until [`EngineLoader::release`].
//!
//! [`Engines`] bundles the loaders the adapters need. It is created once per
//! pipeline and handed to adapters explicitly; nothing here is global.

use crate::config::PipelineConfig;
use crate::error::KilnError;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::process::Command;
use tracing::{debug, info, warn};

// ── Loader ───────────────────────────────────────────────────────────────

/// Observable lifecycle of an engine loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Idle,
    Loading,
    Ready,
    Failed,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineStatus::Idle => "idle",
            EngineStatus::Loading => "loading",
            EngineStatus::Ready => "ready",
            EngineStatus::Failed => "failed",
        })
    }
}

type LoadFuture<T> = Shared<BoxFuture<'static, Result<Arc<T>, String>>>;
type InitFn<T> = dyn Fn() -> BoxFuture<'static, Result<T, String>> + Send + Sync;

enum LoaderState<T> {
    Idle,
    Loading(LoadFuture<T>),
    Ready(Arc<T>),
    Failed(String),
}

/// Memoised, retry-on-failure accessor for one engine instance.
pub struct EngineLoader<T> {
    name: &'static str,
    init: Arc<InitFn<T>>,
    state: Mutex<LoaderState<T>>,
}

impl<T> fmt::Debug for EngineLoader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineLoader")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

impl<T: Send + Sync + 'static> EngineLoader<T> {
    /// `init` runs once per load attempt and must not be shared state itself.
    pub fn new<F, Fut>(name: &'static str, init: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, String>> + Send + 'static,
    {
        Self {
            name,
            init: Arc::new(move || init().boxed()),
            state: Mutex::new(LoaderState::Idle),
        }
    }

    /// Return the engine, loading it on first use.
    pub async fn get(&self) -> Result<Arc<T>, KilnError> {
        let attempt = {
            let mut state = self.lock();
            match &*state {
                LoaderState::Ready(engine) => return Ok(engine.clone()),
                LoaderState::Loading(fut) => fut.clone(),
                LoaderState::Idle | LoaderState::Failed(_) => {
                    debug!(engine = self.name, "loading engine");
                    let init = self.init.clone();
                    let fut = async move { init().await.map(Arc::new) }.boxed().shared();
                    *state = LoaderState::Loading(fut.clone());
                    fut
                }
            }
        };

        let result = attempt.clone().await;

        {
            let mut state = self.lock();
            // Only the attempt that is still current may settle the state;
            // a release() during the load wins.
            let current = matches!(&*state, LoaderState::Loading(f) if f.ptr_eq(&attempt));
            if current {
                *state = match &result {
                    Ok(engine) => {
                        info!(engine = self.name, "engine ready");
                        LoaderState::Ready(engine.clone())
                    }
                    Err(detail) => {
                        warn!(engine = self.name, %detail, "engine failed to load");
                        LoaderState::Failed(detail.clone())
                    }
                };
            }
        }

        result.map_err(|detail| KilnError::EngineUnavailable {
            engine: self.name.to_string(),
            detail,
        })
    }
}

impl<T> EngineLoader<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn status(&self) -> EngineStatus {
        match &*self.lock() {
            LoaderState::Idle => EngineStatus::Idle,
            LoaderState::Loading(_) => EngineStatus::Loading,
            LoaderState::Ready(_) => EngineStatus::Ready,
            LoaderState::Failed(_) => EngineStatus::Failed,
        }
    }

    /// Message of the most recent failed load, while in `Failed`.
    pub fn last_error(&self) -> Option<String> {
        match &*self.lock() {
            LoaderState::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }

    /// Drop the cached instance. Outstanding `Arc`s stay valid; the next
    /// `get` loads a fresh one. Returns whether an instance was held.
    pub fn release(&self) -> bool {
        let mut state = self.lock();
        let held = matches!(&*state, LoaderState::Ready(_));
        *state = LoaderState::Idle;
        if held {
            debug!(engine = self.name, "engine released");
        }
        held
    }

    fn lock(&self) -> MutexGuard<'_, LoaderState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ── ffmpeg ───────────────────────────────────────────────────────────────

/// Validated ffmpeg/ffprobe installation.
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// First line of `ffmpeg -version`.
    pub version: String,
}

impl FfmpegEngine {
    pub async fn load(ffmpeg: PathBuf, ffprobe: PathBuf) -> Result<Self, String> {
        let out = run_version(&ffmpeg).await?;
        let version = String::from_utf8_lossy(&out)
            .lines()
            .next()
            .unwrap_or("ffmpeg (unknown version)")
            .trim()
            .to_string();
        run_version(&ffprobe).await?;
        info!(%version, "ffmpeg found");
        Ok(Self {
            ffmpeg,
            ffprobe,
            version,
        })
    }

    /// Container duration in seconds, or `None` when ffprobe cannot tell.
    pub async fn probe_duration(&self, input: &Path) -> Option<f64> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(input)
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_duration(&String::from_utf8_lossy(&output.stdout))
    }
}

async fn run_version(bin: &Path) -> Result<Vec<u8>, String> {
    let output = Command::new(bin)
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                format!("'{}' not found on PATH", bin.display())
            } else {
                format!("could not run '{}': {e}", bin.display())
            }
        })?;
    if !output.status.success() {
        return Err(format!(
            "'{} -version' exited with {}",
            bin.display(),
            output.status
        ));
    }
    Ok(output.stdout)
}

fn parse_duration(s: &str) -> Option<f64> {
    s.trim()
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d > 0.0)
}

// ── pdfium ───────────────────────────────────────────────────────────────

/// A pdfium shared library that has been located and successfully bound.
///
/// Each document operation binds its own `Pdfium` handle on the blocking
/// pool; this type only carries the verified library path.
#[derive(Debug, Clone)]
pub struct PdfEngine {
    pub library: PathBuf,
}

impl PdfEngine {
    /// Resolve libpdfium (env override, cache, or download) and test-bind it.
    pub async fn load() -> Result<Self, String> {
        tokio::task::spawn_blocking(|| -> Result<Self, String> {
            let library = engine_fetch::ensure_asset(engine_fetch::pdfium(), None)
                .map_err(|e| e.to_string())?;
            bind(&library)?;
            info!(path = %library.display(), "pdfium bound");
            Ok(Self { library })
        })
        .await
        .map_err(|e| format!("pdfium load task panicked: {e}"))?
    }

    /// Bind a fresh handle. Blocking; call from `spawn_blocking`.
    pub fn bind(&self) -> Result<pdfium_render::prelude::Pdfium, String> {
        bind(&self.library)
    }
}

fn bind(path: &Path) -> Result<pdfium_render::prelude::Pdfium, String> {
    use pdfium_render::prelude::Pdfium;
    Pdfium::bind_to_library(path)
        .map(Pdfium::new)
        .map_err(|e| format!("failed to bind '{}': {e}", path.display()))
}

// ── Engine set ───────────────────────────────────────────────────────────

/// The engines a pipeline draws on, injected into every adapter.
#[derive(Debug)]
pub struct Engines {
    pub transcoder: EngineLoader<FfmpegEngine>,
    pub documents: EngineLoader<PdfEngine>,
}

impl Engines {
    pub fn new(config: &PipelineConfig) -> Arc<Self> {
        let ffmpeg = config.ffmpeg_path.clone();
        let ffprobe = config.ffprobe_path.clone();
        Arc::new(Self {
            transcoder: EngineLoader::new("ffmpeg", move || {
                FfmpegEngine::load(ffmpeg.clone(), ffprobe.clone())
            }),
            documents: EngineLoader::new("pdfium", PdfEngine::load),
        })
    }

    /// Current state of each engine, for status displays.
    pub fn report(&self) -> Vec<EngineReport> {
        vec![
            EngineReport::of(&self.transcoder),
            EngineReport::of(&self.documents),
        ]
    }
}

/// One engine's name, status and, when failed, the load error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineReport {
    pub name: &'static str,
    pub status: EngineStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EngineReport {
    fn of<T>(loader: &EngineLoader<T>) -> Self {
        Self {
            name: loader.name(),
            status: loader.status(),
            error: loader.last_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_loader(fail_first: usize) -> (Arc<AtomicUsize>, EngineLoader<usize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let loader = EngineLoader::new("test", move || {
            let c = c.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n < fail_first {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(n)
                }
            }
        });
        (calls, loader)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_load() {
        let (calls, loader) = counting_loader(0);
        let (a, b, c) = tokio::join!(loader.get(), loader.get(), loader.get());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let a = a.unwrap();
        assert!(Arc::ptr_eq(&a, &b.unwrap()));
        assert!(Arc::ptr_eq(&a, &c.unwrap()));
        assert_eq!(loader.status(), EngineStatus::Ready);
    }

    #[tokio::test]
    async fn failure_is_not_cached() {
        let (calls, loader) = counting_loader(1);
        let err = loader.get().await.unwrap_err();
        assert!(matches!(err, KilnError::EngineUnavailable { .. }));
        assert_eq!(loader.status(), EngineStatus::Failed);
        assert_eq!(loader.last_error().as_deref(), Some("attempt 0 failed"));

        let ok = loader.get().await.unwrap();
        assert_eq!(*ok, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(loader.status(), EngineStatus::Ready);
    }

    #[tokio::test]
    async fn ready_instance_is_reused_until_released() {
        let (calls, loader) = counting_loader(0);
        let first = loader.get().await.unwrap();
        let again = loader.get().await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        assert!(loader.release());
        assert_eq!(loader.status(), EngineStatus::Idle);
        let fresh = loader.get().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_ffmpeg_reports_path() {
        let err = FfmpegEngine::load(
            PathBuf::from("/nonexistent/ffmpeg-kiln-test"),
            PathBuf::from("ffprobe"),
        )
        .await
        .unwrap_err();
        assert!(err.contains("ffmpeg-kiln-test"), "got: {err}");
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("12.480000\n"), Some(12.48));
        assert_eq!(parse_duration("N/A"), None);
        assert_eq!(parse_duration("0"), None);
    }

    #[test]
    fn engines_start_idle() {
        let engines = Engines::new(&PipelineConfig::default());
        for EngineReport { status, .. } in engines.report() {
            assert_eq!(status, EngineStatus::Idle);
        }
    }
}
