//! # engine-fetch
//!
//! Resolve a native engine payload (a shared library or binary) on first use,
//! downloading and caching it when it is not already present on disk.
//!
//! An engine is described by a static [`EngineAsset`]: where its release
//! archives live, which member of the archive is the payload for each
//! platform, and which environment variable lets a user point at an existing
//! copy instead. [`pdfium`] is the descriptor the conversion pipeline uses.
//!
//! ## Resolution order
//!
//! 1. `<asset.env_override>` (e.g. `PDFIUM_LIB_PATH`) when it names an existing file.
//! 2. `<cache_root>/<name>-<version>/<file_name>` from a previous run.
//! 3. Download `<base_url>/<archive_name>`, extract `<member>` into the cache.
//!
//! The resolved path is memoised per process, so only the first call ever
//! touches the file system or the network.
//!
//! ```rust,no_run
//! let lib = engine_fetch::ensure_asset(engine_fetch::pdfium(), None)?;
//! println!("libpdfium at {}", lib.display());
//! # Ok::<(), engine_fetch::FetchError>(())
//! ```
//!
//! ## Environment variable overrides
//!
//! - `PDFIUM_LIB_PATH`: path to an existing pdfium library; skips download.
//! - `FILEKILN_CACHE_DIR`: override the default cache root.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use thiserror::Error;

// ── Error type ───────────────────────────────────────────────────────────────

/// Errors returned while resolving an engine payload.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The asset publishes no artifact for this OS/architecture.
    #[error("{engine} is not available for {os}/{arch}")]
    UnsupportedPlatform {
        engine: &'static str,
        os: String,
        arch: String,
    },

    /// Could not create or write the local cache directory.
    #[error("Cache directory error: {0}")]
    CacheDir(#[source] std::io::Error),

    /// Network download failed.
    #[error("Download failed: {0}")]
    Download(String),

    /// gzip/tar extraction failed.
    #[error("Archive extraction failed: {0}")]
    Extract(String),
}

// ── Asset descriptors ────────────────────────────────────────────────────────

/// One downloadable build of an engine for a single platform.
#[derive(Debug, Clone, Copy)]
pub struct PlatformArtifact {
    /// `std::env::consts::OS` value, e.g. `"linux"`.
    pub os: &'static str,
    /// `std::env::consts::ARCH` value, e.g. `"x86_64"`.
    pub arch: &'static str,
    /// Asset filename in the release, e.g. `pdfium-linux-x64.tgz`.
    pub archive_name: &'static str,
    /// Relative path of the payload inside the archive.
    pub member: &'static str,
    /// Filename written to the cache directory.
    pub file_name: &'static str,
}

/// Static description of a fetchable engine.
#[derive(Debug)]
pub struct EngineAsset {
    pub name: &'static str,
    pub version: &'static str,
    /// Release base URL; the archive name is appended after a `/`.
    pub base_url: &'static str,
    /// Environment variable naming an existing copy of the payload.
    pub env_override: &'static str,
    pub artifacts: &'static [PlatformArtifact],
}

/// The pdfium-binaries release tag used for downloads.
pub const PDFIUM_VERSION: &str = "7690";

static PDFIUM: EngineAsset = EngineAsset {
    name: "pdfium",
    version: PDFIUM_VERSION,
    base_url: "https://github.com/bblanchon/pdfium-binaries/releases/download/chromium%2F7690",
    env_override: "PDFIUM_LIB_PATH",
    artifacts: &[
        PlatformArtifact {
            os: "macos",
            arch: "aarch64",
            archive_name: "pdfium-mac-arm64.tgz",
            member: "lib/libpdfium.dylib",
            file_name: "libpdfium.dylib",
        },
        PlatformArtifact {
            os: "macos",
            arch: "x86_64",
            archive_name: "pdfium-mac-x64.tgz",
            member: "lib/libpdfium.dylib",
            file_name: "libpdfium.dylib",
        },
        PlatformArtifact {
            os: "linux",
            arch: "x86_64",
            archive_name: "pdfium-linux-x64.tgz",
            member: "lib/libpdfium.so",
            file_name: "libpdfium.so",
        },
        PlatformArtifact {
            os: "linux",
            arch: "aarch64",
            archive_name: "pdfium-linux-arm64.tgz",
            member: "lib/libpdfium.so",
            file_name: "libpdfium.so",
        },
        PlatformArtifact {
            os: "windows",
            arch: "x86_64",
            archive_name: "pdfium-win-x64.tgz",
            member: "bin/pdfium.dll",
            file_name: "pdfium.dll",
        },
        PlatformArtifact {
            os: "windows",
            arch: "aarch64",
            archive_name: "pdfium-win-arm64.tgz",
            member: "bin/pdfium.dll",
            file_name: "pdfium.dll",
        },
    ],
};

/// Descriptor for the PDFium shared library.
pub fn pdfium() -> &'static EngineAsset {
    &PDFIUM
}

impl EngineAsset {
    /// Look up the artifact for an explicit OS/arch pair.
    pub fn artifact_for(&self, os: &str, arch: &str) -> Result<&PlatformArtifact, FetchError> {
        self.artifacts
            .iter()
            .find(|a| a.os == os && a.arch == arch)
            .ok_or_else(|| FetchError::UnsupportedPlatform {
                engine: self.name,
                os: os.to_string(),
                arch: arch.to_string(),
            })
    }

    /// Artifact for the platform this process runs on.
    pub fn current_artifact(&self) -> Result<&PlatformArtifact, FetchError> {
        self.artifact_for(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn download_url(&self, artifact: &PlatformArtifact) -> String {
        format!("{}/{}", self.base_url, artifact.archive_name)
    }

    /// Per-version cache directory, e.g. `~/.cache/filekiln/pdfium-7690/`.
    pub fn cache_dir(&self) -> PathBuf {
        cache_root().join(format!("{}-{}", self.name, self.version))
    }
}

// ── Cache directory resolution ───────────────────────────────────────────────

/// Root directory under which every engine gets a versioned subdirectory.
///
/// Default locations:
/// - **macOS**: `~/Library/Caches/filekiln/`
/// - **Linux**: `~/.cache/filekiln/`
/// - **Windows**: `%LOCALAPPDATA%\filekiln\`
///
/// Override by setting `FILEKILN_CACHE_DIR`.
pub fn cache_root() -> PathBuf {
    if let Ok(dir) = std::env::var("FILEKILN_CACHE_DIR") {
        return PathBuf::from(dir);
    }

    dirs::cache_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".cache")))
        .unwrap_or_else(std::env::temp_dir)
        .join("filekiln")
}

// ── Process-wide resolution memo ─────────────────────────────────────────────

static RESOLVED: OnceLock<Mutex<HashMap<&'static str, PathBuf>>> = OnceLock::new();

fn memo() -> &'static Mutex<HashMap<&'static str, PathBuf>> {
    RESOLVED.get_or_init(|| Mutex::new(HashMap::new()))
}

fn memoised(name: &'static str) -> Option<PathBuf> {
    memo().lock().ok().and_then(|m| m.get(name).cloned())
}

fn remember(name: &'static str, path: &Path) {
    if let Ok(mut m) = memo().lock() {
        m.insert(name, path.to_path_buf());
    }
}

// ── Public API ───────────────────────────────────────────────────────────────

/// Returns the on-disk payload path without downloading, or `None`.
pub fn cached_path(asset: &EngineAsset) -> Option<PathBuf> {
    if let Ok(p) = std::env::var(asset.env_override) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Some(pb);
        }
    }
    let artifact = asset.current_artifact().ok()?;
    let p = asset.cache_dir().join(artifact.file_name);
    p.exists().then_some(p)
}

/// `true` when [`ensure_asset`] would not need the network.
pub fn is_cached(asset: &EngineAsset) -> bool {
    cached_path(asset).is_some()
}

/// Ensures the engine payload is present locally and returns its path.
///
/// `on_progress` receives `(bytes_downloaded, total_size_option)` during a
/// download. Blocking; call it from `spawn_blocking` inside async code.
///
/// Safe to call from several threads at once. Two racing first calls may both
/// download, but they write through a temp file and rename, so the cache is
/// never left half-written.
pub fn ensure_asset(
    asset: &'static EngineAsset,
    on_progress: Option<&dyn Fn(u64, Option<u64>)>,
) -> Result<PathBuf, FetchError> {
    if let Some(path) = memoised(asset.name) {
        return Ok(path);
    }

    let path = resolve_or_download(asset, on_progress)?;
    remember(asset.name, &path);
    Ok(path)
}

// ── Internal helpers ─────────────────────────────────────────────────────────

fn resolve_or_download(
    asset: &EngineAsset,
    on_progress: Option<&dyn Fn(u64, Option<u64>)>,
) -> Result<PathBuf, FetchError> {
    if let Some(existing) = cached_path(asset) {
        return Ok(existing);
    }

    let artifact = asset.current_artifact()?;
    let cache_dir = asset.cache_dir();
    let dest = cache_dir.join(artifact.file_name);

    std::fs::create_dir_all(&cache_dir).map_err(FetchError::CacheDir)?;

    let archive = download_bytes(&asset.download_url(artifact), on_progress)?;
    extract_member(&archive, artifact.member, &dest)?;

    Ok(dest)
}

/// Streams a URL into memory, calling `on_progress` every 64 KiB.
fn download_bytes(
    url: &str,
    on_progress: Option<&dyn Fn(u64, Option<u64>)>,
) -> Result<Vec<u8>, FetchError> {
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("engine-fetch/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(|e| FetchError::Download(e.to_string()))?;

    let mut response = client
        .get(url)
        .send()
        .map_err(|e| FetchError::Download(format!("GET {url}: {e}")))?;

    if !response.status().is_success() {
        return Err(FetchError::Download(format!(
            "HTTP {} for {url}",
            response.status()
        )));
    }

    let total = response.content_length();
    let mut buf = Vec::with_capacity(total.unwrap_or(8 * 1024 * 1024) as usize);
    let mut chunk = vec![0u8; 64 * 1024];
    let mut downloaded: u64 = 0;

    loop {
        match response.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                downloaded += n as u64;
                if let Some(cb) = on_progress {
                    cb(downloaded, total);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FetchError::Download(format!("Read error: {e}"))),
        }
    }

    Ok(buf)
}

/// Extracts one member of a gzipped tarball to `dest`, via `<dest>.part`.
pub fn extract_member(archive: &[u8], member: &str, dest: &Path) -> Result<(), FetchError> {
    use flate2::read::GzDecoder;
    use tar::Archive;

    let mut tarball = Archive::new(GzDecoder::new(archive));
    let entries = tarball
        .entries()
        .map_err(|e| FetchError::Extract(e.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| FetchError::Extract(e.to_string()))?;
        let is_member = entry
            .path()
            .map(|p| p.to_string_lossy() == member)
            .map_err(|e| FetchError::Extract(e.to_string()))?;
        if !is_member {
            continue;
        }

        let partial = dest.with_extension("part");
        entry
            .unpack(&partial)
            .map_err(|e| FetchError::Extract(format!("Unpack failed: {e}")))?;
        std::fs::rename(&partial, dest).map_err(FetchError::CacheDir)?;
        return Ok(());
    }

    Err(FetchError::Extract(format!(
        "'{member}' not found in archive"
    )))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn tgz_with(member: &str, body: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, member, body).unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn pdfium_has_linux_x64_artifact() {
        let a = pdfium().artifact_for("linux", "x86_64").unwrap();
        assert_eq!(a.file_name, "libpdfium.so");
        assert!(pdfium().download_url(a).ends_with("/pdfium-linux-x64.tgz"));
    }

    #[test]
    fn unknown_platform_is_rejected() {
        let err = pdfium().artifact_for("plan9", "mips").unwrap_err();
        assert!(err.to_string().contains("plan9/mips"), "got: {err}");
    }

    #[test]
    fn cache_dir_is_versioned() {
        let d = pdfium().cache_dir();
        assert!(d.to_string_lossy().contains(&format!("pdfium-{PDFIUM_VERSION}")));
        assert_eq!(d, pdfium().cache_dir());
    }

    #[test]
    fn extract_member_writes_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("libpdfium.so");
        let archive = tgz_with("lib/libpdfium.so", b"\x7fELF-fake");

        extract_member(&archive, "lib/libpdfium.so", &dest).unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"\x7fELF-fake");
        assert!(!dest.with_extension("part").exists());
    }

    #[test]
    fn extract_member_reports_missing_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tgz_with("lib/other.so", b"x");
        let err = extract_member(&archive, "lib/libpdfium.so", &tmp.path().join("out"))
            .unwrap_err();
        assert!(matches!(err, FetchError::Extract(_)));
    }
}
