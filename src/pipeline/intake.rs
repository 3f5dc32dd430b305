//! File intake: turn a raw selection into accepted, tracked files.
//!
//! A file is accepted when its MIME type equals, or its name ends with, one
//! entry of the accept list; then when it fits the size cap; then, in
//! single-file mode, only the first survivor is kept. Every file that is not
//! kept is reported in [`IntakeReport::rejected`] with its reason.

use crate::error::KilnError;
use crate::progress::FileEntry;
use crate::registry::{self, ConversionConfig, ToolConfig};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

/// An input file held in memory.
#[derive(Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    /// Declared MIME type, if known.
    pub mime: Option<String>,
    pub data: Vec<u8>,
}

impl fmt::Debug for SourceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceFile")
            .field("name", &self.name)
            .field("mime", &self.mime)
            .field("len", &self.data.len())
            .finish()
    }
}

impl SourceFile {
    /// MIME type is guessed from the name's extension.
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        let name = name.into();
        let mime = registry::mime_for_name(&name).map(str::to_string);
        Self { name, mime, data }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub async fn from_path(path: &Path) -> Result<Self, KilnError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| KilnError::from_read(path.to_path_buf(), e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::new(name, data))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Lower-cased extension including the dot, e.g. `".png"`.
    pub fn extension(&self) -> Option<String> {
        let stem = crate::output::file_stem(&self.name);
        let base = self.name.rsplit(['/', '\\']).next().unwrap_or(&self.name);
        (stem.len() < base.len()).then(|| base[stem.len()..].to_ascii_lowercase())
    }
}

// ── Policy ───────────────────────────────────────────────────────────────

/// What a tool or conversion accepts.
#[derive(Debug, Clone)]
pub struct AcceptPolicy {
    /// MIME types or filename suffixes (e.g. `"image/png"`, `".png"`).
    pub accept: Vec<String>,
    pub max_size: Option<u64>,
    pub multiple: bool,
}

impl AcceptPolicy {
    pub fn new(accept: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            accept: accept.into_iter().map(Into::into).collect(),
            max_size: None,
            multiple: true,
        }
    }

    /// Source MIME and extension of the conversion; any number of files.
    pub fn from_conversion(c: &ConversionConfig) -> Self {
        Self::new([c.from.mime, c.from.extension])
    }

    pub fn from_tool(t: &ToolConfig) -> Self {
        Self {
            accept: t.accepted_types.iter().map(|s| s.to_string()).collect(),
            max_size: t.max_file_size,
            multiple: t.multiple,
        }
    }

    pub fn multiple(mut self, multiple: bool) -> Self {
        self.multiple = multiple;
        self
    }

    /// Tighten the size cap; `None` leaves the current one.
    pub fn max_size(mut self, cap: Option<u64>) -> Self {
        if let Some(cap) = cap {
            self.max_size = Some(self.max_size.map_or(cap, |old| old.min(cap)));
        }
        self
    }

    pub fn matches(&self, file: &SourceFile) -> bool {
        let name = file.name.to_ascii_lowercase();
        self.accept.iter().any(|t| {
            file.mime.as_deref() == Some(t.as_str()) || name.ends_with(&t.to_ascii_lowercase())
        })
    }
}

// ── Report ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    TypeNotAccepted { mime: Option<String> },
    TooLarge { size: u64, limit: u64 },
    /// Single-file mode keeps only the first accepted file.
    SingleFileMode,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::TypeNotAccepted { mime: Some(m) } => write!(f, "type {m} not accepted"),
            RejectReason::TypeNotAccepted { mime: None } => f.write_str("unknown type"),
            RejectReason::TooLarge { size, limit } => {
                write!(f, "{size} bytes exceeds the {limit} byte limit")
            }
            RejectReason::SingleFileMode => f.write_str("only one file is accepted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub name: String,
    #[serde(flatten)]
    pub reason: RejectReason,
}

/// An accepted file paired with its pending entry.
#[derive(Debug, Clone)]
pub struct QueuedFile {
    pub entry: FileEntry,
    pub source: SourceFile,
}

impl QueuedFile {
    pub fn new(source: SourceFile) -> Self {
        Self {
            entry: FileEntry::new(source.name.clone(), source.size()),
            source,
        }
    }
}

#[derive(Debug, Default)]
pub struct IntakeReport {
    /// In selection order.
    pub accepted: Vec<QueuedFile>,
    pub rejected: Vec<Rejection>,
}

impl IntakeReport {
    /// Fail with `NoAcceptedFiles` when nothing got through.
    pub fn require_any(self) -> Result<Self, KilnError> {
        if self.accepted.is_empty() {
            return Err(KilnError::NoAcceptedFiles {
                rejected: self.rejected.len(),
            });
        }
        Ok(self)
    }
}

/// Filter `files` through `policy`, preserving order.
pub fn intake(files: Vec<SourceFile>, policy: &AcceptPolicy) -> IntakeReport {
    let mut report = IntakeReport::default();

    for file in files {
        let reason = if !policy.matches(&file) {
            Some(RejectReason::TypeNotAccepted {
                mime: file.mime.clone(),
            })
        } else if let Some(limit) = policy.max_size.filter(|&l| file.size() > l) {
            Some(RejectReason::TooLarge {
                size: file.size(),
                limit,
            })
        } else if !policy.multiple && !report.accepted.is_empty() {
            Some(RejectReason::SingleFileMode)
        } else {
            None
        };

        match reason {
            Some(reason) => {
                warn!(file = %file.name, %reason, "file rejected");
                report.rejected.push(Rejection {
                    name: file.name,
                    reason,
                });
            }
            None => {
                debug!(file = %file.name, size = file.size(), "file accepted");
                report.accepted.push(QueuedFile::new(file));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::FileStatus;

    fn file(name: &str, len: usize) -> SourceFile {
        SourceFile::new(name, vec![0; len])
    }

    #[test]
    fn accepts_by_mime_or_suffix() {
        let policy = AcceptPolicy::new(["image/png", ".heic"]);
        assert!(policy.matches(&file("a.png", 1)));
        assert!(policy.matches(&file("IMG_1.HEIC", 1)));
        assert!(policy.matches(&file("blob", 1).with_mime("image/png")));
        assert!(!policy.matches(&file("a.jpg", 1)));
    }

    #[test]
    fn preserves_order_and_mints_pending_entries() {
        let policy = AcceptPolicy::from_conversion(crate::registry::conversion("png-to-jpg").unwrap());
        let report = intake(
            vec![file("1.png", 1), file("x.gif", 1), file("2.png", 2), file("3.png", 3)],
            &policy,
        );
        let names: Vec<_> = report.accepted.iter().map(|q| q.entry.name.as_str()).collect();
        assert_eq!(names, ["1.png", "2.png", "3.png"]);
        assert!(report.accepted.iter().all(|q| q.entry.status == FileStatus::Pending));
        assert_eq!(report.accepted[2].entry.size, 3);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].name, "x.gif");
    }

    #[test]
    fn size_cap_applies_before_single_file_mode() {
        let policy = AcceptPolicy::new(["application/pdf"])
            .multiple(false)
            .max_size(Some(10));
        let report = intake(
            vec![file("big.pdf", 11), file("a.pdf", 5), file("b.pdf", 5)],
            &policy,
        );
        assert_eq!(report.accepted.len(), 1);
        assert_eq!(report.accepted[0].source.name, "a.pdf");
        assert_eq!(
            report.rejected.iter().map(|r| &r.reason).collect::<Vec<_>>(),
            [&RejectReason::TooLarge { size: 11, limit: 10 }, &RejectReason::SingleFileMode]
        );
    }

    #[test]
    fn max_size_only_tightens() {
        let p = AcceptPolicy::new([".png"]).max_size(Some(100)).max_size(Some(500));
        assert_eq!(p.max_size, Some(100));
        assert_eq!(p.max_size(None).max_size, Some(100));
    }

    #[test]
    fn empty_intake_is_an_error() {
        let report = intake(vec![file("a.txt", 1)], &AcceptPolicy::new([".png"]));
        let err = report.require_any().unwrap_err();
        assert!(matches!(err, KilnError::NoAcceptedFiles { rejected: 1 }));
    }

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(file("Photo.JPEG", 1).extension().as_deref(), Some(".jpeg"));
        assert_eq!(file("README", 1).extension(), None);
    }

    #[tokio::test]
    async fn from_path_guesses_mime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mkv");
        tokio::fs::write(&path, b"x").await.unwrap();
        let src = SourceFile::from_path(&path).await.unwrap();
        assert_eq!(src.name, "clip.mkv");
        assert_eq!(src.mime.as_deref(), Some("video/x-matroska"));
    }

    #[tokio::test]
    async fn from_path_missing_file() {
        let err = SourceFile::from_path(Path::new("/no/such/file.png")).await.unwrap_err();
        assert!(matches!(err, KilnError::FileNotFound { .. }));
    }
}
