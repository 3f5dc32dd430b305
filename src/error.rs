//! Error types for the filekiln library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`KilnError`] is **fatal**: the operation cannot proceed at all
//!   (unknown conversion slug, no file passed intake, bad page ranges,
//!   output directory not writable). Returned as `Err(KilnError)` from the
//!   entry points in [`crate::convert`].
//!
//! * [`FileError`] is **per file**: one input failed to decode, transcode or
//!   parse, but the rest of the batch is unaffected. The orchestrator turns
//!   it into the entry's error message in the [`crate::progress::ProgressStore`].

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the filekiln library.
///
/// Failures of a single file inside a batch use [`FileError`] and end up on
/// that file's [`crate::progress::FileEntry`] instead.
#[derive(Debug, Error)]
pub enum KilnError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("File not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// No conversion is registered under this slug.
    #[error("Unknown conversion '{slug}'\nRun `kiln list` to see the available conversions.")]
    UnknownConversion { slug: String },

    /// No tool with this id exists in the given category.
    #[error("Unknown {category} tool '{id}'")]
    UnknownTool { category: String, id: String },

    /// Every input was rejected at intake.
    #[error("None of the {rejected} input file(s) matched the accepted types")]
    NoAcceptedFiles { rejected: usize },

    /// The operation needs more inputs than were given (e.g. merge).
    #[error("At least {needed} files are required, got {got}")]
    NotEnoughInputs { needed: usize, got: usize },

    // ── Document errors ───────────────────────────────────────────────────
    /// The page-range expression selected no page of the document.
    #[error("No valid page range in '{input}' (document has {total} pages)\nUse e.g. \"1-3,5\".")]
    InvalidPageRanges { input: String, total: usize },

    /// A PDF could not be loaded, edited or saved.
    #[error("PDF operation failed: {detail}")]
    Document { detail: String },

    // ── Engine errors ─────────────────────────────────────────────────────
    /// An engine failed to initialise. The next call retries the load.
    #[error(
        "Engine '{engine}' is unavailable: {detail}\n\n\
ffmpeg and ffprobe must be on PATH (or set KILN_FFMPEG / KILN_FFPROBE).\n\
PDFium is downloaded automatically on first use; set PDFIUM_LIB_PATH to use an existing copy.\n"
    )]
    EngineUnavailable { engine: String, detail: String },

    // ── Export errors ─────────────────────────────────────────────────────
    /// Building the zip bundle failed.
    #[error("Export failed: {detail}")]
    ExportFailed { detail: String },

    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KilnError {
    /// Map an I/O error from reading `path` to the matching input variant.
    pub(crate) fn from_read(path: PathBuf, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => KilnError::FileNotFound { path },
            std::io::ErrorKind::PermissionDenied => KilnError::PermissionDenied { path },
            _ => KilnError::Internal(format!("reading {}: {err}", path.display())),
        }
    }

    /// Demote to a per-file error for `name`, keeping engine failures distinct.
    pub(crate) fn into_file_error(self, name: &str) -> FileError {
        match self {
            KilnError::EngineUnavailable { engine, detail } => {
                FileError::EngineLoad { engine, detail }
            }
            KilnError::Document { detail } => FileError::Document {
                name: name.to_string(),
                detail,
            },
            other => FileError::Io {
                name: name.to_string(),
                detail: other.to_string(),
            },
        }
    }
}

/// A non-fatal error for a single file.
///
/// Recorded on the file's entry as its human-readable message. Never
/// propagates to sibling files.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum FileError {
    /// Input bytes could not be decoded (corrupt or unsupported format).
    #[error("{name}: could not decode input: {detail}")]
    Decode { name: String, detail: String },

    /// The decoded image could not be encoded to the target format.
    #[error("{name}: could not encode output: {detail}")]
    Encode { name: String, detail: String },

    /// ffmpeg exited unsuccessfully.
    #[error("{name}: transcode failed: {detail}")]
    Transcode { name: String, detail: String },

    /// The PDF library rejected the document.
    #[error("{name}: PDF operation failed: {detail}")]
    Document { name: String, detail: String },

    /// The shared engine failed to initialise.
    #[error("{engine} engine failed to load: {detail}")]
    EngineLoad { engine: String, detail: String },

    /// Scratch-file I/O failed.
    #[error("{name}: I/O error: {detail}")]
    Io { name: String, detail: String },

    /// The batch was cancelled before or while this file ran.
    #[error("cancelled")]
    Cancelled,

    /// The adapter panicked while processing this file.
    #[error("{name}: conversion panicked: {detail}")]
    Panicked { name: String, detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_enough_inputs_display() {
        let e = KilnError::NotEnoughInputs { needed: 2, got: 1 };
        let msg = e.to_string();
        assert!(msg.contains("2 files"), "got: {msg}");
        assert!(msg.contains("got 1"), "got: {msg}");
    }

    #[test]
    fn invalid_ranges_display() {
        let e = KilnError::InvalidPageRanges {
            input: "20-30".into(),
            total: 10,
        };
        assert!(e.to_string().contains("20-30"));
        assert!(e.to_string().contains("10 pages"));
    }

    #[test]
    fn from_read_maps_not_found() {
        let e = KilnError::from_read(
            PathBuf::from("missing.png"),
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(matches!(e, KilnError::FileNotFound { .. }));
    }

    #[test]
    fn cancelled_message_is_plain() {
        assert_eq!(FileError::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn file_error_round_trips_through_json() {
        let e = FileError::Decode {
            name: "photo.heic".into(),
            detail: "unsupported".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        let back: FileError = serde_json::from_str(&json).unwrap();
        assert_eq!(e, back);
    }
}
