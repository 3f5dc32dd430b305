//! Bundle exporter: decide how finished outputs are delivered and write them.
//!
//! One finished output is delivered as-is. Two or more go into a single zip
//! archive. Nothing is written for an empty batch.

use crate::error::KilnError;
use crate::output::{file_stem, OutputFile};
use crate::progress::FileEntry;
use crate::registry::formats;
use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Outputs needed before a zip is built instead of a direct download.
pub const BUNDLE_THRESHOLD: usize = 2;

/// Archive name for batches that don't pick their own.
pub const DEFAULT_BUNDLE_NAME: &str = "kiln-converted.zip";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadPlan {
    /// No entry finished.
    Nothing,
    Single(OutputFile),
    Bundle { name: String, files: Vec<OutputFile> },
}

impl DownloadPlan {
    /// Plan for an explicit list of outputs, e.g. the parts of a split.
    pub fn for_outputs(mut files: Vec<OutputFile>, bundle_name: &str) -> Self {
        match files.len() {
            0 => DownloadPlan::Nothing,
            1 => DownloadPlan::Single(files.remove(0)),
            _ => DownloadPlan::Bundle {
                name: bundle_name.to_string(),
                files,
            },
        }
    }

    pub fn file_count(&self) -> usize {
        match self {
            DownloadPlan::Nothing => 0,
            DownloadPlan::Single(_) => 1,
            DownloadPlan::Bundle { files, .. } => files.len(),
        }
    }
}

/// Outputs of every `done` entry, in store order.
pub fn completed_outputs(entries: &[FileEntry]) -> Vec<OutputFile> {
    entries.iter().filter_map(|e| e.output().cloned()).collect()
}

/// Bundle only when at least [`BUNDLE_THRESHOLD`] entries are done.
pub fn plan_download(entries: &[FileEntry], bundle_name: &str) -> DownloadPlan {
    DownloadPlan::for_outputs(completed_outputs(entries), bundle_name)
}

/// `<stem>-<suffix>.zip`.
pub fn bundle_name(stem: &str, suffix: &str) -> String {
    format!("{}-{suffix}{}", file_stem(stem), formats::ZIP.extension)
}

/// Archive names for `files`, with clashes renamed `name (2).ext`, `name (3).ext`, ...
pub fn unique_names(files: &[OutputFile]) -> Vec<String> {
    let mut seen = HashSet::new();
    files
        .iter()
        .map(|f| {
            if seen.insert(f.name.clone()) {
                return f.name.clone();
            }
            let stem = file_stem(&f.name);
            let ext = &f.name[stem.len()..];
            let mut n = 2;
            loop {
                let candidate = format!("{stem} ({n}){ext}");
                if seen.insert(candidate.clone()) {
                    return candidate;
                }
                n += 1;
            }
        })
        .collect()
}

/// Deflate `files` into an in-memory zip. Blocking.
pub fn build_zip(files: &[OutputFile]) -> Result<Vec<u8>, KilnError> {
    let export_err = |e: &dyn std::fmt::Display| KilnError::ExportFailed {
        detail: e.to_string(),
    };
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

    for (file, name) in files.iter().zip(unique_names(files)) {
        zip.start_file(name.as_str(), options)
            .map_err(|e| export_err(&e))?;
        zip.write_all(file.bytes()).map_err(|e| export_err(&e))?;
    }
    let cursor = zip.finish().map_err(|e| export_err(&e))?;
    Ok(cursor.into_inner())
}

/// Zip `files` on the blocking pool into one output named `name`.
pub async fn bundle(files: Vec<OutputFile>, name: String) -> Result<OutputFile, KilnError> {
    let count = files.len();
    let data = tokio::task::spawn_blocking(move || build_zip(&files))
        .await
        .map_err(|e| KilnError::Internal(format!("zip task panicked: {e}")))??;
    info!(archive = %name, files = count, bytes = data.len(), "built bundle");
    Ok(OutputFile::new(name, data, formats::ZIP.mime))
}

/// Write the plan into `dir` and return the written paths.
pub async fn export(plan: DownloadPlan, dir: &Path) -> Result<Vec<PathBuf>, KilnError> {
    let file = match plan {
        DownloadPlan::Nothing => return Ok(Vec::new()),
        DownloadPlan::Single(file) => file,
        DownloadPlan::Bundle { name, files } => bundle(files, name).await?,
    };
    let path = write_atomic(dir, &file.name, file.bytes()).await?;
    Ok(vec![path])
}

/// Write `data` to `dir/name` through a temporary sibling and a rename, so a
/// reader never sees a half-written file.
pub async fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> Result<PathBuf, KilnError> {
    let write_err = |path: &Path, source| KilnError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| write_err(dir, e))?;

    let target = dir.join(name);
    let part = dir.join(format!(".{name}.part"));
    tokio::fs::write(&part, data)
        .await
        .map_err(|e| write_err(&part, e))?;
    if let Err(e) = tokio::fs::rename(&part, &target).await {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(write_err(&target, e));
    }
    debug!(path = %target.display(), bytes = data.len(), "wrote output");
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::EntryUpdate;
    use std::io::Read;

    fn out(name: &str, body: &[u8]) -> OutputFile {
        OutputFile::new(name, body.to_vec(), "application/octet-stream")
    }

    fn done(name: &str) -> FileEntry {
        let mut e = FileEntry::new(name, 1);
        e.apply(EntryUpdate::Started);
        e.apply(EntryUpdate::Completed(out(name, b"x")));
        e
    }

    fn failed(name: &str) -> FileEntry {
        let mut e = FileEntry::new(name, 1);
        e.apply(EntryUpdate::Failed("nope".into()));
        e
    }

    #[test]
    fn bundle_only_from_two_outputs() {
        assert_eq!(plan_download(&[failed("a")], "b.zip"), DownloadPlan::Nothing);
        assert!(matches!(
            plan_download(&[done("a.jpg"), failed("b")], "b.zip"),
            DownloadPlan::Single(f) if f.name == "a.jpg"
        ));
        let plan = plan_download(&[done("a.jpg"), failed("b"), done("c.jpg")], "photos.zip");
        assert!(matches!(&plan, DownloadPlan::Bundle { name, files } if name == "photos.zip" && files.len() == 2));
        assert_eq!(plan.file_count(), 2);
    }

    #[test]
    fn clashing_names_are_numbered() {
        let files = [out("a.png", b""), out("a.png", b""), out("b", b""), out("a.png", b""), out("b", b"")];
        assert_eq!(unique_names(&files), ["a.png", "a (2).png", "b", "a (3).png", "b (2)"]);
    }

    #[test]
    fn zip_holds_every_output() {
        let data = build_zip(&[out("a.txt", b"alpha"), out("a.txt", b"beta")]).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(data)).unwrap();
        assert_eq!(archive.len(), 2);

        let mut body = String::new();
        archive.by_name("a (2).txt").unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "beta");
    }

    #[test]
    fn bundle_name_uses_stem() {
        assert_eq!(bundle_name("report.pdf", "pages"), "report-pages.zip");
    }

    #[tokio::test]
    async fn export_single_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = export(DownloadPlan::Single(out("a.jpg", b"jpeg")), dir.path())
            .await
            .unwrap();
        assert_eq!(paths, [dir.path().join("a.jpg")]);
        assert_eq!(std::fs::read(&paths[0]).unwrap(), b"jpeg");
        assert!(!dir.path().join(".a.jpg.part").exists());
    }

    #[tokio::test]
    async fn export_bundle_writes_zip() {
        let dir = tempfile::tempdir().unwrap();
        let plan = DownloadPlan::for_outputs(vec![out("1.png", b"1"), out("2.png", b"2")], "all.zip");
        let paths = export(plan, &dir.path().join("nested")).await.unwrap();
        assert_eq!(paths, [dir.path().join("nested").join("all.zip")]);
        let archive = zip::ZipArchive::new(std::fs::File::open(&paths[0]).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
    }

    #[tokio::test]
    async fn export_nothing_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(export(DownloadPlan::Nothing, dir.path()).await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unwritable_target_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();
        let err = write_atomic(&blocker, "a.txt", b"x").await.unwrap_err();
        assert!(matches!(err, KilnError::OutputWriteFailed { .. }));
    }
}
