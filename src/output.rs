//! Output blobs and output-file naming.

use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

/// Encoded output bytes plus their MIME type.
///
/// Cheap to clone: the bytes are shared, so snapshots of the progress store
/// never copy file contents.
#[derive(Clone, PartialEq, Eq)]
pub struct OutputBlob {
    pub data: Arc<[u8]>,
    pub mime: String,
}

impl OutputBlob {
    pub fn new(data: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            data: Arc::from(data),
            mime: mime.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for OutputBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputBlob")
            .field("len", &self.data.len())
            .field("mime", &self.mime)
            .finish()
    }
}

impl Serialize for OutputBlob {
    // Metadata only; bytes go to disk through the bundle exporter.
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut st = s.serialize_struct("OutputBlob", 2)?;
        st.serialize_field("size", &self.data.len())?;
        st.serialize_field("mime", &self.mime)?;
        st.end()
    }
}

/// A finished output: its download name and its blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputFile {
    pub name: String,
    pub blob: OutputBlob,
}

impl OutputFile {
    pub fn new(name: impl Into<String>, data: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blob: OutputBlob::new(data, mime),
        }
    }

    pub fn mime(&self) -> &str {
        &self.blob.mime
    }

    pub fn bytes(&self) -> &[u8] {
        &self.blob.data
    }
}

// ── Naming ───────────────────────────────────────────────────────────────

/// File name without its last extension: `"clip.final.mp4"` → `"clip.final"`.
///
/// Only the final path component is considered. Dot-files keep their name.
pub fn file_stem(name: &str) -> &str {
    let base = base_name(name);
    match base.rfind('.') {
        Some(0) | None => base,
        Some(i) => &base[..i],
    }
}

/// Swap the extension: `"photo.heic"` + `".jpg"` → `"photo.jpg"`.
///
/// Names without an extension get `ext` appended.
pub fn replace_extension(name: &str, ext: &str) -> String {
    format!("{}{}", file_stem(name), ext)
}

/// `<stem>-<suffix><ext>`, e.g. `("a.png", "clean", ".png")` → `"a-clean.png"`.
pub fn suffixed_name(name: &str, suffix: &str, ext: &str) -> String {
    format!("{}-{}{}", file_stem(name), suffix, ext)
}

fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_extension_swaps_last_only() {
        assert_eq!(replace_extension("photo.heic", ".jpg"), "photo.jpg");
        assert_eq!(replace_extension("clip.final.mkv", ".mp4"), "clip.final.mp4");
        assert_eq!(replace_extension("README", ".txt"), "README.txt");
    }

    #[test]
    fn stem_ignores_directories_and_dotfiles() {
        assert_eq!(file_stem("some/dir/report.pdf"), "report");
        assert_eq!(file_stem(r"C:\scans\report.pdf"), "report");
        assert_eq!(file_stem(".hidden"), ".hidden");
    }

    #[test]
    fn suffixed_name_builds_tool_outputs() {
        assert_eq!(suffixed_name("cat.png", "800x600", ".png"), "cat-800x600.png");
        assert_eq!(suffixed_name("doc.pdf", "text", ".txt"), "doc-text.txt");
    }

    #[test]
    fn blob_debug_hides_bytes() {
        let b = OutputBlob::new(vec![1, 2, 3], "image/png");
        let dbg = format!("{b:?}");
        assert!(dbg.contains("len: 3"), "got: {dbg}");
    }
}
