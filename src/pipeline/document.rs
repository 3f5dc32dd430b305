//! PDF document tools.
//!
//! Structural edits (merge, split, compress) go through `lopdf` and need no
//! native library. Rendering and text extraction go through pdfium, bound
//! per call from the verified library in [`PdfEngine`].
//!
//! Everything here is blocking. Async callers wrap these functions in
//! `tokio::task::spawn_blocking`, as [`DocumentAdapter`] does.

use super::intake::SourceFile;
use super::pages::PageRange;
use super::{ConversionAdapter, ProgressTicker};
use crate::config::RasterFormat;
use crate::engine::{Engines, PdfEngine};
use crate::error::{FileError, KilnError};
use crate::output::{suffixed_name, OutputFile};
use crate::pipeline::canvas::{encode, Encoding};
use crate::registry::{formats, EngineKind};
use async_trait::async_trait;
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the merged document.
pub const MERGED_NAME: &str = "merged.pdf";

/// Page attributes a page may inherit from its ancestors in the page tree.
const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

/// Depth guard against cyclic `Parent` chains.
const MAX_TREE_DEPTH: usize = 64;

// ── lopdf helpers ────────────────────────────────────────────────────────

fn load(source: &SourceFile) -> Result<Document, String> {
    Document::load_mem(&source.data).map_err(|e| format!("{}: {e}", source.name))
}

fn save(doc: &mut Document) -> Result<Vec<u8>, String> {
    let mut buf = Vec::new();
    doc.save_to(&mut buf).map_err(|e| e.to_string())?;
    Ok(buf)
}

fn type_name(object: &Object) -> Option<&[u8]> {
    object
        .as_dict()
        .ok()?
        .get(b"Type")
        .and_then(Object::as_name)
        .ok()
}

/// The page dictionary with inherited attributes copied in, so it survives
/// being re-parented under a fresh page tree.
fn detached_page(doc: &Document, id: ObjectId) -> Result<Dictionary, String> {
    let mut page = doc
        .get_dictionary(id)
        .map_err(|e| format!("page {id:?}: {e}"))?
        .clone();

    let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();
    let mut depth = 0;
    while let Some(pid) = parent {
        depth += 1;
        if depth > MAX_TREE_DEPTH {
            break;
        }
        let Ok(node) = doc.get_dictionary(pid) else { break };
        for key in INHERITABLE {
            if !page.has(key) {
                if let Ok(value) = node.get(key) {
                    page.set(key.to_vec(), value.clone());
                }
            }
        }
        parent = node.get(b"Parent").and_then(Object::as_reference).ok();
    }
    Ok(page)
}

/// Build a new document from selected pages of `parts`, in order.
///
/// `None` selects every page of that part. Page numbers are 1-based; numbers
/// past the end are ignored. Catalogs, page trees and outlines of the inputs
/// are dropped and a fresh catalog is written.
fn assemble(parts: Vec<(Document, Option<Vec<u32>>)>) -> Result<Document, String> {
    let mut next_id = 1;
    let mut pages: Vec<(ObjectId, Dictionary)> = Vec::new();
    let mut objects: BTreeMap<ObjectId, Object> = BTreeMap::new();

    for (mut doc, selection) in parts {
        doc.renumber_objects_with(next_id);
        next_id = doc.max_id + 1;

        let by_number = doc.get_pages();
        let wanted: Vec<ObjectId> = match selection {
            None => by_number.values().copied().collect(),
            Some(numbers) => numbers
                .iter()
                .filter_map(|n| by_number.get(n).copied())
                .collect(),
        };
        for id in wanted {
            pages.push((id, detached_page(&doc, id)?));
        }
        objects.extend(doc.objects);
    }

    if pages.is_empty() {
        return Err("no pages to write".into());
    }

    let mut out = Document::with_version("1.7");
    for (id, object) in objects {
        match type_name(&object) {
            Some(b"Catalog" | b"Pages" | b"Page" | b"Outlines" | b"Outline") => {}
            _ => {
                out.objects.insert(id, object);
            }
        }
    }
    out.max_id = next_id;

    let tree_id = out.new_object_id();
    let kids: Vec<Object> = pages.iter().map(|(id, _)| Object::Reference(*id)).collect();
    let count = pages.len() as i64;
    for (id, mut page) in pages {
        page.set("Parent", tree_id);
        out.objects.insert(id, Object::Dictionary(page));
    }
    out.objects.insert(
        tree_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = out.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => tree_id,
    });
    out.trailer.set("Root", catalog_id);

    out.prune_objects();
    out.renumber_objects();
    out.compress();
    Ok(out)
}

// ── Structural tools ─────────────────────────────────────────────────────

/// Number of pages, via lopdf.
pub fn page_count(source: &SourceFile) -> Result<usize, KilnError> {
    let doc = load(source).map_err(|detail| KilnError::Document { detail })?;
    Ok(doc.get_pages().len())
}

/// Concatenate every page of every source, in input order.
pub fn merge(sources: &[SourceFile]) -> Result<OutputFile, KilnError> {
    if sources.len() < 2 {
        return Err(KilnError::NotEnoughInputs {
            needed: 2,
            got: sources.len(),
        });
    }
    let parts = sources
        .iter()
        .map(|s| load(s).map(|doc| (doc, None)))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|detail| KilnError::Document { detail })?;

    let mut doc = assemble(parts).map_err(|detail| KilnError::Document { detail })?;
    let pages = doc.get_pages().len();
    let data = save(&mut doc).map_err(|detail| KilnError::Document { detail })?;
    info!(inputs = sources.len(), pages, bytes = data.len(), "merged PDFs");
    Ok(OutputFile::new(MERGED_NAME, data, formats::PDF.mime))
}

/// One output document per range, named `<stem>-<range label>.pdf`.
pub fn split(source: &SourceFile, ranges: &[PageRange]) -> Result<Vec<OutputFile>, KilnError> {
    let doc = load(source).map_err(|detail| KilnError::Document { detail })?;
    ranges
        .iter()
        .map(|range| {
            let part = assemble(vec![(doc.clone(), Some(range.pages().collect()))])
                .and_then(|mut d| save(&mut d))
                .map_err(|detail| KilnError::Document {
                    detail: format!("{} ({}): {detail}", source.name, range.label),
                })?;
            debug!(file = %source.name, range = %range.label, bytes = part.len(), "split part");
            Ok(OutputFile::new(
                suffixed_name(&source.name, &range.label, formats::PDF.extension),
                part,
                formats::PDF.mime,
            ))
        })
        .collect()
}

/// Re-save with unreferenced objects dropped and streams deflated.
pub fn compress(source: &SourceFile) -> Result<OutputFile, FileError> {
    let to_err = |detail| FileError::Document {
        name: source.name.clone(),
        detail,
    };
    let mut doc = load(source).map_err(to_err)?;
    doc.prune_objects();
    doc.delete_zero_length_streams();
    doc.renumber_objects();
    doc.compress();
    let data = save(&mut doc).map_err(to_err)?;
    info!(file = %source.name, before = source.data.len(), after = data.len(), "compressed PDF");
    Ok(OutputFile::new(
        suffixed_name(&source.name, "compressed", formats::PDF.extension),
        data,
        formats::PDF.mime,
    ))
}

// ── pdfium tools ─────────────────────────────────────────────────────────

/// Render every page to an image named `<stem>-page-<n><ext>`.
pub fn rasterize(
    engine: &PdfEngine,
    source: &SourceFile,
    scale: f32,
    format: RasterFormat,
    quality: f32,
) -> Result<Vec<OutputFile>, FileError> {
    use pdfium_render::prelude::*;

    let doc_err = |detail: String| FileError::Document {
        name: source.name.clone(),
        detail,
    };
    let pdfium = engine.bind().map_err(|detail| FileError::EngineLoad {
        engine: "pdfium".into(),
        detail,
    })?;
    let document = pdfium
        .load_pdf_from_byte_slice(&source.data, None)
        .map_err(|e| doc_err(format!("{e:?}")))?;

    let encoding = match format {
        RasterFormat::Png => Encoding::Png,
        RasterFormat::Jpeg => Encoding::Jpeg,
    };
    let render_config = PdfRenderConfig::new().scale_page_by_factor(scale);

    let mut outputs = Vec::new();
    for (index, page) in document.pages().iter().enumerate() {
        let number = index + 1;
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| doc_err(format!("page {number}: {e:?}")))?;
        let image = bitmap.as_image();
        debug!(page = number, width = image.width(), height = image.height(), "rendered page");

        let data = encode(&image, encoding, quality).map_err(|detail| FileError::Encode {
            name: source.name.clone(),
            detail: format!("page {number}: {detail}"),
        })?;
        outputs.push(OutputFile::new(
            suffixed_name(&source.name, &format!("page-{number}"), format.extension()),
            data,
            format.mime(),
        ));
    }
    info!(file = %source.name, pages = outputs.len(), "rasterised PDF");
    Ok(outputs)
}

/// Plain text of every page, as `<stem>-text.txt`.
pub fn extract_text(engine: &PdfEngine, source: &SourceFile) -> Result<OutputFile, FileError> {
    let doc_err = |detail: String| FileError::Document {
        name: source.name.clone(),
        detail,
    };
    let pdfium = engine.bind().map_err(|detail| FileError::EngineLoad {
        engine: "pdfium".into(),
        detail,
    })?;
    let document = pdfium
        .load_pdf_from_byte_slice(&source.data, None)
        .map_err(|e| doc_err(format!("{e:?}")))?;

    let mut texts = Vec::new();
    for (index, page) in document.pages().iter().enumerate() {
        let text = page
            .text()
            .map_err(|e| doc_err(format!("page {}: {e:?}", index + 1)))?
            .all();
        texts.push((index + 1, text));
    }

    let body = assemble_page_text(texts);
    Ok(OutputFile::new(
        suffixed_name(&source.name, "text", formats::TXT.extension),
        body.into_bytes(),
        formats::TXT.mime,
    ))
}

/// `--- Page n ---` blocks for non-blank pages, separated by a blank line.
pub fn assemble_page_text(pages: impl IntoIterator<Item = (usize, String)>) -> String {
    pages
        .into_iter()
        .filter_map(|(number, text)| {
            let text = text.trim();
            (!text.is_empty()).then(|| format!("--- Page {number} ---\n{text}"))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ── Adapter ──────────────────────────────────────────────────────────────

/// The per-file PDF tools that run through the batch orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentOp {
    Compress,
    ExtractText,
}

pub struct DocumentAdapter {
    engines: Arc<Engines>,
    op: DocumentOp,
}

impl DocumentAdapter {
    pub fn new(engines: Arc<Engines>, op: DocumentOp) -> Self {
        Self { engines, op }
    }
}

fn run_op(
    op: DocumentOp,
    engine: Option<&PdfEngine>,
    source: &SourceFile,
) -> Result<OutputFile, FileError> {
    match (op, engine) {
        (DocumentOp::Compress, _) => compress(source),
        (DocumentOp::ExtractText, Some(engine)) => extract_text(engine, source),
        (DocumentOp::ExtractText, None) => Err(FileError::EngineLoad {
            engine: "pdfium".into(),
            detail: "text extraction needs the pdfium engine".into(),
        }),
    }
}

#[async_trait]
impl ConversionAdapter for DocumentAdapter {
    fn engine(&self) -> EngineKind {
        EngineKind::Document
    }

    fn label(&self) -> String {
        match self.op {
            DocumentOp::Compress => "pdf compress".into(),
            DocumentOp::ExtractText => "pdf extract-text".into(),
        }
    }

    async fn convert(
        &self,
        source: &SourceFile,
        progress: &ProgressTicker,
    ) -> Result<OutputFile, FileError> {
        let engine = match self.op {
            DocumentOp::Compress => None,
            DocumentOp::ExtractText => Some(
                self.engines
                    .documents
                    .get()
                    .await
                    .map_err(|e| e.into_file_error(&source.name))?,
            ),
        };
        progress.tick(10);

        let op = self.op;
        let owned = source.clone();
        let output = tokio::task::spawn_blocking(move || run_op(op, engine.as_deref(), &owned))
        .await
        .map_err(|e| FileError::Panicked {
            name: source.name.clone(),
            detail: e.to_string(),
        })??;

        progress.tick(100);
        Ok(output)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::pages::parse_ranges;
    use lopdf::content::{Content, Operation};
    use lopdf::Stream;

    /// A PDF whose pages carry a `KilnTag` of `<tag>-<n>` and inherit their
    /// MediaBox and Resources from the page tree.
    pub(crate) fn sample_pdf(tag: &str, pages: usize) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let tree_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids: Vec<Object> = Vec::new();
        for n in 1..=pages {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 24.into()]),
                    Operation::new("Td", vec![72.into(), 720.into()]),
                    Operation::new("Tj", vec![Object::string_literal(format!("{tag} page {n}"))]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => tree_id,
                "Contents" => content_id,
                "KilnTag" => Object::string_literal(format!("{tag}-{n}")),
            });
            kids.push(page_id.into());
        }
        doc.objects.insert(
            tree_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => pages as i64,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => tree_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut buf = Vec::new();
        doc.save_to(&mut buf).unwrap();
        buf
    }

    pub(crate) fn tags(data: &[u8]) -> Vec<String> {
        let doc = Document::load_mem(data).unwrap();
        doc.get_pages()
            .values()
            .map(|id| {
                let page = doc.get_dictionary(*id).unwrap();
                let tag = page.get(b"KilnTag").unwrap().as_str().unwrap();
                String::from_utf8_lossy(tag).into_owned()
            })
            .collect()
    }

    fn pdf(name: &str, tag: &str, pages: usize) -> SourceFile {
        SourceFile::new(name, sample_pdf(tag, pages))
    }

    #[test]
    fn merge_keeps_input_order() {
        let out = merge(&[pdf("b.pdf", "b", 2), pdf("a.pdf", "a", 1)]).unwrap();
        assert_eq!(out.name, MERGED_NAME);
        assert_eq!(out.mime(), "application/pdf");
        assert_eq!(tags(out.bytes()), ["b-1", "b-2", "a-1"]);
    }

    #[test]
    fn merge_needs_two_inputs() {
        let err = merge(&[pdf("a.pdf", "a", 1)]).unwrap_err();
        assert!(matches!(err, KilnError::NotEnoughInputs { needed: 2, got: 1 }));
    }

    #[test]
    fn merge_rejects_garbage() {
        let junk = SourceFile::new("junk.pdf", b"not a pdf".to_vec());
        let err = merge(&[pdf("a.pdf", "a", 1), junk]).unwrap_err();
        assert!(err.to_string().contains("junk.pdf"), "got: {err}");
    }

    #[test]
    fn merged_pages_keep_inherited_media_box() {
        let out = merge(&[pdf("a.pdf", "a", 1), pdf("b.pdf", "b", 1)]).unwrap();
        let doc = Document::load_mem(out.bytes()).unwrap();
        for id in doc.get_pages().values() {
            let page = doc.get_dictionary(*id).unwrap();
            assert!(page.has(b"MediaBox"));
            assert!(page.has(b"Resources"));
        }
    }

    #[test]
    fn split_writes_one_document_per_range() {
        let source = pdf("report.pdf", "r", 10);
        let ranges = parse_ranges("1-3,7", 10);
        let parts = split(&source, &ranges).unwrap();
        let names: Vec<_> = parts.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["report-pages-1-3.pdf", "report-page-7.pdf"]);
        assert_eq!(tags(parts[0].bytes()), ["r-1", "r-2", "r-3"]);
        assert_eq!(tags(parts[1].bytes()), ["r-7"]);
    }

    #[test]
    fn split_parts_are_smaller_than_source() {
        let source = pdf("big.pdf", "x", 20);
        let parts = split(&source, &parse_ranges("2", 20)).unwrap();
        assert!(parts[0].bytes().len() < source.data.len());
    }

    #[test]
    fn page_count_reads_tree() {
        assert_eq!(page_count(&pdf("a.pdf", "a", 4)).unwrap(), 4);
    }

    #[test]
    fn compress_keeps_pages() {
        let out = compress(&pdf("scan.pdf", "s", 3)).unwrap();
        assert_eq!(out.name, "scan-compressed.pdf");
        assert_eq!(tags(out.bytes()), ["s-1", "s-2", "s-3"]);
    }

    #[test]
    fn compress_reports_bad_input_per_file() {
        let err = compress(&SourceFile::new("bad.pdf", vec![1, 2, 3])).unwrap_err();
        assert!(matches!(err, FileError::Document { ref name, .. } if name == "bad.pdf"));
    }

    #[test]
    fn page_text_skips_blank_pages() {
        let text = assemble_page_text([
            (1, "Hello\n".to_string()),
            (2, "   ".to_string()),
            (3, "World".to_string()),
        ]);
        assert_eq!(text, "--- Page 1 ---\nHello\n\n--- Page 3 ---\nWorld");
    }

    #[test]
    fn page_text_of_blank_document_is_empty() {
        assert_eq!(assemble_page_text([(1, String::new())]), "");
    }

    #[test]
    fn extract_text_without_engine_does_not_compress() {
        let err = run_op(DocumentOp::ExtractText, None, &pdf("a.pdf", "a", 1)).unwrap_err();
        assert!(matches!(err, FileError::EngineLoad { ref engine, .. } if engine == "pdfium"));
        let out = run_op(DocumentOp::Compress, None, &pdf("a.pdf", "a", 1)).unwrap();
        assert_eq!(out.name, "a-compressed.pdf");
    }

    #[tokio::test]
    async fn compress_adapter_needs_no_engine() {
        let config = crate::config::PipelineConfig::default();
        let adapter = DocumentAdapter::new(Engines::new(&config), DocumentOp::Compress);
        let out = adapter
            .convert(&pdf("a.pdf", "a", 2), &ProgressTicker::noop())
            .await
            .unwrap();
        assert_eq!(out.name, "a-compressed.pdf");
        assert_eq!(adapter.engine(), EngineKind::Document);
    }
}
