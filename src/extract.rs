//! Text-source resolution: embedded text layer vs. OCR.
//!
//! Digital PDFs carry a usable text layer; scans do not. The resolver
//! extracts the text layer first and only rasterizes + OCRs when the
//! layer is effectively empty.

use std::path::Path;

use tracing::info;

use crate::config::OcrConfig;
use crate::error::PipelineError;
use crate::ocr::{self, EngineRegistry, OcrBackend, MIN_TEXT_LEN};

/// Which extraction path produced a document's page texts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    TextLayer,
    Ocr(OcrBackend),
}

impl Provenance {
    pub fn label(&self) -> &'static str {
        match self {
            Provenance::TextLayer => "text-layer",
            Provenance::Ocr(backend) => backend.as_str(),
        }
    }
}

/// Extract the embedded text layer, one string per page in page order
/// (empty string where a page has none).
pub fn extract_text_layer(path: &Path) -> Result<Vec<String>, PipelineError> {
    let document = lopdf::Document::load(path)
        .map_err(|e| PipelineError::Extraction(format!("failed to load {}: {}", path.display(), e)))?;

    let texts = document
        .get_pages()
        .keys()
        .map(|&page_num| document.extract_text(&[page_num]).unwrap_or_default())
        .collect();
    Ok(texts)
}

/// Resolve a document's page texts: accept the text layer when its
/// whitespace-stripped length reaches the minimum threshold, otherwise
/// run the OCR orchestrator for the whole document.
pub fn extract_pdf_text(
    path: &Path,
    backend: OcrBackend,
    registry: &EngineRegistry,
    cfg: &OcrConfig,
) -> Result<(Vec<String>, Provenance), PipelineError> {
    let texts = extract_text_layer(path)?;
    let stripped: usize = texts
        .iter()
        .map(|t| t.chars().filter(|c| !c.is_whitespace()).count())
        .sum();

    if stripped >= MIN_TEXT_LEN {
        info!("using embedded text layer for {}", path.display());
        return Ok((texts, Provenance::TextLayer));
    }

    info!(
        "text layer too small ({} chars), running OCR for {}",
        stripped,
        path.display()
    );
    let outcome = ocr::ocr_document(registry, cfg, path, backend)?;
    Ok((outcome.texts, Provenance::Ocr(outcome.backend_used)))
}

/// Build a minimal PDF with one page per entry, each carrying its text in
/// an embedded text layer. Shared by the resolver and pipeline tests.
#[cfg(test)]
pub(crate) fn build_pdf_with_text(pages: &[&str]) -> Vec<u8> {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for text in pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().expect("content stream encodes"),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("PDF serializes");
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OcrConfig;

    fn write_pdf(dir: &tempfile::TempDir, name: &str, pages: &[&str]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, build_pdf_with_text(pages)).unwrap();
        path
    }

    #[test]
    fn test_text_layer_extracted_in_page_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_pdf(&dir, "doc.pdf", &["first page AB-1234", "second page CD-5678"]);
        let texts = extract_text_layer(&path).unwrap();
        assert_eq!(texts.len(), 2);
        assert!(texts[0].contains("AB-1234"));
        assert!(texts[1].contains("CD-5678"));
    }

    #[test]
    fn test_sufficient_text_layer_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_pdf(&dir, "doc.pdf", &["drawing AB-1234 steel bracket reference"]);
        let cfg = OcrConfig::default();
        let registry = EngineRegistry::from_config(&cfg);
        let (texts, provenance) =
            extract_pdf_text(&path, OcrBackend::Yomitoku, &registry, &cfg).unwrap();
        assert_eq!(provenance, Provenance::TextLayer);
        assert_eq!(provenance.label(), "text-layer");
        assert!(texts[0].contains("AB-1234"));
    }

    #[test]
    fn test_unreadable_pdf_is_extraction_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"not a pdf at all").unwrap();
        assert!(matches!(
            extract_text_layer(&path),
            Err(PipelineError::Extraction(_))
        ));
    }
}
