//! Text extraction and normalization for the `parse` stage.
//!
//! Produces plain text plus lightweight structural hints (section path, page
//! bounds, table flag) consumed by the chunker. Format-specific extraction is
//! behind a trait so new document types slot in without touching the stage
//! machine, the same seam the predecessor codebase used for pluggable
//! checkpointer backends.

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ExtractError {
    #[error("unsupported document type: {0}")]
    #[diagnostic(code(ragweave::extractor::unsupported_type))]
    UnsupportedType(String),

    #[error("malformed document: {0}")]
    #[diagnostic(code(ragweave::extractor::malformed))]
    Malformed(String),

    #[error("ocr required but disabled for this document")]
    #[diagnostic(
        code(ragweave::extractor::ocr_required),
        help("Enable OCR_ENABLED or route image-only PDFs to a manual review queue.")
    )]
    OcrRequired,
}

pub type ExtractResult<T> = Result<T, ExtractError>;

/// One logical block of extracted text, already segmented along natural
/// boundaries (paragraph, table, page) so the chunker doesn't have to
/// re-discover them from a flat string.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractedBlock {
    pub text: String,
    pub section_path: Option<String>,
    pub page_start: Option<u32>,
    pub page_end: Option<u32>,
    pub is_table: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ExtractedDocument {
    pub blocks: Vec<ExtractedBlock>,
    pub detected_lang: Option<String>,
}

impl ExtractedDocument {
    pub fn full_text(&self) -> String {
        self.blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    fn handles(&self, doc_type: &str) -> bool;
    async fn extract(&self, bytes: &[u8], ocr_enabled: bool) -> ExtractResult<ExtractedDocument>;
}

/// Plain text and markdown: split on blank lines into paragraph blocks.
pub struct PlainTextExtractor;

#[async_trait]
impl Extractor for PlainTextExtractor {
    fn handles(&self, doc_type: &str) -> bool {
        matches!(doc_type, "text" | "txt" | "md" | "markdown")
    }

    async fn extract(&self, bytes: &[u8], _ocr_enabled: bool) -> ExtractResult<ExtractedDocument> {
        let text = String::from_utf8(bytes.to_vec())
            .map_err(|e| ExtractError::Malformed(e.to_string()))?;
        let blocks = text
            .split("\n\n")
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(|b| ExtractedBlock {
                text: b.to_string(),
                section_path: None,
                page_start: None,
                page_end: None,
                is_table: false,
            })
            .collect();
        Ok(ExtractedDocument {
            blocks,
            detected_lang: detect_lang(&text),
        })
    }
}

/// CSV: each row becomes a table block, so the chunker can keep rows intact.
pub struct CsvExtractor;

#[async_trait]
impl Extractor for CsvExtractor {
    fn handles(&self, doc_type: &str) -> bool {
        doc_type == "csv"
    }

    async fn extract(&self, bytes: &[u8], _ocr_enabled: bool) -> ExtractResult<ExtractedDocument> {
        let text = String::from_utf8(bytes.to_vec())
            .map_err(|e| ExtractError::Malformed(e.to_string()))?;
        let blocks = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| ExtractedBlock {
                text: l.to_string(),
                section_path: None,
                page_start: None,
                page_end: None,
                is_table: true,
            })
            .collect();
        Ok(ExtractedDocument {
            blocks,
            detected_lang: Some("en".to_string()),
        })
    }
}

/// Dispatches to the first registered extractor that claims a doc type.
pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn Extractor>>,
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self {
            extractors: vec![Box::new(PlainTextExtractor), Box::new(CsvExtractor)],
        }
    }
}

impl ExtractorRegistry {
    pub fn register(&mut self, extractor: Box<dyn Extractor>) {
        self.extractors.push(extractor);
    }

    pub async fn extract(
        &self,
        doc_type: &str,
        bytes: &[u8],
        ocr_enabled: bool,
    ) -> ExtractResult<ExtractedDocument> {
        let extractor = self
            .extractors
            .iter()
            .find(|e| e.handles(doc_type))
            .ok_or_else(|| ExtractError::UnsupportedType(doc_type.to_string()))?;
        extractor.extract(bytes, ocr_enabled).await
    }
}

/// Crude heuristic: ascii-majority text is called English, otherwise unknown.
/// Good enough to populate the `lang` hint without a model dependency.
fn detect_lang(text: &str) -> Option<String> {
    if text.trim().is_empty() {
        return None;
    }
    let ascii = text.chars().filter(|c| c.is_ascii()).count();
    let ratio = ascii as f64 / text.chars().count().max(1) as f64;
    if ratio > 0.9 {
        Some("en".to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_text_splits_on_blank_lines() {
        let doc = PlainTextExtractor
            .extract(b"first para\n\nsecond para", false)
            .await
            .unwrap();
        assert_eq!(doc.blocks.len(), 2);
        assert_eq!(doc.detected_lang.as_deref(), Some("en"));
    }

    #[tokio::test]
    async fn csv_rows_are_tagged_as_tables() {
        let doc = CsvExtractor.extract(b"a,b\n1,2\n", false).await.unwrap();
        assert!(doc.blocks.iter().all(|b| b.is_table));
    }

    #[tokio::test]
    async fn registry_rejects_unknown_types() {
        let registry = ExtractorRegistry::default();
        let err = registry.extract("pdf", b"%PDF", false).await.unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedType(_)));
    }
}
