//! PDF text layer extraction.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{ExtractInput, Extracted, Extractor};
use crate::error::ExtractionError;
use crate::models::FileKind;
use crate::utils::text::has_meaningful_content;

/// Extracts the text layer with `pdf-extract`. PDFs without one, or that
/// fail to parse, are flagged for OCR instead of failing.
pub struct PdfExtractor;

#[async_trait]
impl Extractor for PdfExtractor {
    fn name(&self) -> &str {
        "pdf"
    }

    fn supports(&self, kind: FileKind) -> bool {
        kind == FileKind::Pdf
    }

    async fn extract(&self, input: &ExtractInput) -> Result<Extracted, ExtractionError> {
        let bytes = input.raw()?;

        // pdf-extract is synchronous and can be slow on large files
        let result = tokio::task::spawn_blocking(move || {
            pdf_extract::extract_text_from_mem(&bytes).map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| ExtractionError::backend("pdf", format!("task join error: {e}")))?;

        let text = match result {
            Ok(text) => text,
            Err(e) => {
                warn!("PDF text extraction failed for {}: {}", input.path.display(), e);
                return Ok(Extracted::needs_ocr());
            }
        };

        let pages: Vec<&str> = text.split('\x0C').collect();
        let page_info: Vec<Value> = pages
            .iter()
            .enumerate()
            .filter(|(_, page)| has_meaningful_content(page))
            .map(|(i, page)| json!({"page_number": i + 1, "char_count": page.chars().count()}))
            .collect();

        let mut extracted = if page_info.is_empty() {
            info!("{}: no text layer found, requires OCR", input.path.display());
            Extracted::needs_ocr()
        } else {
            let content = pages
                .iter()
                .filter(|page| has_meaningful_content(page))
                .map(|page| page.trim_matches('\n'))
                .collect::<Vec<_>>()
                .join("\n\n");
            debug!("pdf-extract read {} pages with text", page_info.len());
            Extracted::text(content)
        };

        extracted
            .metadata
            .insert("num_pages".to_string(), Value::from(pages.len()));
        extracted
            .metadata
            .insert("pages".to_string(), Value::Array(page_info));
        Ok(extracted)
    }
}
