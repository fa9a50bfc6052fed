//! Plain text and image pass-through extractors.

use async_trait::async_trait;

use super::{ExtractInput, Extracted, Extractor};
use crate::error::ExtractionError;
use crate::models::FileKind;

/// Reads text and markdown files, replacing invalid UTF-8.
pub struct TextExtractor;

#[async_trait]
impl Extractor for TextExtractor {
    fn name(&self) -> &str {
        "text"
    }

    fn supports(&self, kind: FileKind) -> bool {
        kind == FileKind::Text
    }

    async fn extract(&self, input: &ExtractInput) -> Result<Extracted, ExtractionError> {
        let bytes = input.bytes().await?;
        Ok(Extracted::text(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

/// Images carry no text layer; they are always routed to OCR.
pub struct ImageExtractor;

#[async_trait]
impl Extractor for ImageExtractor {
    fn name(&self) -> &str {
        "image"
    }

    fn supports(&self, kind: FileKind) -> bool {
        kind == FileKind::Image
    }

    async fn extract(&self, _input: &ExtractInput) -> Result<Extracted, ExtractionError> {
        Ok(Extracted::needs_ocr())
    }
}
