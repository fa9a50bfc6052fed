//! Text extraction and OCR backends.
//!
//! Every backend implements [`Extractor`] or [`OcrEngine`]; the registry and
//! the OCR chain hold the available backends in priority order and fall
//! through on failure.

mod docx;
mod email;
mod enex;
mod ocr;
mod pdf;
mod text;

pub use docx::DocxExtractor;
pub use email::EmailExtractor;
pub use enex::EnexExtractor;
pub use ocr::{OcrChain, OcrEngine, OcrResult, TesseractCli, VisionOcr};
pub use pdf::PdfExtractor;
pub use text::{ImageExtractor, TextExtractor};

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::ExtractionError;
use crate::models::{FileKind, Metadata};

/// What a backend gets to work with.
#[derive(Debug, Clone)]
pub struct ExtractInput {
    pub path: PathBuf,
    pub kind: FileKind,
    /// Bytes loaded by the extraction stage; `None` for text kinds read from disk.
    pub raw: Option<Arc<Vec<u8>>>,
}

impl ExtractInput {
    pub fn raw(&self) -> Result<Arc<Vec<u8>>, ExtractionError> {
        self.raw
            .clone()
            .ok_or_else(|| ExtractionError::MissingPayload(self.path.display().to_string()))
    }

    /// Loaded bytes, or the file contents when nothing was preloaded.
    pub async fn bytes(&self) -> Result<Arc<Vec<u8>>, ExtractionError> {
        match &self.raw {
            Some(raw) => Ok(raw.clone()),
            None => Ok(Arc::new(tokio::fs::read(&self.path).await?)),
        }
    }
}

/// Extracted text plus metadata fields to merge into the document.
#[derive(Debug, Clone, Default)]
pub struct Extracted {
    pub content: String,
    pub metadata: Metadata,
    /// No text layer was found; the document needs OCR.
    pub requires_ocr: bool,
}

impl Extracted {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn needs_ocr() -> Self {
        Self {
            requires_ocr: true,
            ..Default::default()
        }
    }
}

/// A text extraction backend.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, kind: FileKind) -> bool;

    async fn extract(&self, input: &ExtractInput) -> Result<Extracted, ExtractionError>;
}

/// Registry of extractors in priority order.
pub struct ExtractorRegistry {
    extractors: Vec<Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            extractors: Vec::new(),
        }
    }

    /// Every built-in extractor.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(TextExtractor);
        registry.register(PdfExtractor);
        registry.register(DocxExtractor);
        registry.register(EmailExtractor);
        registry.register(EnexExtractor);
        registry.register(ImageExtractor);
        registry
    }

    /// Register an extractor after the existing ones.
    pub fn register<E: Extractor + 'static>(&mut self, extractor: E) {
        self.extractors.push(Arc::new(extractor));
    }

    pub fn supports(&self, kind: FileKind) -> bool {
        self.extractors.iter().any(|e| e.supports(kind))
    }

    /// Try each extractor supporting the input's kind until one succeeds.
    pub async fn extract(&self, input: &ExtractInput) -> Result<Extracted, ExtractionError> {
        let mut last_error = None;

        for extractor in self.extractors.iter().filter(|e| e.supports(input.kind)) {
            match extractor.extract(input).await {
                Ok(extracted) => {
                    debug!(
                        "{} extracted {} chars from {}",
                        extractor.name(),
                        extracted.content.len(),
                        input.path.display()
                    );
                    return Ok(extracted);
                }
                Err(e) => {
                    warn!(
                        "{} failed on {}: {}",
                        extractor.name(),
                        input.path.display(),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ExtractionError::Unsupported(input.kind.to_string())))
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
