use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::text::estimate_tokens;

/// Free-form metadata attached to documents and chunks.
pub type Metadata = serde_json::Map<String, Value>;

pub const META_REQUIRES_OCR: &str = "requires_ocr";
pub const META_SOURCE_FILE: &str = "source_file";
pub const META_CHUNK_INDEX: &str = "chunk_index";
pub const META_FILE_TYPE: &str = "file_type";

/// Input format, detected from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Pdf,
    Docx,
    Image,
    Email,
    Enex,
    Text,
}

impl FileKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "pdf" => Some(FileKind::Pdf),
            "docx" => Some(FileKind::Docx),
            "png" | "jpg" | "jpeg" | "tiff" | "tif" | "bmp" | "gif" | "webp" => {
                Some(FileKind::Image)
            }
            "eml" => Some(FileKind::Email),
            "enex" => Some(FileKind::Enex),
            "txt" | "text" | "md" | "markdown" | "csv" | "log" | "rst" => Some(FileKind::Text),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    /// Binary kinds have their bytes loaded at discovery time.
    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            FileKind::Pdf | FileKind::Docx | FileKind::Image | FileKind::Email
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Pdf => "pdf",
            FileKind::Docx => "docx",
            FileKind::Image => "image",
            FileKind::Email => "email",
            FileKind::Enex => "enex",
            FileKind::Text => "text",
        }
    }
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessingStatus::Pending)
    }
}

/// One input file in flight through the pipeline.
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub path: PathBuf,
    pub kind: FileKind,
    pub metadata: Metadata,
    /// Raw bytes, held only until extraction no longer needs them.
    pub raw: Option<Vec<u8>>,
    pub content: Option<String>,
    pub chunks: Vec<Chunk>,
    pub ocr_confidence: Option<f32>,
    pub errors: Vec<String>,
    pub file_hash: Option<String>,
    status: ProcessingStatus,
}

impl DocumentRecord {
    pub fn new(path: impl Into<PathBuf>, kind: FileKind) -> Self {
        let path = path.into();
        let mut metadata = Metadata::new();
        metadata.insert(
            META_SOURCE_FILE.to_string(),
            Value::String(path.display().to_string()),
        );
        metadata.insert(
            META_FILE_TYPE.to_string(),
            Value::String(kind.as_str().to_string()),
        );
        Self {
            path,
            kind,
            metadata,
            raw: None,
            content: None,
            chunks: Vec::new(),
            ocr_confidence: None,
            errors: Vec::new(),
            file_hash: None,
            status: ProcessingStatus::Pending,
        }
    }

    /// Stable key used by the checkpoint.
    pub fn key(&self) -> String {
        self.path.display().to_string()
    }

    pub fn status(&self) -> ProcessingStatus {
        self.status
    }

    pub fn is_failed(&self) -> bool {
        self.status == ProcessingStatus::Failed
    }

    pub fn is_completed(&self) -> bool {
        self.status == ProcessingStatus::Completed
    }

    /// Mark the document failed. Terminal states are left untouched.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
        if self.status == ProcessingStatus::Pending {
            self.status = ProcessingStatus::Failed;
        }
    }

    /// Returns false if the document already reached a terminal state.
    pub fn mark_completed(&mut self) -> bool {
        if self.status == ProcessingStatus::Pending {
            self.status = ProcessingStatus::Completed;
            true
        } else {
            false
        }
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn requires_ocr(&self) -> bool {
        self.metadata
            .get(META_REQUIRES_OCR)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn fully_embedded(&self) -> bool {
        !self.chunks.is_empty() && self.chunks.iter().all(|c| c.embedding.is_some())
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.key())
    }
}

/// A contiguous span of a document's text, embedded and stored on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub index: u32,
    pub char_count: usize,
    pub token_estimate: usize,
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub storage_id: Option<String>,
}

impl Chunk {
    /// Deterministic storage id, so re-storing a document overwrites
    /// its earlier records.
    pub fn generate_id(source: &str, chunk_index: u32) -> String {
        use uuid::Uuid;
        let name = format!("{}:{}", source, chunk_index);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
    }

    pub fn new(text: String, index: u32, parent: &Metadata, chars_per_token: usize) -> Self {
        let char_count = text.chars().count();
        let token_estimate = estimate_tokens(&text, chars_per_token);
        let mut metadata = parent.clone();
        metadata.insert(META_CHUNK_INDEX.to_string(), Value::from(index));
        Self {
            text,
            index,
            char_count,
            token_estimate,
            metadata,
            embedding: None,
            storage_id: None,
        }
    }
}
