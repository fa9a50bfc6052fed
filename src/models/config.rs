use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::search::OutputFormat;
use crate::error::ConfigError;
use crate::utils::retry::RetryConfig;

pub const DEFAULT_EMBEDDING_URL: &str = "http://localhost:11411";
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_EMBEDDING_DIMENSION: u32 = 768;
pub const DEFAULT_EMBEDDING_API_KEY: &str = "${DOCSTREAM_EMBEDDING_API_KEY}";
pub const DEFAULT_QDRANT_URL: &str = "http://localhost:6334";
pub const DEFAULT_COLLECTION: &str = "document_embeddings";
pub const DEFAULT_VISION_URL: &str = "http://localhost:11434/v1";
pub const DEFAULT_VISION_MODEL: &str = "llava";
pub const DEFAULT_VISION_PROMPT: &str = "Extract all text from this image, including handwritten text. Preserve the original layout and structure.";

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const CACHE_FILE: &str = "embedding_cache.bin";
pub const HASHES_FILE: &str = ".hashes";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub vector_store: VectorStoreConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub ocr: OcrConfig,

    #[serde(default)]
    pub directories: DirectoriesConfig,

    #[serde(default)]
    pub search: SearchConfig,
}

impl Config {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("docstream").join("config.toml"))
    }

    /// Load the user config, falling back to defaults when no file exists.
    /// `${VAR}` placeholders are resolved from the environment.
    pub fn load() -> Result<Self, ConfigError> {
        if let Some(path) = Self::config_path()
            && path.exists()
        {
            return Self::load_from(&path);
        }
        let mut config = Self::default();
        config.resolve_env_vars();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.resolve_env_vars();
        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_path().ok_or_else(|| {
            ConfigError::PathError("could not determine config directory".to_string())
        })?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Replace `${VAR}` secrets with environment values. Unknown variables
    /// keep their placeholder so `validate` can report them.
    pub fn resolve_env_vars(&mut self) {
        self.resolve_with(|name| std::env::var(name).ok());
    }

    pub fn resolve_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let fields = [
            Some(&mut self.embedding.url),
            self.embedding.api_key.as_mut(),
            Some(&mut self.vector_store.url),
            self.vector_store.api_key.as_mut(),
            Some(&mut self.ocr.vision.url),
            self.ocr.vision.api_key.as_mut(),
        ];
        for value in fields.into_iter().flatten() {
            *value = resolve_placeholder(value, &lookup);
        }
    }

    /// Check the values the pipeline depends on before any state is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding.url.trim().is_empty() || is_placeholder(&self.embedding.url) {
            return Err(ConfigError::MissingValue("embedding.url".to_string()));
        }
        if self.embedding.require_api_key && self.embedding.resolved_api_key().is_none() {
            return Err(ConfigError::MissingValue(
                "embedding.api_key (set DOCSTREAM_EMBEDDING_API_KEY or disable embedding.require_api_key)"
                    .to_string(),
            ));
        }

        let positive = [
            ("embedding.request_batch_size", self.embedding.request_batch_size as u64),
            ("embedding.max_retries", self.embedding.max_retries as u64),
            ("chunking.chunk_size", self.chunking.chunk_size as u64),
            ("chunking.chars_per_token", self.chunking.chars_per_token as u64),
            ("pipeline.max_workers", self.pipeline.max_workers as u64),
            ("pipeline.stream_batch_size", self.pipeline.stream_batch_size as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(ConfigError::ValidationError(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunking.chunk_overlap, self.chunking.chunk_size
            )));
        }

        if !(self.memory.max_percent > 0.0 && self.memory.max_percent <= 100.0) {
            return Err(ConfigError::ValidationError(format!(
                "memory.max_percent must be in (0, 100], got {}",
                self.memory.max_percent
            )));
        }

        Ok(())
    }

    pub fn state_dir(&self) -> &Path {
        &self.directories.state
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.directories.state.join(CHECKPOINT_FILE)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.directories.state.join(CACHE_FILE)
    }

    pub fn hashes_path(&self) -> PathBuf {
        self.directories.state.join(HASHES_FILE)
    }
}

fn is_placeholder(value: &str) -> bool {
    value.starts_with("${") && value.ends_with('}')
}

fn resolve_placeholder<F>(value: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if is_placeholder(value) {
        let name = &value[2..value.len() - 1];
        if let Some(resolved) = lookup(name) {
            return resolved;
        }
    }
    value.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_url")]
    pub url: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_embedding_api_key")]
    pub api_key: Option<String>,

    #[serde(default = "default_true")]
    pub require_api_key: bool,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Texts per outbound embedding request.
    #[serde(default = "default_request_batch_size")]
    pub request_batch_size: u32,

    /// Attempts per request group, the first call included.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Minimum gap between outbound request groups.
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    #[serde(default = "default_dimension")]
    pub dimension: u32,
}

impl EmbeddingConfig {
    /// The API key, unless absent, blank or an unresolved placeholder.
    pub fn resolved_api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty() && !is_placeholder(k))
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries)
            .with_initial_delay(Duration::from_millis(self.initial_backoff_ms))
            .with_max_delay(Duration::from_millis(self.max_backoff_ms))
    }
}

fn default_embedding_url() -> String {
    DEFAULT_EMBEDDING_URL.to_string()
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_embedding_api_key() -> Option<String> {
    Some(DEFAULT_EMBEDDING_API_KEY.to_string())
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    120
}

fn default_request_batch_size() -> u32 {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_request_delay_ms() -> u64 {
    100
}

fn default_cache_size() -> usize {
    10_000
}

fn default_dimension() -> u32 {
    DEFAULT_EMBEDDING_DIMENSION
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: default_embedding_url(),
            model: default_embedding_model(),
            api_key: default_embedding_api_key(),
            require_api_key: true,
            timeout_secs: default_timeout(),
            request_batch_size: default_request_batch_size(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            request_delay_ms: default_request_delay_ms(),
            cache_size: default_cache_size(),
            dimension: default_dimension(),
        }
    }
}

/// Which vector store backend the pipeline writes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Qdrant,
    /// Process-local store, contents are lost on exit.
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "qdrant" => Ok(StoreBackend::Qdrant),
            "memory" => Ok(StoreBackend::Memory),
            _ => Err(format!("unknown store backend: {s}")),
        }
    }
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Qdrant => write!(f, "qdrant"),
            StoreBackend::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_qdrant_url")]
    pub url: String,

    #[serde(default = "default_collection")]
    pub collection: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Attempts per chunk write, the first included.
    #[serde(default = "default_store_retries")]
    pub max_retries: u32,
}

impl VectorStoreConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries.max(1))
            .with_initial_delay(Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(5))
    }
}

fn default_store_retries() -> u32 {
    3
}

fn default_qdrant_url() -> String {
    DEFAULT_QDRANT_URL.to_string()
}

fn default_collection() -> String {
    DEFAULT_COLLECTION.to_string()
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_qdrant_url(),
            collection: default_collection(),
            api_key: None,
            max_retries: default_store_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Target chunk length in tokens.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,

    /// Tokens shared between consecutive chunks.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: u32,

    /// Chunks shorter than this many characters (trimmed) are dropped.
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u32,

    /// Characters per token used for the token estimate.
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: u32,
}

fn default_chunk_size() -> u32 {
    800
}

fn default_chunk_overlap() -> u32 {
    200
}

fn default_min_chunk_size() -> u32 {
    100
}

fn default_chars_per_token() -> u32 {
    4
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_chunk_size: default_min_chunk_size(),
            chars_per_token: default_chars_per_token(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Documents carried through all stages before memory is released.
    #[serde(default = "default_stream_batch_size")]
    pub stream_batch_size: usize,

    #[serde(default = "default_true")]
    pub parallel: bool,

    #[serde(default = "default_supported_formats")]
    pub supported_formats: Vec<String>,

    #[serde(default = "default_true")]
    pub skip_duplicates: bool,

    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,

    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

fn default_max_workers() -> usize {
    4
}

fn default_stream_batch_size() -> usize {
    50
}

fn default_supported_formats() -> Vec<String> {
    [
        "pdf", "docx", "txt", "md", "eml", "enex", "png", "jpg", "jpeg", "tiff", "tif", "bmp",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_exclude_patterns() -> Vec<String> {
    vec![
        "**/.git/**".to_string(),
        "**/.DS_Store".to_string(),
        "**/~$*".to_string(),
        "**/*.tmp".to_string(),
    ]
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            stream_batch_size: default_stream_batch_size(),
            parallel: true,
            supported_formats: default_supported_formats(),
            skip_duplicates: true,
            exclude_patterns: default_exclude_patterns(),
            max_file_size: default_max_file_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// System memory percentage above which batches trigger a release.
    #[serde(default = "default_max_percent")]
    pub max_percent: f32,

    /// Release passes performed by an aggressive release.
    #[serde(default = "default_release_passes")]
    pub release_passes: u32,
}

fn default_max_percent() -> f32 {
    80.0
}

fn default_release_passes() -> u32 {
    3
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_percent: default_max_percent(),
            release_passes: default_release_passes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OcrConfig {
    #[serde(default)]
    pub tesseract: TesseractConfig,

    #[serde(default)]
    pub vision: VisionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TesseractConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_tesseract_binary")]
    pub binary: String,

    #[serde(default = "default_tesseract_language")]
    pub language: String,

    /// Results below this confidence fall through to the next engine.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
}

fn default_tesseract_binary() -> String {
    "tesseract".to_string()
}

fn default_tesseract_language() -> String {
    "eng".to_string()
}

fn default_confidence_threshold() -> f32 {
    70.0
}

impl Default for TesseractConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: default_tesseract_binary(),
            language: default_tesseract_language(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Base URL of an OpenAI-compatible chat completions API.
    #[serde(default = "default_vision_url")]
    pub url: String,

    #[serde(default = "default_vision_model")]
    pub model: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_vision_prompt")]
    pub prompt: String,

    /// The vision model is consulted only when local OCR scores below this.
    #[serde(default = "default_confidence_threshold")]
    pub use_when_confidence_below: f32,

    /// Vision models report no confidence; this value is recorded instead.
    #[serde(default = "default_assumed_confidence")]
    pub assumed_confidence: f32,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl VisionConfig {
    pub fn resolved_api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty() && !is_placeholder(k))
    }
}

fn default_vision_url() -> String {
    DEFAULT_VISION_URL.to_string()
}

fn default_vision_model() -> String {
    DEFAULT_VISION_MODEL.to_string()
}

fn default_vision_prompt() -> String {
    DEFAULT_VISION_PROMPT.to_string()
}

fn default_assumed_confidence() -> f32 {
    90.0
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_vision_url(),
            model: default_vision_model(),
            api_key: None,
            prompt: default_vision_prompt(),
            use_when_confidence_below: default_confidence_threshold(),
            assumed_confidence: default_assumed_confidence(),
            timeout_secs: default_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoriesConfig {
    /// Default input path for `run` when none is given.
    #[serde(default = "default_input_dir")]
    pub input: PathBuf,

    /// Checkpoint, embedding cache and duplicate hashes live here.
    #[serde(default = "default_state_dir")]
    pub state: PathBuf,
}

fn default_input_dir() -> PathBuf {
    PathBuf::from("data/input")
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|p| p.join("docstream"))
        .unwrap_or_else(|| PathBuf::from(".docstream"))
}

impl Default for DirectoriesConfig {
    fn default() -> Self {
        Self {
            input: default_input_dir(),
            state: default_state_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_limit")]
    pub default_limit: u32,

    #[serde(default)]
    pub default_format: OutputFormat,

    #[serde(default)]
    pub default_min_score: Option<f32>,
}

fn default_limit() -> u32 {
    10
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            default_format: OutputFormat::Text,
            default_min_score: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.embedding.api_key = Some("secret".to_string());
        config
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.embedding.url, DEFAULT_EMBEDDING_URL);
        assert_eq!(config.embedding.request_batch_size, 100);
        assert_eq!(config.embedding.cache_size, 10_000);
        assert_eq!(config.vector_store.collection, DEFAULT_COLLECTION);
        assert_eq!(config.chunking.chunk_size, 800);
        assert_eq!(config.chunking.chunk_overlap, 200);
        assert_eq!(config.chunking.min_chunk_size, 100);
        assert_eq!(config.pipeline.stream_batch_size, 50);
        assert_eq!(config.memory.max_percent, 80.0);
    }

    #[test]
    fn test_config_path() {
        let path = Config::config_path();
        assert!(path.is_some());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [chunking]
            chunk_size = 400

            [pipeline]
            max_workers = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.chunking.chunk_size, 400);
        assert_eq!(config.chunking.chunk_overlap, 200);
        assert_eq!(config.pipeline.max_workers, 2);
        assert!(config.pipeline.skip_duplicates);
    }

    #[test]
    fn test_resolve_placeholders() {
        let mut config = Config::default();
        config.vector_store.api_key = Some("${QDRANT_KEY}".to_string());
        config.resolve_with(|name| match name {
            "DOCSTREAM_EMBEDDING_API_KEY" => Some("embed-key".to_string()),
            _ => None,
        });
        assert_eq!(config.embedding.api_key.as_deref(), Some("embed-key"));
        // Unknown variables keep their placeholder.
        assert_eq!(config.vector_store.api_key.as_deref(), Some("${QDRANT_KEY}"));
    }

    #[test]
    fn test_validate_missing_api_key() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingValue(_))));

        let mut optional = Config::default();
        optional.embedding.require_api_key = false;
        assert!(optional.validate().is_ok());
    }

    #[test]
    fn test_validate_overlap() {
        let mut config = valid_config();
        assert!(config.validate().is_ok());
        config.chunking.chunk_overlap = config.chunking.chunk_size;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_validate_zero_batch() {
        let mut config = valid_config();
        config.pipeline.stream_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_state_paths() {
        let mut config = Config::default();
        config.directories.state = PathBuf::from("/tmp/ds");
        assert_eq!(config.checkpoint_path(), PathBuf::from("/tmp/ds/checkpoint.json"));
        assert_eq!(config.cache_path(), PathBuf::from("/tmp/ds/embedding_cache.bin"));
        assert_eq!(config.hashes_path(), PathBuf::from("/tmp/ds/.hashes"));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = valid_config();
        config.pipeline.max_workers = 7;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.pipeline.max_workers, 7);
        assert_eq!(loaded.embedding.api_key.as_deref(), Some("secret"));
    }
}
