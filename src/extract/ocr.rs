//! OCR engines and the confidence-driven chain that combines them.
//!
//! The chain asks engines in order. An engine's result is accepted outright
//! when it reaches that engine's threshold; otherwise later engines are
//! consulted and the most confident result wins. A later engine failing
//! never discards an earlier result.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ExtractionError;
use crate::models::{FileKind, OcrConfig, TesseractConfig, VisionConfig};
use crate::utils::text::has_meaningful_content;

const PDF_RASTER_DPI: &str = "300";

#[derive(Debug, Clone, PartialEq)]
pub struct OcrResult {
    pub text: String,
    /// 0-100.
    pub confidence: f32,
    pub engine: String,
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Results at or above this confidence end the chain.
    fn accept_threshold(&self) -> f32;

    /// The engine is only asked when the best result so far is below this.
    fn consult_below(&self) -> f32 {
        f32::INFINITY
    }

    async fn recognize(&self, image: Arc<Vec<u8>>) -> Result<OcrResult, ExtractionError>;
}

/// Local OCR through the `tesseract` command line tool.
pub struct TesseractCli {
    binary: String,
    language: String,
    threshold: f32,
}

impl TesseractCli {
    pub fn new(config: &TesseractConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            language: config.language.clone(),
            threshold: config.confidence_threshold,
        }
    }
}

#[async_trait]
impl OcrEngine for TesseractCli {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn accept_threshold(&self) -> f32 {
        self.threshold
    }

    async fn recognize(&self, image: Arc<Vec<u8>>) -> Result<OcrResult, ExtractionError> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("input.img");
        tokio::fs::write(&input, image.as_slice()).await?;

        let output = Command::new(&self.binary)
            .arg(&input)
            .arg("stdout")
            .args(["-l", self.language.as_str()])
            .arg("tsv")
            .output()
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => {
                    ExtractionError::EngineUnavailable(format!("{} not found", self.binary))
                }
                _ => ExtractionError::IoError(e),
            })?;

        if !output.status.success() {
            return Err(ExtractionError::backend(
                "tesseract",
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }

        let (text, confidence) = parse_tsv(&String::from_utf8_lossy(&output.stdout));
        Ok(OcrResult {
            text,
            confidence,
            engine: self.name().to_string(),
        })
    }
}

/// Rebuild text from tesseract's TSV output. Words on the same line are
/// joined with spaces and paragraphs are separated by a blank line. The
/// confidence is the mean over every row that reports one (`-1` means none).
fn parse_tsv(tsv: &str) -> (String, f32) {
    let mut text = String::new();
    let mut last_line: Option<(&str, &str, &str, &str)> = None;
    let mut conf_sum = 0.0f64;
    let mut conf_count = 0usize;

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 {
            continue;
        }

        match cols[10].trim().parse::<f64>() {
            Ok(conf) if conf != -1.0 => {
                conf_sum += conf;
                conf_count += 1;
            }
            _ => {}
        }

        let word = cols[11].trim();
        if cols[0] != "5" || word.is_empty() {
            continue;
        }

        let line = (cols[1], cols[2], cols[3], cols[4]);
        match last_line {
            Some(prev) if prev == line => text.push(' '),
            Some(prev) if (prev.0, prev.1, prev.2) == (line.0, line.1, line.2) => text.push('\n'),
            Some(_) => text.push_str("\n\n"),
            None => {}
        }
        text.push_str(word);
        last_line = Some(line);
    }

    let confidence = if conf_count == 0 {
        0.0
    } else {
        (conf_sum / conf_count as f64) as f32
    };
    (text, confidence)
}

/// Remote OCR through a vision model behind an OpenAI-compatible
/// `chat/completions` endpoint.
pub struct VisionOcr {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    prompt: String,
    consult_below: f32,
    assumed_confidence: f32,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: [ContentPart<'a>; 2],
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl VisionOcr {
    pub fn new(config: &VisionConfig) -> Result<Self, ExtractionError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.resolved_api_key().map(str::to_string),
            prompt: config.prompt.clone(),
            consult_below: config.use_when_confidence_below,
            assumed_confidence: config.assumed_confidence,
        })
    }
}

#[async_trait]
impl OcrEngine for VisionOcr {
    fn name(&self) -> &str {
        "vision"
    }

    fn accept_threshold(&self) -> f32 {
        0.0
    }

    fn consult_below(&self) -> f32 {
        self.consult_below
    }

    async fn recognize(&self, image: Arc<Vec<u8>>) -> Result<OcrResult, ExtractionError> {
        let data_url = format!(
            "data:{};base64,{}",
            sniff_mime(&image),
            STANDARD.encode(image.as_slice())
        );
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: [
                    ContentPart::Text { text: &self.prompt },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: data_url },
                    },
                ],
            }],
        };

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ExtractionError::backend(
                "vision",
                format!("status {status}: {error_text}"),
            ));
        }

        let parsed: ChatResponse = response.json().await?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ExtractionError::backend("vision", "response had no content"))?;

        Ok(OcrResult {
            text: text.trim().to_string(),
            confidence: self.assumed_confidence,
            engine: self.name().to_string(),
        })
    }
}

fn sniff_mime(bytes: &[u8]) -> &'static str {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'B', b'M', ..] => "image/bmp",
        [b'I', b'I', 0x2A, 0x00, ..] | [b'M', b'M', 0x00, 0x2A, ..] => "image/tiff",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Engines in priority order.
pub struct OcrChain {
    engines: Vec<Arc<dyn OcrEngine>>,
    rasterizer: String,
}

impl OcrChain {
    pub fn new() -> Self {
        Self {
            engines: Vec::new(),
            rasterizer: "pdftoppm".to_string(),
        }
    }

    /// Tesseract first, then the vision model, each if enabled.
    pub fn from_config(config: &OcrConfig) -> Result<Self, ExtractionError> {
        let mut chain = Self::new();
        if config.tesseract.enabled {
            chain.push(Arc::new(TesseractCli::new(&config.tesseract)));
        }
        if config.vision.enabled {
            chain.push(Arc::new(VisionOcr::new(&config.vision)?));
        }
        Ok(chain)
    }

    pub fn push(&mut self, engine: Arc<dyn OcrEngine>) {
        self.engines.push(engine);
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    pub fn engine_names(&self) -> Vec<String> {
        self.engines.iter().map(|e| e.name().to_string()).collect()
    }

    /// OCR a document. PDFs are rasterized page by page first.
    pub async fn recognize(
        &self,
        kind: FileKind,
        bytes: Arc<Vec<u8>>,
    ) -> Result<OcrResult, ExtractionError> {
        match kind {
            FileKind::Pdf => self.recognize_pdf(&bytes).await,
            _ => self.recognize_image(bytes).await,
        }
    }

    pub async fn recognize_image(&self, image: Arc<Vec<u8>>) -> Result<OcrResult, ExtractionError> {
        let mut best: Option<OcrResult> = None;
        let mut last_error = None;

        for engine in &self.engines {
            if best
                .as_ref()
                .is_some_and(|current| current.confidence >= engine.consult_below())
            {
                continue;
            }

            match engine.recognize(image.clone()).await {
                Ok(result) => {
                    debug!(
                        "{} returned {} chars at confidence {:.1}",
                        engine.name(),
                        result.text.len(),
                        result.confidence
                    );
                    let accepted = result.confidence >= engine.accept_threshold();
                    let improves = best.as_ref().is_none_or(|current| {
                        has_meaningful_content(&result.text)
                            && (result.confidence > current.confidence
                                || !has_meaningful_content(&current.text))
                    });
                    if improves {
                        best = Some(result);
                    }
                    if accepted {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{} OCR failed: {}", engine.name(), e);
                    last_error = Some(e);
                }
            }
        }

        best.ok_or_else(|| {
            last_error.unwrap_or_else(|| {
                ExtractionError::EngineUnavailable("no OCR engine configured".to_string())
            })
        })
    }

    async fn recognize_pdf(&self, pdf: &[u8]) -> Result<OcrResult, ExtractionError> {
        let dir = tempfile::tempdir()?;
        let pages = self.rasterize(pdf, dir.path()).await?;
        info!("OCR on {} rasterized PDF pages", pages.len());

        let mut texts = Vec::with_capacity(pages.len());
        let mut confidence_sum = 0.0;
        let mut engines: Vec<String> = Vec::new();
        for page in &pages {
            let image = Arc::new(tokio::fs::read(page).await?);
            let result = self.recognize_image(image).await?;
            confidence_sum += result.confidence;
            if !engines.contains(&result.engine) {
                engines.push(result.engine);
            }
            if has_meaningful_content(&result.text) {
                texts.push(result.text);
            }
        }

        Ok(OcrResult {
            text: texts.join("\n\n"),
            confidence: confidence_sum / pages.len() as f32,
            engine: engines.join("+"),
        })
    }

    /// Render each page to `page-N.png` in `dir`, returned in page order.
    async fn rasterize(&self, pdf: &[u8], dir: &Path) -> Result<Vec<PathBuf>, ExtractionError> {
        let input = dir.join("input.pdf");
        tokio::fs::write(&input, pdf).await?;

        let output = Command::new(&self.rasterizer)
            .args(["-r", PDF_RASTER_DPI, "-png"])
            .arg(&input)
            .arg(dir.join("page"))
            .output()
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => {
                    ExtractionError::EngineUnavailable(format!("{} not found", self.rasterizer))
                }
                _ => ExtractionError::IoError(e),
            })?;
        if !output.status.success() {
            return Err(ExtractionError::backend(
                "pdftoppm",
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }

        let mut pages: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("page") && n.ends_with(".png"))
            })
            .collect();
        // pdftoppm zero-pads page numbers, so name order is page order
        pages.sort();

        if pages.is_empty() {
            return Err(ExtractionError::backend("pdftoppm", "no pages rendered"));
        }
        Ok(pages)
    }
}

impl Default for OcrChain {
    fn default() -> Self {
        Self::new()
    }
}
