//! DOCX extraction straight from the Office Open XML package.

use std::io::{Cursor, Read};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use super::{ExtractInput, Extracted, Extractor};
use crate::error::ExtractionError;
use crate::models::{FileKind, Metadata};
use crate::utils::text::decode_entities;

static RE_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<w:tbl>.*?</w:tbl>").unwrap());
static RE_ROW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<w:tr[ >].*?</w:tr>").unwrap());
static RE_CELL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<w:tc>.*?</w:tc>").unwrap());
static RE_PARAGRAPH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<w:p[ >].*?</w:p>").unwrap());
static RE_RUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<w:t(?:\s[^>]*)?>([^<]*)</w:t>|<w:(tab|br|cr)(?:\s[^>]*)?/>").unwrap()
});

const CORE_PROPERTIES: [(&str, &str); 4] = [
    ("dc:creator", "author"),
    ("dcterms:created", "created_date"),
    ("dcterms:modified", "modified_date"),
    ("dc:title", "title"),
];

/// Reads paragraphs, tables, headers, footers and core properties.
pub struct DocxExtractor;

#[async_trait]
impl Extractor for DocxExtractor {
    fn name(&self) -> &str {
        "docx"
    }

    fn supports(&self, kind: FileKind) -> bool {
        kind == FileKind::Docx
    }

    async fn extract(&self, input: &ExtractInput) -> Result<Extracted, ExtractionError> {
        let bytes = input.raw()?;
        tokio::task::spawn_blocking(move || extract_docx(&bytes))
            .await
            .map_err(|e| ExtractionError::backend("docx", format!("task join error: {e}")))?
    }
}

fn extract_docx(bytes: &[u8]) -> Result<Extracted, ExtractionError> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ExtractionError::backend("docx", e))?;

    let document = read_entry(&mut archive, "word/document.xml")?
        .ok_or_else(|| ExtractionError::backend("docx", "word/document.xml not found"))?;

    let mut parts = body_text(&document);

    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();
    for name in names.iter().filter(|n| n.starts_with("word/header")) {
        if let Some(xml) = read_entry(&mut archive, name)? {
            for para in paragraphs(&xml).into_iter().rev() {
                parts.insert(0, format!("[HEADER] {para}"));
            }
        }
    }
    for name in names.iter().filter(|n| n.starts_with("word/footer")) {
        if let Some(xml) = read_entry(&mut archive, name)? {
            parts.extend(paragraphs(&xml).into_iter().map(|p| format!("[FOOTER] {p}")));
        }
    }

    let mut extracted = Extracted::text(parts.join("\n\n"));
    if let Some(core) = read_entry(&mut archive, "docProps/core.xml")? {
        extracted.metadata = core_properties(&core);
    }
    Ok(extracted)
}

fn read_entry(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Option<String>, ExtractionError> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(ExtractionError::backend("docx", e)),
    };
    let mut xml = String::new();
    file.read_to_string(&mut xml)?;
    Ok(Some(xml))
}

/// Paragraph texts outside tables, then one `a | b | c` line per table row.
fn body_text(xml: &str) -> Vec<String> {
    let mut parts = paragraphs(&RE_TABLE.replace_all(xml, ""));

    for table in RE_TABLE.find_iter(xml) {
        for row in RE_ROW.find_iter(table.as_str()) {
            let cells: Vec<String> = RE_CELL
                .find_iter(row.as_str())
                .map(|cell| paragraphs(cell.as_str()).join(" "))
                .collect();
            let row_text = cells.join(" | ");
            if !row_text.replace('|', "").trim().is_empty() {
                parts.push(row_text);
            }
        }
    }

    parts
}

fn paragraphs(xml: &str) -> Vec<String> {
    RE_PARAGRAPH
        .find_iter(xml)
        .map(|p| paragraph_text(p.as_str()))
        .filter(|text| !text.trim().is_empty())
        .collect()
}

fn paragraph_text(xml: &str) -> String {
    let mut text = String::new();
    for run in RE_RUN.captures_iter(xml) {
        if let Some(t) = run.get(1) {
            text.push_str(&decode_entities(t.as_str()));
        } else if let Some(tag) = run.get(2) {
            text.push(if tag.as_str() == "tab" { '\t' } else { '\n' });
        }
    }
    text
}

fn core_properties(xml: &str) -> Metadata {
    let mut metadata = Metadata::new();
    for (tag, key) in CORE_PROPERTIES {
        let pattern = format!(r"(?s)<{tag}(?:\s[^>]*)?>(.*?)</{tag}>");
        let Ok(re) = Regex::new(&pattern) else {
            continue;
        };
        if let Some(value) = re.captures(xml).and_then(|c| c.get(1)) {
            let value = decode_entities(value.as_str().trim());
            if !value.is_empty() {
                metadata.insert(key.to_string(), Value::String(value));
            }
        }
    }
    metadata
}
