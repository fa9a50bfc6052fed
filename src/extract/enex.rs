//! Evernote exports: every `<note>` becomes a markdown-ish section.

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use regex::Regex;
use serde_json::Value;

use super::{ExtractInput, Extracted, Extractor};
use crate::error::ExtractionError;
use crate::models::FileKind;
use crate::utils::text::{decode_entities, strip_markup};

static RE_NOTE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<note>(.*?)</note>").unwrap());
static RE_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<title>(.*?)</title>").unwrap());
static RE_CREATED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<created>(.*?)</created>").unwrap());
static RE_UPDATED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<updated>(.*?)</updated>").unwrap());
static RE_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<tag>(.*?)</tag>").unwrap());
static RE_CONTENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<content>(.*?)</content>").unwrap());
static RE_CDATA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<!\[CDATA\[|\]\]>").unwrap());
static RE_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)<a[^>]*href="([^"]*)"[^>]*>(.*?)</a>"#).unwrap());
static RE_PARAGRAPH_END: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)</p\s*>").unwrap());
static RE_BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n\s*\n+").unwrap());

const ENEX_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const NOTE_SEPARATOR_WIDTH: usize = 80;

pub struct EnexExtractor;

#[async_trait]
impl Extractor for EnexExtractor {
    fn name(&self) -> &str {
        "enex"
    }

    fn supports(&self, kind: FileKind) -> bool {
        kind == FileKind::Enex
    }

    async fn extract(&self, input: &ExtractInput) -> Result<Extracted, ExtractionError> {
        let bytes = input.bytes().await?;
        Ok(extract_enex(&String::from_utf8_lossy(&bytes)))
    }
}

#[derive(Debug)]
struct Note {
    title: String,
    created: String,
    updated: String,
    tags: Vec<String>,
    content: String,
}

impl Note {
    fn parse(xml: &str) -> Self {
        let field = |re: &Regex| {
            re.captures(xml)
                .and_then(|c| c.get(1))
                .map(|m| decode_entities(m.as_str().trim()))
                .unwrap_or_default()
        };

        let title = field(&RE_TITLE);
        Self {
            title: if title.is_empty() {
                "Untitled".to_string()
            } else {
                title
            },
            created: iso_date(&field(&RE_CREATED)),
            updated: iso_date(&field(&RE_UPDATED)),
            tags: RE_TAG
                .captures_iter(xml)
                .filter_map(|c| c.get(1))
                .map(|m| decode_entities(m.as_str().trim()))
                .filter(|t| !t.is_empty())
                .collect(),
            content: RE_CONTENT
                .captures(xml)
                .and_then(|c| c.get(1))
                .map(|m| clean_enml(m.as_str()))
                .unwrap_or_default(),
        }
    }

    fn render(&self) -> String {
        let mut out = format!(
            "# {}\n\n**Created:** {}\n**Updated:** {}\n",
            self.title, self.created, self.updated
        );
        if !self.tags.is_empty() {
            out.push_str(&format!("**Tags:** {}\n", self.tags.join(", ")));
        }
        out.push_str("\n---\n\n");
        out.push_str(&self.content);
        out
    }
}

/// `20240115T093000Z` becomes `2024-01-15T09:30:00`; anything else is kept.
fn iso_date(raw: &str) -> String {
    NaiveDateTime::parse_from_str(raw, ENEX_DATE_FORMAT)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_else(|_| raw.to_string())
}

fn clean_enml(enml: &str) -> String {
    let text = RE_CDATA.replace_all(enml, "");
    let text = RE_LINK.replace_all(&text, "[$2]($1)");
    let text = RE_PARAGRAPH_END.replace_all(&text, "\n\n");
    let text = strip_markup(&text);
    RE_BLANK_LINES.replace_all(&text, "\n\n").trim().to_string()
}

fn extract_enex(xml: &str) -> Extracted {
    let notes: Vec<Note> = RE_NOTE
        .captures_iter(xml)
        .filter_map(|c| c.get(1))
        .map(|m| Note::parse(m.as_str()))
        .collect();

    let separator = format!("\n\n{}\n\n", "=".repeat(NOTE_SEPARATOR_WIDTH));
    let mut extracted = Extracted::text(
        notes
            .iter()
            .map(Note::render)
            .collect::<Vec<_>>()
            .join(&separator),
    );

    if let Some(first) = notes.first() {
        let metadata = &mut extracted.metadata;
        metadata.insert("title".to_string(), Value::String(first.title.clone()));
        metadata.insert(
            "created_date".to_string(),
            Value::String(first.created.clone()),
        );
        metadata.insert(
            "tags".to_string(),
            Value::Array(first.tags.iter().cloned().map(Value::String).collect()),
        );
    }
    extracted
        .metadata
        .insert("num_notes".to_string(), Value::from(notes.len()));
    extracted
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<en-export>
<note><title>Groceries &amp; errands</title>
<content><![CDATA[<?xml version="1.0"?><en-note><div>Milk</div><div>Eggs<br/>Bread</div><p>See <a href="https://example.com/list">the list</a></p></en-note>]]></content>
<created>20240115T093000Z</created><updated>20240116T101500Z</updated>
<tag>home</tag><tag>weekly</tag></note>
<note><content><![CDATA[<en-note><p>Second</p></en-note>]]></content><created>not-a-date</created></note>
</en-export>"#;

    #[test]
    fn test_notes_are_rendered_and_joined() {
        let extracted = extract_enex(EXPORT);
        let sections: Vec<&str> = extracted
            .content
            .split(&format!("\n\n{}\n\n", "=".repeat(80)))
            .collect();
        assert_eq!(sections.len(), 2);

        assert_eq!(
            sections[0],
            "# Groceries & errands\n\n**Created:** 2024-01-15T09:30:00\n\
             **Updated:** 2024-01-16T10:15:00\n**Tags:** home, weekly\n\n---\n\n\
             Milk\nEggs\nBread\nSee [the list](https://example.com/list)"
        );
        assert!(sections[1].starts_with("# Untitled\n\n**Created:** not-a-date\n**Updated:** \n\n---"));
        assert!(sections[1].ends_with("Second"));
    }

    #[test]
    fn test_metadata_from_first_note() {
        let extracted = extract_enex(EXPORT);
        assert_eq!(extracted.metadata["title"], "Groceries & errands");
        assert_eq!(extracted.metadata["created_date"], "2024-01-15T09:30:00");
        assert_eq!(extracted.metadata["tags"], serde_json::json!(["home", "weekly"]));
        assert_eq!(extracted.metadata["num_notes"], 2);
    }

    #[test]
    fn test_empty_export() {
        let extracted = extract_enex("<en-export></en-export>");
        assert!(extracted.content.is_empty());
        assert_eq!(extracted.metadata["num_notes"], 0);
        assert!(!extracted.metadata.contains_key("title"));
    }

    #[test]
    fn test_clean_enml_collapses_blank_lines() {
        assert_eq!(clean_enml("<p>a</p><p></p><p></p><p>b</p>"), "a\n\nb");
    }
}
