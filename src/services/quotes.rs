//! Keyword quotes and highlighting over search results.
//!
//! Presentation helpers only: sentences are scored by how many distinct
//! query words they contain, nothing smarter.

use std::collections::BTreeSet;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

/// Quotes attached to one result.
const MAX_QUOTES: usize = 3;

pub const DEFAULT_CONTEXT_CHARS: usize = 200;

/// A sentence matching the query, with the text around it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub quote: String,
    pub context_before: String,
    pub context_after: String,
    pub full_context: String,
    /// Number of distinct query words found in the sentence.
    pub relevance: usize,
}

fn words(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Split after `.`, `!` or `?` followed by whitespace. Returns byte spans.
fn sentence_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let end = i + c.len_utf8();
        let mut next = end;
        while let Some(&(j, ws)) = chars.peek() {
            if !ws.is_whitespace() {
                break;
            }
            next = j + ws.len_utf8();
            chars.next();
        }
        if next > end {
            spans.push((start, end));
            start = next;
        }
    }
    if start < text.len() {
        spans.push((start, text.len()));
    }
    spans
}

/// Move `idx` back to the nearest char boundary.
fn floor_boundary(text: &str, mut idx: usize) -> usize {
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(text: &str, mut idx: usize) -> usize {
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Top sentences of `text` by keyword overlap with `query`, each with up to
/// `context_chars` bytes of surrounding text. Ties keep text order.
pub fn extract_quotes(query: &str, text: &str, context_chars: usize) -> Vec<Quote> {
    let query_words = words(query);
    if query_words.is_empty() {
        return Vec::new();
    }

    let mut candidates: Vec<(usize, usize, usize)> = sentence_spans(text)
        .into_iter()
        .filter_map(|(start, end)| {
            let overlap = words(&text[start..end])
                .intersection(&query_words)
                .count();
            (overlap > 0).then_some((overlap, start, end))
        })
        .collect();
    candidates.sort_by(|a, b| b.0.cmp(&a.0));

    candidates
        .into_iter()
        .take(MAX_QUOTES)
        .map(|(relevance, start, end)| {
            let before = floor_boundary(text, start.saturating_sub(context_chars));
            let after = ceil_boundary(text, (end + context_chars).min(text.len()));
            Quote {
                quote: text[start..end].to_string(),
                context_before: text[before..start].to_string(),
                context_after: text[end..after].to_string(),
                full_context: text[before..after].to_string(),
                relevance,
            }
        })
        .collect()
}

/// Wrap every query word longer than two characters in `**…**`,
/// case-insensitively and on word boundaries.
pub fn highlight(text: &str, query: &str) -> String {
    let mut terms: Vec<String> = words(query)
        .into_iter()
        .filter(|w| w.chars().count() > 2)
        .map(|w| regex::escape(&w))
        .collect();
    if terms.is_empty() {
        return text.to_string();
    }
    terms.sort_by_key(|t| std::cmp::Reverse(t.len()));

    let pattern = format!(r"\b({})\b", terms.join("|"));
    match RegexBuilder::new(&pattern).case_insensitive(true).build() {
        Ok(re) => re.replace_all(text, "**$1**").into_owned(),
        Err(_) => text.to_string(),
    }
}

/// Join chunk texts in `chunk_index` order.
pub fn reconstruct_document<I>(chunks: I) -> String
where
    I: IntoIterator<Item = (u32, String)>,
{
    let mut chunks: Vec<(u32, String)> = chunks.into_iter().collect();
    chunks.sort_by_key(|(index, _)| *index);
    chunks
        .into_iter()
        .map(|(_, text)| text)
        .collect::<Vec<_>>()
        .join("\n\n")
}
