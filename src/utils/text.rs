//! Text processing utilities shared by the extractors and the chunker.

use regex::Regex;
use std::sync::LazyLock;

/// Check if content has any non-whitespace text.
pub fn has_meaningful_content(content: &str) -> bool {
    content.chars().any(|c| !c.is_whitespace())
}

/// Rough token count: characters divided by the configured ratio.
pub fn estimate_tokens(text: &str, chars_per_token: usize) -> usize {
    text.chars().count() / chars_per_token.max(1)
}

/// Length of `text` in characters once surrounding whitespace is trimmed.
pub fn trimmed_len(text: &str) -> usize {
    text.trim().chars().count()
}

static RE_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static RE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<\s*(br|/p|/div|/li|/tr|/h[1-6]|/en-todo)\s*/?>").unwrap()
});

/// Strip markup tags, turning block-level closers into line breaks.
pub fn strip_markup(markup: &str) -> String {
    let with_breaks = RE_BLOCK.replace_all(markup, "\n");
    let stripped = RE_TAG.replace_all(&with_breaks, "");
    decode_entities(&stripped)
}

/// Decode the handful of XML/HTML entities that appear in exported notes
/// and Office documents.
pub fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Collapse runs of blank lines and trailing spaces.
pub fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}
