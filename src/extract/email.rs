//! RFC 822 (`.eml`) messages: headers plus the first plain-text body.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;

use super::{ExtractInput, Extracted, Extractor};
use crate::error::ExtractionError;
use crate::models::FileKind;
use crate::utils::text::{normalize_whitespace, strip_markup};

const SUMMARY_HEADERS: [&str; 4] = ["from", "to", "subject", "date"];

pub struct EmailExtractor;

#[async_trait]
impl Extractor for EmailExtractor {
    fn name(&self) -> &str {
        "email"
    }

    fn supports(&self, kind: FileKind) -> bool {
        kind == FileKind::Email
    }

    async fn extract(&self, input: &ExtractInput) -> Result<Extracted, ExtractionError> {
        let bytes = input.bytes().await?;
        Ok(extract_email(&String::from_utf8_lossy(&bytes)))
    }
}

struct Message<'a> {
    headers: Vec<(String, String)>,
    body: &'a str,
}

impl<'a> Message<'a> {
    fn parse(raw: &'a str) -> Self {
        let (head, body) = split_head(raw);

        let mut headers: Vec<(String, String)> = Vec::new();
        for line in head.lines() {
            if line.starts_with([' ', '\t']) {
                if let Some((_, value)) = headers.last_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_lowercase(), value.trim().to_string()));
            }
        }

        Self { headers, body }
    }

    fn header(&self, name: &str) -> &str {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    fn content_type(&self) -> String {
        self.header("content-type").to_lowercase()
    }

    /// The first `text/plain` part, else the first `text/html` part with
    /// markup stripped.
    fn text_body(&self) -> Option<String> {
        let content_type = self.content_type();

        if content_type.starts_with("multipart/") {
            let boundary = parameter(self.header("content-type"), "boundary")?;
            let delimiter = format!("--{boundary}");
            let parts: Vec<Message<'_>> = self
                .body
                .split(delimiter.as_str())
                .skip(1)
                .filter(|part| !part.starts_with("--"))
                .map(|part| Message::parse(part.trim_start_matches(['\r', '\n'])))
                .collect();

            return parts
                .iter()
                .find_map(|p| {
                    let ct = p.content_type();
                    (ct.is_empty() || ct.starts_with("text/plain") || ct.starts_with("multipart/"))
                        .then(|| p.text_body())
                        .flatten()
                })
                .or_else(|| {
                    parts
                        .iter()
                        .find(|p| p.content_type().starts_with("text/html"))
                        .map(|p| html_text(&p.decoded_body()))
                });
        }

        if content_type.starts_with("text/html") {
            return Some(html_text(&self.decoded_body()));
        }
        if content_type.is_empty() || content_type.starts_with("text/") {
            return Some(self.decoded_body());
        }
        None
    }

    fn decoded_body(&self) -> String {
        match self
            .header("content-transfer-encoding")
            .to_lowercase()
            .as_str()
        {
            "base64" => {
                let compact: String = self.body.chars().filter(|c| !c.is_whitespace()).collect();
                match STANDARD.decode(compact) {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Err(_) => self.body.to_string(),
                }
            }
            "quoted-printable" => decode_quoted_printable(self.body),
            _ => self.body.to_string(),
        }
        .trim()
        .to_string()
    }
}

fn html_text(html: &str) -> String {
    normalize_whitespace(&strip_markup(html))
}

fn split_head(raw: &str) -> (&str, &str) {
    ["\r\n\r\n", "\n\n"]
        .iter()
        .filter_map(|sep| raw.find(sep).map(|idx| (idx, sep.len())))
        .min_by_key(|(idx, _)| *idx)
        .map(|(idx, len)| (&raw[..idx], &raw[idx + len..]))
        .unwrap_or((raw, ""))
}

/// Value of `name=...` in a header such as `multipart/mixed; boundary="x"`.
fn parameter(header: &str, name: &str) -> Option<String> {
    header.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

fn decode_quoted_printable(body: &str) -> String {
    let bytes = body.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'=' {
            // Soft line break
            if bytes[i + 1..].starts_with(b"\r\n") {
                i += 3;
                continue;
            }
            if bytes[i + 1..].starts_with(b"\n") {
                i += 2;
                continue;
            }
            if i + 3 <= bytes.len() {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn extract_email(raw: &str) -> Extracted {
    let message = Message::parse(raw);
    let body = message.text_body().unwrap_or_default();

    let mut extracted = Extracted::text(format!(
        "From: {}\nTo: {}\nSubject: {}\nDate: {}\n\n---\n\n{}",
        message.header("from"),
        message.header("to"),
        message.header("subject"),
        message.header("date"),
        body
    ));
    for name in SUMMARY_HEADERS {
        extracted
            .metadata
            .insert(name.to_string(), Value::String(message.header(name).to_string()));
    }
    extracted
}
