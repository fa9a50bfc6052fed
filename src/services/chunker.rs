//! Text chunking with overlap for embedding.

use crate::models::{Chunk, ChunkingConfig, Metadata};
use crate::utils::text::trimmed_len;

/// Text chunker that splits extracted text into overlapping chunks.
#[derive(Debug, Clone)]
pub struct TextChunker {
    /// Target chunk size in characters (tokens * chars_per_token)
    chunk_size: usize,
    /// Overlap size in characters
    overlap: usize,
    /// Chunks whose trimmed text is shorter than this are dropped
    min_chunk_chars: usize,
    chars_per_token: usize,
}

impl TextChunker {
    /// Create a new text chunker with the given configuration.
    pub fn new(config: &ChunkingConfig) -> Self {
        let chars_per_token = config.chars_per_token.max(1) as usize;
        let chunk_size = (config.chunk_size as usize * chars_per_token).max(1);
        let overlap = (config.chunk_overlap as usize * chars_per_token).min(chunk_size - 1);
        Self {
            chunk_size,
            overlap,
            min_chunk_chars: config.min_chunk_size as usize,
            chars_per_token,
        }
    }

    /// Create a chunker with default settings.
    pub fn with_defaults() -> Self {
        Self::new(&ChunkingConfig::default())
    }

    /// Split `content` into chunks carrying a copy of `parent` metadata.
    ///
    /// Spans below the minimum length are dropped first; indices are then
    /// assigned contiguously from zero.
    pub fn chunk(&self, content: &str, parent: &Metadata) -> Vec<Chunk> {
        if content.is_empty() {
            return Vec::new();
        }

        self.split_with_overlap(content)
            .into_iter()
            .filter(|span| trimmed_len(span) >= self.min_chunk_chars)
            .enumerate()
            .map(|(idx, span)| {
                Chunk::new(
                    span.trim().to_string(),
                    idx as u32,
                    parent,
                    self.chars_per_token,
                )
            })
            .collect()
    }

    /// Split content into overlapping spans.
    fn split_with_overlap(&self, content: &str) -> Vec<String> {
        let chars: Vec<char> = content.chars().collect();
        let total_chars = chars.len();

        if total_chars <= self.chunk_size {
            return vec![content.to_string()];
        }

        let mut spans = Vec::new();
        let mut start = 0;

        while start < total_chars {
            let end = (start + self.chunk_size).min(total_chars);

            // Try to find a natural break point (newline, period, space)
            let adjusted_end = self.find_break_point(&chars, end, total_chars);

            spans.push(chars[start..adjusted_end].iter().collect());

            if adjusted_end >= total_chars {
                break;
            }

            // The next span starts `overlap` characters before this one ended.
            start = adjusted_end.saturating_sub(self.overlap).max(start + 1);
        }

        spans
    }

    /// Find a natural break point near the target end position.
    fn find_break_point(&self, chars: &[char], target_end: usize, total: usize) -> usize {
        if target_end >= total {
            return total;
        }

        // Look for a natural break point within the last 20% of the chunk
        let search_start = target_end.saturating_sub(self.chunk_size / 5);
        let search_range = &chars[search_start..target_end];

        // Priority: double newline > single newline > period+space > space
        let mut best_break = None;
        let mut last_newline = None;
        let mut last_sentence = None;
        let mut last_space = None;

        for (i, c) in search_range.iter().enumerate() {
            let pos = search_start + i;
            match c {
                '\n' => {
                    if i > 0 && search_range.get(i - 1) == Some(&'\n') {
                        best_break = Some(pos + 1);
                    }
                    last_newline = Some(pos + 1);
                }
                '.' | '!' | '?' => {
                    if search_range.get(i + 1).is_some_and(|c| c.is_whitespace()) {
                        last_sentence = Some(pos + 1);
                    }
                }
                ' ' | '\t' => {
                    last_space = Some(pos + 1);
                }
                _ => {}
            }
        }

        best_break
            .or(last_newline)
            .or(last_sentence)
            .or(last_space)
            .unwrap_or(target_end)
    }
}
