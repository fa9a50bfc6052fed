use std::fmt::Write as FmtWrite;

use serde::Serialize;

use crate::models::{OutputFormat, SearchResults};
use crate::pipeline::{PipelineStatistics, StageStats};
use crate::services::DocumentView;
use crate::services::quotes::highlight;

pub trait Formatter {
    fn format_search_results(&self, results: &SearchResults) -> String;
    fn format_document(&self, document: &DocumentView) -> String;
    fn format_status(&self, status: &StatusInfo) -> String;
    fn format_run_report(&self, stats: &PipelineStatistics) -> String;
    fn format_message(&self, message: &str) -> String;
    fn format_error(&self, error: &str) -> String;
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusInfo {
    pub embedding_url: String,
    pub embedding_model: String,
    pub embedding_connected: bool,
    pub vector_store_backend: String,
    pub vector_store_url: String,
    pub vector_store_connected: bool,
    pub collection: String,
    pub stored_chunks: u64,
    pub stored_sources: u64,
    pub state_dir: String,
    pub known_hashes: usize,
    pub checkpoint: Option<CheckpointInfo>,
}

/// Summary of an unfinished run that `run` would resume.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointInfo {
    pub timestamp: String,
    pub completed_documents: usize,
    pub current_batch: usize,
    pub total_batches: usize,
}

pub struct TextFormatter;

impl TextFormatter {
    fn stage_row(output: &mut String, name: &str, stats: &StageStats) {
        writeln!(
            output,
            "  {:<12} {:>9} {:>9} {:>9}",
            name, stats.processed, stats.failed, stats.skipped
        )
        .unwrap();
    }
}

impl Formatter for TextFormatter {
    fn format_search_results(&self, results: &SearchResults) -> String {
        if results.is_empty() {
            return format!("No results found for: {}\n", results.query);
        }

        let mut output = String::new();
        writeln!(output, "Search results for: \"{}\"", results.query).unwrap();
        writeln!(
            output,
            "Found {} results in {}ms\n",
            results.len(),
            results.duration_ms
        )
        .unwrap();

        for (i, result) in results.results.iter().enumerate() {
            writeln!(output, "{}. [Score: {:.3}]", i + 1, result.score).unwrap();
            if let Some(ref source) = result.source_file {
                match result.chunk_index {
                    Some(idx) => writeln!(output, "   Source: {} (chunk {})", source, idx).unwrap(),
                    None => writeln!(output, "   Source: {}", source).unwrap(),
                }
            }
            writeln!(output, "   ---").unwrap();

            if result.quotes.is_empty() {
                let preview: String = result.text.chars().take(200).collect();
                let preview = if result.text.chars().count() > 200 {
                    format!("{}...", preview)
                } else {
                    preview
                };
                for line in preview.lines() {
                    writeln!(output, "   {}", line).unwrap();
                }
            } else {
                for quote in &result.quotes {
                    writeln!(output, "   > {}", highlight(&quote.quote, &results.query)).unwrap();
                }
            }
            writeln!(output).unwrap();
        }

        output
    }

    fn format_document(&self, document: &DocumentView) -> String {
        let mut output = String::new();
        writeln!(output, "# {}", document.source_file).unwrap();
        writeln!(output, "({} chunks)\n", document.chunks).unwrap();
        writeln!(output, "{}", document.content).unwrap();
        output
    }

    fn format_status(&self, status: &StatusInfo) -> String {
        let mut output = String::new();
        writeln!(output, "Status").unwrap();
        writeln!(output, "------").unwrap();

        let embedding_status = if status.embedding_connected {
            "[CONNECTED]"
        } else {
            "[DISCONNECTED]"
        };
        writeln!(output, "Embedding:     {}", embedding_status).unwrap();
        writeln!(output, "  URL:         {}", status.embedding_url).unwrap();
        writeln!(output, "  Model:       {}", status.embedding_model).unwrap();
        writeln!(output).unwrap();

        let vector_status = if status.vector_store_connected {
            "[CONNECTED]"
        } else {
            "[DISCONNECTED]"
        };
        writeln!(
            output,
            "Vector Store:  {} ({})",
            status.vector_store_backend, vector_status
        )
        .unwrap();
        writeln!(output, "  URL:         {}", status.vector_store_url).unwrap();
        writeln!(output, "  Collection:  {}", status.collection).unwrap();
        if status.vector_store_connected {
            writeln!(output, "  Chunks:      {}", status.stored_chunks).unwrap();
            writeln!(output, "  Documents:   {}", status.stored_sources).unwrap();
        }
        writeln!(output).unwrap();

        writeln!(output, "State:         {}", status.state_dir).unwrap();
        writeln!(output, "  Known files: {}", status.known_hashes).unwrap();
        match status.checkpoint {
            Some(ref cp) => {
                writeln!(
                    output,
                    "  Checkpoint:  batch {}/{}, {} documents completed ({})",
                    cp.current_batch, cp.total_batches, cp.completed_documents, cp.timestamp
                )
                .unwrap();
            }
            None => writeln!(output, "  Checkpoint:  none").unwrap(),
        }

        output
    }

    fn format_run_report(&self, stats: &PipelineStatistics) -> String {
        let mut output = String::new();
        if stats.interrupted {
            writeln!(output, "Run Interrupted").unwrap();
            writeln!(output, "---------------").unwrap();
        } else {
            writeln!(output, "Run Complete").unwrap();
            writeln!(output, "------------").unwrap();
        }

        writeln!(
            output,
            "  {:<12} {:>9} {:>9} {:>9}",
            "Stage", "Processed", "Failed", "Skipped"
        )
        .unwrap();
        Self::stage_row(&mut output, "discovery", &stats.discovery);
        Self::stage_row(&mut output, "extraction", &stats.extraction);
        Self::stage_row(&mut output, "ocr", &stats.ocr);
        Self::stage_row(&mut output, "embedding", &stats.embedding);
        Self::stage_row(&mut output, "storage", &stats.storage);
        writeln!(output).unwrap();

        writeln!(output, "Documents completed: {}", stats.documents_completed).unwrap();
        writeln!(output, "Documents failed:    {}", stats.documents_failed).unwrap();
        if stats.resumed_skipped > 0 {
            writeln!(output, "Resumed (skipped):   {}", stats.resumed_skipped).unwrap();
        }
        writeln!(output, "Chunks stored:       {}", stats.chunks_stored).unwrap();
        writeln!(
            output,
            "Batches:             {}/{}",
            stats.batches_completed, stats.total_batches
        )
        .unwrap();
        writeln!(
            output,
            "Cache:               {} hits, {} misses ({:.1}% hit rate), {} entries, {} evictions",
            stats.cache.hits,
            stats.cache.misses,
            stats.cache_hit_rate * 100.0,
            stats.cache.entries,
            stats.cache.evictions
        )
        .unwrap();
        writeln!(
            output,
            "Store totals:        {} chunks from {} documents",
            stats.store_totals.chunks, stats.store_totals.sources
        )
        .unwrap();
        writeln!(output, "Memory releases:     {}", stats.memory_releases).unwrap();
        writeln!(output, "Duration:            {}ms", stats.duration_ms).unwrap();
        if stats.interrupted {
            writeln!(output, "\nRun `docstream run` again to resume.").unwrap();
        }
        output
    }

    fn format_message(&self, message: &str) -> String {
        format!("{}\n", message)
    }

    fn format_error(&self, error: &str) -> String {
        format!("Error: {}\n", error)
    }
}

pub struct JsonFormatter {
    pub pretty: bool,
}

impl JsonFormatter {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    fn render<T: Serialize>(&self, value: &T) -> String {
        let rendered = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };
        rendered.unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
    }
}

impl Formatter for JsonFormatter {
    fn format_search_results(&self, results: &SearchResults) -> String {
        self.render(results)
    }

    fn format_document(&self, document: &DocumentView) -> String {
        self.render(document)
    }

    fn format_status(&self, status: &StatusInfo) -> String {
        let json = serde_json::json!({
            "embedding": {
                "url": status.embedding_url,
                "model": status.embedding_model,
                "connected": status.embedding_connected,
            },
            "vector_store": {
                "backend": status.vector_store_backend,
                "url": status.vector_store_url,
                "connected": status.vector_store_connected,
                "collection": status.collection,
                "chunks": status.stored_chunks,
                "documents": status.stored_sources,
            },
            "state": {
                "dir": status.state_dir,
                "known_hashes": status.known_hashes,
                "checkpoint": status.checkpoint,
            }
        });
        self.render(&json)
    }

    fn format_run_report(&self, stats: &PipelineStatistics) -> String {
        self.render(stats)
    }

    fn format_message(&self, message: &str) -> String {
        serde_json::json!({"message": message}).to_string()
    }

    fn format_error(&self, error: &str) -> String {
        serde_json::json!({"error": error}).to_string()
    }
}

pub fn get_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Text => Box::new(TextFormatter),
        OutputFormat::Json => Box::new(JsonFormatter::new(true)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SearchResult;
    use crate::services::quotes::extract_quotes;

    fn results() -> SearchResults {
        let text = "Quarterly budget approved. Lunch was fine.";
        SearchResults::new(
            "budget".to_string(),
            vec![SearchResult {
                id: "1".to_string(),
                score: 0.912,
                distance: 0.088,
                text: text.to_string(),
                source_file: Some("/docs/report.pdf".to_string()),
                chunk_index: Some(3),
                metadata: Default::default(),
                quotes: extract_quotes("budget", text, 50),
            }],
            12,
        )
    }

    #[test]
    fn test_text_search_results() {
        let out = TextFormatter.format_search_results(&results());
        assert!(out.contains("1. [Score: 0.912]"));
        assert!(out.contains("Source: /docs/report.pdf (chunk 3)"));
        assert!(out.contains("> Quarterly **budget** approved."));
    }

    #[test]
    fn test_json_search_results() {
        let out = JsonFormatter::new(false).format_search_results(&results());
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["query"], "budget");
        assert_eq!(value["results"][0]["chunk_index"], 3);
    }

    #[test]
    fn test_run_report() {
        let stats = PipelineStatistics {
            documents_completed: 4,
            interrupted: true,
            ..Default::default()
        };
        let out = TextFormatter.format_run_report(&stats);
        assert!(out.starts_with("Run Interrupted"));
        assert!(out.contains("Documents completed: 4"));

        let json: serde_json::Value =
            serde_json::from_str(&JsonFormatter::new(true).format_run_report(&stats)).unwrap();
        assert_eq!(json["interrupted"], true);
        assert_eq!(json["documents_completed"], 4);
    }

    #[test]
    fn test_empty_results() {
        let empty = SearchResults::new("nothing".to_string(), Vec::new(), 1);
        assert_eq!(
            TextFormatter.format_search_results(&empty),
            "No results found for: nothing\n"
        );
    }
}
