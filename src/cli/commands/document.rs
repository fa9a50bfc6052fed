use anyhow::{Context, Result};
use clap::Args;

use super::search_service;
use crate::cli::output::get_formatter;
use crate::models::{Config, OutputFormat};

#[derive(Debug, Args)]
pub struct DocumentArgs {
    /// Source file as it was ingested
    #[arg(required = true)]
    pub source: String,
}

pub async fn handle_document(args: DocumentArgs, format: OutputFormat, _verbose: bool) -> Result<()> {
    let config = Config::load()?;
    let formatter = get_formatter(format);
    let service = search_service(&config)?;

    // Ingested keys are absolute; accept relative paths that still exist.
    let mut candidates = vec![args.source.clone()];
    if let Ok(path) = std::path::Path::new(&args.source).canonicalize() {
        candidates.push(path.to_string_lossy().to_string());
    }

    for source in &candidates {
        let view = service
            .document(source)
            .await
            .context("failed to read document chunks")?;
        if let Some(view) = view {
            print!("{}", formatter.format_document(&view));
            return Ok(());
        }
    }

    anyhow::bail!("no stored chunks for {}", args.source)
}
