//! Run command: stream a directory through the ingestion pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use super::reset::clear_state;
use super::{confirm, open_store};
use crate::cli::output::get_formatter;
use crate::models::{Config, OutputFormat, StoreBackend};
use crate::pipeline::{CancelToken, Pipeline};
use crate::services::HttpEmbeddingClient;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// File or directory to ingest (defaults to `directories.input`)
    pub path: Option<PathBuf>,

    /// Process documents one at a time inside each stage
    #[arg(long)]
    pub sequential: bool,

    /// Ignore any checkpoint and start from scratch
    #[arg(long)]
    pub restart: bool,

    /// Empty the vector store and forget processed files before running
    #[arg(long)]
    pub reset_store: bool,

    /// Skip confirmation prompts
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Vector store backend override: qdrant or memory
    #[arg(long)]
    pub store: Option<StoreBackend>,
}

pub async fn handle_run(
    args: RunArgs,
    format: OutputFormat,
    verbose: bool,
    cancel: CancelToken,
) -> Result<()> {
    let mut config = Config::load()?;
    if args.sequential {
        config.pipeline.parallel = false;
    }
    if let Some(backend) = args.store {
        config.vector_store.backend = backend;
    }
    config.validate().context("invalid configuration")?;

    let formatter = get_formatter(format);
    let root = args
        .path
        .clone()
        .unwrap_or_else(|| config.directories.input.clone());
    let root = root
        .canonicalize()
        .with_context(|| format!("invalid input path: {}", root.display()))?;

    let store = open_store(&config)?;

    if args.reset_store {
        if !args.yes
            && !confirm(&format!(
                "This will delete ALL chunks in collection '{}'. Continue?",
                config.vector_store.collection
            ))?
        {
            println!("{}", formatter.format_message("Cancelled."));
            return Ok(());
        }
        store.reset().await.context("failed to reset vector store")?;
        clear_state(&config, true);
        info!("Vector store '{}' reset", config.vector_store.collection);
    }

    let provider =
        HttpEmbeddingClient::new(&config.embedding).context("failed to create embedding client")?;

    let progress = if format == OutputFormat::Text {
        let pb = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] batch {pos}/{len} {msg}",
        ) {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    } else {
        ProgressBar::hidden()
    };

    let pb = progress.clone();
    let mut pipeline = Pipeline::builder(&config)
        .provider(Arc::new(provider))
        .store(store)
        .cancel_token(cancel)
        .on_batch(move |p| {
            pb.set_length(p.total_batches as u64);
            pb.set_position(p.batch as u64);
            pb.set_message(format!("(last batch: {}/{} completed)", p.completed, p.documents));
        })
        .build()?;

    let resume = !args.restart;
    if resume && pipeline.checkpoints().exists() {
        progress.println(format!(
            "Resuming from checkpoint {}",
            pipeline.checkpoints().path().display()
        ));
    }
    if verbose {
        progress.println(format!(
            "Input: {} ({} mode, {} workers, batches of {})",
            root.display(),
            if config.pipeline.parallel {
                "parallel"
            } else {
                "sequential"
            },
            config.pipeline.max_workers,
            config.pipeline.stream_batch_size
        ));
    }

    let result = pipeline.run(&root, resume).await;
    progress.finish_and_clear();
    let stats = result?;

    print!("{}", formatter.format_run_report(&stats));
    if stats.failed_total() > 0 && format == OutputFormat::Text {
        eprintln!();
        eprintln!(
            "Warning: {} documents failed; rerun with -v for details",
            stats.failed_total()
        );
    }
    Ok(())
}
