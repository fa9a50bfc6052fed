use anyhow::{Context, Result};
use clap::Args;

use super::search_service;
use crate::cli::output::get_formatter;
use crate::models::{Config, OutputFormat, SearchQuery};

#[derive(Debug, Args)]
pub struct SearchArgs {
    #[arg(required = true, help = "Search query text")]
    pub query: String,

    #[arg(long, short = 'n', help = "Maximum number of results to return")]
    pub limit: Option<u32>,

    #[arg(long, short = 's', help = "Only match chunks of this source file")]
    pub source: Option<String>,

    #[arg(long, help = "Minimum similarity score threshold (0.0-1.0)")]
    pub min_score: Option<f32>,

    #[arg(long, short = 'q', help = "Show the best matching sentences of each result")]
    pub quotes: bool,
}

pub async fn handle_search(args: SearchArgs, format: OutputFormat, verbose: bool) -> Result<()> {
    let query = args.query.trim();
    if query.is_empty() {
        anyhow::bail!("search query cannot be empty");
    }

    let config = Config::load()?;
    let formatter = get_formatter(format);

    let limit = args.limit.unwrap_or(config.search.default_limit);
    if limit == 0 {
        anyhow::bail!("limit must be at least 1");
    }

    let min_score = args.min_score.or(config.search.default_min_score);
    if let Some(score) = min_score
        && !(0.0..=1.0).contains(&score)
    {
        anyhow::bail!("min_score must be between 0.0 and 1.0");
    }

    if verbose {
        eprintln!("Query: \"{query}\"");
        eprintln!("  Limit: {limit}");
        if let Some(ref source) = args.source {
            eprintln!("  Source: {source}");
        }
        if let Some(score) = min_score {
            eprintln!("  Min score: {score:.3}");
        }
    }

    let mut request = SearchQuery::new(query)
        .with_limit(limit)
        .with_quotes(args.quotes);
    if let Some(source) = args.source {
        request = request.with_source_file(source);
    }
    if let Some(score) = min_score {
        request = request.with_min_score(score);
    }

    let service = search_service(&config)?;
    let results = service.search(&request).await.context("search failed")?;

    if verbose {
        eprintln!("Timing: {}ms\n", results.duration_ms);
    }

    print!("{}", formatter.format_search_results(&results));
    Ok(())
}
