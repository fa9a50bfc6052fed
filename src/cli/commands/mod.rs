mod config;
mod document;
mod reset;
mod run;
mod search;
mod status;

pub use config::ConfigCommand;
pub use document::DocumentArgs;
pub use reset::ResetArgs;
pub use run::RunArgs;
pub use search::SearchArgs;

pub use config::handle_config;
pub use document::handle_document;
pub use reset::handle_reset;
pub use run::handle_run;
pub use search::handle_search;
pub use status::handle_status;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::models::Config;
use crate::services::{
    CachedEmbedder, EmbeddingCache, HttpEmbeddingClient, SearchService, VectorStore,
    create_backend,
};

/// Ask a yes/no question on stdin. Anything but `y` declines.
fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt} [y/N] ");
    std::io::stderr().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

fn open_store(config: &Config) -> Result<Arc<dyn VectorStore>> {
    create_backend(&config.vector_store, u64::from(config.embedding.dimension))
        .context("failed to create vector store backend")
}

fn search_service(config: &Config) -> Result<SearchService> {
    let provider = HttpEmbeddingClient::new(&config.embedding)
        .context("failed to create embedding client")?;
    let embedder = CachedEmbedder::new(
        Arc::new(provider),
        Arc::new(EmbeddingCache::new(config.embedding.cache_size)),
        &config.embedding,
    );
    Ok(SearchService::new(Arc::new(embedder), open_store(config)?))
}
