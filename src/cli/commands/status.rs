use anyhow::Result;

use super::open_store;
use crate::cli::output::{CheckpointInfo, StatusInfo, get_formatter};
use crate::models::{Config, OutputFormat, StoreBackend};
use crate::pipeline::CheckpointStore;
use crate::services::{HttpEmbeddingClient, StoreTotals};
use crate::sources::DuplicateRegistry;

pub async fn handle_status(format: OutputFormat, _verbose: bool) -> Result<()> {
    let config = Config::load()?;
    let formatter = get_formatter(format);

    let embedding_connected = match HttpEmbeddingClient::new(&config.embedding) {
        Ok(client) => client.health_check().await.is_ok(),
        Err(_) => false,
    };

    let (vector_store_connected, totals) = match open_store(&config) {
        Ok(store) => {
            let connected = store.health_check().await.unwrap_or(false);
            let totals = if connected {
                store.totals().await.unwrap_or_default()
            } else {
                StoreTotals::default()
            };
            (connected, totals)
        }
        Err(_) => (false, StoreTotals::default()),
    };

    let checkpoint = CheckpointStore::new(config.checkpoint_path())
        .load()
        .map(|cp| CheckpointInfo {
            timestamp: cp.timestamp.to_rfc3339(),
            completed_documents: cp.completed_keys.len(),
            current_batch: cp.current_batch,
            total_batches: cp.total_batches,
        });

    let status = StatusInfo {
        embedding_url: config.embedding.url.clone(),
        embedding_model: config.embedding.model.clone(),
        embedding_connected,
        vector_store_backend: config.vector_store.backend.to_string(),
        vector_store_url: config.vector_store.url.clone(),
        vector_store_connected,
        collection: config.vector_store.collection.clone(),
        stored_chunks: totals.chunks,
        stored_sources: totals.sources,
        state_dir: config.state_dir().display().to_string(),
        known_hashes: DuplicateRegistry::open(config.hashes_path()).len(),
        checkpoint,
    };

    print!("{}", formatter.format_status(&status));

    if !embedding_connected {
        eprintln!();
        eprintln!(
            "Warning: embedding server not reachable at {}",
            config.embedding.url
        );
    }
    if !vector_store_connected && config.vector_store.backend == StoreBackend::Qdrant {
        eprintln!();
        eprintln!("Warning: Qdrant not running. Start with: docker run -p 6334:6334 qdrant/qdrant");
    }

    Ok(())
}
