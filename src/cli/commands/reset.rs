use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{debug, warn};

use super::{confirm, open_store};
use crate::cli::output::get_formatter;
use crate::models::{Config, OutputFormat};

#[derive(Debug, Args)]
pub struct ResetArgs {
    /// Skip confirmation prompt
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Also delete the persisted embedding cache
    #[arg(long)]
    pub clear_cache: bool,
}

pub async fn handle_reset(args: ResetArgs, format: OutputFormat, verbose: bool) -> Result<()> {
    let config = Config::load()?;
    let formatter = get_formatter(format);

    if !args.yes
        && !confirm(&format!(
            "This will delete ALL chunks in collection '{}' and forget every processed file. Continue?",
            config.vector_store.collection
        ))?
    {
        println!("{}", formatter.format_message("Cancelled."));
        return Ok(());
    }

    let store = open_store(&config)?;
    store.reset().await.context("failed to reset vector store")?;

    let removed = clear_state(&config, !args.clear_cache);
    if verbose {
        for path in &removed {
            eprintln!("Removed {}", path.display());
        }
    }

    println!(
        "{}",
        formatter.format_message(&format!(
            "Collection '{}' reset; {} state file(s) removed.",
            config.vector_store.collection,
            removed.len()
        ))
    );
    Ok(())
}

/// Delete the checkpoint and duplicate-hash files, and the embedding cache
/// unless `keep_cache`. Returns the files that were actually removed.
pub(super) fn clear_state(config: &Config, keep_cache: bool) -> Vec<PathBuf> {
    let mut targets = vec![config.checkpoint_path(), config.hashes_path()];
    if !keep_cache {
        targets.push(config.cache_path());
    }

    targets
        .into_iter()
        .filter(|path| path.exists())
        .filter(|path| match std::fs::remove_file(path) {
            Ok(()) => {
                debug!("Removed {}", path.display());
                true
            }
            Err(e) => {
                warn!("Could not remove {}: {}", path.display(), e);
                false
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_clear_state_keeps_cache() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.directories.state = dir.path().to_path_buf();
        for path in [
            config.checkpoint_path(),
            config.hashes_path(),
            config.cache_path(),
        ] {
            std::fs::write(path, b"x").unwrap();
        }

        let removed = clear_state(&config, true);
        assert_eq!(removed.len(), 2);
        assert!(config.cache_path().exists());
        assert!(!config.checkpoint_path().exists());

        let removed = clear_state(&config, false);
        assert_eq!(removed, vec![config.cache_path()]);
    }
}
