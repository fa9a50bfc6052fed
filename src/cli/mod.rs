//! Command-line interface for the ingestion pipeline.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};

use crate::models::OutputFormat;

/// Streaming document ingestion: extract, chunk, embed and store, with
/// checkpointed recovery.
#[derive(Debug, Parser)]
#[command(name = "docstream")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[arg(long, short = 'f', global = true, help = "Output format: text or json")]
    pub format: Option<OutputFormat>,

    #[arg(long, short = 'v', global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the pipeline over a file or directory
    Run(commands::RunArgs),

    /// Search stored chunks
    Search(commands::SearchArgs),

    /// Print a stored document reassembled from its chunks
    Document(commands::DocumentArgs),

    /// Check embedding server, vector store and pipeline state
    Status,

    /// Empty the vector store and forget processed files
    Reset(commands::ResetArgs),

    /// Manage configuration
    #[command(subcommand)]
    Config(commands::ConfigCommand),
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from([
            "docstream",
            "run",
            "./docs",
            "--sequential",
            "--restart",
            "--store",
            "memory",
            "-f",
            "json",
        ]);
        assert_eq!(cli.format, Some(OutputFormat::Json));
        match cli.command {
            Commands::Run(args) => {
                assert!(args.sequential);
                assert!(args.restart);
                assert!(!args.reset_store);
                assert_eq!(args.store, Some(crate::models::StoreBackend::Memory));
                assert_eq!(args.path.as_deref(), Some(std::path::Path::new("./docs")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
