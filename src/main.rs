use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::{Level, warn};
use tracing_subscriber::FmtSubscriber;

use docstream::cli::commands::{
    handle_config, handle_document, handle_reset, handle_run, handle_search, handle_status,
};
use docstream::cli::{Cli, Commands};
use docstream::models::{Config, OutputFormat};
use docstream::pipeline::CancelToken;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load().unwrap_or_default();
    let format = cli.format.unwrap_or(config.search.default_format);

    let cancel = CancelToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Received shutdown signal, finishing the current batch...");
        watcher.cancel();

        shutdown_signal().await;
        eprintln!("\nSecond signal received, exiting without cleanup");
        std::process::exit(130);
    });

    run_command(cli.command, format, cli.verbose, cancel).await
}

async fn run_command(
    command: Commands,
    format: OutputFormat,
    verbose: bool,
    cancel: CancelToken,
) -> Result<()> {
    match command {
        Commands::Run(args) => {
            handle_run(args, format, verbose, cancel).await?;
        }
        Commands::Search(args) => {
            handle_search(args, format, verbose).await?;
        }
        Commands::Document(args) => {
            handle_document(args, format, verbose).await?;
        }
        Commands::Status => {
            handle_status(format, verbose).await?;
        }
        Commands::Reset(args) => {
            handle_reset(args, format, verbose).await?;
        }
        Commands::Config(cmd) => {
            handle_config(cmd, format, verbose).await?;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
