use anyhow::{Context, Result};
use clap::Subcommand;

use crate::cli::output::{Formatter, get_formatter};
use crate::models::{Config, OutputFormat};

const MASK: &str = "********";

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    #[command(about = "Write a config file with default values")]
    Init {
        #[arg(long, help = "Force overwrite existing config")]
        force: bool,
    },
    #[command(about = "Show current configuration")]
    Show {
        #[arg(long, help = "Print secrets instead of masking them")]
        reveal: bool,
    },
    #[command(about = "Show configuration and state paths")]
    Path,
}

pub async fn handle_config(cmd: ConfigCommand, format: OutputFormat, _verbose: bool) -> Result<()> {
    let formatter = get_formatter(format);

    match cmd {
        ConfigCommand::Init { force } => handle_init(force, formatter.as_ref()),
        ConfigCommand::Show { reveal } => handle_show(reveal, format),
        ConfigCommand::Path => handle_path(),
    }
}

fn handle_init(force: bool, formatter: &dyn Formatter) -> Result<()> {
    let config_path = Config::config_path()
        .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config already exists at: {}\nUse --force to overwrite.",
            config_path.display()
        );
    }

    Config::default()
        .save_to(&config_path)
        .context("failed to write config")?;
    println!(
        "{}",
        formatter.format_message(&format!("Created config at: {}", config_path.display()))
    );
    Ok(())
}

fn handle_show(reveal: bool, format: OutputFormat) -> Result<()> {
    let mut config = Config::load()?;
    if !reveal {
        mask_secrets(&mut config);
    }

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    if let Some(path) = Config::config_path()
        && path.exists()
    {
        println!("# Config: {}", path.display());
    } else {
        println!("# Config: defaults (no file)");
    }
    println!();
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn mask_secrets(config: &mut Config) {
    for key in [
        config.embedding.api_key.as_mut(),
        config.vector_store.api_key.as_mut(),
        config.ocr.vision.api_key.as_mut(),
    ]
    .into_iter()
    .flatten()
    {
        // Unresolved placeholders name the variable, not the secret.
        if !key.is_empty() && !key.starts_with("${") {
            *key = MASK.to_string();
        }
    }
}

fn handle_path() -> Result<()> {
    let config = Config::load()?;

    println!("Configuration paths:");
    println!();

    match Config::config_path() {
        Some(path) if path.exists() => println!("Config file (active): {}", path.display()),
        Some(path) => println!("Config file (would be): {}", path.display()),
        None => println!("Config file: unavailable (no config directory)"),
    }

    if let Ok(cwd) = std::env::current_dir() {
        let env_path = cwd.join(".env");
        if env_path.exists() {
            println!(".env file (active): {}", env_path.display());
        } else {
            println!(".env file (would be): {}", env_path.display());
        }
    }

    println!();
    println!("State directory: {}", config.state_dir().display());
    println!("  Checkpoint:    {}", config.checkpoint_path().display());
    println!("  Cache:         {}", config.cache_path().display());
    println!("  Hashes:        {}", config.hashes_path().display());

    Ok(())
}
