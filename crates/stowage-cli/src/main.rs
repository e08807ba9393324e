#![deny(unsafe_code)]

//! Stowage CLI: save, load and flush values from the shell.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use stowage_config::AppConfig;
use stowage_core::{ConnectionState, Persistence};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Stowage: key/value persistence on local disk or a remote backend.
#[derive(Parser)]
#[command(name = "stowage", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "stowage.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a value and flush it.
    Save {
        group: String,
        key: String,
        /// JSON value; anything that is not valid JSON is stored as a string.
        value: String,
        /// Store VALUE verbatim, without encoding.
        #[arg(long)]
        raw: bool,
    },

    /// Print a stored value.
    Load {
        group: String,
        key: String,
        /// Print the stored payload verbatim.
        #[arg(long)]
        raw: bool,
    },

    /// Persist everything saved so far.
    Flush,

    /// Show the selected storage mode and connection state.
    Status,

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, found) = load_config(&cli.config).await?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(log_filter(cli.verbose, &config))),
        )
        .init();
    if !found {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Save {
            group,
            key,
            value,
            raw,
        } => cmd_save(&config, &group, &key, value, raw).await?,
        Commands::Load { group, key, raw } => cmd_load(&config, &group, &key, raw).await?,
        Commands::Flush => cmd_flush(&config).await?,
        Commands::Status => cmd_status(&config).await?,
        Commands::Config { show } => cmd_config(&cli.config, &config, show)?,
    }

    Ok(())
}

/// `-v` wins over the configured level.
fn log_filter(verbose: u8, config: &AppConfig) -> String {
    match verbose {
        0 => config.logging.level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Interpret a command-line value: JSON when it parses, a string otherwise.
fn parse_value(input: String) -> Value {
    serde_json::from_str(&input).unwrap_or(Value::String(input))
}

fn open(config: &AppConfig) -> Result<Persistence> {
    let session = Persistence::init(config).context("failed to start persistence session")?;
    info!(mode = %session.mode(), "Session started");
    Ok(session)
}

async fn cmd_save(config: &AppConfig, group: &str, key: &str, value: String, raw: bool) -> Result<()> {
    let session = open(config)?;
    if raw {
        session.save_raw(group, key, value).await?;
    } else {
        session.save(group, key, &parse_value(value)).await?;
    }
    session.flush().await?;
    session.shutdown().await;
    println!("Saved {group}/{key}.");
    Ok(())
}

async fn cmd_load(config: &AppConfig, group: &str, key: &str, raw: bool) -> Result<()> {
    let session = open(config)?;
    if raw {
        println!("{}", session.load_raw(group, key).await?);
    } else {
        let value: Value = session.load(group, key).await?;
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    session.shutdown().await;
    Ok(())
}

async fn cmd_flush(config: &AppConfig) -> Result<()> {
    let session = open(config)?;
    session.flush().await?;
    session.shutdown().await;
    println!("Flushed.");
    Ok(())
}

async fn cmd_status(config: &AppConfig) -> Result<()> {
    let session = open(config)?;
    println!("mode: {}", session.mode());
    match session.socket_path() {
        Some(path) => println!("socket: {}", path.display()),
        None => println!("local path: {}", config.storage.local_path),
    }

    if let Err(e) = session.wait_ready(config.reconnect.ready_timeout()).await {
        warn!(error = %e, "Backend not ready");
    }
    match session.connection_state() {
        Some(ConnectionState::Connected) | None => println!("state: ready"),
        Some(state) => println!("state: {state}"),
    }
    session.shutdown().await;
    Ok(())
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

/// Load the config file, or defaults when it does not exist. The flag
/// reports whether the file was found.
async fn load_config(path: &Path) -> Result<(AppConfig, bool)> {
    if path.exists() {
        let config = AppConfig::load(path)
            .await
            .with_context(|| format!("invalid config at {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((AppConfig::default(), false))
    }
}
