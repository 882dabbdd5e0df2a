//! Flotilla CLI - local development process supervisor
//!
//! Declares services once in `flotilla.yaml`, then `flotilla run` allocates
//! ports, installs dependencies, launches everything in dependency order
//! and keeps probing health until interrupted.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use flotilla::manifest::MANIFEST_FILE;
use tracing::error;

mod cmd;

#[derive(Parser)]
#[command(name = "flotilla")]
#[command(about = "Local development process supervisor and orchestrator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: cmd::Commands,

    /// Path to the service manifest
    #[arg(short, long, default_value = MANIFEST_FILE, global = true)]
    manifest: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("flotilla={}", log_level).into()),
        )
        .init();

    let code = match cmd::dispatch(cli.command, &cli.manifest).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            2
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
