//! Parley CLI, the main entry point.
//!
//! Commands:
//! - `onboard`     Write the default config and extension root
//! - `run`         Boot the runtime with the built-in extensions
//! - `extensions`  List discovered extensions and their load order
//! - `doctor`      Diagnose the local setup

use clap::{Parser, Subcommand};
use parley_config::AppConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Parley: a platform-agnostic chat-bot runtime",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration and the extension root
    Onboard,

    /// Run the bot until Ctrl-C or end of console input
    Run,

    /// List discovered extensions and the resolved load order
    Extensions {
        /// Scan this directory instead of the configured root
        #[arg(short, long)]
        root: Option<PathBuf>,
    },

    /// Diagnose system health
    Doctor,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // A broken config still gets logging; `doctor` reports the error.
    let config = AppConfig::load().ok();
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config
            .as_ref()
            .map(|c| c.logging.level.clone())
            .unwrap_or_else(|| "info".into())
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter));
    if config.as_ref().is_some_and(|c| c.logging.json) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    match cli.command {
        Commands::Onboard => commands::onboard::run().await?,
        Commands::Run => commands::run::run().await?,
        Commands::Extensions { root } => commands::extensions::run(root).await?,
        Commands::Doctor => commands::doctor::run().await?,
    }

    Ok(())
}
