mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "calmirror")]
#[command(about = "Mirror a source calendar into a target calendar, one way, on a schedule")]
struct Cli {
    /// Config file (default: ~/.config/calmirror/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a commented default config file
    Init,
    /// Sync now, then keep syncing on schedule until stopped
    Start,
    /// Stop the scheduled synchronization
    Stop,
    /// Run every configured pair once
    Sync {
        /// Only sync pairs whose source calendar has this name
        #[arg(short, long)]
        source: Option<String>,
    },
    /// Delete every mirrored event and forget all sync state
    Clean,
    /// Show configuration and sync state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = match cli.config {
        Some(path) => path,
        None => calmirror_core::config::MirrorConfig::config_path()?,
    };

    match cli.command {
        Commands::Init => commands::init::run(&config_path),
        Commands::Start => commands::start::run(&config_path).await,
        Commands::Stop => commands::stop::run(&config_path),
        Commands::Sync { source } => commands::sync::run(&config_path, source.as_deref()).await,
        Commands::Clean => commands::clean::run(&config_path).await,
        Commands::Status => commands::status::run(&config_path),
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
