//! Pump.fun Recovery Trader - simulated trading on bonding-curve launches
//!
//! # NOTE
//! - Every trade is simulated. Nothing is signed or sent on-chain.
//! - Backtest results depend on the simulator's latency and slippage model.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

// Use the library crate
use pumpfun_trader::cli::commands;
use pumpfun_trader::config::{Config, LoggingConfig};
use pumpfun_trader::stats::log_rotation::RotatingFile;

/// Pump.fun Recovery Trader
#[derive(Parser)]
#[command(name = "trader")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trade the live PumpPortal feed
    Run {
        /// Do not restore or write snapshots
        #[arg(long)]
        dry_run: bool,
    },

    /// Backtest against a newline-delimited JSON feed capture
    Replay {
        /// Feed capture, one PumpPortal record per line
        file: PathBuf,

        /// Seed for the transaction simulator
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Show the last snapshot (wallet, analytics, open position)
    Status,

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&config.logging)?;

    // Execute command
    let result = match cli.command {
        Commands::Run { dry_run } => commands::run(config, dry_run).await,
        Commands::Replay { file, seed } => commands::replay(config, &file, seed).await,
        Commands::Status => commands::status(&config).await,
        Commands::Config => commands::show_config(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Install the global subscriber: env filter, text or JSON, stdout or a
/// size-rotated file
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("pumpfun_trader=info".parse()?);

    let (writer, ansi) = match &logging.file {
        Some(path) => {
            let file = RotatingFile::open(path, logging.max_file_bytes)?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stdout), true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}
