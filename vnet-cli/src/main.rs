//! vnet CLI - Command-line interface
//!
//! Runs canned scenarios against a configured virtual network and prints
//! what the network did with the traffic.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use vnet_core::NetworkConfig;
use vnet_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "vnet")]
#[command(about = "Deterministic virtual socket network")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// JSON network configuration (defaults plus VNET_* environment overrides when absent)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the random seed
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Warn, global = true)]
    log_level: CliLogLevel,

    /// Directory for the full trace log of the run
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())?;

    let mut config = match &cli.config {
        Some(path) => NetworkConfig::from_json_file(path)?,
        None => NetworkConfig::from_env(),
    };
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    config.validate()?;

    commands::run_command(cli.command, config)
}
