//! Machina Control - CLI for inspecting the Machina daemon
//!
//! Reads the daemon's state file and metrics database directly; it
//! never mutates anything.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use machina_common::config::CONFIG_PATH;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "machinactl")]
#[command(about = "Machina - adaptive system monitor", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the daemon configuration file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show awareness state and recent transitions
    Status,

    /// Show the audit trail
    Audit {
        /// Maximum records to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show recent samples for one metric
    History {
        /// Metric name, e.g. cpu_load_1m
        metric: String,

        /// Trailing window in hours
        #[arg(long, default_value_t = 24)]
        hours: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = machina_common::config::Config::load(&cli.config)?;

    match cli.command {
        Commands::Status => commands::status(&config),
        Commands::Audit { limit } => commands::audit(&config, limit),
        Commands::History { metric, hours } => commands::history(&config, &metric, hours),
    }
}
