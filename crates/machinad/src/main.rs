//! Machina daemon - adaptive system monitor
//!
//! Watches the host through probes and integrity scans, scores
//! metrics against their own history, escalates awareness, and runs
//! the configured remediation when things go critical.

use anyhow::Result;
use clap::Parser;
use machina_common::config::{Config, CONFIG_PATH};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use machinad::daemon::Engine;

#[derive(Parser)]
#[command(name = "machinad", version, about = "Adaptive system monitoring daemon")]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Run a single tick and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    info!("Machina Daemon v{} starting", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&args.config)?;
    let mut engine = Engine::new(config, Vec::new())?;

    if args.once {
        let report = engine.run_once().await?;
        info!(
            "Single tick done: level {}, {} samples, {} anomalies",
            report.level,
            report.samples_recorded,
            report.anomalous_metrics.len()
        );
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    engine.run(shutdown_rx).await?;
    info!("Shutting down gracefully");
    Ok(())
}
