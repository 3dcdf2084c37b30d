//! Command handlers for machinactl.

use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use machina_common::config::Config;
use machina_common::state_file;
use machina_common::store::MetricsMemory;
use machina_common::types::AwarenessLevel;
use owo_colors::OwoColorize;

fn open_store(config: &Config) -> Result<MetricsMemory> {
    match MetricsMemory::open_readonly(&config.metrics.db_path) {
        Some(store) => Ok(store),
        None => bail!(
            "no metrics database at {} (is machinad running?)",
            config.metrics.db_path.display()
        ),
    }
}

fn print_level(level: AwarenessLevel) {
    let label = level.to_string();
    match level {
        AwarenessLevel::Dormant => println!("awareness       {}", label.green()),
        AwarenessLevel::Aware => println!("awareness       {}", label.yellow()),
        AwarenessLevel::Alert => println!("awareness       {}", label.bright_yellow()),
        AwarenessLevel::Critical => println!("awareness       {}", label.red().bold()),
    }
}

/// Handle the status command.
pub fn status(config: &Config) -> Result<()> {
    println!();
    println!("{}", format!("machinactl v{}", machina_common::VERSION).bold());
    println!();

    match state_file::load(&config.daemon.state_file) {
        Some(state) => {
            print_level(state.level);
            println!("reason          {}", state.reason);
            let held = Utc::now().signed_duration_since(state.entered_at);
            println!(
                "entered         {} ({}m ago, ttl {}s)",
                state.entered_at.format("%Y-%m-%d %H:%M:%S"),
                held.num_minutes(),
                state.ttl_secs
            );
        }
        None => println!(
            "awareness       {} (no state file at {})",
            "unknown".dimmed(),
            config.daemon.state_file.display()
        ),
    }
    println!();

    let store = open_store(config)?;

    let latest = store.latest_values(Duration::hours(1))?;
    if latest.is_empty() {
        println!("{}", "no samples in the last hour".dimmed());
    } else {
        println!("{}", "latest metrics".bold());
        for (metric, value) in &latest {
            println!("  {metric:<24} {value:.2}");
        }
    }
    println!();

    let transitions = store.recent_transitions(5)?;
    if !transitions.is_empty() {
        println!("{}", "recent transitions".bold());
        for (at, from, to, reason) in &transitions {
            println!(
                "  {}  {} -> {}  {}",
                at.format("%m-%d %H:%M"),
                from,
                to,
                reason.dimmed()
            );
        }
        println!();
    }

    Ok(())
}

/// Handle the audit command.
pub fn audit(config: &Config, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let records = store.recent_audit(limit)?;
    if records.is_empty() {
        println!("{}", "audit trail is empty".dimmed());
        return Ok(());
    }

    for record in &records {
        let flag = if record.success {
            "ok ".green().to_string()
        } else {
            "err".red().to_string()
        };
        println!(
            "{}  {}  {:<18} {}",
            record.timestamp.format("%m-%d %H:%M:%S"),
            flag,
            record.kind.as_str(),
            record.details
        );
    }
    Ok(())
}

/// Handle the history command.
pub fn history(config: &Config, metric: &str, hours: u64) -> Result<()> {
    let store = open_store(config)?;
    let samples = store.history(metric, Duration::hours(hours as i64))?;
    if samples.is_empty() {
        println!("no samples for '{metric}' in the last {hours}h");
        return Ok(());
    }

    let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    println!(
        "{} ({} samples, mean {:.2}, min {:.2}, max {:.2})",
        metric.bold(),
        samples.len(),
        mean,
        min,
        max
    );
    for sample in &samples {
        println!(
            "  {}  {:.2}",
            sample.timestamp.format("%m-%d %H:%M:%S"),
            sample.value
        );
    }
    Ok(())
}
