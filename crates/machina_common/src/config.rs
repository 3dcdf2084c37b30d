//! Configuration for the Machina daemon.
//!
//! Loads settings from /etc/machina/config.toml or uses defaults.
//! Every threshold and TTL in the escalation ladder is tunable here
//! rather than hard-coded.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::types::PermissionLevel;

/// Config file path
pub const CONFIG_PATH: &str = "/etc/machina/config.toml";

/// Scheduling loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between ticks.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Hard deadline for a whole tick; a tick past this is abandoned.
    #[serde(default = "default_tick_deadline")]
    pub tick_deadline_secs: u64,

    /// Maximum concurrent probe/scan tasks within a tick.
    #[serde(default = "default_worker_limit")]
    pub worker_limit: usize,

    /// Seconds between maintenance purges of the store.
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,

    /// Awareness state file, readable by external tooling.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

fn default_tick_interval() -> u64 {
    60
}

fn default_tick_deadline() -> u64 {
    45
}

fn default_worker_limit() -> usize {
    4
}

fn default_purge_interval() -> u64 {
    6 * 3600
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/machina/awareness_state.json")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            tick_deadline_secs: default_tick_deadline(),
            worker_limit: default_worker_limit(),
            purge_interval_secs: default_purge_interval(),
            state_file: default_state_file(),
        }
    }
}

/// Probe layer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Per-probe timeout in seconds.
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,

    /// Lines of error-priority log tail to collect per tick.
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_log_tail_lines() -> usize {
    50
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_probe_timeout(),
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

/// Integrity monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityConfig {
    /// Roots fingerprinted each scan, recursively.
    #[serde(default = "default_integrity_roots")]
    pub roots: Vec<PathBuf>,

    /// Where the accepted baseline fingerprint is persisted.
    #[serde(default = "default_baseline_path")]
    pub baseline_path: PathBuf,
}

fn default_integrity_roots() -> Vec<PathBuf> {
    vec![PathBuf::from("/etc")]
}

fn default_baseline_path() -> PathBuf {
    PathBuf::from("/var/lib/machina/integrity_baseline.json")
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            roots: default_integrity_roots(),
            baseline_path: default_baseline_path(),
        }
    }
}

/// Metrics memory and anomaly scoring settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Trailing window used for the rolling baseline, in hours.
    #[serde(default = "default_window_hours")]
    pub window_hours: u64,

    /// Minimum samples before scoring yields anything but
    /// not-enough-data.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// A sample is anomalous outside mean ± k·stddev.
    #[serde(default = "default_sigma_k")]
    pub sigma_k: f64,

    /// Samples, audit records and state history older than this are
    /// purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/machina/memory.db")
}

fn default_window_hours() -> u64 {
    7 * 24
}

fn default_min_samples() -> usize {
    12
}

fn default_sigma_k() -> f64 {
    3.0
}

fn default_retention_days() -> u64 {
    30
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            window_hours: default_window_hours(),
            min_samples: default_min_samples(),
            sigma_k: default_sigma_k(),
            retention_days: default_retention_days(),
        }
    }
}

/// Escalation ladder tuning. The original documentation presented
/// these as fixed numbers; here they are parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// TTL for the Aware level, seconds.
    #[serde(default = "default_aware_ttl")]
    pub aware_ttl_secs: u64,

    /// TTL for the Alert level, seconds.
    #[serde(default = "default_alert_ttl")]
    pub alert_ttl_secs: u64,

    /// TTL for the Critical level, seconds.
    #[serde(default = "default_critical_ttl")]
    pub critical_ttl_secs: u64,
}

fn default_aware_ttl() -> u64 {
    8 * 3600
}

fn default_alert_ttl() -> u64 {
    4 * 3600
}

fn default_critical_ttl() -> u64 {
    3600
}

impl EscalationConfig {
    /// TTL a freshly entered level starts with.
    pub fn ttl_for(&self, level: crate::types::AwarenessLevel) -> u64 {
        use crate::types::AwarenessLevel::*;
        match level {
            Dormant => self.aware_ttl_secs, // unused while dormant; kept sane
            Aware => self.aware_ttl_secs,
            Alert => self.alert_ttl_secs,
            Critical => self.critical_ttl_secs,
        }
    }
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            aware_ttl_secs: default_aware_ttl(),
            alert_ttl_secs: default_alert_ttl(),
            critical_ttl_secs: default_critical_ttl(),
        }
    }
}

/// Analysis backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Per-backend call timeout in seconds.
    #[serde(default = "default_backend_timeout")]
    pub backend_timeout_secs: u64,
}

fn default_backend_timeout() -> u64 {
    30
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            backend_timeout_secs: default_backend_timeout(),
        }
    }
}

/// One step of the configured remediation playbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationStep {
    pub action: String,
    #[serde(default)]
    pub parameters: Vec<(String, String)>,
}

/// Action executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Highest permission level the executor may run.
    #[serde(default = "default_ceiling")]
    pub permission_ceiling: PermissionLevel,

    /// Per-action execution timeout in seconds.
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,

    /// Directory for rollback snapshots (config backups etc).
    #[serde(default = "default_rollback_dir")]
    pub rollback_dir: PathBuf,

    /// Sequence run when the engine reaches Critical with an
    /// authorizing assessment.
    #[serde(default)]
    pub on_critical: Vec<RemediationStep>,

    /// Whether the on_critical sequence keeps going past failures.
    #[serde(default)]
    pub best_effort: bool,
}

fn default_ceiling() -> PermissionLevel {
    PermissionLevel::Restart
}

fn default_action_timeout() -> u64 {
    60
}

fn default_rollback_dir() -> PathBuf {
    PathBuf::from("/var/lib/machina/rollbacks")
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            permission_ceiling: default_ceiling(),
            action_timeout_secs: default_action_timeout(),
            rollback_dir: default_rollback_dir(),
            on_critical: Vec::new(),
            best_effort: false,
        }
    }
}

/// Full daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub probes: ProbeConfig,
    #[serde(default)]
    pub integrity: IntegrityConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub actions: ActionConfig,
}

impl Config {
    /// Load from the given path, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let config: Config = toml::from_str(&raw)
                .with_context(|| format!("parsing config {}", path.display()))?;
            info!("Loaded config from {}", path.display());
            config
        } else {
            warn!("Config {} not found, using defaults", path.display());
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.daemon.tick_interval_secs == 0 {
            bail!("daemon.tick_interval_secs must be positive");
        }
        if self.daemon.tick_deadline_secs == 0 {
            bail!("daemon.tick_deadline_secs must be positive");
        }
        if self.daemon.worker_limit == 0 {
            bail!("daemon.worker_limit must be at least 1");
        }
        if self.integrity.roots.is_empty() {
            bail!("integrity.roots must name at least one path");
        }
        if self.metrics.sigma_k <= 0.0 {
            bail!("metrics.sigma_k must be positive");
        }
        if self.metrics.min_samples < 2 {
            bail!("metrics.min_samples must be at least 2");
        }
        if self.metrics.window_hours == 0 {
            bail!("metrics.window_hours must be positive");
        }
        if self.escalation.aware_ttl_secs == 0
            || self.escalation.alert_ttl_secs == 0
            || self.escalation.critical_ttl_secs == 0
        {
            bail!("escalation TTLs must be positive");
        }
        Ok(())
    }
}
