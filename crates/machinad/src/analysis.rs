//! Analysis backends and the failover chain.
//!
//! A backend is anything that can look at the joined system context
//! and hand back a normalized `Assessment`. The manager walks its
//! chain in priority order and the rule-based heuristic backend is
//! always appended last, so `analyze` is total: it cannot come back
//! empty-handed no matter how many backends above it misbehave.

use chrono::Utc;
use machina_common::types::{Assessment, Severity};
use std::collections::BTreeMap;
use std::sync::Arc;
use sysinfo::System;
use thiserror::Error;
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

/// Host facts handed to backends alongside metrics and logs.
#[derive(Debug, Clone, Default)]
pub struct SystemFacts {
    pub hostname: String,
    pub os: String,
    pub kernel: String,
    pub uptime_secs: u64,
}

impl SystemFacts {
    /// Collect from the running host.
    pub fn collect() -> Self {
        Self {
            hostname: System::host_name().unwrap_or_default(),
            os: System::long_os_version().unwrap_or_default(),
            kernel: System::kernel_version().unwrap_or_default(),
            uptime_secs: System::uptime(),
        }
    }
}

/// Everything a backend gets to reason over for one invocation.
#[derive(Debug, Clone, Default)]
pub struct AnalysisContext {
    pub facts: SystemFacts,
    /// Error-priority log tail from the current tick.
    pub recent_logs: Vec<String>,
    /// Latest value per metric.
    pub recent_metrics: BTreeMap<String, f64>,
    /// Metrics the scorer flagged this tick.
    pub anomalous_metrics: Vec<String>,
}

/// Soft failures that advance the chain to the next backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable")]
    Unavailable,

    #[error("backend timed out after {0}s")]
    Timeout(u64),

    #[error("backend response malformed: {0}")]
    Malformed(String),

    #[error("backend failed: {0}")]
    Failed(String),
}

/// Capability interface every analysis backend implements. Network
/// backends adapt their wire format to `Assessment` before returning;
/// none of their fields leak through this boundary.
pub trait AnalysisBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap availability check; an unavailable backend is skipped
    /// without counting as a failure.
    fn is_available(&self) -> bool;

    fn analyze(&self, ctx: &AnalysisContext) -> Result<Assessment, BackendError>;
}

/// Rule-based local backend. Always available, never fails; the
/// guarantee the whole chain leans on.
pub struct HeuristicBackend;

impl HeuristicBackend {
    const ERROR_PATTERNS: [&'static str; 8] = [
        "error", "critical", "fail", "segfault", "denied", "refused", "timeout", "fatal",
    ];
}

impl AnalysisBackend for HeuristicBackend {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Result<Assessment, BackendError> {
        let mut issues = Vec::new();
        let mut anomalies = Vec::new();
        let mut recommendations = Vec::new();
        let mut severity = Severity::Low;

        let metric = |name: &str| ctx.recent_metrics.get(name).copied();

        if let Some(cpu) = metric("cpu_load_1m") {
            if cpu > 8.0 {
                issues.push(format!("very high load average ({cpu:.2})"));
                recommendations.push("identify processes saturating the CPU".to_string());
                severity = severity.max(Severity::High);
            } else if cpu > 4.0 {
                issues.push(format!("elevated load average ({cpu:.2})"));
                recommendations.push("watch the load trend".to_string());
                severity = severity.max(Severity::Medium);
            }
        }

        if let Some(mem) = metric("memory_used_percent") {
            if mem > 95.0 {
                issues.push(format!("memory nearly exhausted ({mem:.0}%)"));
                recommendations.push("check for leaking processes".to_string());
                severity = severity.max(Severity::Critical);
            } else if mem > 85.0 {
                issues.push(format!("high memory usage ({mem:.0}%)"));
                recommendations.push("identify memory-heavy processes".to_string());
                severity = severity.max(Severity::High);
            }
        }

        if let Some(disk) = metric("disk_usage_root") {
            if disk > 95.0 {
                issues.push(format!("root filesystem nearly full ({disk:.0}%)"));
                recommendations.push("free space on / or expand storage".to_string());
                severity = severity.max(Severity::Critical);
            } else if disk > 85.0 {
                issues.push(format!("root filesystem filling up ({disk:.0}%)"));
                recommendations.push("clean old logs and caches".to_string());
                severity = severity.max(Severity::High);
            }
        }

        for name in &ctx.anomalous_metrics {
            anomalies.push(format!("{name} outside its rolling baseline"));
            severity = severity.max(Severity::Medium);
        }

        let noisy_lines = ctx
            .recent_logs
            .iter()
            .filter(|line| {
                let lower = line.to_lowercase();
                Self::ERROR_PATTERNS.iter().any(|p| lower.contains(p))
            })
            .count();
        if noisy_lines > 0 {
            issues.push(format!("{noisy_lines} error-level log lines in the tail"));
            recommendations.push("review the journal for details".to_string());
            severity = severity.max(Severity::Medium);
        }

        let summary = if issues.is_empty() && anomalies.is_empty() {
            "system appears healthy".to_string()
        } else {
            format!(
                "found {} issue(s) and {} anomaly(ies)",
                issues.len(),
                anomalies.len()
            )
        };

        Ok(Assessment {
            summary,
            issues,
            anomalies,
            recommendations,
            severity,
            provider: self.name().to_string(),
            generated_at: Utc::now(),
        })
    }
}

/// Priority-ordered chain of backends with per-call timeouts.
pub struct BackendManager {
    backends: Vec<Arc<dyn AnalysisBackend>>,
    timeout_secs: u64,
}

impl BackendManager {
    /// Build the chain. The heuristic backend is appended last
    /// unconditionally; callers only supply what runs ahead of it.
    pub fn new(mut backends: Vec<Arc<dyn AnalysisBackend>>, timeout_secs: u64) -> Self {
        backends.push(Arc::new(HeuristicBackend));
        Self {
            backends,
            timeout_secs,
        }
    }

    /// Try each backend in order until one yields an assessment.
    ///
    /// Unavailable backends are skipped silently; an available
    /// backend's error or timeout is a soft failure and the chain
    /// moves on. No backend is retried within one invocation —
    /// retrying is the next tick's business. Total by construction.
    pub async fn analyze(&self, ctx: &AnalysisContext) -> Assessment {
        for backend in &self.backends {
            if !backend.is_available() {
                info!("Backend '{}' unavailable, skipping", backend.name());
                continue;
            }

            let backend = Arc::clone(backend);
            let ctx_owned = ctx.clone();
            let name = backend.name().to_string();
            let call = tokio::task::spawn_blocking(move || backend.analyze(&ctx_owned));

            match timeout(Duration::from_secs(self.timeout_secs), call).await {
                Ok(Ok(Ok(assessment))) => {
                    info!(
                        "Backend '{}' produced assessment (severity {})",
                        name, assessment.severity
                    );
                    return assessment;
                }
                Ok(Ok(Err(e))) => {
                    warn!("Backend '{}' failed: {}, trying next", name, e);
                }
                Ok(Err(e)) => {
                    warn!("Backend '{}' panicked: {}, trying next", name, e);
                }
                Err(_) => {
                    warn!(
                        "Backend '{}' timed out after {}s, trying next",
                        name, self.timeout_secs
                    );
                }
            }
        }

        // Unreachable while the heuristic backend sits at the end of
        // the chain, but the loop shape cannot promise that to the
        // compiler.
        HeuristicBackend
            .analyze(ctx)
            .expect("heuristic backend is infallible")
    }
}
