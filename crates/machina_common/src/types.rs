//! Core data model: samples, assessments, awareness states, actions
//! and audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One time-stamped metric observation. Immutable once recorded; the
/// store enforces at most one sample per (timestamp, metric).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub metric: String,
    pub value: f64,
}

impl Sample {
    pub fn new(metric: impl Into<String>, value: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            metric: metric.into(),
            value,
        }
    }
}

/// Statistical context for a scored sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreDetail {
    pub value: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub z_score: f64,
}

/// Result of scoring a sample against its rolling baseline.
///
/// A cold series (fewer than the configured minimum of samples) is
/// reported as `NotEnoughData` and must never be treated as anomalous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnomalyScore {
    NotEnoughData { have: usize, need: usize },
    Nominal(ScoreDetail),
    Anomalous(ScoreDetail),
}

impl AnomalyScore {
    pub fn is_anomalous(&self) -> bool {
        matches!(self, AnomalyScore::Anomalous(_))
    }
}

/// Severity reported by an analysis backend, ordered so that the
/// worst rule fired wins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        write!(f, "{s}")
    }
}

/// Normalized output of any analysis backend. Backend-specific wire
/// fields never appear here; a backend adapts its response to this
/// shape before handing it back to the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assessment {
    pub summary: String,
    pub issues: Vec<String>,
    pub anomalies: Vec<String>,
    pub recommendations: Vec<String>,
    pub severity: Severity,
    /// Name of the backend that produced this assessment.
    pub provider: String,
    pub generated_at: DateTime<Utc>,
}

/// Depth of self-inspection the engine is committed to. Ordered:
/// each level implies everything the lower ones do.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum AwarenessLevel {
    #[default]
    Dormant,
    Aware,
    Alert,
    Critical,
}

impl AwarenessLevel {
    /// Next level up, saturating at Critical.
    pub fn escalated(self) -> Self {
        match self {
            AwarenessLevel::Dormant => AwarenessLevel::Aware,
            AwarenessLevel::Aware => AwarenessLevel::Alert,
            AwarenessLevel::Alert | AwarenessLevel::Critical => AwarenessLevel::Critical,
        }
    }

    /// Next level down, saturating at Dormant.
    pub fn decayed(self) -> Self {
        match self {
            AwarenessLevel::Critical => AwarenessLevel::Alert,
            AwarenessLevel::Alert => AwarenessLevel::Aware,
            AwarenessLevel::Aware | AwarenessLevel::Dormant => AwarenessLevel::Dormant,
        }
    }
}

impl fmt::Display for AwarenessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AwarenessLevel::Dormant => "dormant",
            AwarenessLevel::Aware => "aware",
            AwarenessLevel::Alert => "alert",
            AwarenessLevel::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// The single live awareness record. Mutated only by the escalation
/// state machine and persisted for restart survival.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub level: AwarenessLevel,
    pub entered_at: DateTime<Utc>,
    /// Seconds the level survives without a fresh triggering signal.
    pub ttl_secs: u64,
    pub reason: String,
}

impl AwarenessState {
    pub fn dormant(ttl_secs: u64) -> Self {
        Self {
            level: AwarenessLevel::Dormant,
            entered_at: Utc::now(),
            ttl_secs,
            reason: "baseline".to_string(),
        }
    }

    /// True once the TTL has fully elapsed since entry.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        let deadline = self.entered_at + chrono::Duration::seconds(self.ttl_secs as i64);
        now >= deadline
    }
}

/// Risk level an action requires. Execution is refused above the
/// configured ceiling.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    #[default]
    Observe,
    Restart,
    Clean,
    Configure,
    Admin,
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PermissionLevel::Observe => "observe",
            PermissionLevel::Restart => "restart",
            PermissionLevel::Clean => "clean",
            PermissionLevel::Configure => "configure",
            PermissionLevel::Admin => "admin",
        };
        write!(f, "{s}")
    }
}

/// Completed (or refused) remediation action. Immutable after
/// completion except for the `rolled_back` flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: String,
    pub name: String,
    pub permission: PermissionLevel,
    pub parameters: Vec<(String, String)>,
    pub executed_at: DateTime<Utc>,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub rollback_token: Option<String>,
    pub rolled_back: bool,
}

/// What an audit record is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    ActionExecuted,
    ActionDenied,
    ActionRolledBack,
    StateTransition,
    IntegrityDrift,
    AnomalyDetected,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::ActionExecuted => "action_executed",
            AuditKind::ActionDenied => "action_denied",
            AuditKind::ActionRolledBack => "action_rolled_back",
            AuditKind::StateTransition => "state_transition",
            AuditKind::IntegrityDrift => "integrity_drift",
            AuditKind::AnomalyDetected => "anomaly_detected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "action_executed" => Some(AuditKind::ActionExecuted),
            "action_denied" => Some(AuditKind::ActionDenied),
            "action_rolled_back" => Some(AuditKind::ActionRolledBack),
            "state_transition" => Some(AuditKind::StateTransition),
            "integrity_drift" => Some(AuditKind::IntegrityDrift),
            "anomaly_detected" => Some(AuditKind::AnomalyDetected),
            _ => None,
        }
    }
}

/// Append-only trail entry referencing an action or a state
/// transition. Never mutated or deleted outside retention cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    pub details: String,
    pub success: bool,
    /// Set when the record refers to a specific action.
    pub action_id: Option<String>,
}

impl AuditRecord {
    pub fn now(kind: AuditKind, details: impl Into<String>, success: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            details: details.into(),
            success,
            action_id: None,
        }
    }

    pub fn for_action(mut self, action_id: impl Into<String>) -> Self {
        self.action_id = Some(action_id.into());
        self
    }
}
