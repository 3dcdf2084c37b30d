//! SQLite-backed memory: metric samples, the audit trail, and state
//! transition history.
//!
//! Schema:
//! - metrics: timestamp, metric_name, value — UNIQUE(timestamp, name)
//! - audit: append-only trail for actions and transitions
//! - state_history: awareness transitions
//!
//! All access serializes on a single connection mutex, so a reader
//! never observes a half-applied retention purge.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::config::MetricsConfig;
use crate::types::{AnomalyScore, AuditKind, AuditRecord, Sample, ScoreDetail};

/// Rows removed by a maintenance purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub metrics: usize,
    pub audit: usize,
    pub transitions: usize,
}

/// Persistent memory for the engine.
pub struct MetricsMemory {
    conn: Mutex<Connection>,
}

impl MetricsMemory {
    /// Open or create the database at `path`.
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating db dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Open read-only for inspection tooling. Returns `None` when the
    /// database does not exist yet.
    pub fn open_readonly<P: AsRef<Path>>(path: P) -> Option<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return None;
        }
        let conn =
            Connection::open_with_flags(path, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY).ok()?;
        Some(Self {
            conn: Mutex::new(conn),
        })
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                metric_name TEXT NOT NULL,
                value REAL NOT NULL,
                UNIQUE(timestamp, metric_name)
            );
            CREATE INDEX IF NOT EXISTS idx_metrics_timestamp ON metrics(timestamp);
            CREATE INDEX IF NOT EXISTS idx_metrics_name_time ON metrics(metric_name, timestamp);

            CREATE TABLE IF NOT EXISTS audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                details TEXT NOT NULL,
                success INTEGER NOT NULL,
                action_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit(timestamp);
            CREATE INDEX IF NOT EXISTS idx_audit_kind ON audit(kind);

            CREATE TABLE IF NOT EXISTS state_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                from_state TEXT NOT NULL,
                to_state TEXT NOT NULL,
                reason TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_state_timestamp ON state_history(timestamp);
            "#,
        )?;
        debug!("Metrics memory schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record one sample. Samples are immutable: a duplicate
    /// (timestamp, metric) pair is ignored, not overwritten. Returns
    /// whether a row was inserted.
    pub fn record(&self, sample: &Sample) -> Result<bool> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO metrics (timestamp, metric_name, value) VALUES (?1, ?2, ?3)",
            params![sample.timestamp, sample.metric, sample.value],
        )?;
        Ok(inserted > 0)
    }

    /// Samples for one metric inside the trailing window, oldest
    /// first.
    pub fn history(&self, metric: &str, window: Duration) -> Result<Vec<Sample>> {
        let since = Utc::now() - window;
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT timestamp, metric_name, value FROM metrics
             WHERE metric_name = ?1 AND timestamp >= ?2
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![metric, since], |row| {
            Ok(Sample {
                timestamp: row.get(0)?,
                metric: row.get(1)?,
                value: row.get(2)?,
            })
        })?;
        let mut samples = Vec::new();
        for row in rows {
            samples.push(row?);
        }
        Ok(samples)
    }

    /// Score `value` against the metric's rolling baseline.
    ///
    /// The baseline is the mean and population standard deviation of
    /// the stored window; the candidate value itself is not part of
    /// it. A flat series (stddev zero) scores as nominal.
    pub fn score(&self, metric: &str, value: f64, cfg: &MetricsConfig) -> Result<AnomalyScore> {
        let window = Duration::hours(cfg.window_hours as i64);
        let history = self.history(metric, window)?;

        if history.len() < cfg.min_samples {
            return Ok(AnomalyScore::NotEnoughData {
                have: history.len(),
                need: cfg.min_samples,
            });
        }

        let n = history.len() as f64;
        let mean = history.iter().map(|s| s.value).sum::<f64>() / n;
        let variance = history.iter().map(|s| (s.value - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();

        let z_score = if std_dev > 0.0 {
            (value - mean) / std_dev
        } else {
            0.0
        };

        let detail = ScoreDetail {
            value,
            mean,
            std_dev,
            z_score,
        };

        if z_score.abs() > cfg.sigma_k {
            Ok(AnomalyScore::Anomalous(detail))
        } else {
            Ok(AnomalyScore::Nominal(detail))
        }
    }

    /// Most recent value per metric inside the window. Feeds the
    /// analysis context.
    pub fn latest_values(&self, window: Duration) -> Result<BTreeMap<String, f64>> {
        let since = Utc::now() - window;
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT metric_name, value FROM metrics
             WHERE timestamp >= ?1
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![since], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;
        // Later rows overwrite earlier ones, leaving the newest value.
        let mut latest = BTreeMap::new();
        for row in rows {
            let (name, value) = row?;
            latest.insert(name, value);
        }
        Ok(latest)
    }

    /// Append one audit record. Never updates or deletes.
    pub fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO audit (timestamp, kind, details, success, action_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.timestamp,
                record.kind.as_str(),
                record.details,
                record.success,
                record.action_id,
            ],
        )?;
        Ok(())
    }

    /// Newest audit records first.
    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT timestamp, kind, details, success, action_id FROM audit
             ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let kind: String = row.get(1)?;
            Ok(AuditRecord {
                timestamp: row.get(0)?,
                kind: AuditKind::parse(&kind).unwrap_or(AuditKind::ActionExecuted),
                details: row.get(2)?,
                success: row.get(3)?,
                action_id: row.get(4)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Record an awareness transition in the history table.
    pub fn record_transition(&self, from: &str, to: &str, reason: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO state_history (timestamp, from_state, to_state, reason)
             VALUES (?1, ?2, ?3, ?4)",
            params![Utc::now(), from, to, reason],
        )?;
        Ok(())
    }

    /// Newest transitions first, as (timestamp, from, to, reason).
    pub fn recent_transitions(
        &self,
        limit: usize,
    ) -> Result<Vec<(DateTime<Utc>, String, String, String)>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT timestamp, from_state, to_state, reason FROM state_history
             ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
        let mut transitions = Vec::new();
        for row in rows {
            transitions.push(row?);
        }
        Ok(transitions)
    }

    /// Remove rows older than the retention horizon and reclaim
    /// space. Holds the connection for the whole pass, so concurrent
    /// reads see either the pre- or post-purge set.
    pub fn purge(&self, retention_days: u64) -> Result<PurgeStats> {
        let cutoff = Utc::now() - Duration::days(retention_days as i64);
        let conn = self.conn.lock().expect("store mutex poisoned");

        let metrics = conn.execute("DELETE FROM metrics WHERE timestamp < ?1", params![cutoff])?;
        let audit = conn.execute("DELETE FROM audit WHERE timestamp < ?1", params![cutoff])?;
        let transitions = conn.execute(
            "DELETE FROM state_history WHERE timestamp < ?1",
            params![cutoff],
        )?;
        conn.execute_batch("VACUUM;")?;

        let stats = PurgeStats {
            metrics,
            audit,
            transitions,
        };
        info!(
            "Purged {} samples, {} audit rows, {} transitions past {} day retention",
            stats.metrics, stats.audit, stats.transitions, retention_days
        );
        Ok(stats)
    }

    /// Timestamp of the newest sample for a metric, if any.
    pub fn last_seen(&self, metric: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let ts = conn
            .query_row(
                "SELECT timestamp FROM metrics WHERE metric_name = ?1
                 ORDER BY timestamp DESC LIMIT 1",
                params![metric],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with_series(metric: &str, values: &[f64]) -> MetricsMemory {
        let memory = MetricsMemory::open_in_memory().unwrap();
        let start = Utc::now() - Duration::hours(2);
        for (i, value) in values.iter().enumerate() {
            let sample = Sample {
                timestamp: start + Duration::minutes(i as i64),
                metric: metric.to_string(),
                value: *value,
            };
            assert!(memory.record(&sample).unwrap());
        }
        memory
    }

    fn test_config() -> MetricsConfig {
        MetricsConfig {
            min_samples: 5,
            ..MetricsConfig::default()
        }
    }

    #[test]
    fn duplicate_samples_are_ignored() {
        let memory = MetricsMemory::open_in_memory().unwrap();
        let sample = Sample::new("cpu_load", 0.5);
        assert!(memory.record(&sample).unwrap());
        assert!(!memory.record(&sample).unwrap());

        let history = memory.history("cpu_load", Duration::hours(1)).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn history_is_ordered_and_windowed() {
        let memory = MetricsMemory::open_in_memory().unwrap();
        let old = Sample {
            timestamp: Utc::now() - Duration::days(2),
            metric: "cpu_load".to_string(),
            value: 1.0,
        };
        memory.record(&old).unwrap();
        memory.record(&Sample::new("cpu_load", 2.0)).unwrap();

        let history = memory.history("cpu_load", Duration::hours(1)).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].value, 2.0);

        let full = memory.history("cpu_load", Duration::days(7)).unwrap();
        assert_eq!(full.len(), 2);
        assert!(full[0].timestamp < full[1].timestamp);
    }

    #[test]
    fn cold_series_is_never_anomalous() {
        let memory = memory_with_series("cpu_load", &[20.0, 21.0]);
        let score = memory.score("cpu_load", 1000.0, &test_config()).unwrap();
        assert!(matches!(
            score,
            AnomalyScore::NotEnoughData { have: 2, need: 5 }
        ));
        assert!(!score.is_anomalous());
    }

    #[test]
    fn spike_outside_three_sigma_is_anomalous() {
        // Stream averaging ~20 with stddev ~5; 95 is far past 20 + 3*5.
        let memory = memory_with_series(
            "cpu_percent",
            &[15.0, 20.0, 25.0, 20.0, 15.0, 25.0, 20.0, 15.0, 25.0, 20.0],
        );
        let score = memory.score("cpu_percent", 95.0, &test_config()).unwrap();
        assert!(score.is_anomalous());

        let nominal = memory.score("cpu_percent", 22.0, &test_config()).unwrap();
        assert!(!nominal.is_anomalous());
    }

    #[test]
    fn flat_series_scores_nominal() {
        let memory = memory_with_series("disk_usage_root", &[42.0; 10]);
        let score = memory.score("disk_usage_root", 42.0, &test_config()).unwrap();
        match score {
            AnomalyScore::Nominal(detail) => assert_eq!(detail.z_score, 0.0),
            other => panic!("expected nominal, got {:?}", other),
        }
    }

    #[test]
    fn purge_removes_old_rows_only() {
        let memory = MetricsMemory::open_in_memory().unwrap();
        let old = Sample {
            timestamp: Utc::now() - Duration::days(60),
            metric: "cpu_load".to_string(),
            value: 1.0,
        };
        memory.record(&old).unwrap();
        memory.record(&Sample::new("cpu_load", 2.0)).unwrap();
        memory
            .append_audit(&AuditRecord::now(AuditKind::StateTransition, "old", true))
            .unwrap();

        let stats = memory.purge(30).unwrap();
        assert_eq!(stats.metrics, 1);
        assert_eq!(stats.audit, 0);

        let remaining = memory.history("cpu_load", Duration::days(90)).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].value, 2.0);
    }

    #[test]
    fn audit_round_trip() {
        let memory = MetricsMemory::open_in_memory().unwrap();
        let record = AuditRecord::now(AuditKind::ActionDenied, "refused restart_service", false)
            .for_action("action-1");
        memory.append_audit(&record).unwrap();

        let recent = memory.recent_audit(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, AuditKind::ActionDenied);
        assert_eq!(recent[0].action_id.as_deref(), Some("action-1"));
        assert!(!recent[0].success);
    }

    #[test]
    fn latest_values_keep_newest() {
        let memory = MetricsMemory::open_in_memory().unwrap();
        let earlier = Sample {
            timestamp: Utc::now() - Duration::minutes(10),
            metric: "open_ports".to_string(),
            value: 4.0,
        };
        memory.record(&earlier).unwrap();
        memory.record(&Sample::new("open_ports", 7.0)).unwrap();

        let latest = memory.latest_values(Duration::hours(1)).unwrap();
        assert_eq!(latest.get("open_ports"), Some(&7.0));
    }

    #[test]
    fn transitions_round_trip() {
        let memory = MetricsMemory::open_in_memory().unwrap();
        memory
            .record_transition("dormant", "alert", "integrity divergence: b.txt")
            .unwrap();
        let transitions = memory.recent_transitions(5).unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].1, "dormant");
        assert_eq!(transitions[0].2, "alert");
    }
}
