//! The engine: one scheduling loop driving probes, integrity scans,
//! scoring, analysis, escalation and remediation.
//!
//! Every tick runs the same pipeline: collect (bounded concurrency),
//! join, score, analyze when warranted, evaluate the state machine,
//! persist, remediate on entry to critical. A failed tick is logged
//! and the loop keeps going; only shutdown stops the engine.

use anyhow::{anyhow, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use machina_common::config::Config;
use machina_common::state_file;
use machina_common::store::MetricsMemory;
use machina_common::types::{
    AnomalyScore, AuditKind, AuditRecord, AwarenessLevel, AwarenessState, Sample,
};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::analysis::{AnalysisBackend, AnalysisContext, BackendManager, SystemFacts};
use crate::awareness::{evaluate, resume_state, TickSignals, TransitionNote};
use crate::executor::{default_remedies, ActionExecutor, ActionSpec, Remedy};
use crate::integrity::{IntegrityMonitor, IntegrityVerdict, ScanOutcome};
use crate::probe_runner::run_probe_or_default;
use crate::probes::{default_probes, Probe, ProbeReading};

/// What one tick did, for logging and inspection.
#[derive(Debug)]
pub struct TickReport {
    pub level: AwarenessLevel,
    pub samples_recorded: usize,
    pub anomalous_metrics: Vec<String>,
    pub transition: Option<TransitionNote>,
}

pub struct Engine {
    config: Config,
    memory: Arc<MetricsMemory>,
    monitor: Arc<Mutex<IntegrityMonitor>>,
    analysis: BackendManager,
    executor: ActionExecutor,
    probes: Vec<Probe>,
    state: AwarenessState,
}

impl Engine {
    /// Wire the engine from config. `extra_backends` run ahead of the
    /// built-in heuristic backend, highest priority first.
    pub fn new(config: Config, extra_backends: Vec<Arc<dyn AnalysisBackend>>) -> Result<Self> {
        let memory = Arc::new(
            MetricsMemory::open_at(&config.metrics.db_path)
                .with_context(|| format!("opening {}", config.metrics.db_path.display()))?,
        );
        let monitor = Arc::new(Mutex::new(IntegrityMonitor::new(
            config.integrity.roots.clone(),
            config.integrity.baseline_path.clone(),
        )));
        let analysis = BackendManager::new(extra_backends, config.analysis.backend_timeout_secs);
        let executor = ActionExecutor::new(
            default_remedies(config.actions.rollback_dir.clone()),
            config.actions.permission_ceiling,
            config.actions.action_timeout_secs,
            Arc::clone(&memory),
        );
        let probes = default_probes(&config.probes);

        let persisted = state_file::load(&config.daemon.state_file);
        let state = resume_state(persisted, Utc::now(), &config.escalation);
        info!("Engine starting at awareness level {}", state.level);

        Ok(Self {
            config,
            memory,
            monitor,
            analysis,
            executor,
            probes,
            state,
        })
    }

    /// Replace the probe catalog.
    pub fn with_probes(mut self, probes: Vec<Probe>) -> Self {
        self.probes = probes;
        self
    }

    /// Replace the action catalog, keeping ceiling and timeout from
    /// config.
    pub fn with_remedies(mut self, remedies: Vec<Arc<dyn Remedy>>) -> Self {
        self.executor = ActionExecutor::new(
            remedies,
            self.config.actions.permission_ceiling,
            self.config.actions.action_timeout_secs,
            Arc::clone(&self.memory),
        );
        self
    }

    pub fn state(&self) -> &AwarenessState {
        &self.state
    }

    pub fn memory(&self) -> &Arc<MetricsMemory> {
        &self.memory
    }

    /// One tick under the configured deadline. A tick that overruns
    /// is abandoned; in-flight probe children die with their futures.
    pub async fn run_once(&mut self) -> Result<TickReport> {
        let deadline = Duration::from_secs(self.config.daemon.tick_deadline_secs);
        match timeout(deadline, self.tick()).await {
            Ok(report) => report,
            Err(_) => Err(anyhow!(
                "tick abandoned after {}s deadline",
                self.config.daemon.tick_deadline_secs
            )),
        }
    }

    /// The loop. Returns only after a shutdown signal, with the
    /// current state persisted.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = interval(Duration::from_secs(self.config.daemon.tick_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut purge_ticker = interval(Duration::from_secs(self.config.daemon.purge_interval_secs));
        purge_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // An interval fires immediately; a purge belongs later.
        purge_ticker.tick().await;

        info!(
            "Engine loop started (tick every {}s, deadline {}s)",
            self.config.daemon.tick_interval_secs, self.config.daemon.tick_deadline_secs
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) => debug!(
                            "Tick done: level {}, {} samples, {} anomalies",
                            report.level,
                            report.samples_recorded,
                            report.anomalous_metrics.len()
                        ),
                        Err(e) => warn!("Tick failed: {e:#}"),
                    }
                }
                _ = purge_ticker.tick() => {
                    match self.memory.purge(self.config.metrics.retention_days) {
                        Ok(stats) => info!(
                            "Purged {} samples, {} audit records, {} transitions",
                            stats.metrics, stats.audit, stats.transitions
                        ),
                        Err(e) => warn!("Purge failed: {e:#}"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("Shutdown requested, persisting state");
                    if let Err(e) = state_file::save(&self.config.daemon.state_file, &self.state) {
                        warn!("Could not persist state on shutdown: {e:#}");
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn tick(&mut self) -> Result<TickReport> {
        let (readings, scan_outcome) = self.collect().await;

        let mut signals = TickSignals::default();
        let mut recent_logs = Vec::new();
        let mut samples_recorded = 0usize;

        for reading in &readings {
            if let ProbeReading::LogTail(lines) = reading {
                recent_logs.extend(lines.iter().cloned());
            }
            for (metric, value) in reading.samples() {
                // Score against history first; the candidate must not
                // shift its own baseline.
                let score = self.memory.score(&metric, value, &self.config.metrics)?;
                if let AnomalyScore::Anomalous(detail) = &score {
                    warn!(
                        "Anomaly: {} = {:.2} (z {:.2}, baseline {:.2} ± {:.2})",
                        metric, value, detail.z_score, detail.mean, detail.std_dev
                    );
                    self.memory.append_audit(&AuditRecord::now(
                        AuditKind::AnomalyDetected,
                        format!(
                            "{metric} = {value:.2} scored z {:.2} against {:.2} ± {:.2}",
                            detail.z_score, detail.mean, detail.std_dev
                        ),
                        false,
                    ))?;
                    signals.anomalous_metrics.push(metric.clone());
                }
                if self.memory.record(&Sample::new(metric, value))? {
                    samples_recorded += 1;
                }
            }
        }

        if let Some(outcome) = &scan_outcome {
            if let IntegrityVerdict::Changed(changes) = &outcome.verdict {
                let description = outcome.verdict.describe();
                warn!("Integrity divergence: {}", description);
                self.memory.append_audit(&AuditRecord::now(
                    AuditKind::IntegrityDrift,
                    format!("fingerprint diverged: {description}"),
                    false,
                ))?;
                signals.integrity_changes = changes
                    .iter()
                    .map(|c| c.path.display().to_string())
                    .collect();
            }
        }

        // Analysis backends only get consulted once the engine is
        // already alert; below that the raw signals carry the tick.
        if self.state.level >= AwarenessLevel::Alert {
            let window = ChronoDuration::hours(self.config.metrics.window_hours as i64);
            let ctx = AnalysisContext {
                facts: SystemFacts::collect(),
                recent_logs,
                recent_metrics: self.memory.latest_values(window)?,
                anomalous_metrics: signals.anomalous_metrics.clone(),
            };
            let assessment = self.analysis.analyze(&ctx).await;
            info!(
                "Assessment from '{}': {} (severity {})",
                assessment.provider, assessment.summary, assessment.severity
            );
            signals.assessment_severity = Some(assessment.severity);
        }

        let evaluation = evaluate(&self.state, &signals, Utc::now(), &self.config.escalation);
        let transition = evaluation.transition;
        self.state = evaluation.state;

        if let Some(note) = &transition {
            info!("Awareness {} -> {} ({})", note.from, note.to, note.reason);
            self.memory.record_transition(
                &note.from.to_string(),
                &note.to.to_string(),
                &note.reason,
            )?;
            self.memory.append_audit(&AuditRecord::now(
                AuditKind::StateTransition,
                format!("{} -> {}: {}", note.from, note.to, note.reason),
                true,
            ))?;
        }
        state_file::save(&self.config.daemon.state_file, &self.state)?;

        if let Some(note) = &transition {
            if note.to == AwarenessLevel::Critical {
                self.remediate().await;
            }
        }

        Ok(TickReport {
            level: self.state.level,
            samples_recorded,
            anomalous_metrics: signals.anomalous_metrics,
            transition,
        })
    }

    /// Run all probes and the integrity scan concurrently, probes
    /// under the worker limit, and join everything before returning.
    /// The state machine never sees a partially collected tick.
    async fn collect(&self) -> (Vec<ProbeReading>, Option<ScanOutcome>) {
        let semaphore = Arc::new(Semaphore::new(self.config.daemon.worker_limit));
        let mut tasks = JoinSet::new();
        for probe in self.probes.clone() {
            let semaphore = Arc::clone(&semaphore);
            let timeout_secs = self.config.probes.timeout_secs;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                run_probe_or_default(&probe, timeout_secs).await
            });
        }

        let monitor = Arc::clone(&self.monitor);
        let scan = tokio::task::spawn_blocking(move || {
            monitor.lock().expect("integrity mutex poisoned").scan()
        });

        let mut readings = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(reading) => readings.push(reading),
                Err(e) => warn!("Probe task died: {e}"),
            }
        }

        let scan_outcome = match scan.await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) => {
                warn!("Integrity scan failed: {e:#}");
                None
            }
            Err(e) => {
                warn!("Integrity scan task died: {e}");
                None
            }
        };

        (readings, scan_outcome)
    }

    /// Entry to critical triggers the configured playbook, bounded by
    /// the same permission ceiling as any other action.
    async fn remediate(&self) {
        if self.config.actions.on_critical.is_empty() {
            info!("Critical reached, no remediation configured");
            return;
        }
        let specs: Vec<ActionSpec> = self
            .config
            .actions
            .on_critical
            .iter()
            .map(|step| ActionSpec {
                name: step.action.clone(),
                parameters: step.parameters.clone(),
            })
            .collect();
        warn!("Critical reached, running {}-step remediation", specs.len());

        match self
            .executor
            .run_sequence(&specs, self.config.actions.best_effort)
            .await
        {
            Ok(outcome) => match &outcome.halted_at {
                Some(step) => warn!("Remediation halted at '{}'", step),
                None => info!("Remediation completed ({} steps)", outcome.records.len()),
            },
            Err(e) => warn!("Remediation refused: {e}"),
        }
    }
}
