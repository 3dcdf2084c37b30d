//! The escalation state machine.
//!
//! One pure transition function evaluates the joined signals of a
//! tick against the current awareness state and returns the next
//! state plus, when something moved, a note for the audit trail.
//! Keeping it free of I/O makes every transition deterministic under
//! test; the daemon owns persistence.
//!
//! Ladder: dormant < aware < alert < critical.
//! - Escalate one level on a triggering signal for that level.
//! - A highest-severity assessment jumps straight to critical; no
//!   other transition skips a level.
//! - A triggering signal at the current ceiling refreshes the TTL
//!   instead, so a sustained incident is not lost to decay.
//! - Decay one level once the TTL elapses with no fresh signal.

use chrono::{DateTime, Utc};
use machina_common::config::EscalationConfig;
use machina_common::types::{AwarenessLevel, AwarenessState, Severity};

/// Joined, complete signals of one tick. The state machine never
/// sees a partial tick.
#[derive(Debug, Clone, Default)]
pub struct TickSignals {
    /// Metrics whose current sample scored anomalous.
    pub anomalous_metrics: Vec<String>,
    /// Paths the integrity monitor reported as diverged; empty means
    /// the fingerprint was unchanged.
    pub integrity_changes: Vec<String>,
    /// Severity of this tick's assessment, when analysis ran.
    pub assessment_severity: Option<Severity>,
}

impl TickSignals {
    fn integrity_reason(&self) -> Option<String> {
        if self.integrity_changes.is_empty() {
            None
        } else {
            Some(format!(
                "integrity divergence: {}",
                self.integrity_changes.join(", ")
            ))
        }
    }

    fn anomaly_reason(&self) -> Option<String> {
        if self.anomalous_metrics.is_empty() {
            None
        } else {
            Some(format!(
                "metric anomaly: {}",
                self.anomalous_metrics.join(", ")
            ))
        }
    }

    fn severity_reason(&self, at_least: Severity) -> Option<String> {
        self.assessment_severity
            .filter(|s| *s >= at_least)
            .map(|s| format!("assessment severity {s}"))
    }

    /// The signal (if any) that exceeds the given level's threshold,
    /// i.e. justifies escalating out of it.
    fn trigger_for(&self, level: AwarenessLevel) -> Option<String> {
        match level {
            // Anything at all wakes a dormant engine.
            AwarenessLevel::Dormant => self
                .integrity_reason()
                .or_else(|| self.anomaly_reason())
                .or_else(|| self.severity_reason(Severity::Medium)),
            // Aware needs a hard signal: divergence or anomaly.
            AwarenessLevel::Aware => self
                .integrity_reason()
                .or_else(|| self.anomaly_reason())
                .or_else(|| self.severity_reason(Severity::High)),
            // Alert only rises on a high-severity assessment.
            AwarenessLevel::Alert => self.severity_reason(Severity::High),
            AwarenessLevel::Critical => None,
        }
    }

    /// Any signal at all; used to keep the TTL of the current level
    /// alive during a sustained incident.
    fn any_signal(&self) -> Option<String> {
        self.integrity_reason()
            .or_else(|| self.anomaly_reason())
            .or_else(|| self.severity_reason(Severity::Medium))
    }
}

/// Audit-trail note describing a transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionNote {
    pub from: AwarenessLevel,
    pub to: AwarenessLevel,
    pub reason: String,
}

/// Result of one evaluation: the (possibly unchanged) state and the
/// transition, if one happened.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub state: AwarenessState,
    pub transition: Option<TransitionNote>,
}

fn enter(level: AwarenessLevel, reason: String, now: DateTime<Utc>, cfg: &EscalationConfig) -> AwarenessState {
    AwarenessState {
        level,
        entered_at: now,
        ttl_secs: cfg.ttl_for(level),
        reason,
    }
}

/// Evaluate one tick. Called exactly once per tick with the joined
/// signals.
pub fn evaluate(
    current: &AwarenessState,
    signals: &TickSignals,
    now: DateTime<Utc>,
    cfg: &EscalationConfig,
) -> Evaluation {
    // Highest severity overrides the one-level rule.
    if signals.assessment_severity == Some(Severity::Critical)
        && current.level < AwarenessLevel::Critical
    {
        let reason = "assessment severity CRITICAL".to_string();
        let state = enter(AwarenessLevel::Critical, reason.clone(), now, cfg);
        return Evaluation {
            transition: Some(TransitionNote {
                from: current.level,
                to: AwarenessLevel::Critical,
                reason,
            }),
            state,
        };
    }

    if let Some(reason) = signals.trigger_for(current.level) {
        let to = current.level.escalated();
        let state = enter(to, reason.clone(), now, cfg);
        return Evaluation {
            transition: Some(TransitionNote {
                from: current.level,
                to,
                reason,
            }),
            state,
        };
    }

    // No escalation. A signal below the escalation threshold still
    // counts as activity: refresh the TTL so the incident is not
    // decayed away mid-stream.
    if current.level > AwarenessLevel::Dormant {
        if let Some(reason) = signals.any_signal() {
            let mut state = current.clone();
            state.entered_at = now;
            state.reason = reason;
            return Evaluation {
                state,
                transition: None,
            };
        }
    }

    // Quiet tick: decay once the TTL has fully elapsed.
    if current.level > AwarenessLevel::Dormant && current.expired(now) {
        let to = current.level.decayed();
        let reason = format!("ttl elapsed with no new signal at {}", current.level);
        let state = enter(to, reason.clone(), now, cfg);
        return Evaluation {
            transition: Some(TransitionNote {
                from: current.level,
                to,
                reason,
            }),
            state,
        };
    }

    Evaluation {
        state: current.clone(),
        transition: None,
    }
}

/// State to resume with after a restart: the persisted record, unless
/// its TTL already ran out while the daemon was down.
pub fn resume_state(
    persisted: Option<AwarenessState>,
    now: DateTime<Utc>,
    cfg: &EscalationConfig,
) -> AwarenessState {
    match persisted {
        Some(state) if !state.expired(now) => state,
        Some(state) => {
            tracing::info!(
                "Persisted {} state expired while down, starting dormant",
                state.level
            );
            AwarenessState::dormant(cfg.ttl_for(AwarenessLevel::Dormant))
        }
        None => AwarenessState::dormant(cfg.ttl_for(AwarenessLevel::Dormant)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn cfg() -> EscalationConfig {
        EscalationConfig {
            aware_ttl_secs: 600,
            alert_ttl_secs: 300,
            critical_ttl_secs: 120,
        }
    }

    fn dormant() -> AwarenessState {
        AwarenessState::dormant(600)
    }

    fn at(level: AwarenessLevel, entered_secs_ago: i64, ttl: u64) -> AwarenessState {
        AwarenessState {
            level,
            entered_at: Utc::now() - Duration::seconds(entered_secs_ago),
            ttl_secs: ttl,
            reason: "test".to_string(),
        }
    }

    #[test]
    fn quiet_tick_does_not_escalate() {
        let eval = evaluate(&dormant(), &TickSignals::default(), Utc::now(), &cfg());
        assert_eq!(eval.state.level, AwarenessLevel::Dormant);
        assert!(eval.transition.is_none());
    }

    #[test]
    fn integrity_divergence_escalates_with_path_in_reason() {
        let signals = TickSignals {
            integrity_changes: vec!["b.txt".to_string()],
            ..Default::default()
        };
        let eval = evaluate(&dormant(), &signals, Utc::now(), &cfg());
        assert_eq!(eval.state.level, AwarenessLevel::Aware);
        let note = eval.transition.unwrap();
        assert_eq!(note.reason, "integrity divergence: b.txt");
    }

    #[test]
    fn anomaly_escalates_one_level_per_tick() {
        let signals = TickSignals {
            anomalous_metrics: vec!["cpu_percent".to_string()],
            ..Default::default()
        };
        let now = Utc::now();

        let first = evaluate(&dormant(), &signals, now, &cfg());
        assert_eq!(first.state.level, AwarenessLevel::Aware);

        let second = evaluate(&first.state, &signals, now, &cfg());
        assert_eq!(second.state.level, AwarenessLevel::Alert);

        // An anomaly alone never lifts alert to critical.
        let third = evaluate(&second.state, &signals, now, &cfg());
        assert_eq!(third.state.level, AwarenessLevel::Alert);
        assert!(third.transition.is_none());
    }

    #[test]
    fn critical_assessment_jumps_directly() {
        let signals = TickSignals {
            assessment_severity: Some(Severity::Critical),
            ..Default::default()
        };
        let eval = evaluate(&dormant(), &signals, Utc::now(), &cfg());
        assert_eq!(eval.state.level, AwarenessLevel::Critical);
        let note = eval.transition.unwrap();
        assert_eq!(note.from, AwarenessLevel::Dormant);
        assert_eq!(note.reason, "assessment severity CRITICAL");
    }

    #[test]
    fn high_severity_lifts_alert_to_critical() {
        let state = at(AwarenessLevel::Alert, 10, 300);
        let signals = TickSignals {
            assessment_severity: Some(Severity::High),
            ..Default::default()
        };
        let eval = evaluate(&state, &signals, Utc::now(), &cfg());
        assert_eq!(eval.state.level, AwarenessLevel::Critical);
    }

    #[test]
    fn sustained_signal_refreshes_ttl() {
        // Entered alert long ago; TTL would have expired, but the
        // anomaly is still arriving, so the state holds and the clock
        // restarts.
        let state = at(AwarenessLevel::Alert, 10_000, 300);
        let signals = TickSignals {
            anomalous_metrics: vec!["open_ports".to_string()],
            ..Default::default()
        };
        let now = Utc::now();
        let eval = evaluate(&state, &signals, now, &cfg());
        assert_eq!(eval.state.level, AwarenessLevel::Alert);
        assert!(eval.transition.is_none());
        assert_eq!(eval.state.entered_at, now);
        assert!(!eval.state.expired(now));
    }

    #[test]
    fn ttl_expiry_decays_one_level() {
        let state = at(AwarenessLevel::Alert, 10_000, 300);
        let eval = evaluate(&state, &TickSignals::default(), Utc::now(), &cfg());
        assert_eq!(eval.state.level, AwarenessLevel::Aware);
        let note = eval.transition.unwrap();
        assert_eq!(note.from, AwarenessLevel::Alert);
        assert_eq!(note.to, AwarenessLevel::Aware);
    }

    #[test]
    fn unexpired_ttl_holds_the_level() {
        let state = at(AwarenessLevel::Aware, 10, 600);
        let eval = evaluate(&state, &TickSignals::default(), Utc::now(), &cfg());
        assert_eq!(eval.state.level, AwarenessLevel::Aware);
        assert!(eval.transition.is_none());
    }

    #[test]
    fn dormant_is_reachable_from_critical_by_decay() {
        let quiet = TickSignals::default();
        let mut state = at(AwarenessLevel::Critical, 10_000, 120);
        let mut levels = Vec::new();
        for _ in 0..3 {
            // Back-date each level so its TTL has elapsed.
            state.entered_at = Utc::now() - Duration::seconds(10_000);
            let eval = evaluate(&state, &quiet, Utc::now(), &cfg());
            state = eval.state;
            levels.push(state.level);
        }
        assert_eq!(
            levels,
            vec![
                AwarenessLevel::Alert,
                AwarenessLevel::Aware,
                AwarenessLevel::Dormant
            ]
        );
    }

    #[test]
    fn resume_keeps_live_state_and_drops_expired() {
        let live = at(AwarenessLevel::Alert, 10, 300);
        let resumed = resume_state(Some(live.clone()), Utc::now(), &cfg());
        assert_eq!(resumed, live);

        let stale = at(AwarenessLevel::Alert, 10_000, 300);
        let resumed = resume_state(Some(stale), Utc::now(), &cfg());
        assert_eq!(resumed.level, AwarenessLevel::Dormant);

        let fresh = resume_state(None, Utc::now(), &cfg());
        assert_eq!(fresh.level, AwarenessLevel::Dormant);
    }

    #[test]
    fn spike_then_quiet_scenario() {
        // 95% CPU on a 20±5 stream escalates; three quiet ticks later,
        // with TTL elapsed, the state decays back down.
        let cfg = cfg();
        let spike = TickSignals {
            anomalous_metrics: vec!["cpu_percent".to_string()],
            ..Default::default()
        };
        let quiet = TickSignals::default();

        let t0 = Utc::now();
        let eval = evaluate(&at(AwarenessLevel::Aware, 5, 600), &spike, t0, &cfg);
        assert_eq!(eval.state.level, AwarenessLevel::Alert);

        // Quiet ticks inside the TTL hold the level.
        let mut state = eval.state;
        for secs in [60, 120, 180] {
            let now = t0 + Duration::seconds(secs);
            let eval = evaluate(&state, &quiet, now, &cfg);
            assert_eq!(eval.state.level, AwarenessLevel::Alert);
            state = eval.state;
        }

        // Past the TTL the alert decays to aware.
        let eval = evaluate(&state, &quiet, t0 + Duration::seconds(301), &cfg);
        assert_eq!(eval.state.level, AwarenessLevel::Aware);
    }
}
