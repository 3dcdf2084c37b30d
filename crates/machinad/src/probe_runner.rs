//! Probe execution with hard timeouts.
//!
//! A probe failure is never fatal to the tick: the caller substitutes
//! the probe's fallback reading and moves on.

use std::process::Stdio;
use std::time::Instant;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use crate::probes::{Probe, ProbeReading};

/// Why a probe yielded no usable reading.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe '{id}' timed out after {secs}s")]
    Timeout { id: String, secs: u64 },

    #[error("probe '{id}' failed (exit {code:?}): {stderr}")]
    ExecFailed {
        id: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("probe '{id}' output unparseable: {message}")]
    ParseFailed { id: String, message: String },
}

/// Run one probe under its timeout and parse the output.
///
/// The child is spawned through `sh -c` so probe commands may use
/// pipes, and is killed if the future is cancelled or the timeout
/// fires.
pub async fn run_probe(probe: &Probe, timeout_secs: u64) -> Result<ProbeReading, ProbeError> {
    let started = Instant::now();

    let child = Command::new("sh")
        .arg("-c")
        .arg(&probe.command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match timeout(Duration::from_secs(timeout_secs), child).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(ProbeError::ExecFailed {
                id: probe.id.clone(),
                code: None,
                stderr: e.to_string(),
            });
        }
        Err(_) => {
            warn!("Probe '{}' timed out after {}s", probe.id, timeout_secs);
            return Err(ProbeError::Timeout {
                id: probe.id.clone(),
                secs: timeout_secs,
            });
        }
    };

    if !output.status.success() {
        return Err(ProbeError::ExecFailed {
            id: probe.id.clone(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let reading = (probe.parser)(&stdout).map_err(|message| ProbeError::ParseFailed {
        id: probe.id.clone(),
        message,
    })?;

    debug!(
        "Probe '{}' completed in {}ms",
        probe.id,
        started.elapsed().as_millis()
    );
    Ok(reading)
}

/// Run a probe, substituting its fallback on any failure. The error
/// is logged, not propagated; one broken probe must not halt a tick.
pub async fn run_probe_or_default(probe: &Probe, timeout_secs: u64) -> ProbeReading {
    match run_probe(probe, timeout_secs).await {
        Ok(reading) => reading,
        Err(e) => {
            warn!("Substituting default for probe '{}': {}", probe.id, e);
            (probe.fallback)()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::parse_loadavg;

    fn echo_probe(command: &str) -> Probe {
        Probe::new("test_probe", command, parse_loadavg, || {
            ProbeReading::Metrics(vec![("cpu_load_1m".to_string(), 0.0)])
        })
    }

    #[tokio::test]
    async fn runs_and_parses() {
        let probe = echo_probe("echo '0.10 0.20 0.30 1/100 42'");
        let reading = run_probe(&probe, 5).await.unwrap();
        match reading {
            ProbeReading::Metrics(m) => assert_eq!(m[1], ("cpu_load_5m".to_string(), 0.20)),
            other => panic!("unexpected reading {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let probe = echo_probe("sleep 5");
        let err = run_probe(&probe, 1).await.unwrap_err();
        assert!(matches!(err, ProbeError::Timeout { .. }));
    }

    #[tokio::test]
    async fn nonzero_exit_is_exec_failed() {
        let probe = echo_probe("exit 3");
        let err = run_probe(&probe, 5).await.unwrap_err();
        match err {
            ProbeError::ExecFailed { code, .. } => assert_eq!(code, Some(3)),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_output_is_parse_failed() {
        let probe = echo_probe("echo 'not numbers here'");
        let err = run_probe(&probe, 5).await.unwrap_err();
        assert!(matches!(err, ProbeError::ParseFailed { .. }));
    }

    #[tokio::test]
    async fn fallback_substitutes_on_failure() {
        let probe = echo_probe("exit 1");
        let reading = run_probe_or_default(&probe, 5).await;
        assert_eq!(reading.samples(), vec![("cpu_load_1m".to_string(), 0.0)]);
    }
}
