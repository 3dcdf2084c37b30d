//! Permission-scoped action execution with audit and rollback.
//!
//! Consumers register remedies (name, permission level, execute,
//! optional rollback). The executor enforces the configured
//! permission ceiling, serializes mutating actions on one lock,
//! writes exactly one audit record per attempt before returning, and
//! can reverse an action that registered a rollback token.
//!
//! Refusals (unknown action, permission denied, bad rollback) are
//! errors; an attempted execution that fails is data — the returned
//! record carries `success = false` and the captured error.

use anyhow::{anyhow, Context};
use chrono::Utc;
use machina_common::store::MetricsMemory;
use machina_common::types::{ActionRecord, AuditKind, AuditRecord, PermissionLevel};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

/// Request to run one registered action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<(String, String)>,
}

impl ActionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push((key.into(), value.into()));
        self
    }
}

fn param<'a>(parameters: &'a [(String, String)], key: &str) -> Option<&'a str> {
    parameters
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// What a remedy hands back on success.
#[derive(Debug, Clone)]
pub struct RemedyOutput {
    pub output: String,
    /// Registered by mutating remedies that know how to undo
    /// themselves; opaque to everything but the remedy.
    pub rollback_token: Option<String>,
}

/// A registered remediation. `execute` and `rollback` are blocking;
/// the executor runs them on the blocking pool under a timeout.
pub trait Remedy: Send + Sync {
    fn name(&self) -> &str;

    fn permission(&self) -> PermissionLevel;

    fn execute(&self, parameters: &[(String, String)]) -> anyhow::Result<RemedyOutput>;

    /// Reverse a prior execution. Only called with a token this
    /// remedy registered.
    fn rollback(&self, _token: &str) -> anyhow::Result<String> {
        Err(anyhow!("remedy registered a token but no rollback"))
    }
}

/// Refusals and rollback failures.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("permission denied: '{action}' requires {required}, ceiling is {ceiling}")]
    PermissionDenied {
        action: String,
        required: PermissionLevel,
        ceiling: PermissionLevel,
    },

    #[error("action {0} registered no rollback token")]
    NotReversible(String),

    #[error("action {0} was already rolled back")]
    AlreadyRolledBack(String),

    #[error("no completed action with id '{0}'")]
    UnknownActionId(String),

    #[error("rollback of action {0} failed: {1}")]
    RollbackFailed(String, String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Outcome of a sequence run.
#[derive(Debug)]
pub struct SequenceOutcome {
    pub records: Vec<ActionRecord>,
    /// Name of the step the sequence halted on, strict mode only.
    pub halted_at: Option<String>,
}

impl SequenceOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.halted_at.is_none() && self.records.iter().all(|r| r.success)
    }
}

/// The action executor. One instance per daemon.
pub struct ActionExecutor {
    registry: HashMap<String, Arc<dyn Remedy>>,
    ceiling: PermissionLevel,
    timeout_secs: u64,
    memory: Arc<MetricsMemory>,
    /// Mutating actions never run concurrently; they are assumed
    /// non-commutative.
    mutation_lock: tokio::sync::Mutex<()>,
    completed: Mutex<HashMap<String, (ActionRecord, Arc<dyn Remedy>)>>,
}

impl ActionExecutor {
    pub fn new(
        remedies: Vec<Arc<dyn Remedy>>,
        ceiling: PermissionLevel,
        timeout_secs: u64,
        memory: Arc<MetricsMemory>,
    ) -> Self {
        let mut registry = HashMap::new();
        for remedy in remedies {
            registry.insert(remedy.name().to_string(), remedy);
        }
        Self {
            registry,
            ceiling,
            timeout_secs,
            memory,
            mutation_lock: tokio::sync::Mutex::new(()),
            completed: Mutex::new(HashMap::new()),
        }
    }

    pub fn ceiling(&self) -> PermissionLevel {
        self.ceiling
    }

    /// Execute one action. Exactly one audit record is written before
    /// this returns, whatever happened.
    pub async fn execute(&self, spec: &ActionSpec) -> Result<ActionRecord, ActionError> {
        let remedy = self
            .registry
            .get(&spec.name)
            .cloned()
            .ok_or_else(|| ActionError::UnknownAction(spec.name.clone()))?;

        let required = remedy.permission();
        if required > self.ceiling {
            // The denial is the only audit record this attempt makes.
            let denial = AuditRecord::now(
                AuditKind::ActionDenied,
                format!(
                    "refused '{}': requires {}, ceiling {}",
                    spec.name, required, self.ceiling
                ),
                false,
            );
            self.memory.append_audit(&denial)?;
            warn!(
                "Refused action '{}' ({} > ceiling {})",
                spec.name, required, self.ceiling
            );
            return Err(ActionError::PermissionDenied {
                action: spec.name.clone(),
                required,
                ceiling: self.ceiling,
            });
        }

        // Observe-level actions are read-only and commute; everything
        // else serializes.
        let _guard = if required > PermissionLevel::Observe {
            Some(self.mutation_lock.lock().await)
        } else {
            None
        };

        info!("Executing action '{}'", spec.name);
        let run_remedy = Arc::clone(&remedy);
        let parameters = spec.parameters.clone();
        let call = tokio::task::spawn_blocking(move || run_remedy.execute(&parameters));

        let result = match timeout(Duration::from_secs(self.timeout_secs), call).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(anyhow!("action task failed: {e}")),
            Err(_) => Err(anyhow!("timed out after {}s", self.timeout_secs)),
        };

        let id = format!("action_{}", uuid::Uuid::new_v4());
        let record = match result {
            Ok(output) => ActionRecord {
                id: id.clone(),
                name: spec.name.clone(),
                permission: required,
                parameters: spec.parameters.clone(),
                executed_at: Utc::now(),
                success: true,
                output: output.output,
                error: None,
                rollback_token: output.rollback_token,
                rolled_back: false,
            },
            Err(e) => ActionRecord {
                id: id.clone(),
                name: spec.name.clone(),
                permission: required,
                parameters: spec.parameters.clone(),
                executed_at: Utc::now(),
                success: false,
                output: String::new(),
                error: Some(e.to_string()),
                rollback_token: None,
                rolled_back: false,
            },
        };

        // Audit-before-return: a crash after this line cannot lose
        // the trace of an executed action.
        let audit = AuditRecord::now(
            AuditKind::ActionExecuted,
            format!(
                "'{}' {}",
                record.name,
                if record.success {
                    "succeeded".to_string()
                } else {
                    format!("failed: {}", record.error.as_deref().unwrap_or("unknown"))
                }
            ),
            record.success,
        )
        .for_action(&id);
        self.memory.append_audit(&audit)?;

        self.completed
            .lock()
            .expect("executor mutex poisoned")
            .insert(id, (record.clone(), remedy));

        Ok(record)
    }

    /// Reverse a completed action. Defined only for actions that
    /// registered a rollback token.
    pub async fn rollback(&self, action_id: &str) -> Result<ActionRecord, ActionError> {
        let (record, remedy) = {
            let completed = self.completed.lock().expect("executor mutex poisoned");
            completed
                .get(action_id)
                .cloned()
                .ok_or_else(|| ActionError::UnknownActionId(action_id.to_string()))?
        };

        if record.rolled_back {
            return Err(ActionError::AlreadyRolledBack(action_id.to_string()));
        }
        let token = record
            .rollback_token
            .clone()
            .ok_or_else(|| ActionError::NotReversible(action_id.to_string()))?;

        let _guard = self.mutation_lock.lock().await;

        info!("Rolling back action {} ('{}')", action_id, record.name);
        let call_remedy = Arc::clone(&remedy);
        let call = tokio::task::spawn_blocking(move || call_remedy.rollback(&token));
        let result = match timeout(Duration::from_secs(self.timeout_secs), call).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(anyhow!("rollback task failed: {e}")),
            Err(_) => Err(anyhow!("rollback timed out after {}s", self.timeout_secs)),
        };

        match result {
            Ok(detail) => {
                let audit = AuditRecord::now(
                    AuditKind::ActionRolledBack,
                    format!("rolled back '{}': {}", record.name, detail),
                    true,
                )
                .for_action(action_id);
                self.memory.append_audit(&audit)?;

                let mut completed = self.completed.lock().expect("executor mutex poisoned");
                let updated = if let Some((stored, _)) = completed.get_mut(action_id) {
                    stored.rolled_back = true;
                    stored.clone()
                } else {
                    record
                };
                Ok(updated)
            }
            Err(e) => {
                let audit = AuditRecord::now(
                    AuditKind::ActionRolledBack,
                    format!("rollback of '{}' failed: {}", record.name, e),
                    false,
                )
                .for_action(action_id);
                self.memory.append_audit(&audit)?;
                Err(ActionError::RollbackFailed(
                    action_id.to_string(),
                    e.to_string(),
                ))
            }
        }
    }

    /// Run a sequence left to right. Strict mode halts on the first
    /// failure; best-effort records failures and keeps going.
    /// Refusals (unknown action, permission denied) halt either way —
    /// a sequence built on actions it may not run is misconfigured.
    pub async fn run_sequence(
        &self,
        specs: &[ActionSpec],
        best_effort: bool,
    ) -> Result<SequenceOutcome, ActionError> {
        let mut records = Vec::new();
        for spec in specs {
            let record = self.execute(spec).await?;
            let failed = !record.success;
            records.push(record);
            if failed && !best_effort {
                warn!("Sequence halted at '{}'", spec.name);
                return Ok(SequenceOutcome {
                    records,
                    halted_at: Some(spec.name.clone()),
                });
            }
        }
        Ok(SequenceOutcome {
            records,
            halted_at: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Built-in remedies
// ---------------------------------------------------------------------------

fn check_param_value(value: &str) -> anyhow::Result<()> {
    let ok = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_.:/@+-".contains(c));
    if ok {
        Ok(())
    } else {
        Err(anyhow!("unsafe parameter value {value:?}"))
    }
}

/// Remedy wrapping a shell command with `{param}` substitution.
/// Parameter values are restricted to a safe character set before
/// they reach the shell.
pub struct CommandRemedy {
    name: String,
    permission: PermissionLevel,
    template: String,
}

impl CommandRemedy {
    pub fn new(
        name: impl Into<String>,
        permission: PermissionLevel,
        template: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            permission,
            template: template.into(),
        }
    }
}

impl Remedy for CommandRemedy {
    fn name(&self) -> &str {
        &self.name
    }

    fn permission(&self) -> PermissionLevel {
        self.permission
    }

    fn execute(&self, parameters: &[(String, String)]) -> anyhow::Result<RemedyOutput> {
        let mut command = self.template.clone();
        for (key, value) in parameters {
            let placeholder = format!("{{{key}}}");
            if command.contains(&placeholder) {
                check_param_value(value)?;
                command = command.replace(&placeholder, value);
            }
        }
        if command.contains('{') && command.contains('}') {
            return Err(anyhow!("unresolved parameter in command {command:?}"));
        }

        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .output()
            .with_context(|| format!("spawning '{command}'"))?;

        if output.status.success() {
            Ok(RemedyOutput {
                output: String::from_utf8_lossy(&output.stdout).to_string(),
                rollback_token: None,
            })
        } else {
            Err(anyhow!(
                "'{}' exited {:?}: {}",
                command,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

#[derive(Serialize, Deserialize)]
struct TruncateToken {
    backup: PathBuf,
    original: PathBuf,
}

/// Truncates a runaway log file after snapshotting it into the
/// rollback directory; the snapshot path doubles as the rollback
/// token, so the truncation can be undone.
pub struct TruncateLogRemedy {
    rollback_dir: PathBuf,
}

impl TruncateLogRemedy {
    pub fn new(rollback_dir: PathBuf) -> Self {
        Self { rollback_dir }
    }
}

impl Remedy for TruncateLogRemedy {
    fn name(&self) -> &str {
        "truncate_log"
    }

    fn permission(&self) -> PermissionLevel {
        PermissionLevel::Clean
    }

    fn execute(&self, parameters: &[(String, String)]) -> anyhow::Result<RemedyOutput> {
        let path = param(parameters, "path").ok_or_else(|| anyhow!("missing 'path' parameter"))?;
        let original = PathBuf::from(path);
        if !original.is_file() {
            return Err(anyhow!("{} is not a regular file", original.display()));
        }

        std::fs::create_dir_all(&self.rollback_dir)
            .with_context(|| format!("creating {}", self.rollback_dir.display()))?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let file_name = original
            .file_name()
            .ok_or_else(|| anyhow!("{} has no file name", original.display()))?;
        let backup = self
            .rollback_dir
            .join(format!("{}.{stamp}.bak", file_name.to_string_lossy()));

        let bytes = std::fs::copy(&original, &backup)
            .with_context(|| format!("backing up {}", original.display()))?;
        std::fs::write(&original, b"")
            .with_context(|| format!("truncating {}", original.display()))?;

        let token = serde_json::to_string(&TruncateToken { backup, original })?;
        Ok(RemedyOutput {
            output: format!("truncated {path} ({bytes} bytes backed up)"),
            rollback_token: Some(token),
        })
    }

    fn rollback(&self, token: &str) -> anyhow::Result<String> {
        let token: TruncateToken = serde_json::from_str(token).context("bad rollback token")?;
        std::fs::copy(&token.backup, &token.original)
            .with_context(|| format!("restoring {}", token.original.display()))?;
        Ok(format!(
            "restored {} from {}",
            token.original.display(),
            token.backup.display()
        ))
    }
}

/// The default action catalog, mirroring the original remediation
/// set. Consumers can register more through `ActionExecutor::new`.
pub fn default_remedies(rollback_dir: PathBuf) -> Vec<Arc<dyn Remedy>> {
    vec![
        Arc::new(CommandRemedy::new(
            "check_service",
            PermissionLevel::Observe,
            "systemctl status {service} --no-pager",
        )),
        Arc::new(CommandRemedy::new(
            "restart_service",
            PermissionLevel::Restart,
            "systemctl restart {service}",
        )),
        Arc::new(CommandRemedy::new(
            "clean_temp_files",
            PermissionLevel::Clean,
            "find {directory} -type f -mtime +{max_age_days} -delete -print",
        )),
        Arc::new(TruncateLogRemedy::new(rollback_dir)),
    ]
}
