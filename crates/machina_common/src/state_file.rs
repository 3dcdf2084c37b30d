//! Awareness state file persistence.
//!
//! The state machine survives restarts through a small JSON document
//! `{state, entered_at, ttl, reason}` that external tooling (and
//! `machinactl status`) can read directly. Writes go through a temp
//! file plus rename so a crash never leaves a torn state file.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::types::AwarenessState;

/// Read the persisted awareness state. Returns `None` when the file
/// is absent or unparseable; a corrupt state file is logged and
/// treated like a fresh start rather than an error.
pub fn load(path: &Path) -> Option<AwarenessState> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!("Unparseable state file {}: {}", path.display(), e);
            None
        }
    }
}

/// Persist the awareness state atomically.
pub fn save(path: &Path, state: &AwarenessState) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating state dir {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AwarenessLevel;
    use tempfile::TempDir;

    #[test]
    fn round_trips_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let mut state = AwarenessState::dormant(600);
        state.level = AwarenessLevel::Alert;
        state.reason = "integrity divergence: b.txt".to_string();

        save(&path, &state).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn missing_file_is_none() {
        assert!(load(Path::new("/nonexistent/state.json")).is_none());
    }

    #[test]
    fn corrupt_file_is_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();
        assert!(load(&path).is_none());
    }

    #[test]
    fn schema_is_stable_for_external_tools() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        save(&path, &AwarenessState::dormant(60)).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["level"], "dormant");
        assert!(value["entered_at"].is_string());
        assert!(value["ttl_secs"].is_u64());
        assert!(value["reason"].is_string());
    }
}
