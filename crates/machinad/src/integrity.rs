//! Filesystem integrity monitoring.
//!
//! Computes a content-addressed fingerprint over the configured
//! roots and compares it against the last accepted baseline. The
//! baseline is self-healing: a detected change is reported and then
//! adopted, so the monitor tracks drift without ever blocking it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Aggregate content-derived identifier for a configured file set.
///
/// `files` maps each regular file to its sha256; the aggregate hash
/// covers the lexicographically sorted (path, hash) pairs, so it is
/// order-independent at the file level and order-fixed at
/// aggregation. Fingerprints are only comparable when computed over
/// the same root set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub roots: Vec<PathBuf>,
    pub files: BTreeMap<PathBuf, String>,
    pub aggregate: String,
    pub computed_at: DateTime<Utc>,
}

/// How one path diverged from the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Outcome of comparing the current fingerprint to the baseline.
#[derive(Debug, Clone, PartialEq)]
pub enum IntegrityVerdict {
    Unchanged,
    Changed(Vec<FileChange>),
}

impl IntegrityVerdict {
    pub fn is_changed(&self) -> bool {
        matches!(self, IntegrityVerdict::Changed(_))
    }

    /// Affected paths, comma-separated, for reasons and audit text.
    pub fn describe(&self) -> String {
        match self {
            IntegrityVerdict::Unchanged => "unchanged".to_string(),
            IntegrityVerdict::Changed(changes) => changes
                .iter()
                .map(|c| c.path.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// Compute the fingerprint for the given roots. Symlinks are not
/// followed; unreadable files are skipped and returned separately as
/// soft warnings. The scan never aborts over a single bad file.
pub fn compute_fingerprint(roots: &[PathBuf]) -> (Fingerprint, Vec<PathBuf>) {
    let mut files = BTreeMap::new();
    let mut skipped = Vec::new();

    for root in roots {
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    if let Some(path) = e.path() {
                        skipped.push(path.to_path_buf());
                    }
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match hash_file(entry.path()) {
                Ok(digest) => {
                    files.insert(entry.path().to_path_buf(), digest);
                }
                Err(_) => skipped.push(entry.path().to_path_buf()),
            }
        }
    }

    // BTreeMap iteration is already path-sorted; hash the
    // concatenation of the sorted pairs.
    let mut hasher = Sha256::new();
    for (path, digest) in &files {
        hasher.update(path.as_os_str().as_encoded_bytes());
        hasher.update(b"\0");
        hasher.update(digest.as_bytes());
        hasher.update(b"\n");
    }
    let aggregate = hex::encode(hasher.finalize());

    let fingerprint = Fingerprint {
        roots: roots.to_vec(),
        files,
        aggregate,
        computed_at: Utc::now(),
    };
    (fingerprint, skipped)
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let content = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(hex::encode(hasher.finalize()))
}

/// Compare two fingerprints derived from the same root set.
pub fn compare(previous: &Fingerprint, current: &Fingerprint) -> IntegrityVerdict {
    if previous.aggregate == current.aggregate {
        return IntegrityVerdict::Unchanged;
    }

    let mut changes = Vec::new();
    for (path, digest) in &current.files {
        match previous.files.get(path) {
            None => changes.push(FileChange {
                path: path.clone(),
                kind: ChangeKind::Added,
            }),
            Some(old) if old != digest => changes.push(FileChange {
                path: path.clone(),
                kind: ChangeKind::Modified,
            }),
            Some(_) => {}
        }
    }
    for path in previous.files.keys() {
        if !current.files.contains_key(path) {
            changes.push(FileChange {
                path: path.clone(),
                kind: ChangeKind::Removed,
            });
        }
    }

    if changes.is_empty() {
        // Aggregates differed but the file maps agree; treat as
        // unchanged rather than inventing a diff.
        IntegrityVerdict::Unchanged
    } else {
        IntegrityVerdict::Changed(changes)
    }
}

/// Owns the baseline fingerprint and its persistence.
pub struct IntegrityMonitor {
    roots: Vec<PathBuf>,
    baseline_path: PathBuf,
    baseline: Option<Fingerprint>,
}

/// One scan's outcome: the verdict plus any unreadable paths.
#[derive(Debug)]
pub struct ScanOutcome {
    pub verdict: IntegrityVerdict,
    pub skipped: Vec<PathBuf>,
}

impl IntegrityMonitor {
    /// Load the persisted baseline if one exists. A baseline computed
    /// over a different root set is discarded; the next scan then
    /// re-baselines.
    pub fn new(roots: Vec<PathBuf>, baseline_path: PathBuf) -> Self {
        let baseline = Self::load_baseline(&baseline_path).filter(|b| {
            if b.roots == roots {
                true
            } else {
                info!("Integrity baseline covers different roots, discarding");
                false
            }
        });
        Self {
            roots,
            baseline_path,
            baseline,
        }
    }

    fn load_baseline(path: &Path) -> Option<Fingerprint> {
        let raw = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(fingerprint) => Some(fingerprint),
            Err(e) => {
                warn!("Unparseable integrity baseline {}: {}", path.display(), e);
                None
            }
        }
    }

    fn save_baseline(&self, fingerprint: &Fingerprint) -> Result<()> {
        if let Some(parent) = self.baseline_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating baseline dir {}", parent.display()))?;
        }
        let json = serde_json::to_string(fingerprint)?;
        let tmp = self.baseline_path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.baseline_path)
            .with_context(|| format!("persisting baseline {}", self.baseline_path.display()))?;
        Ok(())
    }

    /// Scan the configured roots and compare against the baseline.
    ///
    /// The first scan (no stored baseline) is baseline acceptance and
    /// reports `Unchanged`. Whatever the verdict, the fresh
    /// fingerprint becomes the new baseline.
    pub fn scan(&mut self) -> Result<ScanOutcome> {
        let (current, skipped) = compute_fingerprint(&self.roots);
        for path in &skipped {
            warn!("Integrity scan skipped unreadable {}", path.display());
        }

        let verdict = match &self.baseline {
            Some(previous) => compare(previous, &current),
            None => {
                info!(
                    "Accepting integrity baseline over {} files",
                    current.files.len()
                );
                IntegrityVerdict::Unchanged
            }
        };

        self.save_baseline(&current)?;
        self.baseline = Some(current);

        Ok(ScanOutcome { verdict, skipped })
    }

    pub fn baseline(&self) -> Option<&Fingerprint> {
        self.baseline.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn monitor_for(dir: &TempDir) -> IntegrityMonitor {
        IntegrityMonitor::new(
            vec![dir.path().join("watched")],
            dir.path().join("baseline.json"),
        )
    }

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join("watched").join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn identical_sets_fingerprint_identically() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.txt", "alpha");
        write(&dir, "b.txt", "beta");

        let roots = vec![dir.path().join("watched")];
        let (first, _) = compute_fingerprint(&roots);
        let (second, _) = compute_fingerprint(&roots);
        assert_eq!(first.aggregate, second.aggregate);
        assert_eq!(compare(&first, &second), IntegrityVerdict::Unchanged);
    }

    #[test]
    fn first_scan_is_baseline_acceptance() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.txt", "alpha");

        let mut monitor = monitor_for(&dir);
        let outcome = monitor.scan().unwrap();
        assert_eq!(outcome.verdict, IntegrityVerdict::Unchanged);
        assert!(monitor.baseline().is_some());
    }

    #[test]
    fn single_modification_names_exactly_that_path() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.txt", "alpha");
        let b = write(&dir, "b.txt", "beta");

        let mut monitor = monitor_for(&dir);
        monitor.scan().unwrap();

        fs::write(&b, "beta changed").unwrap();
        let outcome = monitor.scan().unwrap();
        match outcome.verdict {
            IntegrityVerdict::Changed(changes) => {
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].path, b);
                assert_eq!(changes[0].kind, ChangeKind::Modified);
            }
            other => panic!("expected change, got {other:?}"),
        }
    }

    #[test]
    fn additions_and_removals_are_reported() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.txt", "alpha");

        let mut monitor = monitor_for(&dir);
        monitor.scan().unwrap();

        fs::remove_file(&a).unwrap();
        let c = write(&dir, "c.txt", "gamma");
        let outcome = monitor.scan().unwrap();
        match outcome.verdict {
            IntegrityVerdict::Changed(changes) => {
                assert_eq!(changes.len(), 2);
                assert!(changes
                    .iter()
                    .any(|ch| ch.path == a && ch.kind == ChangeKind::Removed));
                assert!(changes
                    .iter()
                    .any(|ch| ch.path == c && ch.kind == ChangeKind::Added));
            }
            other => panic!("expected change, got {other:?}"),
        }
    }

    #[test]
    fn changed_fingerprint_becomes_new_baseline() {
        // A verified change is accepted, not rejected: the scan after
        // a divergence must report unchanged again.
        let dir = TempDir::new().unwrap();
        write(&dir, "a.txt", "alpha");
        let b = write(&dir, "b.txt", "beta");

        let mut monitor = monitor_for(&dir);
        monitor.scan().unwrap();

        fs::write(&b, "drifted").unwrap();
        assert!(monitor.scan().unwrap().verdict.is_changed());
        assert_eq!(monitor.scan().unwrap().verdict, IntegrityVerdict::Unchanged);
    }

    #[test]
    fn baseline_survives_restart() {
        let dir = TempDir::new().unwrap();
        let b = write(&dir, "b.txt", "beta");

        let mut monitor = monitor_for(&dir);
        monitor.scan().unwrap();
        drop(monitor);

        fs::write(&b, "changed while down").unwrap();
        let mut reloaded = monitor_for(&dir);
        let outcome = reloaded.scan().unwrap();
        assert!(outcome.verdict.is_changed());
    }

    #[test]
    fn different_roots_discard_baseline() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.txt", "alpha");

        let mut monitor = monitor_for(&dir);
        monitor.scan().unwrap();

        // Same baseline file, different root set: not comparable, so
        // the next scan re-baselines instead of diffing.
        let other_root = dir.path().join("elsewhere");
        fs::create_dir_all(&other_root).unwrap();
        let mut moved = IntegrityMonitor::new(vec![other_root], dir.path().join("baseline.json"));
        assert_eq!(moved.scan().unwrap().verdict, IntegrityVerdict::Unchanged);
    }

    #[test]
    fn verdict_describe_lists_paths() {
        let verdict = IntegrityVerdict::Changed(vec![FileChange {
            path: PathBuf::from("b.txt"),
            kind: ChangeKind::Modified,
        }]);
        assert_eq!(verdict.describe(), "b.txt");
    }
}
