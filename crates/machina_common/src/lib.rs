//! Shared types and persistence for the Machina engine.
//!
//! Everything the daemon and the operator CLI both need lives here:
//! the data model, the typed configuration, the awareness state file,
//! and the SQLite store for metrics, audit records and state history.

pub mod config;
pub mod state_file;
pub mod store;
pub mod types;

pub use config::Config;
pub use types::{
    AnomalyScore, Assessment, AuditKind, AuditRecord, AwarenessLevel, AwarenessState,
    PermissionLevel, Sample, Severity,
};

/// Crate version, stamped into status output and audit records.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
