//! Machina daemon library - exposes modules for testing.

pub mod analysis;
pub mod awareness;
pub mod daemon;
pub mod executor;
pub mod integrity;
pub mod probe_runner;
pub mod probes;
