//! Stabilization Tracker
//!
//! Decides when a discovered file is safe to ingest and keeps the
//! time-bounded registry of content hashes used for deduplication.

mod descriptor;
mod errors;
mod probe;
mod tracker;

pub use descriptor::{content_hash, FileDescriptor};
pub use errors::{TrackerError, TrackerResult};
pub use probe::Prober;
pub use tracker::{
    Decision, EntryStatus, RegistryEntry, StabilizationTracker, Stabilized, TrackerConfig,
};
