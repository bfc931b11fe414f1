//! Metrics registry for lrledger
//!
//! - Counters only
//! - Monotonic increase, reset only on process start
//! - Lock-free increments

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-process ingestion counters.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    files_discovered: AtomicU64,
    files_completed: AtomicU64,
    files_rejected: AtomicU64,
    files_failed: AtomicU64,
    files_skipped: AtomicU64,
    reservations_issued: AtomicU64,
    identifiers_issued: AtomicU64,
    identifiers_released: AtomicU64,
    batches_committed: AtomicU64,
    commit_retries: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_files_discovered(&self) {
        self.files_discovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_files_completed(&self) {
        self.files_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_files_rejected(&self) {
        self.files_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_files_failed(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_files_skipped(&self) {
        self.files_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one reservation of `width` identifiers
    pub fn record_reservation(&self, width: u64) {
        self.reservations_issued.fetch_add(1, Ordering::Relaxed);
        self.identifiers_issued.fetch_add(width, Ordering::Relaxed);
    }

    pub fn add_identifiers_released(&self, width: u64) {
        self.identifiers_released.fetch_add(width, Ordering::Relaxed);
    }

    pub fn increment_batches_committed(&self) {
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_commit_retries(&self) {
        self.commit_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            files_discovered: self.files_discovered.load(Ordering::Relaxed),
            files_completed: self.files_completed.load(Ordering::Relaxed),
            files_rejected: self.files_rejected.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            files_skipped: self.files_skipped.load(Ordering::Relaxed),
            reservations_issued: self.reservations_issued.load(Ordering::Relaxed),
            identifiers_issued: self.identifiers_issued.load(Ordering::Relaxed),
            identifiers_released: self.identifiers_released.load(Ordering::Relaxed),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            commit_retries: self.commit_retries.load(Ordering::Relaxed),
        }
    }

    /// Snapshot as a JSON object
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub files_discovered: u64,
    pub files_completed: u64,
    pub files_rejected: u64,
    pub files_failed: u64,
    pub files_skipped: u64,
    pub reservations_issued: u64,
    pub identifiers_issued: u64,
    pub identifiers_released: u64,
    pub batches_committed: u64,
    pub commit_retries: u64,
}
