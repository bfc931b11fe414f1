//! Stabilization Tracker - file readiness and content deduplication
//!
//! - A file is ready once two observations at least one interval apart agree
//!   on size and content hash
//! - An observation taken before the interval elapsed never replaces the
//!   reference observation
//! - A content hash already registered (in flight, completed or failed, and
//!   inside the retention window) makes the file a duplicate
//! - Settled entries are pruned once retention expires; in-flight entries
//!   are never pruned

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::observability::{log_event_with_fields, Event};
use crate::retry::RetryPolicy;

use super::descriptor::FileDescriptor;
use super::errors::{TrackerError, TrackerResult};
use super::probe::Prober;

/// Outcome of one observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Not stable yet; observe again after the interval
    Wait,
    /// Same content as a registered file
    Duplicate { original: PathBuf },
    /// Stable and unique; the hash is now registered in flight
    Ready(FileDescriptor),
}

/// Outcome of driving a path to a decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stabilized {
    Ready(FileDescriptor),
    Duplicate {
        descriptor: FileDescriptor,
        original: PathBuf,
    },
    /// The file disappeared while stabilizing
    Vanished,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    InFlight,
    Completed,
    Failed,
}

/// A registered content hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryEntry {
    pub content_hash: String,
    pub path: PathBuf,
    pub status: EntryStatus,
    pub registered_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl RegistryEntry {
    fn is_live(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        match self.settled_at {
            None => true,
            Some(settled) => now - settled <= retention,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Minimum spacing of two agreeing observations
    pub interval: Duration,
    /// Give up on a file that has not stabilized this long after first seen
    pub timeout: Duration,
    /// How long settled hashes keep matching duplicates
    pub retention: Duration,
    /// Read retry for unreadable files
    pub probe: RetryPolicy,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(300),
            retention: Duration::from_secs(24 * 60 * 60),
            probe: RetryPolicy::new(5, Duration::from_millis(500), Duration::from_secs(10)),
        }
    }
}

#[derive(Default)]
struct Registry {
    /// Reference observation per path still stabilizing
    pending: HashMap<PathBuf, FileDescriptor>,
    /// Registered content hashes
    seen: HashMap<String, RegistryEntry>,
}

pub struct StabilizationTracker {
    config: TrackerConfig,
    prober: Prober,
    registry: Mutex<Registry>,
}

impl StabilizationTracker {
    pub fn new(config: TrackerConfig) -> Self {
        let prober = Prober::new(config.probe);
        Self {
            config,
            prober,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Judge one observation against the reference for its path.
    pub fn observe(&self, observation: FileDescriptor) -> TrackerResult<Decision> {
        let now = observation.last_seen;
        let retention = to_chrono(self.config.retention);
        let mut registry = self.lock()?;

        if let Some(entry) = registry.seen.get(&observation.content_hash) {
            if entry.is_live(now, retention) {
                let original = entry.path.clone();
                registry.pending.remove(&observation.path);
                log_event_with_fields(
                    Event::FileDuplicate,
                    &[
                        ("path", &observation.path.display().to_string()),
                        ("original", &original.display().to_string()),
                        ("content_hash", &observation.content_hash),
                    ],
                );
                return Ok(Decision::Duplicate { original });
            }
        }

        let reference = match registry.pending.get(&observation.path) {
            Some(reference) => reference.clone(),
            None => {
                registry.pending.insert(observation.path.clone(), observation);
                return Ok(Decision::Wait);
            }
        };

        let interval_elapsed = now - reference.last_seen >= to_chrono(self.config.interval);
        if interval_elapsed && observation.agrees_with(&reference) {
            registry.pending.remove(&observation.path);
            let ready = FileDescriptor {
                first_seen: reference.first_seen,
                ..observation
            };
            registry.seen.insert(
                ready.content_hash.clone(),
                RegistryEntry {
                    content_hash: ready.content_hash.clone(),
                    path: ready.path.clone(),
                    status: EntryStatus::InFlight,
                    registered_at: now,
                    settled_at: None,
                },
            );
            log_event_with_fields(
                Event::FileReady,
                &[
                    ("path", &ready.path.display().to_string()),
                    ("size", &ready.size.to_string()),
                    ("content_hash", &ready.content_hash),
                ],
            );
            return Ok(Decision::Ready(ready));
        }

        if now - reference.first_seen > to_chrono(self.config.timeout) {
            registry.pending.remove(&observation.path);
            return Err(TrackerError::StabilizationTimeout {
                path: observation.path,
                waited_secs: (now - reference.first_seen).num_seconds().max(0) as u64,
            });
        }

        if interval_elapsed {
            registry.pending.insert(
                observation.path.clone(),
                FileDescriptor {
                    first_seen: reference.first_seen,
                    ..observation
                },
            );
        }
        Ok(Decision::Wait)
    }

    /// Probe `path` every interval until it is ready, a duplicate, gone,
    /// or the wait is cancelled.
    pub async fn stabilize(
        &self,
        path: &Path,
        cancel: &mut watch::Receiver<bool>,
    ) -> TrackerResult<Stabilized> {
        loop {
            if *cancel.borrow() {
                self.forget(path)?;
                return Ok(Stabilized::Cancelled);
            }

            let observation = match self.prober.probe(path, Utc::now()).await {
                Ok(Some(observation)) => observation,
                Ok(None) => {
                    self.forget(path)?;
                    return Ok(Stabilized::Vanished);
                }
                Err(e) => {
                    self.forget(path)?;
                    return Err(e);
                }
            };

            match self.observe(observation.clone())? {
                Decision::Ready(descriptor) => return Ok(Stabilized::Ready(descriptor)),
                Decision::Duplicate { original } => {
                    return Ok(Stabilized::Duplicate {
                        descriptor: observation,
                        original,
                    })
                }
                Decision::Wait => {}
            }

            log_event_with_fields(
                Event::FileStabilizing,
                &[
                    ("path", &path.display().to_string()),
                    ("size", &observation.size.to_string()),
                ],
            );

            let interval = self.config.interval;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = cancel.changed() => {
                    // Sender gone: nobody can cancel any more
                    if changed.is_err() {
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        }
    }

    pub fn mark_completed(&self, content_hash: &str, now: DateTime<Utc>) -> TrackerResult<()> {
        self.settle(content_hash, EntryStatus::Completed, now)
    }

    /// Failed files keep matching duplicates until retention expires
    pub fn mark_failed(&self, content_hash: &str, now: DateTime<Utc>) -> TrackerResult<()> {
        self.settle(content_hash, EntryStatus::Failed, now)
    }

    /// Remove an in-flight registration whose processing was abandoned
    pub fn withdraw(&self, content_hash: &str) -> TrackerResult<()> {
        let mut registry = self.lock()?;
        if matches!(registry.seen.get(content_hash), Some(e) if e.status == EntryStatus::InFlight) {
            registry.seen.remove(content_hash);
        }
        Ok(())
    }

    /// Drop the stabilization state of `path`
    pub fn forget(&self, path: &Path) -> TrackerResult<()> {
        self.lock()?.pending.remove(path);
        Ok(())
    }

    /// Remove settled entries older than the retention window.
    pub fn prune(&self, now: DateTime<Utc>) -> TrackerResult<usize> {
        let retention = to_chrono(self.config.retention);
        let mut registry = self.lock()?;
        let before = registry.seen.len();
        registry.seen.retain(|_, entry| entry.is_live(now, retention));
        let pruned = before - registry.seen.len();

        if pruned > 0 {
            log_event_with_fields(
                Event::RegistryPruned,
                &[
                    ("pruned", &pruned.to_string()),
                    ("remaining", &registry.seen.len().to_string()),
                ],
            );
        }
        Ok(pruned)
    }

    pub fn entry(&self, content_hash: &str) -> TrackerResult<Option<RegistryEntry>> {
        Ok(self.lock()?.seen.get(content_hash).cloned())
    }

    /// Number of registered content hashes
    pub fn len(&self) -> TrackerResult<usize> {
        Ok(self.lock()?.seen.len())
    }

    pub fn is_empty(&self) -> TrackerResult<bool> {
        Ok(self.len()? == 0)
    }

    fn settle(&self, content_hash: &str, status: EntryStatus, now: DateTime<Utc>) -> TrackerResult<()> {
        if let Some(entry) = self.lock()?.seen.get_mut(content_hash) {
            entry.status = status;
            entry.settled_at = Some(now);
        }
        Ok(())
    }

    fn lock(&self) -> TrackerResult<MutexGuard<'_, Registry>> {
        self.registry.lock().map_err(|_| TrackerError::Poisoned)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}
