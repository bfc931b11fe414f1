//! Watch service - discovery and the bounded worker pool
//!
//! Polls the watch directory, hands each new matching file to a worker and
//! prunes the tracker registry on a timer. At most `max_workers` files are
//! in flight. On shutdown discovery stops, workers stop at their next state
//! boundary, and commits already in progress finish.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};

use crate::observability::{log_event_with_fields, Event};

use super::errors::{IngestError, IngestResult};
use super::orchestrator::{FileReport, Orchestrator};
use super::state::FileState;

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub dir: PathBuf,
    pub patterns: Vec<String>,
    pub ignore_patterns: Vec<String>,
    pub poll_interval: Duration,
    pub max_workers: usize,
    pub prune_interval: Duration,
}

/// Include/ignore globs applied to file names
#[derive(Debug, Clone)]
pub struct FileFilter {
    include: GlobSet,
    ignore: GlobSet,
}

impl FileFilter {
    pub fn new(patterns: &[String], ignore_patterns: &[String]) -> IngestResult<Self> {
        Ok(Self {
            include: build_globs(patterns)?,
            ignore: build_globs(ignore_patterns)?,
        })
    }

    pub fn matches(&self, path: &Path) -> bool {
        let Some(name) = path.file_name() else {
            return false;
        };
        self.include.is_match(name) && !self.ignore.is_match(name)
    }
}

fn build_globs(patterns: &[String]) -> IngestResult<GlobSet> {
    patterns
        .iter()
        .map(|p| p.parse::<Glob>())
        .collect::<Result<Vec<_>, _>>()
        .and_then(|globs| {
            globs
                .into_iter()
                .fold(&mut GlobSetBuilder::new(), |builder, glob| builder.add(glob))
                .build()
        })
        .map_err(|e| IngestError::InvalidGlob(e.to_string()))
}

/// Terminal-state counts of one service run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatchSummary {
    pub processed: usize,
    pub completed: usize,
    pub rejected: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Stopped by shutdown before a terminal state
    pub interrupted: usize,
}

impl WatchSummary {
    fn record(&mut self, report: &FileReport) {
        self.processed += 1;
        match report.state {
            FileState::Completed => self.completed += 1,
            FileState::Rejected => self.rejected += 1,
            FileState::Failed => self.failed += 1,
            FileState::Skipped => self.skipped += 1,
            _ => self.interrupted += 1,
        }
    }
}

pub struct WatchService {
    config: WatchConfig,
    filter: FileFilter,
    orchestrator: Arc<Orchestrator>,
}

impl WatchService {
    pub fn new(config: WatchConfig, orchestrator: Arc<Orchestrator>) -> IngestResult<Self> {
        let filter = FileFilter::new(&config.patterns, &config.ignore_patterns)?;
        Ok(Self {
            config,
            filter,
            orchestrator,
        })
    }

    /// Matching files in the watch directory, sorted by path
    pub async fn scan(&self) -> IngestResult<Vec<(PathBuf, SystemTime)>> {
        let scan_err = |source| IngestError::Scan {
            path: self.config.dir.clone(),
            source,
        };

        let mut entries = tokio::fs::read_dir(&self.config.dir).await.map_err(scan_err)?;
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(scan_err)? {
            let path = entry.path();
            if !self.filter.matches(&path) {
                continue;
            }
            // Entries can vanish between listing and stat
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if metadata.is_file() {
                found.push((path, metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH)));
            }
        }
        found.sort();
        Ok(found)
    }

    /// Files not dispatched before, or modified since they were.
    async fn discover(&self, known: &mut HashMap<PathBuf, SystemTime>) -> IngestResult<Vec<PathBuf>> {
        let found = self.scan().await?;
        known.retain(|path, _| found.iter().any(|(p, _)| p == path));

        let mut fresh = Vec::new();
        for (path, modified) in found {
            if known.get(&path) == Some(&modified) {
                continue;
            }
            known.insert(path.clone(), modified);
            fresh.push(path);
        }
        Ok(fresh)
    }

    fn spawn(
        &self,
        tasks: &mut JoinSet<FileReport>,
        semaphore: &Arc<Semaphore>,
        path: PathBuf,
        shutdown: &watch::Receiver<bool>,
    ) {
        let orchestrator = self.orchestrator.clone();
        let semaphore = semaphore.clone();
        let cancel = shutdown.clone();
        tasks.spawn(async move {
            // The semaphore is never closed
            let _permit = semaphore.acquire_owned().await.ok();
            orchestrator.process_file(&path, cancel).await
        });
    }

    /// Process every file currently present, then return their reports.
    pub async fn run_once(&self, shutdown: watch::Receiver<bool>) -> IngestResult<Vec<FileReport>> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut tasks = JoinSet::new();
        for (path, _) in self.scan().await? {
            self.spawn(&mut tasks, &semaphore, path, &shutdown);
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Some(report) = joined_report(joined) {
                reports.push(report);
            }
        }
        reports.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(reports)
    }

    /// Watch until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> IngestResult<WatchSummary> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut tasks: JoinSet<FileReport> = JoinSet::new();
        let mut known = HashMap::new();
        let mut summary = WatchSummary::default();
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        let mut last_prune = Instant::now();

        log_event_with_fields(
            Event::BootComplete,
            &[
                ("watch_dir", &self.config.dir.display().to_string()),
                ("max_workers", &self.config.max_workers.to_string()),
            ],
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    for path in self.discover(&mut known).await? {
                        self.spawn(&mut tasks, &semaphore, path, &shutdown);
                    }
                    if last_prune.elapsed() >= self.config.prune_interval {
                        self.orchestrator.tracker().prune(Utc::now())?;
                        last_prune = Instant::now();
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Some(report) = joined_report(joined) {
                        summary.record(&report);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        log_event_with_fields(
            Event::ShutdownStart,
            &[("in_flight", &tasks.len().to_string())],
        );
        while let Some(joined) = tasks.join_next().await {
            if let Some(report) = joined_report(joined) {
                summary.record(&report);
            }
        }
        log_event_with_fields(
            Event::ShutdownComplete,
            &[
                ("processed", &summary.processed.to_string()),
                ("completed", &summary.completed.to_string()),
            ],
        );
        Ok(summary)
    }
}

fn joined_report(joined: Result<FileReport, JoinError>) -> Option<FileReport> {
    match joined {
        Ok(report) => Some(report),
        Err(e) => {
            log_event_with_fields(Event::FileFailed, &[("error", &format!("worker panicked: {}", e))]);
            None
        }
    }
}
