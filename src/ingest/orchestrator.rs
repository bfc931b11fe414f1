//! Ingestion Orchestrator - drives one file through the core
//!
//! stabilize -> read/validate -> reserve -> commit -> artifact
//!
//! - Every file ends in exactly one terminal state with one report
//! - Validation happens before any identifier is consumed
//! - Content already committed under the same hash is not committed again,
//!   and an interrupted ingestion resumes its outstanding reservation
//! - Cancellation is honored between states; a commit in progress finishes
//! - Artifact delivery happens after the commit and never undoes it

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::spawn_blocking;

use crate::commit::{CommitBatch, CommitCoordinator, CommitError, CommitReceipt, InvoiceFields};
use crate::crash_point::{maybe_crash, points};
use crate::ledger::{offload, LedgerStore};
use crate::observability::{
    log_event_with_fields, record_audit, AuditAction, AuditLog, AuditOutcome, AuditRecord, Event,
    MetricsRegistry, ObservationScope,
};
use crate::sequence::{
    AuthorityError, IdentifierPattern, IdentifierReservation, ResetCadence, SequenceAuthority,
    SequenceScope,
};
use crate::stabilization::{content_hash, StabilizationTracker, Stabilized, TrackerError};

use super::errors::{IngestError, IngestResult};
use super::reader::InvoiceReader;
use super::sink::{ArtifactSink, BatchArtifact};
use super::state::FileState;

/// Release reasons recorded by the orchestrator
const REASON_PATTERN_OVERFLOW: &str = "pattern_overflow";
const REASON_COUNT_CHANGED: &str = "count_changed";
const REASON_COMMIT_REJECTED: &str = "commit_rejected";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub branch_code: String,
    pub cadence: ResetCadence,
    pub pattern: IdentifierPattern,
    pub delete_after_processing: bool,
    /// Fixed batch date; today's local date when unset
    pub batch_date: Option<NaiveDate>,
}

impl OrchestratorConfig {
    pub fn new(branch_code: impl Into<String>) -> Self {
        Self {
            branch_code: branch_code.into(),
            cadence: ResetCadence::default(),
            pattern: IdentifierPattern::default(),
            delete_after_processing: false,
            batch_date: None,
        }
    }

    fn batch_date(&self) -> NaiveDate {
        self.batch_date.unwrap_or_else(|| Local::now().date_naive())
    }
}

/// Error half of a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportError {
    pub code: String,
    pub message: String,
}

/// Outcome of processing one file
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: String,
    pub state: FileState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<CommitReceipt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// Invalid rows dropped under `skip_invalid_rows`
    pub skipped_rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportError>,
}

impl FileReport {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Mutable progress of one file
struct FileRun {
    path: PathBuf,
    display: String,
    state: FileState,
    content_hash: Option<String>,
    reservation: Option<IdentifierReservation>,
    receipt: Option<CommitReceipt>,
    artifact: Option<String>,
    skipped_rows: usize,
    error: Option<ReportError>,
}

impl FileRun {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            display: path.display().to_string(),
            state: FileState::Discovered,
            content_hash: None,
            reservation: None,
            receipt: None,
            artifact: None,
            skipped_rows: 0,
            error: None,
        }
    }

    fn advance(&mut self, next: FileState) -> IngestResult<()> {
        self.state.advance(next)
    }

    fn into_report(self) -> FileReport {
        FileReport {
            path: self.display,
            state: self.state,
            content_hash: self.content_hash,
            receipt: self.receipt,
            artifact: self.artifact,
            skipped_rows: self.skipped_rows,
            error: self.error,
        }
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    tracker: Arc<StabilizationTracker>,
    reader: Arc<dyn InvoiceReader>,
    store: Arc<dyn LedgerStore>,
    authority: Arc<SequenceAuthority>,
    coordinator: Arc<CommitCoordinator>,
    sink: Arc<dyn ArtifactSink>,
    audit: Arc<dyn AuditLog>,
    metrics: Arc<MetricsRegistry>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        tracker: Arc<StabilizationTracker>,
        reader: Arc<dyn InvoiceReader>,
        store: Arc<dyn LedgerStore>,
        authority: Arc<SequenceAuthority>,
        coordinator: Arc<CommitCoordinator>,
        sink: Arc<dyn ArtifactSink>,
        audit: Arc<dyn AuditLog>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config,
            tracker,
            reader,
            store,
            authority,
            coordinator,
            sink,
            audit,
            metrics,
        }
    }

    pub fn tracker(&self) -> &Arc<StabilizationTracker> {
        &self.tracker
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Drive `path` to a terminal state, or stop early when cancelled.
    pub async fn process_file(&self, path: &Path, mut cancel: watch::Receiver<bool>) -> FileReport {
        let mut run = FileRun::new(path);
        let scope = ObservationScope::with_fields("INGEST_FILE", &[("path", &run.display)]);

        self.metrics.increment_files_discovered();
        log_event_with_fields(Event::FileDiscovered, &[("path", &run.display)]);

        match self.drive(&mut run, &mut cancel).await {
            Ok(()) => scope.complete_with_fields(&[("state", run.state.as_str())]),
            Err(e) => {
                scope.fail(e.code());
                self.settle_failure(&mut run, e).await;
            }
        }
        run.into_report()
    }

    async fn drive(&self, run: &mut FileRun, cancel: &mut watch::Receiver<bool>) -> IngestResult<()> {
        check_cancel(cancel)?;
        run.advance(FileState::Stabilizing)?;
        let descriptor = match self.tracker.stabilize(&run.path, cancel).await? {
            Stabilized::Ready(descriptor) => descriptor,
            Stabilized::Duplicate { descriptor, original } => {
                run.content_hash = Some(descriptor.content_hash.clone());
                run.advance(FileState::Skipped)?;
                self.on_skipped(run, &format!("duplicate of {}", original.display()))
                    .await;
                return Ok(());
            }
            Stabilized::Vanished => {
                run.advance(FileState::Skipped)?;
                log_event_with_fields(
                    Event::FileSkipped,
                    &[("path", &run.display), ("reason", "vanished")],
                );
                return Ok(());
            }
            Stabilized::Cancelled => return Err(IngestError::Cancelled),
        };
        run.content_hash = Some(descriptor.content_hash.clone());

        check_cancel(cancel)?;
        run.advance(FileState::Validating)?;
        let records = self.read_records(run, &descriptor.content_hash).await?;

        check_cancel(cancel)?;
        run.advance(FileState::Reserving)?;
        let date = self.config.batch_date();
        let scope = SequenceScope::for_date(&self.config.branch_code, self.config.cadence, date);

        if let Some(receipt) = self.already_committed(&descriptor.content_hash).await? {
            run.advance(FileState::Skipped)?;
            // A crash between commit and artifact left the artifact undelivered
            self.deliver(run, &receipt).await;
            self.tracker.mark_completed(&descriptor.content_hash, Utc::now())?;
            self.finish_source(run).await;
            run.receipt = Some(receipt);
            self.on_skipped(run, "already committed").await;
            return Ok(());
        }

        let reservation = self
            .reservation_for(&scope, &descriptor.content_hash, records.len() as u64)
            .await?;
        run.reservation = Some(reservation.clone());

        let batch = match CommitBatch::bind(
            reservation,
            run.display.clone(),
            records,
            &self.config.pattern,
            date,
        ) {
            Ok(batch) => batch,
            Err(e) => {
                self.release_quietly(run, REASON_PATTERN_OVERFLOW).await;
                return Err(e.into());
            }
        };

        // Past this point the commit runs to completion
        check_cancel(cancel)?;
        run.advance(FileState::Committing)?;
        let receipt = self
            .commit(run, &scope, &descriptor.content_hash, batch, date)
            .await?;

        self.deliver(run, &receipt).await;
        self.tracker.mark_completed(&descriptor.content_hash, Utc::now())?;
        run.receipt = Some(receipt);
        run.advance(FileState::Completed)?;
        self.metrics.increment_files_completed();
        log_event_with_fields(
            Event::FileCompleted,
            &[
                ("path", &run.display),
                ("first_id", run.receipt.as_ref().and_then(|r| r.first_id.as_deref()).unwrap_or("")),
                ("last_id", run.receipt.as_ref().and_then(|r| r.last_id.as_deref()).unwrap_or("")),
            ],
        );
        self.finish_source(run).await;
        Ok(())
    }

    /// Read the file and validate its rows. The bytes read must be the
    /// bytes that stabilized.
    async fn read_records(&self, run: &mut FileRun, expected_hash: &str) -> IngestResult<Vec<InvoiceFields>> {
        let bytes = tokio::fs::read(&run.path)
            .await
            .map_err(|source| IngestError::Read {
                path: run.path.clone(),
                source,
            })?;
        if content_hash(&bytes) != expected_hash {
            return Err(IngestError::Malformed {
                path: run.path.clone(),
                reason: "content changed after stabilizing".to_string(),
            });
        }

        let outcome = self.reader.read(&run.path, &bytes)?;
        run.skipped_rows = outcome.skipped.len();
        for row in &outcome.skipped {
            log_event_with_fields(
                Event::FileRejected,
                &[
                    ("path", &run.display),
                    ("row", &row.row.to_string()),
                    ("reason", &row.message),
                    ("skipped", "true"),
                ],
            );
        }
        Ok(outcome.records)
    }

    /// Commit `batch`. A reservation that expired before the commit landed
    /// is replaced once by a fresh range; the coordinator has already failed
    /// the old batch and released its range.
    async fn commit(
        &self,
        run: &mut FileRun,
        scope: &SequenceScope,
        source_hash: &str,
        mut batch: CommitBatch,
        date: NaiveDate,
    ) -> IngestResult<CommitReceipt> {
        let mut renewed = false;
        loop {
            let error = match self.coordinator.commit(&mut batch).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) => e,
            };

            match &error {
                CommitError::ReservationExpired { token, .. } if !renewed => {
                    renewed = true;
                    self.metrics.add_identifiers_released(batch.reservation.len());
                    let expired = *token;

                    let fields: Vec<InvoiceFields> =
                        batch.records.iter().map(|r| r.fields.clone()).collect();
                    let reservation = self
                        .reservation_for(scope, source_hash, fields.len() as u64)
                        .await?;
                    run.reservation = Some(reservation.clone());
                    log_event_with_fields(
                        Event::ReservationRenewed,
                        &[
                            ("path", &run.display),
                            ("expired", &expired.to_string()),
                            ("token", &reservation.token.to_string()),
                            ("start", &reservation.start.to_string()),
                            ("end", &reservation.end.to_string()),
                        ],
                    );

                    batch = match CommitBatch::bind(
                        reservation,
                        run.display.clone(),
                        fields,
                        &self.config.pattern,
                        date,
                    ) {
                        Ok(batch) => batch,
                        Err(e) => {
                            self.release_quietly(run, REASON_PATTERN_OVERFLOW).await;
                            return Err(e.into());
                        }
                    };
                    continue;
                }
                CommitError::Exhausted { .. } | CommitError::ReservationExpired { .. } => {
                    self.metrics.add_identifiers_released(batch.reservation.len());
                }
                CommitError::ReservationNotOutstanding(_) | CommitError::AlreadyFailed(_) => {}
                _ => self.release_quietly(run, REASON_COMMIT_REJECTED).await,
            }
            return Err(error.into());
        }
    }

    async fn already_committed(&self, source_hash: &str) -> IngestResult<Option<CommitReceipt>> {
        let found = offload(&self.store, {
            let source_hash = source_hash.to_string();
            move |store| store.committed_batch_for_source(&source_hash)
        })
        .await?;
        match found {
            Some(row) => Ok(self.coordinator.receipt_for(&row.idempotency_key).await?),
            None => Ok(None),
        }
    }

    /// Refuse a batch whose last identifier cannot be rendered, before any
    /// number is spent on it. `bind` still catches a concurrent overrun.
    async fn check_capacity(&self, scope: &SequenceScope, count: u64) -> IngestResult<()> {
        let Some(capacity) = self.config.pattern.capacity() else {
            return Ok(());
        };
        let last = self.authority.recover(scope).await? + count;
        if last > capacity {
            return Err(AuthorityError::PatternOverflow {
                offset: last,
                width: capacity.to_string().len(),
            }
            .into());
        }
        Ok(())
    }

    /// Resume an outstanding reservation for this content, or reserve anew.
    async fn reservation_for(
        &self,
        scope: &SequenceScope,
        source_hash: &str,
        count: u64,
    ) -> IngestResult<IdentifierReservation> {
        if let Some(existing) = self
            .authority
            .outstanding_for_source(source_hash, scope, Utc::now())
            .await?
        {
            if existing.len() == count {
                return Ok(existing);
            }
            // Same content read under a different reader configuration
            self.authority.release(&existing, REASON_COUNT_CHANGED).await?;
            self.metrics.add_identifiers_released(existing.len());
        }

        self.check_capacity(scope, count).await?;
        let reservation = self.authority.reserve(scope, count, source_hash).await?;
        self.metrics.record_reservation(reservation.len());
        Ok(reservation)
    }

    async fn release_quietly(&self, run: &FileRun, reason: &str) {
        let Some(reservation) = run.reservation.as_ref() else {
            return;
        };
        match self.authority.release(reservation, reason).await {
            Ok(_) => self.metrics.add_identifiers_released(reservation.len()),
            Err(e) => log_event_with_fields(
                Event::FileFailed,
                &[
                    ("path", &run.display),
                    ("token", &reservation.token.to_string()),
                    ("stage", "release"),
                    ("error", &e.to_string()),
                ],
            ),
        }
    }

    /// Hand committed records to the sink. Failures are logged only.
    async fn deliver(&self, run: &mut FileRun, receipt: &CommitReceipt) {
        let records = match self.coordinator.committed_records(&receipt.idempotency_key).await {
            Ok(records) => records,
            Err(e) => {
                self.artifact_failed(run, &e.to_string());
                return;
            }
        };
        let artifact = BatchArtifact {
            source_path: run.display.clone(),
            scope: receipt.scope.clone(),
            idempotency_key: receipt.idempotency_key.clone(),
            first_id: receipt.first_id.clone().unwrap_or_default(),
            last_id: receipt.last_id.clone().unwrap_or_default(),
            committed_at: receipt.committed_at,
            records,
        };

        let record_count = artifact.records.len();

        maybe_crash(points::BEFORE_ARTIFACT);
        let sink = Arc::clone(&self.sink);
        match spawn_blocking(move || sink.emit(&artifact)).await {
            Ok(Ok(location)) => {
                run.artifact = location.map(|p| p.display().to_string());
                log_event_with_fields(
                    Event::ArtifactEmitted,
                    &[
                        ("path", &run.display),
                        ("artifact", run.artifact.as_deref().unwrap_or("")),
                        ("records", &record_count.to_string()),
                    ],
                );
            }
            Ok(Err(e)) => self.artifact_failed(run, &e.to_string()),
            Err(e) => self.artifact_failed(run, &e.to_string()),
        }
    }

    fn artifact_failed(&self, run: &FileRun, error: &str) {
        log_event_with_fields(
            Event::ArtifactFailed,
            &[("path", &run.display), ("error", error)],
        );
    }

    /// Delete the source when configured. Only called for content that is
    /// durably committed.
    async fn finish_source(&self, run: &FileRun) {
        if !self.config.delete_after_processing {
            return;
        }
        match tokio::fs::remove_file(&run.path).await {
            Ok(()) => log_event_with_fields(Event::FileDeleted, &[("path", &run.display)]),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log_event_with_fields(
                Event::FileDeleted,
                &[("path", &run.display), ("error", &e.to_string())],
            ),
        }
    }

    async fn on_skipped(&self, run: &FileRun, reason: &str) {
        self.metrics.increment_files_skipped();
        log_event_with_fields(
            Event::FileSkipped,
            &[("path", &run.display), ("reason", reason)],
        );

        let mut record = AuditRecord::new(AuditAction::FileSkipped, AuditOutcome::Skipped)
            .with_path(run.display.clone())
            .with_error(reason);
        if let Some(hash) = &run.content_hash {
            record = record.with_content_hash(hash.clone());
        }
        if let Some(receipt) = &run.receipt {
            record = record
                .with_idempotency_key(receipt.idempotency_key.clone())
                .with_token(receipt.token)
                .with_scope(receipt.scope.to_string())
                .with_range(receipt.start, receipt.end);
        }
        record_audit(&self.audit, record).await;
    }

    /// Move a run that stopped on `error` to its terminal state, with the
    /// log line and audit record the state calls for.
    async fn settle_failure(&self, run: &mut FileRun, error: IngestError) {
        run.error = Some(ReportError {
            code: error.code().to_string(),
            message: error.to_string(),
        });

        if matches!(error, IngestError::Cancelled) {
            // Not a verdict on the content: let a later run pick it up
            if let Some(hash) = &run.content_hash {
                if let Err(e) = self.tracker.withdraw(hash) {
                    log_event_with_fields(Event::FileFailed, &[("error", &e.to_string())]);
                }
            }
            return;
        }

        let rejected = error.is_rejection() && run.state.can_transition_to(FileState::Rejected);
        let (next, event, action, outcome) = if rejected {
            (FileState::Rejected, Event::FileRejected, AuditAction::FileRejected, AuditOutcome::Rejected)
        } else {
            let (event, action) = match &error {
                IngestError::Tracker(TrackerError::StabilizationTimeout { .. }) => {
                    (Event::StabilizationTimeout, AuditAction::StabilizationTimeout)
                }
                IngestError::Tracker(TrackerError::Unreadable { .. }) => {
                    (Event::FileUnreadable, AuditAction::FileUnreadable)
                }
                _ => (Event::FileFailed, AuditAction::FileFailed),
            };
            (FileState::Failed, event, action, AuditOutcome::Failed)
        };

        if run.advance(next).is_err() {
            // Already terminal; the report keeps that state
            return;
        }
        if rejected {
            self.metrics.increment_files_rejected();
        } else {
            self.metrics.increment_files_failed();
        }

        // Failed content keeps matching duplicates until retention expires
        if let Some(hash) = &run.content_hash {
            if let Err(e) = self.tracker.mark_failed(hash, Utc::now()) {
                log_event_with_fields(Event::FileFailed, &[("error", &e.to_string())]);
            }
        }

        let message = error.to_string();
        log_event_with_fields(
            event,
            &[("path", &run.display), ("code", error.code()), ("error", &message)],
        );

        let mut record = AuditRecord::new(action, outcome)
            .with_path(run.display.clone())
            .with_error(message);
        if let Some(hash) = &run.content_hash {
            record = record.with_content_hash(hash.clone());
        }
        if let Some(reservation) = &run.reservation {
            record = record
                .with_token(reservation.token)
                .with_scope(reservation.scope.to_string())
                .with_range(reservation.start, reservation.end);
        }
        record_audit(&self.audit, record).await;
    }
}

fn check_cancel(cancel: &watch::Receiver<bool>) -> IngestResult<()> {
    if *cancel.borrow() {
        Err(IngestError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{JsonBatchReader, MemorySink, ReaderConfig};
    use crate::ledger::{FaultyLedger, FileLedger, ReservationState};
    use crate::observability::MemoryAuditLog;
    use crate::retry::RetryPolicy;
    use crate::sequence::AuthorityConfig;
    use crate::stabilization::TrackerConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        faulty: Arc<FaultyLedger>,
        store: Arc<dyn LedgerStore>,
        authority: Arc<SequenceAuthority>,
        audit: Arc<MemoryAuditLog>,
        sink: Arc<MemorySink>,
        commit_policy: RetryPolicy,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_ttl(chrono::Duration::minutes(5), policy())
        }

        fn with_ttl(reservation_ttl: chrono::Duration, commit_policy: RetryPolicy) -> Self {
            let dir = TempDir::new().unwrap();
            std::fs::create_dir_all(dir.path().join("drop")).unwrap();
            let inner: Arc<dyn LedgerStore> = Arc::new(FileLedger::open(dir.path()).unwrap());
            let faulty = Arc::new(FaultyLedger::new(inner));
            let store: Arc<dyn LedgerStore> = faulty.clone();
            let audit = Arc::new(MemoryAuditLog::new());
            let authority = Arc::new(SequenceAuthority::new(
                store.clone(),
                audit.clone(),
                AuthorityConfig {
                    reservation_ttl,
                    retry: policy(),
                },
            ));
            Self {
                dir,
                faulty,
                store,
                authority,
                audit,
                sink: Arc::new(MemorySink::new()),
                commit_policy,
            }
        }

        /// A fresh orchestrator over the same ledger, as after a restart
        fn orchestrator(&self, delete_after_processing: bool) -> Orchestrator {
            self.orchestrator_with(|config| config.delete_after_processing = delete_after_processing)
        }

        fn orchestrator_with(&self, configure: impl FnOnce(&mut OrchestratorConfig)) -> Orchestrator {
            let metrics = Arc::new(MetricsRegistry::new());
            let coordinator = Arc::new(CommitCoordinator::new(
                self.store.clone(),
                self.authority.clone(),
                self.audit.clone(),
                metrics.clone(),
                self.commit_policy,
            ));
            let tracker = Arc::new(StabilizationTracker::new(TrackerConfig {
                interval: Duration::from_millis(10),
                timeout: Duration::from_secs(5),
                retention: Duration::from_secs(60),
                probe: policy(),
            }));
            let mut config = OrchestratorConfig::new("BR01");
            config.batch_date = NaiveDate::from_ymd_opt(2025, 4, 28);
            configure(&mut config);

            Orchestrator::new(
                config,
                tracker,
                Arc::new(JsonBatchReader::new(ReaderConfig::default())),
                self.store.clone(),
                self.authority.clone(),
                coordinator,
                self.sink.clone(),
                self.audit.clone(),
                metrics,
            )
        }

        fn write(&self, name: &str, rows: usize) -> PathBuf {
            let rows: Vec<_> = (0..rows)
                .map(|i| {
                    serde_json::json!({
                        "invoice_number": format!("INV-{}", i),
                        "date": "2025-04-28",
                        "consignor_name": "Acme Mills",
                        "consignee_name": "Delta Traders",
                        "weight": 12.5,
                        "packages": 2,
                        "destination": "Pune"
                    })
                })
                .collect();
            self.write_raw(name, &serde_json::Value::Array(rows).to_string())
        }

        fn write_raw(&self, name: &str, content: &str) -> PathBuf {
            let path = self.dir.path().join("drop").join(name);
            std::fs::write(&path, content).unwrap();
            path
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5)).without_jitter()
    }

    /// Never cancelled: the sender is gone
    fn running() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    fn scope() -> SequenceScope {
        SequenceScope::new("BR01", "20250428")
    }

    #[tokio::test]
    async fn test_file_is_numbered_committed_and_delivered() {
        let h = Harness::new();
        let path = h.write("a.json", 3);

        let report = h.orchestrator(false).process_file(&path, running()).await;
        assert_eq!(report.state, FileState::Completed, "{:?}", report.error);

        let receipt = report.receipt.unwrap();
        assert_eq!((receipt.start, receipt.end), (1, 3));
        assert_eq!(receipt.first_id.as_deref(), Some("BR012504280001"));
        assert_eq!(receipt.last_id.as_deref(), Some("BR012504280003"));

        let artifacts = h.sink.artifacts();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].records.len(), 3);
        assert_eq!(artifacts[0].records[2].fields.invoice_number, "INV-2");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_same_content_under_another_name_is_skipped() {
        let h = Harness::new();
        let orchestrator = h.orchestrator(false);
        let first = h.write("a.json", 2);
        let copy = h.write("copy of a.json", 2);

        assert_eq!(orchestrator.process_file(&first, running()).await.state, FileState::Completed);
        let report = orchestrator.process_file(&copy, running()).await;
        assert_eq!(report.state, FileState::Skipped);
        assert!(report.receipt.is_none());

        assert_eq!(h.authority.highest_committed(&scope()).unwrap(), Some(2));
        assert_eq!(h.audit.with_action(AuditAction::FileSkipped).len(), 1);
    }

    #[tokio::test]
    async fn test_committed_content_is_skipped_after_restart() {
        let h = Harness::new();
        let path = h.write("a.json", 2);
        let committed = h.orchestrator(false).process_file(&path, running()).await;

        // Fresh tracker: only the ledger remembers the content
        let report = h.orchestrator(true).process_file(&path, running()).await;
        assert_eq!(report.state, FileState::Skipped);
        assert_eq!(
            report.receipt.as_ref().map(|r| r.idempotency_key.clone()),
            committed.receipt.map(|r| r.idempotency_key)
        );
        assert!(report.receipt.unwrap().already_committed);

        // Artifact re-delivered, nothing new reserved, source removed
        assert_eq!(h.sink.artifacts().len(), 2);
        assert_eq!(h.authority.recover(&scope()).await.unwrap(), 2);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_invalid_file_is_rejected_before_reserving() {
        let h = Harness::new();
        let path = h.write_raw("bad.json", r#"[{"invoice_number": "A1"}]"#);

        let report = h.orchestrator(false).process_file(&path, running()).await;
        assert_eq!(report.state, FileState::Rejected);
        assert_eq!(report.error.unwrap().code, "LRL_INGEST_INVALID_ROWS");

        assert!(h.authority.scopes().unwrap().is_empty());
        assert_eq!(h.audit.with_action(AuditAction::FileRejected).len(), 1);
    }

    #[tokio::test]
    async fn test_commit_exhaustion_fails_file_and_releases_range() {
        let h = Harness::new();
        let path = h.write("a.json", 3);

        h.faulty.fail_next_commits(10);
        let report = h.orchestrator(true).process_file(&path, running()).await;
        assert_eq!(report.state, FileState::Failed);
        assert_eq!(report.error.unwrap().code, "LRL_COMMIT_EXHAUSTED");

        let released = h.authority.released_ranges().unwrap();
        assert_eq!((released[0].start, released[0].end), (1, 3));
        let failed = h.audit.with_action(AuditAction::FileFailed);
        assert_eq!(failed[0].range, Some((1, 3)));

        // Failed files are never deleted
        assert!(path.exists());

        // The next file continues after the released range
        h.faulty.fail_next_commits(0);
        let next = h.write("b.json", 1);
        let report = h.orchestrator(false).process_file(&next, running()).await;
        assert_eq!(report.receipt.map(|r| r.start), Some(4));
    }

    #[tokio::test]
    async fn test_reservation_expired_during_backoff_is_renewed() {
        let commit_policy =
            RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(1)).without_jitter();
        let h = Harness::with_ttl(chrono::Duration::milliseconds(200), commit_policy);
        let path = h.write("a.json", 3);

        h.faulty.fail_next_commits(1);
        let report = h.orchestrator(false).process_file(&path, running()).await;
        assert_eq!(report.state, FileState::Completed, "{:?}", report.error);

        let receipt = report.receipt.unwrap();
        assert_eq!((receipt.start, receipt.end), (4, 6));
        assert_eq!(receipt.first_id.as_deref(), Some("BR012504280004"));

        let released = h.authority.released_ranges().unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!((released[0].start, released[0].end), (1, 3));
        assert_eq!(released[0].reason, crate::sequence::REASON_EXPIRED);

        // The first key is failed rather than left pending
        let failed = h.store.failed_batches().unwrap();
        assert_eq!(failed.len(), 1);
        assert_ne!(failed[0].idempotency_key, receipt.idempotency_key);
        assert_eq!(h.authority.highest_committed(&scope()).unwrap(), Some(6));
        assert_eq!(h.sink.artifacts().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_past_pattern_capacity_fails_without_spending_numbers() {
        let h = Harness::new();
        let path = h.write("a.json", 10);
        let orchestrator = h.orchestrator_with(|config| {
            config.pattern = IdentifierPattern::parse("{branch_code}-{sequence:01}").unwrap();
        });

        let report = orchestrator.process_file(&path, running()).await;
        assert_eq!(report.state, FileState::Failed);
        assert_eq!(report.error.unwrap().code, "LRL_SEQUENCE_PATTERN_OVERFLOW");
        assert_eq!(h.authority.recover(&scope()).await.unwrap(), 0);
        assert!(h.authority.released_ranges().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outstanding_reservation_is_resumed() {
        let h = Harness::new();
        let path = h.write("a.json", 2);
        let hash = content_hash(&std::fs::read(&path).unwrap());

        // A crash after reserving left this behind
        let earlier = h.authority.reserve(&scope(), 2, &hash).await.unwrap();

        let report = h.orchestrator(false).process_file(&path, running()).await;
        let receipt = report.receipt.unwrap();
        assert_eq!(receipt.token, earlier.token);
        assert_eq!((receipt.start, receipt.end), (1, 2));
        assert_eq!(
            h.store.reservation(earlier.token).unwrap().unwrap().state,
            ReservationState::Committed
        );
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_before_terminal_state() {
        let h = Harness::new();
        let path = h.write("a.json", 1);
        let (tx, rx) = watch::channel(true);

        let report = h.orchestrator(false).process_file(&path, rx).await;
        drop(tx);
        assert!(!report.is_terminal());
        assert_eq!(report.error.unwrap().code, "LRL_INGEST_CANCELLED");
        assert!(h.authority.scopes().unwrap().is_empty());
    }
}
