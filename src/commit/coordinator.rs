//! Commit Coordinator - idempotent, atomic batch persistence
//!
//! - One ledger entry per batch: every record and identifier of a batch
//!   becomes visible together or not at all
//! - The idempotency key makes the commit safe to repeat: a key that is
//!   already committed returns the earlier receipt and writes nothing
//! - Transient failures retry with exponential backoff under the same key;
//!   attempt count and next deadline are persisted in the batch row
//! - Exhausting retries marks the batch failed and releases its reservation
//! - An expired reservation is never committed: the batch is failed and its
//!   range released, and the caller must reserve again

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::crash_point::{maybe_crash, points};
use crate::ledger::{
    offload, BatchRow, BatchStatus, BatchWriteOutcome, LedgerError, LedgerStore, ReservationState,
};
use crate::observability::{
    log_event_with_fields, record_audit, AuditAction, AuditLog, AuditOutcome, AuditRecord, Event,
    MetricsRegistry,
};
use crate::retry::{retry_transient, RetryPolicy};
use crate::sequence::{SequenceAuthority, SequenceScope, REASON_EXPIRED};

use super::batch::{CommitBatch, InvoiceRecord};
use super::errors::{CommitError, CommitResult};

/// Release reason for a reservation whose batch exhausted its retries
pub const REASON_COMMIT_FAILED: &str = "commit_failed";

/// Proof of a durable commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitReceipt {
    pub idempotency_key: String,
    pub token: Uuid,
    pub scope: SequenceScope,
    pub start: u64,
    pub end: u64,
    pub first_id: Option<String>,
    pub last_id: Option<String>,
    pub record_count: u64,
    pub attempts: u32,
    pub committed_at: DateTime<Utc>,
    /// True when an earlier call had already committed this key
    pub already_committed: bool,
}

impl CommitReceipt {
    fn from_row(row: &BatchRow, records: &[InvoiceRecord], already_committed: bool) -> Self {
        Self {
            idempotency_key: row.idempotency_key.clone(),
            token: row.token,
            scope: row.scope.clone(),
            start: row.start,
            end: row.end,
            first_id: records.first().map(|r| r.receipt_id.clone()),
            last_id: records.last().map(|r| r.receipt_id.clone()),
            record_count: row.record_count,
            attempts: row.attempts,
            committed_at: row.updated_at,
            already_committed,
        }
    }
}

pub struct CommitCoordinator {
    store: Arc<dyn LedgerStore>,
    authority: Arc<SequenceAuthority>,
    audit: Arc<dyn AuditLog>,
    metrics: Arc<MetricsRegistry>,
    policy: RetryPolicy,
}

impl CommitCoordinator {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        authority: Arc<SequenceAuthority>,
        audit: Arc<dyn AuditLog>,
        metrics: Arc<MetricsRegistry>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            authority,
            audit,
            metrics,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Persist `batch` exactly once.
    pub async fn commit(&self, batch: &mut CommitBatch) -> CommitResult<CommitReceipt> {
        let key = batch.key.to_string();

        if let Some(row) = self.batch_row(&key).await? {
            match row.status {
                BatchStatus::Committed => return self.already_committed(batch, &row).await,
                BatchStatus::Failed => return Err(CommitError::AlreadyFailed(key)),
                // Resumed after a restart: carry the persisted retry state
                BatchStatus::Pending => {
                    batch.attempts = batch.attempts.max(row.attempts);
                    batch.last_error = row.last_error.clone();
                }
            }
        }

        loop {
            if let Err(e) = self.check_reservation(batch) {
                if matches!(e, CommitError::ReservationExpired { .. }) {
                    self.abandon_expired(batch, &e).await;
                }
                return Err(e);
            }

            batch.attempts += 1;
            let now = Utc::now();

            match self.try_commit(batch, now).await {
                Ok(BatchWriteOutcome::Written(row)) => {
                    batch.status = BatchStatus::Committed;
                    batch.next_attempt_at = None;
                    let receipt = CommitReceipt::from_row(&row, &batch.records, false);
                    self.on_committed(batch, &receipt).await;
                    return Ok(receipt);
                }
                Ok(BatchWriteOutcome::AlreadyCommitted(row)) => {
                    return self.already_committed(batch, &row).await;
                }
                Err(e) if e.is_transient() && self.policy.allows_another(batch.attempts) => {
                    let delay = self.policy.delay_for_attempt(batch.attempts);
                    let next = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                    batch.record_failure(e.to_string(), Some(next));
                    self.persist_retry_state(batch, now).await;
                    self.metrics.increment_commit_retries();

                    log_event_with_fields(
                        Event::BatchRetryScheduled,
                        &[
                            ("key", &key),
                            ("attempt", &batch.attempts.to_string()),
                            ("delay_ms", &delay.as_millis().to_string()),
                            ("error", &e.to_string()),
                        ],
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    batch.record_failure(e.to_string(), None);
                    return Err(self.exhaust(batch).await);
                }
                Err(e) if e.is_conflict() => {
                    let error = self.explain_conflict(batch, e).await;
                    if matches!(error, CommitError::ReservationExpired { .. }) {
                        self.abandon_expired(batch, &error).await;
                    }
                    return Err(error);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Committed records of a batch, in identifier order
    pub async fn committed_records(&self, idempotency_key: &str) -> CommitResult<Vec<InvoiceRecord>> {
        let key = idempotency_key.to_string();
        Ok(offload(&self.store, move |store| store.committed_records(&key)).await?)
    }

    /// Receipt of an earlier commit of `idempotency_key`
    pub async fn receipt_for(&self, idempotency_key: &str) -> CommitResult<Option<CommitReceipt>> {
        match self.batch_row(idempotency_key).await? {
            Some(row) if row.status == BatchStatus::Committed => {
                let records = self.committed_records(idempotency_key).await?;
                Ok(Some(CommitReceipt::from_row(&row, &records, true)))
            }
            _ => Ok(None),
        }
    }

    /// Batches that exhausted their retries or outlived their reservation
    pub fn failed_batches(&self) -> CommitResult<Vec<BatchRow>> {
        Ok(self.store.failed_batches()?)
    }

    async fn batch_row(&self, idempotency_key: &str) -> CommitResult<Option<BatchRow>> {
        let key = idempotency_key.to_string();
        Ok(offload(&self.store, move |store| store.batch(&key)).await?)
    }

    /// Create the pending row on first attempt, then write the batch.
    async fn try_commit(
        &self,
        batch: &CommitBatch,
        now: DateTime<Utc>,
    ) -> Result<BatchWriteOutcome, LedgerError> {
        let binding = batch.binding();
        let attempts = batch.attempts;
        let records = batch.records.clone();

        offload(&self.store, move |store| {
            if store.batch(&binding.idempotency_key)?.is_none() {
                store.record_attempt(&binding, attempts - 1, None, None, now)?;
            }

            maybe_crash(points::BATCH_BEFORE_COMMIT);
            let outcome = store.commit_batch(&binding, attempts, records, now)?;
            maybe_crash(points::BATCH_AFTER_COMMIT);

            Ok(outcome)
        })
        .await
    }

    fn check_reservation(&self, batch: &CommitBatch) -> CommitResult<()> {
        let reservation = &batch.reservation;
        if reservation.is_expired(Utc::now()) {
            return Err(CommitError::ReservationExpired {
                token: reservation.token,
                expires_at: reservation.expires_at,
            });
        }
        if reservation.len() != batch.records.len() as u64 {
            return Err(CommitError::CountMismatch {
                token: reservation.token,
                expected: reservation.len(),
                actual: batch.records.len() as u64,
            });
        }
        Ok(())
    }

    /// Persisting retry state is best effort: the store that just failed
    /// the commit may fail this write too.
    async fn persist_retry_state(&self, batch: &CommitBatch, now: DateTime<Utc>) {
        let binding = batch.binding();
        let key = binding.idempotency_key.clone();
        let attempts = batch.attempts;
        let next_attempt_at = batch.next_attempt_at;
        let last_error = batch.last_error.clone();

        let persisted = offload(&self.store, move |store| {
            store.record_attempt(&binding, attempts, next_attempt_at, last_error, now)
        })
        .await;
        if let Err(e) = persisted {
            log_event_with_fields(
                Event::LedgerWriteRetry,
                &[
                    ("operation", "record_attempt"),
                    ("key", &key),
                    ("error", &e.to_string()),
                ],
            );
        }
    }

    /// Move the batch's pending row, if one was written, to failed with the
    /// final attempt count.
    async fn fail_pending(&self, batch: &mut CommitBatch, error: &str) {
        let key = batch.key.to_string();
        let attempts = batch.attempts;

        let marked = retry_transient(&self.policy, "fail_batch", || {
            let key = key.clone();
            let error = error.to_string();
            offload(&self.store, move |store| match store.batch(&key)? {
                Some(row) if row.status == BatchStatus::Pending => {
                    store.fail_batch(&key, attempts, &error, Utc::now()).map(Some)
                }
                _ => Ok(None),
            })
        })
        .await;
        if let Err(e) = marked {
            log_event_with_fields(
                Event::BatchFailed,
                &[("key", &key), ("error", &e.to_string()), ("stage", "mark_failed")],
            );
        }
        batch.status = BatchStatus::Failed;
    }

    /// Fail the batch, release its range and leave an audit trail.
    async fn give_up(&self, batch: &mut CommitBatch, reason: &str, error: &str) {
        let key = batch.key.to_string();
        self.fail_pending(batch, error).await;

        if let Err(e) = self.authority.release(&batch.reservation, reason).await {
            log_event_with_fields(
                Event::BatchFailed,
                &[("key", &key), ("error", &e.to_string()), ("stage", "release")],
            );
        }

        log_event_with_fields(
            Event::BatchFailed,
            &[
                ("key", &key),
                ("token", &batch.reservation.token.to_string()),
                ("attempts", &batch.attempts.to_string()),
                ("reason", reason),
                ("error", error),
            ],
        );
        record_audit(
            &self.audit,
            AuditRecord::new(AuditAction::BatchFailed, AuditOutcome::Failed)
                .with_idempotency_key(key)
                .with_token(batch.reservation.token)
                .with_scope(batch.reservation.scope.to_string())
                .with_range(batch.reservation.start, batch.reservation.end)
                .with_path(batch.source_path.clone())
                .with_error(error),
        )
        .await;
    }

    async fn exhaust(&self, batch: &mut CommitBatch) -> CommitError {
        let last_error = batch
            .last_error
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        self.give_up(batch, REASON_COMMIT_FAILED, &last_error).await;

        CommitError::Exhausted {
            key: batch.key.to_string(),
            attempts: batch.attempts,
            last_error,
        }
    }

    /// An expired reservation is never committed; its batch is failed so no
    /// pending row outlives it.
    async fn abandon_expired(&self, batch: &mut CommitBatch, error: &CommitError) {
        let message = error.to_string();
        batch.record_failure(message.clone(), None);
        self.give_up(batch, REASON_EXPIRED, &message).await;
    }

    async fn explain_conflict(&self, batch: &CommitBatch, error: LedgerError) -> CommitError {
        let token = batch.reservation.token;
        match offload(&self.store, move |store| store.reservation(token)).await {
            Ok(Some(row)) if row.state != ReservationState::Outstanding => {
                CommitError::ReservationNotOutstanding(token)
            }
            Ok(Some(row)) if row.is_expired(Utc::now()) => CommitError::ReservationExpired {
                token,
                expires_at: row.expires_at,
            },
            _ => CommitError::Ledger(error),
        }
    }

    async fn already_committed(&self, batch: &mut CommitBatch, row: &BatchRow) -> CommitResult<CommitReceipt> {
        batch.status = BatchStatus::Committed;
        let records = self.committed_records(&row.idempotency_key).await?;
        log_event_with_fields(
            Event::BatchAlreadyCommitted,
            &[
                ("key", &row.idempotency_key),
                ("scope", &row.scope.to_string()),
                ("start", &row.start.to_string()),
                ("end", &row.end.to_string()),
            ],
        );
        Ok(CommitReceipt::from_row(row, &records, true))
    }

    async fn on_committed(&self, batch: &CommitBatch, receipt: &CommitReceipt) {
        self.metrics.increment_batches_committed();
        log_event_with_fields(
            Event::BatchCommitted,
            &[
                ("key", &receipt.idempotency_key),
                ("scope", &receipt.scope.to_string()),
                ("start", &receipt.start.to_string()),
                ("end", &receipt.end.to_string()),
                ("records", &receipt.record_count.to_string()),
                ("attempts", &receipt.attempts.to_string()),
            ],
        );
        record_audit(
            &self.audit,
            AuditRecord::new(AuditAction::BatchCommitted, AuditOutcome::Success)
                .with_idempotency_key(receipt.idempotency_key.clone())
                .with_token(receipt.token)
                .with_scope(receipt.scope.to_string())
                .with_range(receipt.start, receipt.end)
                .with_path(batch.source_path.clone())
                .with_content_hash(batch.reservation.source_hash.clone()),
        )
        .await;
    }
}
