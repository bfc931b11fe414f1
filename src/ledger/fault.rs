//! Fault injection for the ledger store
//!
//! `FaultyLedger` wraps any `LedgerStore` and fails a configured number of
//! upcoming writes with a transient append error before they reach the
//! inner store. Reads always pass through. Used by tests that exercise the
//! retry paths of the authority and the coordinator.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::commit::InvoiceRecord;
use crate::retry::transient_error;
use crate::sequence::SequenceScope;

use super::errors::LedgerResult;
use super::state::{BatchRow, ReleasedRange, ReservationRow, ScopeRow};
use super::store::{BatchBinding, BatchWriteOutcome, LedgerStore, ReserveRequest};

pub struct FaultyLedger {
    inner: Arc<dyn LedgerStore>,
    /// Any mutating call
    fail_writes: AtomicU32,
    /// `commit_batch` only
    fail_commits: AtomicU32,
    injected: AtomicU32,
}

impl FaultyLedger {
    pub fn new(inner: Arc<dyn LedgerStore>) -> Self {
        Self {
            inner,
            fail_writes: AtomicU32::new(0),
            fail_commits: AtomicU32::new(0),
            injected: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` writes of any kind
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` batch commits
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Number of failures injected so far
    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_write(&self, operation: &str) -> LedgerResult<()> {
        if Self::take(&self.fail_writes) {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(transient_error(&format!("injected failure in {}", operation)));
        }
        Ok(())
    }
}

impl LedgerStore for FaultyLedger {
    fn ensure_scope(&self, scope: &SequenceScope, now: DateTime<Utc>) -> LedgerResult<ScopeRow> {
        self.check_write("ensure_scope")?;
        self.inner.ensure_scope(scope, now)
    }

    fn scope(&self, scope: &SequenceScope) -> LedgerResult<Option<ScopeRow>> {
        self.inner.scope(scope)
    }

    fn scopes(&self) -> LedgerResult<Vec<ScopeRow>> {
        self.inner.scopes()
    }

    fn reserve_range(&self, request: ReserveRequest) -> LedgerResult<ReservationRow> {
        self.check_write("reserve_range")?;
        self.inner.reserve_range(request)
    }

    fn release_range(
        &self,
        token: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<ReleasedRange> {
        self.check_write("release_range")?;
        self.inner.release_range(token, reason, now)
    }

    fn reservation(&self, token: Uuid) -> LedgerResult<Option<ReservationRow>> {
        self.inner.reservation(token)
    }

    fn outstanding_for_source(
        &self,
        source_hash: &str,
        scope: &SequenceScope,
    ) -> LedgerResult<Vec<ReservationRow>> {
        self.inner.outstanding_for_source(source_hash, scope)
    }

    fn released_ranges(&self) -> LedgerResult<Vec<ReleasedRange>> {
        self.inner.released_ranges()
    }

    fn record_attempt(
        &self,
        binding: &BatchBinding,
        attempts: u32,
        next_attempt_at: Option<DateTime<Utc>>,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> LedgerResult<BatchRow> {
        self.check_write("record_attempt")?;
        self.inner
            .record_attempt(binding, attempts, next_attempt_at, last_error, now)
    }

    fn commit_batch(
        &self,
        binding: &BatchBinding,
        attempts: u32,
        records: Vec<InvoiceRecord>,
        now: DateTime<Utc>,
    ) -> LedgerResult<BatchWriteOutcome> {
        if Self::take(&self.fail_commits) {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(transient_error("injected failure in commit_batch"));
        }
        self.check_write("commit_batch")?;
        self.inner.commit_batch(binding, attempts, records, now)
    }

    fn fail_batch(
        &self,
        idempotency_key: &str,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<BatchRow> {
        self.check_write("fail_batch")?;
        self.inner.fail_batch(idempotency_key, attempts, error, now)
    }

    fn batch(&self, idempotency_key: &str) -> LedgerResult<Option<BatchRow>> {
        self.inner.batch(idempotency_key)
    }

    fn committed_batch_for_source(&self, source_hash: &str) -> LedgerResult<Option<BatchRow>> {
        self.inner.committed_batch_for_source(source_hash)
    }

    fn committed_records(&self, idempotency_key: &str) -> LedgerResult<Vec<InvoiceRecord>> {
        self.inner.committed_records(idempotency_key)
    }

    fn failed_batches(&self) -> LedgerResult<Vec<BatchRow>> {
        self.inner.failed_batches()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::FileLedger;
    use tempfile::TempDir;

    #[test]
    fn test_fails_exactly_n_writes() {
        let dir = TempDir::new().unwrap();
        let inner: Arc<dyn LedgerStore> = Arc::new(FileLedger::open(dir.path()).unwrap());
        let faulty = FaultyLedger::new(inner.clone());
        let scope = SequenceScope::new("BR01", "ALL");

        faulty.fail_next_writes(2);
        assert!(faulty.ensure_scope(&scope, Utc::now()).unwrap_err().is_transient());
        assert!(faulty.ensure_scope(&scope, Utc::now()).is_err());
        assert!(faulty.ensure_scope(&scope, Utc::now()).is_ok());
        assert_eq!(faulty.injected(), 2);

        // Reads pass through even while faults are armed
        faulty.fail_next_writes(1);
        assert!(faulty.scope(&scope).unwrap().is_some());
    }
}
