//! Ledger store
//!
//! `LedgerStore` is the seam between the durable ledger and the components
//! that write through it. Every mutating method is one critical section:
//! the current tables are read, the entry is validated, appended, fsynced and
//! only then applied. No caller ever observes a state the log does not hold.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use tokio::task::spawn_blocking;
use uuid::Uuid;

use crate::commit::InvoiceRecord;
use crate::sequence::SequenceScope;

use super::errors::{LedgerError, LedgerResult};
use super::record::LedgerEntry;
use super::state::{
    BatchRow, BatchStatus, LedgerState, ReleasedRange, ReservationRow, ReservationState, ScopeRow,
};
use super::writer::LedgerWriter;

/// Parameters of one transactional increment.
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub scope: SequenceScope,
    pub count: u64,
    pub source_hash: String,
    pub ttl: Duration,
    pub now: DateTime<Utc>,
}

/// Identity of a batch and the reservation it is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchBinding {
    pub idempotency_key: String,
    pub token: Uuid,
    pub scope: SequenceScope,
    pub start: u64,
    pub end: u64,
    pub source_hash: String,
    pub source_path: String,
}

/// Result of an atomic batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchWriteOutcome {
    /// The batch and its records were written by this call
    Written(BatchRow),
    /// A batch with the same key was already committed; nothing was written
    AlreadyCommitted(BatchRow),
}

impl BatchWriteOutcome {
    pub fn row(&self) -> &BatchRow {
        match self {
            BatchWriteOutcome::Written(row) | BatchWriteOutcome::AlreadyCommitted(row) => row,
        }
    }
}

/// Durable store used by the sequence authority and the commit coordinator.
pub trait LedgerStore: Send + Sync {
    /// Insert-if-absent of a scope row at high-water-mark zero.
    fn ensure_scope(&self, scope: &SequenceScope, now: DateTime<Utc>) -> LedgerResult<ScopeRow>;

    fn scope(&self, scope: &SequenceScope) -> LedgerResult<Option<ScopeRow>>;

    fn scopes(&self) -> LedgerResult<Vec<ScopeRow>>;

    /// Atomically advance the scope's high-water-mark by `count` and record
    /// the reservation. Creates the scope first if it does not exist.
    fn reserve_range(&self, request: ReserveRequest) -> LedgerResult<ReservationRow>;

    /// Release an outstanding reservation. Its numbers are never reissued.
    fn release_range(
        &self,
        token: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<ReleasedRange>;

    fn reservation(&self, token: Uuid) -> LedgerResult<Option<ReservationRow>>;

    /// Outstanding reservations issued for `source_hash` in `scope`.
    fn outstanding_for_source(
        &self,
        source_hash: &str,
        scope: &SequenceScope,
    ) -> LedgerResult<Vec<ReservationRow>>;

    fn released_ranges(&self) -> LedgerResult<Vec<ReleasedRange>>;

    /// Create or advance a pending batch row.
    fn record_attempt(
        &self,
        binding: &BatchBinding,
        attempts: u32,
        next_attempt_at: Option<DateTime<Utc>>,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> LedgerResult<BatchRow>;

    /// Write a batch and all of its records as one entry, or report the
    /// earlier commit of the same key.
    fn commit_batch(
        &self,
        binding: &BatchBinding,
        attempts: u32,
        records: Vec<InvoiceRecord>,
        now: DateTime<Utc>,
    ) -> LedgerResult<BatchWriteOutcome>;

    /// Mark a pending batch failed after `attempts` attempts.
    fn fail_batch(
        &self,
        idempotency_key: &str,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<BatchRow>;

    fn batch(&self, idempotency_key: &str) -> LedgerResult<Option<BatchRow>>;

    /// A committed batch whose source content hash equals `source_hash`.
    fn committed_batch_for_source(&self, source_hash: &str) -> LedgerResult<Option<BatchRow>>;

    fn committed_records(&self, idempotency_key: &str) -> LedgerResult<Vec<InvoiceRecord>>;

    fn failed_batches(&self) -> LedgerResult<Vec<BatchRow>>;
}

/// Run `op` against `store` on the blocking pool.
///
/// Writes hold the ledger lock through an fsync; async workers must never
/// wait on either directly.
pub fn offload<T, F>(store: &Arc<dyn LedgerStore>, op: F) -> impl Future<Output = LedgerResult<T>>
where
    T: Send + 'static,
    F: FnOnce(&dyn LedgerStore) -> LedgerResult<T> + Send + 'static,
{
    let task = spawn_blocking({
        let store = Arc::clone(store);
        move || op(store.as_ref())
    });
    async move {
        task.await.unwrap_or_else(|e| {
            Err(LedgerError::poisoned(format!("ledger task did not finish: {}", e)))
        })
    }
}

struct Inner {
    writer: LedgerWriter,
    state: LedgerState,
}

impl Inner {
    /// Validate, make durable, then apply.
    fn write(&mut self, entry: LedgerEntry) -> LedgerResult<()> {
        self.state.validate(&entry)?;
        self.writer.append(entry.clone())?;
        self.state.apply(entry)
    }
}

/// File-backed `LedgerStore`.
///
/// A single process owns the ledger directory; concurrency comes from the
/// tasks sharing this value.
pub struct FileLedger {
    data_dir: PathBuf,
    inner: Mutex<Inner>,
}

impl FileLedger {
    /// Open `<data_dir>/ledger/ledger.log` and rebuild every table from it.
    pub fn open(data_dir: &Path) -> LedgerResult<Self> {
        let (writer, replay) = LedgerWriter::open(data_dir)?;

        let mut state = LedgerState::new();
        for record in replay.records {
            let sequence = record.sequence_number;
            state.apply(record.entry).map_err(|e| {
                LedgerError::corruption_at_sequence(
                    sequence,
                    format!("Replayed entry is inconsistent with prior state: {}", e.message()),
                )
            })?;
        }

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            inner: Mutex::new(Inner { writer, state }),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn last_sequence_number(&self) -> LedgerResult<u64> {
        Ok(self.lock()?.writer.last_sequence_number())
    }

    fn lock(&self) -> LedgerResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| LedgerError::poisoned("ledger lock poisoned by a panicked writer"))
    }
}

impl LedgerStore for FileLedger {
    fn ensure_scope(&self, scope: &SequenceScope, now: DateTime<Utc>) -> LedgerResult<ScopeRow> {
        let mut inner = self.lock()?;
        if inner.state.scope(scope).is_none() {
            inner.write(LedgerEntry::ScopeCreated {
                scope: scope.clone(),
                at: now,
            })?;
        }
        inner
            .state
            .scope(scope)
            .cloned()
            .ok_or_else(|| LedgerError::conflict(format!("scope {} missing after insert", scope)))
    }

    fn scope(&self, scope: &SequenceScope) -> LedgerResult<Option<ScopeRow>> {
        Ok(self.lock()?.state.scope(scope).cloned())
    }

    fn scopes(&self) -> LedgerResult<Vec<ScopeRow>> {
        Ok(self.lock()?.state.scopes().cloned().collect())
    }

    fn reserve_range(&self, request: ReserveRequest) -> LedgerResult<ReservationRow> {
        if request.count == 0 {
            return Err(LedgerError::conflict("reservation count must be at least 1"));
        }

        let mut inner = self.lock()?;
        if inner.state.scope(&request.scope).is_none() {
            inner.write(LedgerEntry::ScopeCreated {
                scope: request.scope.clone(),
                at: request.now,
            })?;
        }

        let high_water_mark = inner
            .state
            .scope(&request.scope)
            .map(|row| row.high_water_mark)
            .unwrap_or(0);
        let end = high_water_mark.checked_add(request.count).ok_or_else(|| {
            LedgerError::conflict(format!("scope {} sequence space exhausted", request.scope))
        })?;

        let token = Uuid::new_v4();
        inner.write(LedgerEntry::RangeReserved {
            token,
            scope: request.scope.clone(),
            start: high_water_mark + 1,
            end,
            source_hash: request.source_hash,
            issued_at: request.now,
            expires_at: request.now + request.ttl,
        })?;

        inner
            .state
            .reservation(&token)
            .cloned()
            .ok_or_else(|| LedgerError::conflict(format!("reservation {} missing after insert", token)))
    }

    fn release_range(
        &self,
        token: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<ReleasedRange> {
        let mut inner = self.lock()?;
        inner.write(LedgerEntry::RangeReleased {
            token,
            reason: reason.to_string(),
            released_at: now,
        })?;

        inner
            .state
            .released()
            .iter()
            .rev()
            .find(|r| r.token == token)
            .cloned()
            .ok_or_else(|| LedgerError::conflict(format!("released range {} missing", token)))
    }

    fn reservation(&self, token: Uuid) -> LedgerResult<Option<ReservationRow>> {
        Ok(self.lock()?.state.reservation(&token).cloned())
    }

    fn outstanding_for_source(
        &self,
        source_hash: &str,
        scope: &SequenceScope,
    ) -> LedgerResult<Vec<ReservationRow>> {
        let inner = self.lock()?;
        let mut rows: Vec<ReservationRow> = inner
            .state
            .reservations()
            .filter(|r| {
                r.state == ReservationState::Outstanding
                    && r.source_hash == source_hash
                    && &r.scope == scope
            })
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.start);
        Ok(rows)
    }

    fn released_ranges(&self) -> LedgerResult<Vec<ReleasedRange>> {
        Ok(self.lock()?.state.released().to_vec())
    }

    fn record_attempt(
        &self,
        binding: &BatchBinding,
        attempts: u32,
        next_attempt_at: Option<DateTime<Utc>>,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> LedgerResult<BatchRow> {
        let mut inner = self.lock()?;
        inner.write(LedgerEntry::BatchAttempted {
            idempotency_key: binding.idempotency_key.clone(),
            token: binding.token,
            scope: binding.scope.clone(),
            start: binding.start,
            end: binding.end,
            source_hash: binding.source_hash.clone(),
            source_path: binding.source_path.clone(),
            attempts,
            next_attempt_at,
            last_error,
            at: now,
        })?;

        inner
            .state
            .batch(&binding.idempotency_key)
            .cloned()
            .ok_or_else(|| {
                LedgerError::conflict(format!("batch {} missing after insert", binding.idempotency_key))
            })
    }

    fn commit_batch(
        &self,
        binding: &BatchBinding,
        attempts: u32,
        records: Vec<InvoiceRecord>,
        now: DateTime<Utc>,
    ) -> LedgerResult<BatchWriteOutcome> {
        let mut inner = self.lock()?;

        if let Some(existing) = inner.state.batch(&binding.idempotency_key) {
            if existing.status == BatchStatus::Committed {
                return Ok(BatchWriteOutcome::AlreadyCommitted(existing.clone()));
            }
        }

        inner.write(LedgerEntry::BatchCommitted {
            idempotency_key: binding.idempotency_key.clone(),
            token: binding.token,
            scope: binding.scope.clone(),
            start: binding.start,
            end: binding.end,
            source_hash: binding.source_hash.clone(),
            source_path: binding.source_path.clone(),
            attempts,
            records,
            committed_at: now,
        })?;

        inner
            .state
            .batch(&binding.idempotency_key)
            .cloned()
            .map(BatchWriteOutcome::Written)
            .ok_or_else(|| {
                LedgerError::conflict(format!("batch {} missing after commit", binding.idempotency_key))
            })
    }

    fn fail_batch(
        &self,
        idempotency_key: &str,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<BatchRow> {
        let mut inner = self.lock()?;
        inner.write(LedgerEntry::BatchFailed {
            idempotency_key: idempotency_key.to_string(),
            attempts,
            error: error.to_string(),
            at: now,
        })?;

        inner
            .state
            .batch(idempotency_key)
            .cloned()
            .ok_or_else(|| LedgerError::conflict(format!("batch {} missing", idempotency_key)))
    }

    fn batch(&self, idempotency_key: &str) -> LedgerResult<Option<BatchRow>> {
        Ok(self.lock()?.state.batch(idempotency_key).cloned())
    }

    fn committed_batch_for_source(&self, source_hash: &str) -> LedgerResult<Option<BatchRow>> {
        Ok(self
            .lock()?
            .state
            .committed_batches()
            .find(|b| b.source_hash == source_hash)
            .cloned())
    }

    fn committed_records(&self, idempotency_key: &str) -> LedgerResult<Vec<InvoiceRecord>> {
        Ok(self
            .lock()?
            .state
            .records(idempotency_key)
            .map(<[InvoiceRecord]>::to_vec)
            .unwrap_or_default())
    }

    fn failed_batches(&self) -> LedgerResult<Vec<BatchRow>> {
        let inner = self.lock()?;
        let mut rows: Vec<BatchRow> = inner
            .state
            .batches()
            .filter(|b| b.status == BatchStatus::Failed)
            .cloned()
            .collect();
        rows.sort_by_key(|b| b.updated_at);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scope() -> SequenceScope {
        SequenceScope::new("BR01", "20250428")
    }

    fn request(count: u64) -> ReserveRequest {
        ReserveRequest {
            scope: scope(),
            count,
            source_hash: "hash-a".into(),
            ttl: Duration::minutes(10),
            now: Utc::now(),
        }
    }

    #[test]
    fn test_reserve_creates_scope_and_advances() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::open(dir.path()).unwrap();

        let first = ledger.reserve_range(request(3)).unwrap();
        let second = ledger.reserve_range(request(5)).unwrap();

        assert_eq!((first.start, first.end), (1, 3));
        assert_eq!((second.start, second.end), (4, 8));
        assert_eq!(ledger.scope(&scope()).unwrap().unwrap().high_water_mark, 8);
    }

    #[test]
    fn test_zero_count_rejected() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::open(dir.path()).unwrap();
        assert!(ledger.reserve_range(request(0)).is_err());
        assert!(ledger.scopes().unwrap().is_empty());
    }

    #[test]
    fn test_ensure_scope_is_insert_if_absent() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::open(dir.path()).unwrap();

        ledger.ensure_scope(&scope(), Utc::now()).unwrap();
        ledger.reserve_range(request(2)).unwrap();
        let row = ledger.ensure_scope(&scope(), Utc::now()).unwrap();

        assert_eq!(row.high_water_mark, 2);
        assert_eq!(ledger.last_sequence_number().unwrap(), 2);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let token;
        {
            let ledger = FileLedger::open(dir.path()).unwrap();
            ledger.reserve_range(request(3)).unwrap();
            token = ledger.reserve_range(request(2)).unwrap().token;
            ledger.release_range(token, "test", Utc::now()).unwrap();
        }

        let ledger = FileLedger::open(dir.path()).unwrap();
        assert_eq!(ledger.scope(&scope()).unwrap().unwrap().high_water_mark, 5);
        let released = ledger.released_ranges().unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!((released[0].start, released[0].end), (4, 5));
        assert_eq!(
            ledger.reservation(token).unwrap().unwrap().state,
            ReservationState::Released
        );
    }

    #[tokio::test]
    async fn test_offload_leaves_the_runtime_thread_free() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn LedgerStore> = Arc::new(FileLedger::open(dir.path()).unwrap());

        // The store call blocks until a task on this single-threaded runtime
        // unblocks it; run inline, it would never return.
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let call = offload(&store, move |store| {
            rx.recv()
                .map_err(|_| LedgerError::conflict("sender dropped"))?;
            store.reserve_range(request(2))
        });
        tokio::spawn(async move { tx.send(()).unwrap() }).await.unwrap();

        let row = call.await.unwrap();
        assert_eq!((row.start, row.end), (1, 2));
    }

    #[test]
    fn test_outstanding_for_source_filters_state_and_scope() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::open(dir.path()).unwrap();

        let kept = ledger.reserve_range(request(1)).unwrap();
        let released = ledger.reserve_range(request(1)).unwrap();
        ledger.release_range(released.token, "test", Utc::now()).unwrap();

        let rows = ledger.outstanding_for_source("hash-a", &scope()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].token, kept.token);

        let other = SequenceScope::new("BR02", "20250428");
        assert!(ledger.outstanding_for_source("hash-a", &other).unwrap().is_empty());
    }
}
