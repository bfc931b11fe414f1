//! Tables derived from the ledger
//!
//! `LedgerState` is never written independently: it is rebuilt from the log on
//! open and advanced only after an entry's fsync returns. Each entry is
//! validated against the current tables before it is written, and again when
//! it is replayed.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::commit::InvoiceRecord;
use crate::sequence::SequenceScope;

use super::errors::{LedgerError, LedgerResult};
use super::record::LedgerEntry;

/// Durable row per scope. Never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRow {
    pub scope: SequenceScope,
    /// Last issued offset; 0 means nothing issued yet
    pub high_water_mark: u64,
    /// Highest offset inside a committed batch
    pub highest_committed: Option<u64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    Outstanding,
    Committed,
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRow {
    pub token: Uuid,
    pub scope: SequenceScope,
    pub start: u64,
    pub end: u64,
    pub source_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: ReservationState,
}

impl ReservationRow {
    pub fn count(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// A released range, kept forever so gaps can be explained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedRange {
    pub token: Uuid,
    pub scope: SequenceScope,
    pub start: u64,
    pub end: u64,
    pub reason: String,
    pub released_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Committed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Committed => "committed",
            BatchStatus::Failed => "failed",
        }
    }
}

/// Durable batch row keyed by idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRow {
    pub idempotency_key: String,
    pub status: BatchStatus,
    pub token: Uuid,
    pub scope: SequenceScope,
    pub start: u64,
    pub end: u64,
    pub record_count: u64,
    pub source_hash: String,
    pub source_path: String,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// In-memory tables rebuilt from the ledger.
#[derive(Debug, Default)]
pub struct LedgerState {
    scopes: BTreeMap<SequenceScope, ScopeRow>,
    reservations: HashMap<Uuid, ReservationRow>,
    released: Vec<ReleasedRange>,
    batches: HashMap<String, BatchRow>,
    /// Idempotency keys in commit order
    commit_order: Vec<String>,
    records: HashMap<String, Vec<InvoiceRecord>>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(&self, scope: &SequenceScope) -> Option<&ScopeRow> {
        self.scopes.get(scope)
    }

    pub fn scopes(&self) -> impl Iterator<Item = &ScopeRow> {
        self.scopes.values()
    }

    pub fn reservation(&self, token: &Uuid) -> Option<&ReservationRow> {
        self.reservations.get(token)
    }

    pub fn reservations(&self) -> impl Iterator<Item = &ReservationRow> {
        self.reservations.values()
    }

    pub fn released(&self) -> &[ReleasedRange] {
        &self.released
    }

    pub fn batch(&self, key: &str) -> Option<&BatchRow> {
        self.batches.get(key)
    }

    pub fn batches(&self) -> impl Iterator<Item = &BatchRow> {
        self.batches.values()
    }

    /// Committed batches in commit order
    pub fn committed_batches(&self) -> impl Iterator<Item = &BatchRow> {
        self.commit_order.iter().filter_map(|k| self.batches.get(k))
    }

    pub fn records(&self, key: &str) -> Option<&[InvoiceRecord]> {
        self.records.get(key).map(Vec::as_slice)
    }

    /// Check that `entry` is a legal next step from the current tables.
    pub fn validate(&self, entry: &LedgerEntry) -> LedgerResult<()> {
        match entry {
            LedgerEntry::ScopeCreated { scope, .. } => {
                if self.scopes.contains_key(scope) {
                    return Err(LedgerError::conflict(format!("scope {} already exists", scope)));
                }
            }
            LedgerEntry::RangeReserved {
                token,
                scope,
                start,
                end,
                ..
            } => {
                let row = self
                    .scopes
                    .get(scope)
                    .ok_or_else(|| LedgerError::conflict(format!("scope {} does not exist", scope)))?;
                if *start != row.high_water_mark + 1 || end < start {
                    return Err(LedgerError::conflict(format!(
                        "range {}-{} does not continue scope {} at high-water-mark {}",
                        start, end, scope, row.high_water_mark
                    )));
                }
                if self.reservations.contains_key(token) {
                    return Err(LedgerError::conflict(format!("reservation {} already issued", token)));
                }
            }
            LedgerEntry::RangeReleased { token, .. } => {
                let row = self.reservation_row(token)?;
                if row.state != ReservationState::Outstanding {
                    return Err(LedgerError::conflict(format!(
                        "reservation {} is {:?}, only outstanding reservations can be released",
                        token, row.state
                    )));
                }
            }
            LedgerEntry::BatchAttempted {
                idempotency_key,
                token,
                start,
                end,
                ..
            } => {
                if let Some(batch) = self.batches.get(idempotency_key) {
                    if batch.status != BatchStatus::Pending {
                        return Err(LedgerError::conflict(format!(
                            "batch {} is already {}",
                            idempotency_key,
                            batch.status.as_str()
                        )));
                    }
                }
                self.check_reservation_binding(token, *start, *end)?;
            }
            LedgerEntry::BatchCommitted {
                idempotency_key,
                token,
                start,
                end,
                records,
                committed_at,
                ..
            } => {
                if let Some(batch) = self.batches.get(idempotency_key) {
                    if batch.status != BatchStatus::Pending {
                        return Err(LedgerError::conflict(format!(
                            "batch {} is already {}",
                            idempotency_key,
                            batch.status.as_str()
                        )));
                    }
                }
                let reservation = self.check_reservation_binding(token, *start, *end)?;
                if reservation.is_expired(*committed_at) {
                    return Err(LedgerError::conflict(format!(
                        "reservation {} expired at {}",
                        token, reservation.expires_at
                    )));
                }
                if records.len() as u64 != end - start + 1 {
                    return Err(LedgerError::conflict(format!(
                        "batch {} carries {} records for range {}-{}",
                        idempotency_key,
                        records.len(),
                        start,
                        end
                    )));
                }
                for (offset, record) in (*start..=*end).zip(records.iter()) {
                    if record.sequence != offset {
                        return Err(LedgerError::conflict(format!(
                            "record {} carries sequence {}, expected {}",
                            record.fields.invoice_number, record.sequence, offset
                        )));
                    }
                }
            }
            LedgerEntry::BatchFailed { idempotency_key, .. } => {
                let batch = self.batches.get(idempotency_key).ok_or_else(|| {
                    LedgerError::conflict(format!("batch {} does not exist", idempotency_key))
                })?;
                if batch.status != BatchStatus::Pending {
                    return Err(LedgerError::conflict(format!(
                        "batch {} is already {}",
                        idempotency_key,
                        batch.status.as_str()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate and apply an entry.
    pub fn apply(&mut self, entry: LedgerEntry) -> LedgerResult<()> {
        self.validate(&entry)?;

        match entry {
            LedgerEntry::ScopeCreated { scope, at } => {
                self.scopes.insert(
                    scope.clone(),
                    ScopeRow {
                        scope,
                        high_water_mark: 0,
                        highest_committed: None,
                        created_at: at,
                    },
                );
            }
            LedgerEntry::RangeReserved {
                token,
                scope,
                start,
                end,
                source_hash,
                issued_at,
                expires_at,
            } => {
                if let Some(row) = self.scopes.get_mut(&scope) {
                    row.high_water_mark = end;
                }
                self.reservations.insert(
                    token,
                    ReservationRow {
                        token,
                        scope,
                        start,
                        end,
                        source_hash,
                        issued_at,
                        expires_at,
                        state: ReservationState::Outstanding,
                    },
                );
            }
            LedgerEntry::RangeReleased {
                token,
                reason,
                released_at,
            } => {
                if let Some(row) = self.reservations.get_mut(&token) {
                    row.state = ReservationState::Released;
                    self.released.push(ReleasedRange {
                        token,
                        scope: row.scope.clone(),
                        start: row.start,
                        end: row.end,
                        reason,
                        released_at,
                    });
                }
            }
            LedgerEntry::BatchAttempted {
                idempotency_key,
                token,
                scope,
                start,
                end,
                source_hash,
                source_path,
                attempts,
                next_attempt_at,
                last_error,
                at,
            } => {
                let created_at = self
                    .batches
                    .get(&idempotency_key)
                    .map(|b| b.created_at)
                    .unwrap_or(at);
                self.batches.insert(
                    idempotency_key.clone(),
                    BatchRow {
                        idempotency_key,
                        status: BatchStatus::Pending,
                        token,
                        scope,
                        start,
                        end,
                        record_count: end - start + 1,
                        source_hash,
                        source_path,
                        attempts,
                        next_attempt_at,
                        last_error,
                        created_at,
                        updated_at: at,
                    },
                );
            }
            LedgerEntry::BatchCommitted {
                idempotency_key,
                token,
                scope,
                start,
                end,
                source_hash,
                source_path,
                attempts,
                records,
                committed_at,
            } => {
                let created_at = self
                    .batches
                    .get(&idempotency_key)
                    .map(|b| b.created_at)
                    .unwrap_or(committed_at);
                if let Some(row) = self.reservations.get_mut(&token) {
                    row.state = ReservationState::Committed;
                }
                if let Some(row) = self.scopes.get_mut(&scope) {
                    row.highest_committed = Some(row.highest_committed.map_or(end, |h| h.max(end)));
                }
                self.batches.insert(
                    idempotency_key.clone(),
                    BatchRow {
                        idempotency_key: idempotency_key.clone(),
                        status: BatchStatus::Committed,
                        token,
                        scope,
                        start,
                        end,
                        record_count: records.len() as u64,
                        source_hash,
                        source_path,
                        attempts,
                        next_attempt_at: None,
                        last_error: None,
                        created_at,
                        updated_at: committed_at,
                    },
                );
                self.commit_order.push(idempotency_key.clone());
                self.records.insert(idempotency_key, records);
            }
            LedgerEntry::BatchFailed {
                idempotency_key,
                attempts,
                error,
                at,
            } => {
                if let Some(batch) = self.batches.get_mut(&idempotency_key) {
                    batch.status = BatchStatus::Failed;
                    batch.attempts = batch.attempts.max(attempts);
                    batch.next_attempt_at = None;
                    batch.last_error = Some(error);
                    batch.updated_at = at;
                }
            }
        }
        Ok(())
    }

    fn reservation_row(&self, token: &Uuid) -> LedgerResult<&ReservationRow> {
        self.reservations
            .get(token)
            .ok_or_else(|| LedgerError::conflict(format!("reservation {} does not exist", token)))
    }

    fn check_reservation_binding(
        &self,
        token: &Uuid,
        start: u64,
        end: u64,
    ) -> LedgerResult<&ReservationRow> {
        let reservation = self.reservation_row(token)?;
        if reservation.state != ReservationState::Outstanding {
            return Err(LedgerError::conflict(format!(
                "reservation {} is {:?}",
                token, reservation.state
            )));
        }
        if reservation.start != start || reservation.end != end {
            return Err(LedgerError::conflict(format!(
                "batch range {}-{} does not match reservation {} range {}-{}",
                start, end, token, reservation.start, reservation.end
            )));
        }
        Ok(reservation)
    }
}
