//! Invoice records and commit batches

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ledger::{BatchBinding, BatchStatus};
use crate::sequence::{IdentifierPattern, IdentifierReservation, SequenceScope};

use super::errors::{CommitError, CommitResult};

/// One validated invoice row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceFields {
    pub invoice_number: String,
    pub date: NaiveDate,
    pub consignor_name: String,
    pub consignee_name: String,
    pub weight: f64,
    pub packages: i64,
    pub destination: String,
    /// Mapped columns outside the fixed set
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A validated row with its assigned offset and rendered identifier.
/// Immutable once committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub sequence: u64,
    pub receipt_id: String,
    #[serde(flatten)]
    pub fields: InvoiceFields,
}

/// SHA-256 over (source content hash, scope, reservation token), hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(source_hash: &str, scope: &SequenceScope, token: uuid::Uuid) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source_hash.as_bytes());
        hasher.update([0u8]);
        hasher.update(scope.branch_code.as_bytes());
        hasher.update([0u8]);
        hasher.update(scope.period_key.as_bytes());
        hasher.update([0u8]);
        hasher.update(token.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered records bound to one reservation, plus their retry state.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    pub key: IdempotencyKey,
    pub reservation: IdentifierReservation,
    pub source_path: String,
    pub records: Vec<InvoiceRecord>,
    pub status: BatchStatus,
    /// Attempts made so far, across restarts
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl CommitBatch {
    /// Assign the reservation's offsets to `rows` in order and render
    /// their identifiers.
    pub fn bind(
        reservation: IdentifierReservation,
        source_path: impl Into<String>,
        rows: Vec<InvoiceFields>,
        pattern: &IdentifierPattern,
        date: NaiveDate,
    ) -> CommitResult<Self> {
        if rows.len() as u64 != reservation.len() {
            return Err(CommitError::CountMismatch {
                token: reservation.token,
                expected: reservation.len(),
                actual: rows.len() as u64,
            });
        }

        let scope = &reservation.scope;
        let records = reservation
            .offsets()
            .zip(rows)
            .map(|(offset, fields)| {
                let receipt_id =
                    pattern.render(&scope.branch_code, &scope.period_key, date, offset)?;
                Ok(InvoiceRecord {
                    sequence: offset,
                    receipt_id,
                    fields,
                })
            })
            .collect::<CommitResult<Vec<_>>>()?;

        Ok(Self {
            key: IdempotencyKey::derive(&reservation.source_hash, scope, reservation.token),
            reservation,
            source_path: source_path.into(),
            records,
            status: BatchStatus::Pending,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
        })
    }

    pub fn binding(&self) -> BatchBinding {
        BatchBinding {
            idempotency_key: self.key.to_string(),
            token: self.reservation.token,
            scope: self.reservation.scope.clone(),
            start: self.reservation.start,
            end: self.reservation.end,
            source_hash: self.reservation.source_hash.clone(),
            source_path: self.source_path.clone(),
        }
    }

    pub fn first_id(&self) -> Option<&str> {
        self.records.first().map(|r| r.receipt_id.as_str())
    }

    pub fn last_id(&self) -> Option<&str> {
        self.records.last().map(|r| r.receipt_id.as_str())
    }

    /// Record a failed attempt and when the next one is due
    pub fn record_failure(&mut self, error: impl Into<String>, next_attempt_at: Option<DateTime<Utc>>) {
        self.last_error = Some(error.into());
        self.next_attempt_at = next_attempt_at;
    }
}
