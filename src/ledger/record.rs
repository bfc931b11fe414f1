//! Ledger record envelope and entry types
//!
//! On-disk record layout:
//! - Record Length (u32 LE), total length including this field
//! - Entry Type (u8)
//! - Sequence Number (u64 LE), starts at 1, strictly +1
//! - Payload (JSON encoded `LedgerEntry`)
//! - Checksum (u32 LE) over everything before it
//!
//! One record is the unit of atomicity: an entry is either fully present with
//! a valid checksum or it does not exist.

use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::commit::InvoiceRecord;
use crate::sequence::SequenceScope;

use super::checksum::compute_checksum;

/// Bytes before the payload: length + type + sequence
pub const HEADER_SIZE: usize = 4 + 1 + 8;
/// Smallest possible record: header + checksum
pub const MIN_RECORD_SIZE: usize = HEADER_SIZE + 4;

/// Entry type tag stored in the record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    ScopeCreated = 1,
    RangeReserved = 2,
    RangeReleased = 3,
    BatchAttempted = 4,
    BatchCommitted = 5,
    BatchFailed = 6,
}

impl EntryType {
    /// Convert from u8, returns None for unknown tags
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(EntryType::ScopeCreated),
            2 => Some(EntryType::RangeReserved),
            3 => Some(EntryType::RangeReleased),
            4 => Some(EntryType::BatchAttempted),
            5 => Some(EntryType::BatchCommitted),
            6 => Some(EntryType::BatchFailed),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A durable state change.
///
/// Every table in the ledger is derived by replaying these in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEntry {
    /// Insert-if-absent of a scope row at high-water-mark zero
    ScopeCreated {
        scope: SequenceScope,
        at: DateTime<Utc>,
    },
    /// Transactional increment: the scope's high-water-mark moves to `end`
    RangeReserved {
        token: Uuid,
        scope: SequenceScope,
        start: u64,
        end: u64,
        source_hash: String,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    /// Outstanding reservation abandoned; its numbers are skipped forever
    RangeReleased {
        token: Uuid,
        reason: String,
        released_at: DateTime<Utc>,
    },
    /// Batch row created or its retry state advanced
    BatchAttempted {
        idempotency_key: String,
        token: Uuid,
        scope: SequenceScope,
        start: u64,
        end: u64,
        source_hash: String,
        source_path: String,
        attempts: u32,
        next_attempt_at: Option<DateTime<Utc>>,
        last_error: Option<String>,
        at: DateTime<Utc>,
    },
    /// All records of a batch, made visible together
    BatchCommitted {
        idempotency_key: String,
        token: Uuid,
        scope: SequenceScope,
        start: u64,
        end: u64,
        source_hash: String,
        source_path: String,
        attempts: u32,
        records: Vec<InvoiceRecord>,
        committed_at: DateTime<Utc>,
    },
    /// Batch gave up: retries exhausted or reservation expired
    BatchFailed {
        idempotency_key: String,
        attempts: u32,
        error: String,
        at: DateTime<Utc>,
    },
}

impl LedgerEntry {
    pub fn entry_type(&self) -> EntryType {
        match self {
            LedgerEntry::ScopeCreated { .. } => EntryType::ScopeCreated,
            LedgerEntry::RangeReserved { .. } => EntryType::RangeReserved,
            LedgerEntry::RangeReleased { .. } => EntryType::RangeReleased,
            LedgerEntry::BatchAttempted { .. } => EntryType::BatchAttempted,
            LedgerEntry::BatchCommitted { .. } => EntryType::BatchCommitted,
            LedgerEntry::BatchFailed { .. } => EntryType::BatchFailed,
        }
    }
}

/// Complete ledger record
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRecord {
    /// Monotonic record number (starts at 1, never repeats)
    pub sequence_number: u64,
    pub entry: LedgerEntry,
}

impl LedgerRecord {
    pub fn new(sequence_number: u64, entry: LedgerEntry) -> Self {
        Self {
            sequence_number,
            entry,
        }
    }

    /// Serialize the complete record to bytes
    pub fn serialize(&self) -> io::Result<Vec<u8>> {
        let payload = serde_json::to_vec(&self.entry)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let record_length = (HEADER_SIZE + payload.len() + 4) as u32;

        let mut record = Vec::with_capacity(record_length as usize);
        record.extend_from_slice(&record_length.to_le_bytes());
        record.push(self.entry.entry_type().as_u8());
        record.extend_from_slice(&self.sequence_number.to_le_bytes());
        record.extend_from_slice(&payload);

        let checksum = compute_checksum(&record);
        record.extend_from_slice(&checksum.to_le_bytes());

        Ok(record)
    }

    /// Deserialize a record from bytes, verifying checksum.
    ///
    /// Returns the record and the number of bytes consumed.
    pub fn deserialize(data: &[u8]) -> io::Result<(Self, usize)> {
        if data.len() < MIN_RECORD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Record too short",
            ));
        }

        let record_length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;

        if record_length < MIN_RECORD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid record length: {}", record_length),
            ));
        }

        if data.len() < record_length {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "Record truncated: expected {} bytes, got {}",
                    record_length,
                    data.len()
                ),
            ));
        }

        let checksum_offset = record_length - 4;
        let stored_checksum = u32::from_le_bytes([
            data[checksum_offset],
            data[checksum_offset + 1],
            data[checksum_offset + 2],
            data[checksum_offset + 3],
        ]);
        let computed_checksum = compute_checksum(&data[..checksum_offset]);

        if computed_checksum != stored_checksum {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Checksum mismatch: computed {:08x}, stored {:08x}",
                    computed_checksum, stored_checksum
                ),
            ));
        }

        let type_byte = data[4];
        let entry_type = EntryType::from_u8(type_byte).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid entry type: {}", type_byte),
            )
        })?;

        let mut seq_buf = [0u8; 8];
        seq_buf.copy_from_slice(&data[5..HEADER_SIZE]);
        let sequence_number = u64::from_le_bytes(seq_buf);

        let entry: LedgerEntry = serde_json::from_slice(&data[HEADER_SIZE..checksum_offset])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if entry.entry_type() != entry_type {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Entry type tag {:?} does not match payload {:?}",
                    entry_type,
                    entry.entry_type()
                ),
            ));
        }

        Ok((
            LedgerRecord {
                sequence_number,
                entry,
            },
            record_length,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope_created() -> LedgerEntry {
        LedgerEntry::ScopeCreated {
            scope: SequenceScope::new("BR01", "20250428"),
            at: Utc::now(),
        }
    }

    #[test]
    fn test_entry_type_tags() {
        for tag in 1..=6u8 {
            assert_eq!(EntryType::from_u8(tag).map(EntryType::as_u8), Some(tag));
        }
        assert!(EntryType::from_u8(0).is_none());
        assert!(EntryType::from_u8(7).is_none());
    }

    #[test]
    fn test_serialized_length_prefix_matches() {
        let record = LedgerRecord::new(1, scope_created());
        let bytes = record.serialize().unwrap();
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(len, bytes.len());

        let (decoded, consumed) = LedgerRecord::deserialize(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_corrupted_payload_fails_checksum() {
        let mut bytes = LedgerRecord::new(1, scope_created()).serialize().unwrap();
        bytes[HEADER_SIZE + 3] ^= 0xFF;
        let err = LedgerRecord::deserialize(&bytes).unwrap_err();
        assert!(err.to_string().contains("Checksum mismatch"));
    }

    #[test]
    fn test_truncated_record_is_unexpected_eof() {
        let bytes = LedgerRecord::new(1, scope_created()).serialize().unwrap();
        let err = LedgerRecord::deserialize(&bytes[..bytes.len() - 2]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_mismatched_type_tag_rejected() {
        let mut bytes = LedgerRecord::new(1, scope_created()).serialize().unwrap();
        bytes[4] = EntryType::BatchFailed.as_u8();
        let checksum_offset = bytes.len() - 4;
        let checksum = compute_checksum(&bytes[..checksum_offset]);
        bytes[checksum_offset..].copy_from_slice(&checksum.to_le_bytes());

        let err = LedgerRecord::deserialize(&bytes).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }
}
