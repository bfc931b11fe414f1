//! Ledger reader with strict corruption detection
//!
//! Replay rules:
//! - Records are read strictly in sequence number order, starting at 1
//! - A checksum or structure failure followed by further data is corruption
//!   and halts startup
//! - A damaged *final* record is a torn write: the process died before the
//!   record's fsync returned, so it was never acknowledged. It is reported to
//!   the caller, who discards it.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use super::errors::{LedgerError, LedgerResult};
use super::record::{LedgerRecord, MIN_RECORD_SIZE};

/// Result of reading one frame from the log
enum Frame {
    Record(LedgerRecord),
    End,
    TornTail { offset: u64, reason: String },
}

/// Outcome of a full tolerant replay
#[derive(Debug)]
pub struct Replay {
    /// All intact records in order
    pub records: Vec<LedgerRecord>,
    /// Byte length of the intact prefix
    pub valid_len: u64,
    /// Offset and reason of a discarded torn tail, if any
    pub torn_tail: Option<(u64, String)>,
}

/// Sequential ledger reader.
pub struct LedgerReader {
    reader: BufReader<File>,
    current_offset: u64,
    file_size: u64,
    last_sequence: u64,
}

impl LedgerReader {
    /// Opens a ledger file for reading.
    pub fn open(path: &Path) -> LedgerResult<Self> {
        let file = File::open(path).map_err(|e| {
            LedgerError::corruption(format!(
                "Failed to open ledger file: {}: {}",
                path.display(),
                e
            ))
        })?;

        let file_size = file
            .metadata()
            .map_err(|e| LedgerError::corruption(format!("Failed to read ledger metadata: {}", e)))?
            .len();

        Ok(Self {
            reader: BufReader::new(file),
            current_offset: 0,
            file_size,
            last_sequence: 0,
        })
    }

    /// Reads every intact record, stopping at a torn final record.
    pub fn replay(mut self) -> LedgerResult<Replay> {
        let mut records = Vec::new();
        loop {
            match self.next_frame()? {
                Frame::Record(record) => records.push(record),
                Frame::End => {
                    return Ok(Replay {
                        records,
                        valid_len: self.current_offset,
                        torn_tail: None,
                    })
                }
                Frame::TornTail { offset, reason } => {
                    return Ok(Replay {
                        records,
                        valid_len: offset,
                        torn_tail: Some((offset, reason)),
                    })
                }
            }
        }
    }

    fn next_frame(&mut self) -> LedgerResult<Frame> {
        if self.current_offset >= self.file_size {
            return Ok(Frame::End);
        }

        let offset = self.current_offset;
        let remaining = self.file_size - offset;

        if remaining < MIN_RECORD_SIZE as u64 {
            return Ok(Frame::TornTail {
                offset,
                reason: format!(
                    "{} trailing bytes, minimum record size is {}",
                    remaining, MIN_RECORD_SIZE
                ),
            });
        }

        let mut len_buf = [0u8; 4];
        self.reader.read_exact(&mut len_buf).map_err(|e| {
            LedgerError::corruption_at_offset(offset, format!("Failed to read record length: {}", e))
        })?;
        let record_length = u32::from_le_bytes(len_buf) as u64;

        if record_length < MIN_RECORD_SIZE as u64 {
            return Err(LedgerError::corruption_at_offset(
                offset,
                format!("Invalid record length: {}", record_length),
            ));
        }

        if record_length > remaining {
            return Ok(Frame::TornTail {
                offset,
                reason: format!(
                    "record length {} exceeds remaining file size {}",
                    record_length, remaining
                ),
            });
        }

        let mut record_buf = vec![0u8; record_length as usize];
        record_buf[0..4].copy_from_slice(&len_buf);
        self.reader.read_exact(&mut record_buf[4..]).map_err(|e| {
            LedgerError::corruption_at_offset(offset, format!("Failed to read record body: {}", e))
        })?;

        let is_final = offset + record_length == self.file_size;
        let (record, consumed) = match LedgerRecord::deserialize(&record_buf) {
            Ok(decoded) => decoded,
            Err(e) if is_final && e.kind() != io::ErrorKind::UnexpectedEof => {
                return Ok(Frame::TornTail {
                    offset,
                    reason: e.to_string(),
                })
            }
            Err(e) => return Err(LedgerError::corruption_at_offset(offset, e.to_string())),
        };

        let expected = self.last_sequence + 1;
        if record.sequence_number != expected {
            return Err(LedgerError::corruption_at_sequence(
                record.sequence_number,
                format!(
                    "Non-sequential sequence number: expected {}, got {}",
                    expected, record.sequence_number
                ),
            ));
        }

        self.current_offset += consumed as u64;
        self.last_sequence = record.sequence_number;

        Ok(Frame::Record(record))
    }
}
