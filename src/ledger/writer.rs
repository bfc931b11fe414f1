//! Ledger writer with fsync enforcement
//!
//! - Every append is followed by fsync before it is acknowledged
//! - A failed write is rolled back to the last durable length so the next
//!   append never lands behind garbage
//! - After an fsync failure the writer is poisoned: the durability of the
//!   tail is unknown and no further write is accepted

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::crash_point::{maybe_crash, points};
use crate::observability::{log_event_with_fields, Event};

use super::errors::{LedgerError, LedgerResult};
use super::reader::{LedgerReader, Replay};
use super::record::{LedgerEntry, LedgerRecord};

/// Ledger file name inside `<data_dir>/ledger/`
pub const LEDGER_FILE_NAME: &str = "ledger.log";

/// Append-only ledger writer.
pub struct LedgerWriter {
    path: PathBuf,
    file: File,
    /// Next sequence number to assign (starts at 1, never reused)
    next_sequence: u64,
    /// Length of the durable prefix
    durable_len: u64,
    poisoned: bool,
}

impl LedgerWriter {
    /// Opens or creates `<data_dir>/ledger/ledger.log`, replays it and
    /// discards a torn final record.
    ///
    /// Returns the writer positioned after the last intact record, plus the
    /// replayed records for rebuilding state.
    pub fn open(data_dir: &Path) -> LedgerResult<(Self, Replay)> {
        let ledger_dir = data_dir.join("ledger");
        let path = ledger_dir.join(LEDGER_FILE_NAME);

        fs::create_dir_all(&ledger_dir).map_err(|e| {
            LedgerError::append_failed(
                format!("Failed to create ledger directory: {}", ledger_dir.display()),
                e,
            )
        })?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                LedgerError::append_failed(
                    format!("Failed to open ledger file: {}", path.display()),
                    e,
                )
            })?;

        let replay = LedgerReader::open(&path)?.replay()?;

        if let Some((offset, ref reason)) = replay.torn_tail {
            file.set_len(replay.valid_len).map_err(|e| {
                LedgerError::fsync_failed(
                    format!("Failed to discard torn ledger tail at offset {}", offset),
                    e,
                )
            })?;
            file.sync_all().map_err(|e| {
                LedgerError::fsync_failed("fsync failed after discarding torn ledger tail", e)
            })?;
            log_event_with_fields(
                Event::LedgerTornTailDiscarded,
                &[
                    ("offset", &offset.to_string()),
                    ("reason", reason),
                    ("path", &path.display().to_string()),
                ],
            );
        }

        let next_sequence = replay
            .records
            .last()
            .map(|r| r.sequence_number + 1)
            .unwrap_or(1);

        let writer = Self {
            path,
            file,
            next_sequence,
            durable_len: replay.valid_len,
            poisoned: false,
        };

        Ok((writer, replay))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the last assigned sequence number, or 0 if nothing was written.
    pub fn last_sequence_number(&self) -> u64 {
        self.next_sequence - 1
    }

    /// Appends an entry and fsyncs it.
    ///
    /// Returns the sequence number assigned to the record. Only after this
    /// returns `Ok` does the entry exist.
    pub fn append(&mut self, entry: LedgerEntry) -> LedgerResult<u64> {
        if self.poisoned {
            return Err(LedgerError::poisoned(
                "ledger writer refused append after an earlier fsync failure",
            ));
        }

        let sequence_number = self.next_sequence;
        let bytes = LedgerRecord::new(sequence_number, entry)
            .serialize()
            .map_err(|e| {
                LedgerError::append_failed(
                    format!("Failed to encode ledger record {}", sequence_number),
                    e,
                )
            })?;

        maybe_crash(points::LEDGER_BEFORE_APPEND);

        if let Err(e) = self.file.write_all(&bytes) {
            self.roll_back();
            return Err(LedgerError::append_failed(
                format!("Failed to write ledger record {}", sequence_number),
                e,
            ));
        }

        maybe_crash(points::LEDGER_BEFORE_FSYNC);

        if let Err(e) = self.file.sync_data() {
            self.poisoned = true;
            return Err(LedgerError::fsync_failed(
                format!("fsync failed after ledger append at sequence {}", sequence_number),
                e,
            ));
        }

        maybe_crash(points::LEDGER_AFTER_FSYNC);

        self.durable_len += bytes.len() as u64;
        self.next_sequence += 1;

        Ok(sequence_number)
    }

    /// Cut a partially written record back off the file.
    fn roll_back(&mut self) {
        let restored = self
            .file
            .set_len(self.durable_len)
            .and_then(|_| self.file.sync_all());
        if restored.is_err() {
            self.poisoned = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::SequenceScope;
    use chrono::Utc;
    use tempfile::TempDir;

    fn scope_entry(branch: &str) -> LedgerEntry {
        LedgerEntry::ScopeCreated {
            scope: SequenceScope::new(branch, "20250428"),
            at: Utc::now(),
        }
    }

    #[test]
    fn test_writer_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let (_writer, replay) = LedgerWriter::open(temp_dir.path()).unwrap();

        assert!(temp_dir.path().join("ledger").join(LEDGER_FILE_NAME).exists());
        assert!(replay.records.is_empty());
    }

    #[test]
    fn test_sequence_numbers_start_at_one_and_increment() {
        let temp_dir = TempDir::new().unwrap();
        let (mut writer, _) = LedgerWriter::open(temp_dir.path()).unwrap();

        assert_eq!(writer.last_sequence_number(), 0);
        assert_eq!(writer.append(scope_entry("BR01")).unwrap(), 1);
        assert_eq!(writer.append(scope_entry("BR02")).unwrap(), 2);
        assert_eq!(writer.last_sequence_number(), 2);
    }

    #[test]
    fn test_reopen_continues_sequence() {
        let temp_dir = TempDir::new().unwrap();
        {
            let (mut writer, _) = LedgerWriter::open(temp_dir.path()).unwrap();
            writer.append(scope_entry("BR01")).unwrap();
            writer.append(scope_entry("BR02")).unwrap();
        }

        let (mut writer, replay) = LedgerWriter::open(temp_dir.path()).unwrap();
        assert_eq!(replay.records.len(), 2);
        assert_eq!(writer.last_sequence_number(), 2);
        assert_eq!(writer.append(scope_entry("BR03")).unwrap(), 3);
    }

    #[test]
    fn test_reopen_discards_torn_tail_and_appends_cleanly() {
        let temp_dir = TempDir::new().unwrap();
        let path;
        {
            let (mut writer, _) = LedgerWriter::open(temp_dir.path()).unwrap();
            writer.append(scope_entry("BR01")).unwrap();
            path = writer.path().to_path_buf();
        }

        let torn = LedgerRecord::new(2, scope_entry("BR02")).serialize().unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&torn[..torn.len() - 5]).unwrap();
        drop(file);

        {
            let (mut writer, replay) = LedgerWriter::open(temp_dir.path()).unwrap();
            assert_eq!(replay.records.len(), 1);
            assert!(replay.torn_tail.is_some());
            assert_eq!(writer.append(scope_entry("BR03")).unwrap(), 2);
        }

        let (_, replay) = LedgerWriter::open(temp_dir.path()).unwrap();
        assert_eq!(replay.records.len(), 2);
        assert!(replay.torn_tail.is_none());
    }
}
