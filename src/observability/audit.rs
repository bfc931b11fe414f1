//! Operator audit log
//!
//! - Every terminal failure of a file and every released or committed range
//!   is recorded, keyed by file and reservation token
//! - The audit log is append-only and durable
//! - Crash-safe: each record is synced before `append` returns
//! - No retention or purging; that is an operator concern

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit log file name inside the data directory
pub const AUDIT_FILE_NAME: &str = "audit.log";

/// Audit action type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    /// File failed validation; no identifiers consumed
    FileRejected,
    /// File's commit exhausted its retries
    FileFailed,
    /// File content was already committed
    FileSkipped,
    /// File did not stabilize in time
    StabilizationTimeout,
    /// File could not be read
    FileUnreadable,
    /// Identifier range released and skipped forever
    ReservationReleased,
    /// Batch committed
    BatchCommitted,
    /// Batch marked failed
    BatchFailed,
    /// Operator released an expired reservation
    ForceRelease,
}

impl AuditAction {
    /// Returns the action name string.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::FileRejected => "FILE_REJECTED",
            AuditAction::FileFailed => "FILE_FAILED",
            AuditAction::FileSkipped => "FILE_SKIPPED",
            AuditAction::StabilizationTimeout => "STABILIZATION_TIMEOUT",
            AuditAction::FileUnreadable => "FILE_UNREADABLE",
            AuditAction::ReservationReleased => "RESERVATION_RELEASED",
            AuditAction::BatchCommitted => "BATCH_COMMITTED",
            AuditAction::BatchFailed => "BATCH_FAILED",
            AuditAction::ForceRelease => "FORCE_RELEASE",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Audit record outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Success,
    Rejected,
    Failed,
    Skipped,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "SUCCESS",
            AuditOutcome::Rejected => "REJECTED",
            AuditOutcome::Failed => "FAILED",
            AuditOutcome::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single audit record. One JSON object per line on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Inclusive identifier offsets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<(u64, u64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditRecord {
    pub fn new(action: AuditAction, outcome: AuditOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            ts: Utc::now(),
            action,
            outcome,
            path: None,
            content_hash: None,
            token: None,
            scope: None,
            range: None,
            idempotency_key: None,
            operator: None,
            error: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    pub fn with_token(mut self, token: Uuid) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_range(mut self, start: u64, end: u64) -> Self {
        self.range = Some((start, end));
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = Some(operator.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    /// Serialize to one JSON line (without the newline).
    pub fn to_json(&self) -> io::Result<String> {
        serde_json::to_string(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Audit log trait.
///
/// Appends are synchronous and durable: the record is visible and synced
/// when `append` returns.
pub trait AuditLog: Send + Sync {
    fn append(&self, record: &AuditRecord) -> io::Result<()>;

    fn sync(&self) -> io::Result<()>;
}

fn lock_poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "audit log lock poisoned")
}

/// File-based audit log: append-only JSON lines, fsync after each record.
pub struct FileAuditLog {
    path: PathBuf,
    writer: Arc<Mutex<BufWriter<File>>>,
}

impl FileAuditLog {
    /// Open or create an audit log file.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record from an audit log file. A missing file is empty.
    ///
    /// A final line that does not parse is a write cut short by a crash and
    /// is skipped; a bad line followed by more records is an error.
    pub fn read_all(path: impl AsRef<Path>) -> io::Result<Vec<AuditRecord>> {
        let file = match File::open(path.as_ref()) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let lines: Vec<String> = BufReader::new(file).lines().collect::<io::Result<_>>()?;
        let last = lines.len().saturating_sub(1);
        let mut records = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditRecord>(line) {
                Ok(record) => records.push(record),
                Err(_) if index == last => break,
                Err(e) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("audit log line {}: {}", index + 1, e),
                    ))
                }
            }
        }
        Ok(records)
    }
}

impl AuditLog for FileAuditLog {
    fn append(&self, record: &AuditRecord) -> io::Result<()> {
        let json = record.to_json()?;
        let mut writer = self.writer.lock().map_err(|_| lock_poisoned())?;
        writeln!(writer, "{}", json)?;
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    fn sync(&self) -> io::Result<()> {
        let writer = self.writer.lock().map_err(|_| lock_poisoned())?;
        writer.get_ref().sync_all()
    }
}

/// In-memory audit log for testing.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Records with the given action, in append order
    pub fn with_action(&self, action: AuditAction) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.action == action)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditLog for MemoryAuditLog {
    fn append(&self, record: &AuditRecord) -> io::Result<()> {
        self.records
            .lock()
            .map_err(|_| lock_poisoned())?
            .push(record.clone());
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_audit_record_builder() {
        let token = Uuid::new_v4();
        let record = AuditRecord::new(AuditAction::ReservationReleased, AuditOutcome::Success)
            .with_token(token)
            .with_scope("BR01/20250428")
            .with_range(9, 11);

        assert_eq!(record.action, AuditAction::ReservationReleased);
        assert_eq!(record.token, Some(token));
        assert_eq!(record.range, Some((9, 11)));
    }

    #[test]
    fn test_audit_record_json() {
        let record = AuditRecord::new(AuditAction::FileRejected, AuditOutcome::Rejected)
            .with_path("drop/batch.json")
            .with_error("row 3: missing consignor");

        let json = record.to_json().unwrap();
        assert!(json.contains("\"FILE_REJECTED\""));
        assert!(json.contains("\"REJECTED\""));
        assert!(json.contains("drop/batch.json"));
        assert!(!json.contains("token"));
    }

    #[test]
    fn test_memory_audit_log() {
        let log = MemoryAuditLog::new();
        log.append(&AuditRecord::new(AuditAction::FileFailed, AuditOutcome::Failed))
            .unwrap();
        log.append(&AuditRecord::new(AuditAction::BatchCommitted, AuditOutcome::Success))
            .unwrap();

        assert_eq!(log.len(), 2);
        assert_eq!(log.with_action(AuditAction::FileFailed).len(), 1);
        assert_eq!(log.records()[1].action, AuditAction::BatchCommitted);
    }

    #[test]
    fn test_file_audit_log_reads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(AUDIT_FILE_NAME);

        let log = FileAuditLog::open(&path).unwrap();
        let record = AuditRecord::new(AuditAction::ForceRelease, AuditOutcome::Success)
            .with_operator("cli")
            .with_range(4, 8);
        log.append(&record).unwrap();

        let records = FileAuditLog::read_all(&path).unwrap();
        assert_eq!(records, vec![record]);
    }

    #[test]
    fn test_read_all_skips_cut_off_final_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(AUDIT_FILE_NAME);

        let log = FileAuditLog::open(&path).unwrap();
        log.append(&AuditRecord::new(AuditAction::FileSkipped, AuditOutcome::Skipped))
            .unwrap();
        let mut contents = fs::read_to_string(&path).unwrap();
        contents.push_str("{\"id\":\"abc");
        fs::write(&path, contents).unwrap();

        assert_eq!(FileAuditLog::read_all(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_read_all_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        assert!(FileAuditLog::read_all(dir.path().join("none.log")).unwrap().is_empty());
    }
}
