//! Ingestion errors

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::commit::CommitError;
use crate::ledger::LedgerError;
use crate::sequence::AuthorityError;
use crate::stabilization::TrackerError;

use super::reader::RowError;
use super::state::FileState;

pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed batch file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("Missing required column(s) after mapping: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("{} invalid row(s), {}", .0.len(), first_row(.0))]
    InvalidRows(Vec<RowError>),

    #[error("No valid records in batch")]
    NoValidRows,

    #[error("Invalid file state transition {from} -> {to}")]
    InvalidTransition { from: FileState, to: FileState },

    #[error("Invalid watch pattern: {0}")]
    InvalidGlob(String),

    #[error("Cannot scan watch directory {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Artifact sink failed: {0}")]
    Sink(String),

    #[error("Ingestion cancelled")]
    Cancelled,

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Authority(#[from] AuthorityError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

fn first_row(rows: &[RowError]) -> String {
    rows.first()
        .map(|r| format!("first at row {}: {}", r.row, r.message))
        .unwrap_or_default()
}

impl IngestError {
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::Read { .. } => "LRL_INGEST_READ",
            IngestError::Malformed { .. } => "LRL_INGEST_MALFORMED",
            IngestError::MissingColumns(_) => "LRL_INGEST_MISSING_COLUMNS",
            IngestError::InvalidRows(_) => "LRL_INGEST_INVALID_ROWS",
            IngestError::NoValidRows => "LRL_INGEST_NO_VALID_ROWS",
            IngestError::InvalidTransition { .. } => "LRL_INGEST_INVALID_TRANSITION",
            IngestError::InvalidGlob(_) => "LRL_INGEST_INVALID_GLOB",
            IngestError::Scan { .. } => "LRL_INGEST_SCAN",
            IngestError::Sink(_) => "LRL_INGEST_SINK",
            IngestError::Cancelled => "LRL_INGEST_CANCELLED",
            IngestError::Tracker(e) => e.code(),
            IngestError::Authority(e) => e.code(),
            IngestError::Commit(e) => e.code(),
            IngestError::Ledger(e) => e.code().code(),
        }
    }

    /// A validation failure: the file is rejected and no identifiers are consumed
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            IngestError::Malformed { .. }
                | IngestError::MissingColumns(_)
                | IngestError::InvalidRows(_)
                | IngestError::NoValidRows
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_and_codes() {
        let err = IngestError::InvalidRows(vec![RowError {
            row: 2,
            message: "Missing required field: weight".into(),
        }]);
        assert!(err.is_rejection());
        assert_eq!(err.code(), "LRL_INGEST_INVALID_ROWS");
        assert!(err.to_string().contains("first at row 2"));

        let err = IngestError::from(TrackerError::Poisoned);
        assert!(!err.is_rejection());
        assert_eq!(err.code(), "LRL_TRACKER_POISONED");
    }
}
