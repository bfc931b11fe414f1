//! Commit coordinator errors

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::LedgerError;
use crate::sequence::AuthorityError;

pub type CommitResult<T> = Result<T, CommitError>;

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("Batch has {actual} records but reservation {token} holds {expected} identifiers")]
    CountMismatch {
        token: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("Reservation {token} expired at {expires_at}")]
    ReservationExpired {
        token: Uuid,
        expires_at: DateTime<Utc>,
    },

    #[error("Reservation {0} is no longer outstanding")]
    ReservationNotOutstanding(Uuid),

    #[error("Batch {0} was already marked failed")]
    AlreadyFailed(String),

    #[error("Batch {key} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        key: String,
        attempts: u32,
        last_error: String,
    },

    #[error(transparent)]
    Identifier(#[from] AuthorityError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl CommitError {
    pub fn code(&self) -> &'static str {
        match self {
            CommitError::CountMismatch { .. } => "LRL_COMMIT_COUNT_MISMATCH",
            CommitError::ReservationExpired { .. } => "LRL_COMMIT_RESERVATION_EXPIRED",
            CommitError::ReservationNotOutstanding(_) => "LRL_COMMIT_RESERVATION_NOT_OUTSTANDING",
            CommitError::AlreadyFailed(_) => "LRL_COMMIT_ALREADY_FAILED",
            CommitError::Exhausted { .. } => "LRL_COMMIT_EXHAUSTED",
            CommitError::Identifier(e) => e.code(),
            CommitError::Ledger(e) => e.code().code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        let err = CommitError::Exhausted {
            key: "k".into(),
            attempts: 3,
            last_error: "busy".into(),
        };
        assert_eq!(err.code(), "LRL_COMMIT_EXHAUSTED");
        assert!(err.to_string().contains("after 3 attempts"));

        let err = CommitError::from(LedgerError::corruption("bad"));
        assert_eq!(err.code(), "LRL_LEDGER_CORRUPTION");
    }
}
