//! Sequence authority errors

use thiserror::Error;
use uuid::Uuid;

use crate::ledger::LedgerError;

pub type AuthorityResult<T> = Result<T, AuthorityError>;

#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Reservation count must be at least 1")]
    InvalidCount,

    #[error("Reservation not found: {0}")]
    NotFound(Uuid),

    #[error("Reservation {0} is already committed")]
    AlreadyCommitted(Uuid),

    #[error("Reservation {0} is already released")]
    AlreadyReleased(Uuid),

    #[error("Reservation {token} has not expired (expires at {expires_at})")]
    NotExpired {
        token: Uuid,
        expires_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("Invalid identifier pattern: {0}")]
    InvalidPattern(String),

    #[error("Sequence {offset} does not fit in {width} digits")]
    PatternOverflow { offset: u64, width: usize },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl AuthorityError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthorityError::InvalidScope(_) => "LRL_SEQUENCE_INVALID_SCOPE",
            AuthorityError::InvalidCount => "LRL_SEQUENCE_INVALID_COUNT",
            AuthorityError::NotFound(_) => "LRL_SEQUENCE_NOT_FOUND",
            AuthorityError::AlreadyCommitted(_) => "LRL_SEQUENCE_ALREADY_COMMITTED",
            AuthorityError::AlreadyReleased(_) => "LRL_SEQUENCE_ALREADY_RELEASED",
            AuthorityError::NotExpired { .. } => "LRL_SEQUENCE_NOT_EXPIRED",
            AuthorityError::InvalidPattern(_) => "LRL_SEQUENCE_INVALID_PATTERN",
            AuthorityError::PatternOverflow { .. } => "LRL_SEQUENCE_PATTERN_OVERFLOW",
            AuthorityError::Ledger(e) => e.code().code(),
        }
    }

    /// Whether the error is a transient storage failure that survived local retry
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthorityError::Ledger(e) if e.is_transient())
    }
}
