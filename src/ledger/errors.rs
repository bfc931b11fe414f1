//! Ledger error types
//!
//! Error codes:
//! - LRL_LEDGER_APPEND_FAILED (ERROR severity, retryable)
//! - LRL_LEDGER_FSYNC_FAILED (FATAL severity)
//! - LRL_LEDGER_CORRUPTION (FATAL severity)
//! - LRL_LEDGER_CONFLICT (ERROR severity)
//! - LRL_LEDGER_POISONED (FATAL severity)

use std::fmt;
use std::io;

/// Severity levels for ledger errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Operation fails, process continues
    Error,
    /// The ledger can no longer be trusted; the process must stop writing
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Ledger-specific error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerErrorCode {
    /// Ledger write failed before it became durable
    LrlLedgerAppendFailed,
    /// Ledger fsync failed
    LrlLedgerFsyncFailed,
    /// Ledger checksum or structure failure
    LrlLedgerCorruption,
    /// Operation conflicts with durable state
    LrlLedgerConflict,
    /// Ledger refused further writes after an earlier fatal error
    LrlLedgerPoisoned,
}

impl LedgerErrorCode {
    /// Returns the string code
    pub fn code(&self) -> &'static str {
        match self {
            LedgerErrorCode::LrlLedgerAppendFailed => "LRL_LEDGER_APPEND_FAILED",
            LedgerErrorCode::LrlLedgerFsyncFailed => "LRL_LEDGER_FSYNC_FAILED",
            LedgerErrorCode::LrlLedgerCorruption => "LRL_LEDGER_CORRUPTION",
            LedgerErrorCode::LrlLedgerConflict => "LRL_LEDGER_CONFLICT",
            LedgerErrorCode::LrlLedgerPoisoned => "LRL_LEDGER_POISONED",
        }
    }

    /// Returns the severity level for this error
    pub fn severity(&self) -> Severity {
        match self {
            LedgerErrorCode::LrlLedgerAppendFailed => Severity::Error,
            LedgerErrorCode::LrlLedgerFsyncFailed => Severity::Fatal,
            LedgerErrorCode::LrlLedgerCorruption => Severity::Fatal,
            LedgerErrorCode::LrlLedgerConflict => Severity::Error,
            LedgerErrorCode::LrlLedgerPoisoned => Severity::Fatal,
        }
    }
}

impl fmt::Display for LedgerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Ledger error with full context
#[derive(Debug)]
pub struct LedgerError {
    code: LedgerErrorCode,
    message: String,
    details: Option<String>,
    source: Option<io::Error>,
}

impl LedgerError {
    /// A write that did not reach the log. Nothing was applied; retrying is safe.
    pub fn append_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            code: LedgerErrorCode::LrlLedgerAppendFailed,
            message: message.into(),
            details: None,
            source: Some(source),
        }
    }

    /// fsync failed; durability of the tail is unknown
    pub fn fsync_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            code: LedgerErrorCode::LrlLedgerFsyncFailed,
            message: message.into(),
            details: None,
            source: Some(source),
        }
    }

    /// Create a corruption error
    pub fn corruption(message: impl Into<String>) -> Self {
        Self {
            code: LedgerErrorCode::LrlLedgerCorruption,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    /// Create a corruption error with sequence number context
    pub fn corruption_at_sequence(sequence: u64, reason: impl Into<String>) -> Self {
        Self {
            code: LedgerErrorCode::LrlLedgerCorruption,
            message: reason.into(),
            details: Some(format!("sequence_number: {}", sequence)),
            source: None,
        }
    }

    /// Create a corruption error with byte offset context
    pub fn corruption_at_offset(offset: u64, reason: impl Into<String>) -> Self {
        Self {
            code: LedgerErrorCode::LrlLedgerCorruption,
            message: reason.into(),
            details: Some(format!("byte_offset: {}", offset)),
            source: None,
        }
    }

    /// The requested change contradicts durable state
    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            code: LedgerErrorCode::LrlLedgerConflict,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    /// The ledger has stopped accepting writes
    pub fn poisoned(message: impl Into<String>) -> Self {
        Self {
            code: LedgerErrorCode::LrlLedgerPoisoned,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    /// Returns the error code
    pub fn code(&self) -> LedgerErrorCode {
        self.code
    }

    /// Returns the severity level
    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    /// Returns the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns additional error details
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Returns whether this error is fatal
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// Returns whether the failed operation may be retried unchanged.
    pub fn is_transient(&self) -> bool {
        self.code == LedgerErrorCode::LrlLedgerAppendFailed
    }

    /// Returns whether this is a conflict with durable state
    pub fn is_conflict(&self) -> bool {
        self.code == LedgerErrorCode::LrlLedgerConflict
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        if let Some(ref source) = self.source {
            write!(f, " (caused by: {})", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(LedgerErrorCode::LrlLedgerAppendFailed.code(), "LRL_LEDGER_APPEND_FAILED");
        assert_eq!(LedgerErrorCode::LrlLedgerFsyncFailed.code(), "LRL_LEDGER_FSYNC_FAILED");
        assert_eq!(LedgerErrorCode::LrlLedgerCorruption.code(), "LRL_LEDGER_CORRUPTION");
        assert_eq!(LedgerErrorCode::LrlLedgerConflict.code(), "LRL_LEDGER_CONFLICT");
    }

    #[test]
    fn test_append_failed_is_transient_not_fatal() {
        let err = LedgerError::append_failed(
            "write failed",
            io::Error::new(io::ErrorKind::TimedOut, "device busy"),
        );
        assert!(err.is_transient());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fsync_failed_is_fatal() {
        let err = LedgerError::fsync_failed(
            "fsync failed",
            io::Error::new(io::ErrorKind::Other, "disk error"),
        );
        assert!(err.is_fatal());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_conflict_is_neither_fatal_nor_transient() {
        let err = LedgerError::conflict("reservation already released");
        assert!(err.is_conflict());
        assert!(!err.is_fatal());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_display_contains_context() {
        let err = LedgerError::corruption_at_sequence(42, "checksum mismatch");
        let display = format!("{}", err);
        assert!(display.contains("LRL_LEDGER_CORRUPTION"));
        assert!(display.contains("FATAL"));
        assert!(display.contains("checksum mismatch"));
        assert!(display.contains("sequence_number: 42"));
    }
}
