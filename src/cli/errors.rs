//! CLI-specific error types
//!
//! Every CLI error ends the process with a non-zero exit code.

use std::fmt;
use std::io;

use crate::commit::CommitError;
use crate::config::ConfigError;
use crate::ingest::IngestError;
use crate::ledger::LedgerError;
use crate::sequence::AuthorityError;

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file error
    ConfigError,
    /// I/O error (stdout, audit log)
    IoError,
    /// Already initialized
    AlreadyInitialized,
    /// Not initialized
    NotInitialized,
    /// Ledger replay or runtime startup failed
    BootFailed,
    /// The command itself failed
    CommandFailed,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "LRL_CLI_CONFIG_ERROR",
            Self::IoError => "LRL_CLI_IO_ERROR",
            Self::AlreadyInitialized => "LRL_CLI_ALREADY_INITIALIZED",
            Self::NotInitialized => "LRL_CLI_NOT_INITIALIZED",
            Self::BootFailed => "LRL_CLI_BOOT_FAILED",
            Self::CommandFailed => "LRL_CLI_COMMAND_FAILED",
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn already_initialized() -> Self {
        Self::new(
            CliErrorCode::AlreadyInitialized,
            "Data directory already initialized",
        )
    }

    pub fn not_initialized() -> Self {
        Self::new(
            CliErrorCode::NotInitialized,
            "Data directory not initialized. Run 'lrledger init' first.",
        )
    }

    pub fn boot_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::BootFailed, msg)
    }

    /// Command failed; the message carries the component error code
    pub fn command_failed(code: &str, msg: impl fmt::Display) -> Self {
        Self::new(CliErrorCode::CommandFailed, format!("{}: {}", code, msg))
    }

    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        Self::config_error(format!("{}: {}", e.code(), e))
    }
}

impl From<LedgerError> for CliError {
    fn from(e: LedgerError) -> Self {
        Self::boot_failed(e.to_string())
    }
}

impl From<AuthorityError> for CliError {
    fn from(e: AuthorityError) -> Self {
        Self::command_failed(e.code(), e)
    }
}

impl From<CommitError> for CliError {
    fn from(e: CommitError) -> Self {
        Self::command_failed(e.code(), e)
    }
}

impl From<IngestError> for CliError {
    fn from(e: IngestError) -> Self {
        Self::command_failed(e.code(), e)
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;
