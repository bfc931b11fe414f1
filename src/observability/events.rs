//! Observability events for lrledger
//!
//! Every line the service logs names one of these events. Events are
//! explicit and typed; free-form event names are reserved for
//! `ObservationScope`.

use std::fmt;

use super::logger::Severity;

/// Observable events in lrledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Lifecycle
    /// Process startup begins
    BootStart,
    /// Ledger replayed, ready to ingest
    BootComplete,
    /// Shutdown requested, discovery stopped
    ShutdownStart,
    /// In-flight work drained
    ShutdownComplete,
    /// Configuration loaded
    ConfigLoaded,

    // Ledger
    /// Ledger replayed into tables
    LedgerOpened,
    /// A torn final record was cut off the ledger
    LedgerTornTailDiscarded,
    /// Ledger corruption detected (FATAL)
    LedgerCorruption,
    /// A transient ledger write failure is being retried
    LedgerWriteRetry,

    // Files
    /// New path matched the watch patterns
    FileDiscovered,
    /// Size or hash still changing
    FileStabilizing,
    /// File stable and unique, ingestion starts
    FileReady,
    /// Content hash already seen inside the retention window
    FileDuplicate,
    /// File could not be read after all probe attempts
    FileUnreadable,
    /// File did not stabilize in time
    StabilizationTimeout,
    /// File failed validation; no identifiers consumed
    FileRejected,
    /// File ingested and committed
    FileCompleted,
    /// Commit exhausted; reservation released
    FileFailed,
    /// Content already committed by an earlier run
    FileSkipped,
    /// Source removed after processing
    FileDeleted,

    // Sequence
    /// Identifier range reserved
    ReservationIssued,
    /// Outstanding reservation picked up again after restart
    ReservationResumed,
    /// Identifier range released; numbers skipped forever
    ReservationReleased,
    /// Expired reservation replaced by a fresh range before committing
    ReservationRenewed,

    // Commit
    /// Batch and records durable
    BatchCommitted,
    /// Commit found an earlier commit of the same key
    BatchAlreadyCommitted,
    /// Commit attempt failed, retry scheduled
    BatchRetryScheduled,
    /// Retries exhausted or reservation expired
    BatchFailed,

    // Artifacts
    /// Committed records handed to the artifact sink
    ArtifactEmitted,
    /// Artifact sink failed; commit stands
    ArtifactFailed,

    // Registry
    /// Expired tracker entries pruned
    RegistryPruned,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::BootStart => "LRLEDGER_STARTUP_BEGIN",
            Event::BootComplete => "LRLEDGER_STARTUP_COMPLETE",
            Event::ShutdownStart => "SHUTDOWN_START",
            Event::ShutdownComplete => "SHUTDOWN_COMPLETE",
            Event::ConfigLoaded => "CONFIG_LOADED",

            Event::LedgerOpened => "LEDGER_OPENED",
            Event::LedgerTornTailDiscarded => "LEDGER_TORN_TAIL_DISCARDED",
            Event::LedgerCorruption => "LEDGER_CORRUPTION",
            Event::LedgerWriteRetry => "LEDGER_WRITE_RETRY",

            Event::FileDiscovered => "FILE_DISCOVERED",
            Event::FileStabilizing => "FILE_STABILIZING",
            Event::FileReady => "FILE_READY",
            Event::FileDuplicate => "FILE_DUPLICATE",
            Event::FileUnreadable => "FILE_UNREADABLE",
            Event::StabilizationTimeout => "STABILIZATION_TIMEOUT",
            Event::FileRejected => "FILE_REJECTED",
            Event::FileCompleted => "FILE_COMPLETED",
            Event::FileFailed => "FILE_FAILED",
            Event::FileSkipped => "FILE_SKIPPED",
            Event::FileDeleted => "FILE_DELETED",

            Event::ReservationIssued => "RESERVATION_ISSUED",
            Event::ReservationResumed => "RESERVATION_RESUMED",
            Event::ReservationReleased => "RESERVATION_RELEASED",
            Event::ReservationRenewed => "RESERVATION_RENEWED",

            Event::BatchCommitted => "BATCH_COMMITTED",
            Event::BatchAlreadyCommitted => "BATCH_ALREADY_COMMITTED",
            Event::BatchRetryScheduled => "BATCH_RETRY_SCHEDULED",
            Event::BatchFailed => "BATCH_FAILED",

            Event::ArtifactEmitted => "ARTIFACT_EMITTED",
            Event::ArtifactFailed => "ARTIFACT_FAILED",

            Event::RegistryPruned => "REGISTRY_PRUNED",
        }
    }

    /// Severity the event is logged at
    pub fn severity(&self) -> Severity {
        match self {
            Event::LedgerCorruption => Severity::Fatal,
            Event::FileUnreadable
            | Event::StabilizationTimeout
            | Event::FileFailed
            | Event::BatchFailed => Severity::Error,
            Event::LedgerTornTailDiscarded
            | Event::LedgerWriteRetry
            | Event::FileDuplicate
            | Event::FileRejected
            | Event::ReservationReleased
            | Event::ReservationRenewed
            | Event::BatchRetryScheduled
            | Event::ArtifactFailed => Severity::Warn,
            Event::FileStabilizing | Event::RegistryPruned => Severity::Trace,
            _ => Severity::Info,
        }
    }

    /// Returns true if this event indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
