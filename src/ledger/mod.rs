//! Durable ledger for lrledger
//!
//! The ledger is the only durable state in the system. Scopes, reservations,
//! released ranges, batches and committed invoice records are all tables
//! derived by replaying one append-only log.
//!
//! # Guarantees
//!
//! - fsync before acknowledgment: no reservation or commit exists unless its
//!   record is fully persisted
//! - Checksums on every record
//! - Sequential replay on open; state is never cached outside the replay
//! - Corruption inside the log halts startup
//! - A torn final record is discarded, since it was never acknowledged
//! - One record per batch: all of a batch's invoices become visible together

mod checksum;
mod errors;
mod fault;
mod reader;
mod record;
mod state;
mod store;
mod writer;

pub use checksum::compute_checksum;
pub use errors::{LedgerError, LedgerErrorCode, LedgerResult, Severity};
pub use fault::FaultyLedger;
pub use reader::{LedgerReader, Replay};
pub use record::{EntryType, LedgerEntry, LedgerRecord};
pub use state::{
    BatchRow, BatchStatus, LedgerState, ReleasedRange, ReservationRow, ReservationState, ScopeRow,
};
pub use store::{offload, BatchBinding, BatchWriteOutcome, FileLedger, LedgerStore, ReserveRequest};
pub use writer::{LedgerWriter, LEDGER_FILE_NAME};
