//! Commit Coordinator
//!
//! Binds validated invoice rows to a reservation and persists them as one
//! idempotent, atomic batch.

mod batch;
mod coordinator;
mod errors;

pub use batch::{CommitBatch, IdempotencyKey, InvoiceFields, InvoiceRecord};
pub use coordinator::{CommitCoordinator, CommitReceipt, REASON_COMMIT_FAILED};
pub use errors::{CommitError, CommitResult};
