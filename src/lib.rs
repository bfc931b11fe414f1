//! lrledger - gapless lorry-receipt numbering for invoice batches
//!
//! Watches a drop directory for invoice batch files, waits until each file
//! is stable and unique, reserves a contiguous range of receipt identifiers
//! for its rows and commits the numbered records to a durable ledger as one
//! idempotent batch.

pub mod cli;
pub mod commit;
pub mod config;
pub mod crash_point;
pub mod ingest;
pub mod ledger;
pub mod observability;
pub mod retry;
pub mod sequence;
pub mod stabilization;
