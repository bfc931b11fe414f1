//! Ingestion Orchestrator
//!
//! Drives discovered files through stabilization, validation, reservation
//! and commit, and hands committed batches to the artifact sink.

mod errors;
mod orchestrator;
mod reader;
mod service;
mod sink;
mod state;

pub use errors::{IngestError, IngestResult};
pub use orchestrator::{FileReport, Orchestrator, OrchestratorConfig, ReportError};
pub use reader::{FieldType, InvoiceReader, JsonBatchReader, ReadOutcome, ReaderConfig, RowError};
pub use service::{FileFilter, WatchConfig, WatchService, WatchSummary};
pub use sink::{ArtifactSink, BatchArtifact, ManifestSink, MemorySink, NullSink};
pub use state::FileState;
