//! Observability subsystem for lrledger
//!
//! - Structured logging (JSON lines)
//! - Per-process ingestion counters
//! - Durable operator audit log
//!
//! Observability never changes the outcome of an operation: logging and
//! audit failures are reported, not propagated into ingestion results.
//!
//! ```ignore
//! use lrledger::observability::{log_event_with_fields, Event};
//!
//! log_event_with_fields(Event::ReservationIssued, &[("scope", "BR01/20250428")]);
//! ```

pub mod audit;
mod events;
mod logger;
mod metrics;
mod scope;

pub use audit::{
    AuditAction, AuditLog, AuditOutcome, AuditRecord, FileAuditLog, MemoryAuditLog,
    AUDIT_FILE_NAME,
};
pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scope::{ObservationScope, Timer};

use std::sync::Arc;

use tokio::task::spawn_blocking;

/// Log an event at its own severity
pub fn log_event(event: Event) {
    Logger::log(event.severity(), event.as_str(), &[]);
}

/// Log an event with fields at its own severity
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}

/// Append an audit record on the blocking pool, logging instead of
/// failing if the write fails
pub async fn record_audit(log: &Arc<dyn AuditLog>, record: AuditRecord) {
    let action = record.action;
    let written = spawn_blocking({
        let log = Arc::clone(log);
        move || log.append(&record)
    })
    .await;

    let error = match written {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(e) => e.to_string(),
    };
    Logger::error(
        "AUDIT_WRITE_FAILED",
        &[("action", action.as_str()), ("error", &error)],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event() {
        log_event(Event::BootStart);
        log_event_with_fields(Event::ConfigLoaded, &[("data_dir", "/tmp/test")]);
    }

    #[tokio::test]
    async fn test_record_audit_appends() {
        let log = Arc::new(MemoryAuditLog::new());
        let shared: Arc<dyn AuditLog> = log.clone();
        record_audit(
            &shared,
            AuditRecord::new(AuditAction::FileRejected, AuditOutcome::Rejected),
        )
        .await;
        assert_eq!(log.len(), 1);
    }
}
