//! CLI command implementations
//!
//! Every command loads the configuration, replays the ledger and then does
//! one thing. `watch` and `process` run the ingestion stack on a tokio
//! runtime owned by the command.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use uuid::Uuid;

use crate::commit::CommitCoordinator;
use crate::config::Config;
use crate::ingest::{
    ArtifactSink, InvoiceReader, JsonBatchReader, ManifestSink, Orchestrator, WatchService,
};
use crate::ledger::{FileLedger, LedgerStore};
use crate::observability::{
    log_event, log_event_with_fields, AuditLog, Event, FileAuditLog, MetricsRegistry,
    AUDIT_FILE_NAME,
};
use crate::sequence::SequenceAuthority;
use crate::stabilization::StabilizationTracker;

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::{write_error, write_response};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command. A failed
/// command also reports its error as a JSON object on stdout.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    let result = run_command(cli.command);
    if let Err(ref e) = result {
        // Best effort; the error still reaches stderr through main
        let _ = write_error(e.code_str(), e.message());
    }
    result
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Init { config } => init(&config),
        Command::Watch { config } => watch_inbox(&config),
        Command::Process { file, config } => process(&config, &file),
        Command::Status { config } => status(&config),
        Command::Audit { config, action } => audit(&config, action.as_deref()),
        Command::Release {
            token,
            config,
            operator,
        } => release(&config, &token, &operator),
    }
}

/// Create the data directory layout. Writes no ledger records.
pub fn init(config_path: &Path) -> CliResult<()> {
    let config = Config::load(config_path)?;
    let data_dir = config.data_path();

    if is_initialized(data_dir) {
        return Err(CliError::already_initialized());
    }

    let dirs = [
        data_dir.join("ledger"),
        config.output_path(),
        config.watch_path(),
    ];
    for dir in &dirs {
        fs::create_dir_all(dir).map_err(|e| {
            CliError::config_error(format!("Failed to create directory {:?}: {}", dir, e))
        })?;
    }

    write_response(json!({
        "initialized": true,
        "data_dir": config.data_dir,
        "watch_dir": config.watch_path(),
        "output_dir": config.output_path(),
    }))
}

/// Watch the inbox until Ctrl-C, then drain in-flight files.
pub fn watch_inbox(config_path: &Path) -> CliResult<()> {
    let config = load_initialized(config_path)?;
    let system = boot_system(&config)?;
    let service = WatchService::new(config.watch_config(), system.orchestrator.clone())?;

    let summary = runtime()?.block_on(async {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(true);
            }
        });
        service.run(shutdown_rx).await
    })?;

    write_response(json!({
        "summary": summary,
        "metrics": system.metrics.snapshot(),
    }))
}

/// Ingest one file and print its report.
///
/// Every terminal state, including rejection, is a successful command; the
/// report's `state` and `error` say what happened.
pub fn process(config_path: &Path, file: &Path) -> CliResult<()> {
    let config = load_initialized(config_path)?;
    let system = boot_system(&config)?;

    let report = runtime()?.block_on(async {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(true);
            }
        });
        system.orchestrator.process_file(file, shutdown_rx).await
    });

    write_response(serde_json::to_value(&report)?)
}

/// Highest committed offset per scope, failed batches and released ranges.
pub fn status(config_path: &Path) -> CliResult<()> {
    let config = load_initialized(config_path)?;
    let system = boot_system(&config)?;

    let scopes: Vec<_> = system
        .authority
        .scopes()?
        .into_iter()
        .map(|row| {
            json!({
                "scope": row.scope.to_string(),
                "high_water_mark": row.high_water_mark,
                "highest_committed": row.highest_committed,
            })
        })
        .collect();

    write_response(json!({
        "branch_code": config.branch_code,
        "scopes": scopes,
        "failed_batches": system.coordinator.failed_batches()?,
        "released_ranges": system.authority.released_ranges()?,
    }))
}

/// Print audit records, optionally only one action.
pub fn audit(config_path: &Path, action: Option<&str>) -> CliResult<()> {
    let config = load_initialized(config_path)?;
    let records = FileAuditLog::read_all(config.data_path().join(AUDIT_FILE_NAME))?;

    let records: Vec<_> = records
        .into_iter()
        .filter(|r| action.map_or(true, |a| r.action.as_str().eq_ignore_ascii_case(a)))
        .collect();

    write_response(json!({
        "count": records.len(),
        "records": records,
    }))
}

/// Operator release of an expired reservation.
pub fn release(config_path: &Path, token: &str, operator: &str) -> CliResult<()> {
    let config = load_initialized(config_path)?;
    let token = parse_uuid(token)?;
    let system = boot_system(&config)?;

    let released = runtime()?.block_on(system.authority.force_release_expired(
        token,
        Utc::now(),
        operator,
    ))?;

    write_response(serde_json::to_value(&released)?)
}

fn load_initialized(config_path: &Path) -> CliResult<Config> {
    let config = Config::load(config_path)?;
    log_event_with_fields(Event::ConfigLoaded, &[("data_dir", &config.data_dir)]);

    if !is_initialized(config.data_path()) {
        return Err(CliError::not_initialized());
    }
    Ok(config)
}

fn runtime() -> CliResult<Runtime> {
    Runtime::new()
        .map_err(|e| CliError::boot_failed(format!("Failed to create tokio runtime: {}", e)))
}

fn parse_uuid(s: &str) -> CliResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| CliError::config_error(format!("Invalid token '{}': {}", s, e)))
}

/// Check if a data directory is initialized
fn is_initialized(data_dir: &Path) -> bool {
    data_dir.join("ledger").is_dir()
}

/// Components shared by the commands
struct System {
    authority: Arc<SequenceAuthority>,
    coordinator: Arc<CommitCoordinator>,
    orchestrator: Arc<Orchestrator>,
    metrics: Arc<MetricsRegistry>,
}

/// Replay the ledger and wire the ingestion stack.
///
/// FATAL: ledger corruption halts startup; nothing is served from a
/// partially replayed ledger.
fn boot_system(config: &Config) -> CliResult<System> {
    log_event(Event::BootStart);
    let data_dir = config.data_path();

    let ledger = FileLedger::open(data_dir)?;
    log_event_with_fields(
        Event::LedgerOpened,
        &[
            ("data_dir", &config.data_dir),
            ("last_sequence", &ledger.last_sequence_number()?.to_string()),
        ],
    );
    let store: Arc<dyn LedgerStore> = Arc::new(ledger);

    let audit_path = data_dir.join(AUDIT_FILE_NAME);
    let audit: Arc<dyn AuditLog> = Arc::new(FileAuditLog::open(&audit_path).map_err(|e| {
        CliError::boot_failed(format!("Audit log open failed {}: {}", audit_path.display(), e))
    })?);
    let metrics = Arc::new(MetricsRegistry::new());

    let authority = Arc::new(SequenceAuthority::new(
        store.clone(),
        audit.clone(),
        config.authority_config(),
    ));
    let coordinator = Arc::new(CommitCoordinator::new(
        store.clone(),
        authority.clone(),
        audit.clone(),
        metrics.clone(),
        config.commit_policy(),
    ));

    let tracker = Arc::new(StabilizationTracker::new(config.tracker_config()));
    let reader: Arc<dyn InvoiceReader> = Arc::new(JsonBatchReader::new(config.reader.clone()));
    let sink: Arc<dyn ArtifactSink> = Arc::new(ManifestSink::new(config.output_path()));

    let orchestrator = Arc::new(Orchestrator::new(
        config.orchestrator_config()?,
        tracker,
        reader,
        store,
        authority.clone(),
        coordinator.clone(),
        sink,
        audit,
        metrics.clone(),
    ));

    Ok(System {
        authority,
        coordinator,
        orchestrator,
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("lrledger.json");
        let config = json!({
            "data_dir": dir.path().join("data"),
            "branch_code": "BR01",
        });
        fs::write(&path, config.to_string()).unwrap();
        path
    }

    #[test]
    fn test_init_creates_layout_once() {
        let dir = TempDir::new().unwrap();
        let config_path = write_config(&dir);

        init(&config_path).unwrap();
        assert!(dir.path().join("data/ledger").is_dir());
        assert!(dir.path().join("data/inbox").is_dir());
        assert!(dir.path().join("data/output").is_dir());

        let err = init(&config_path).unwrap_err();
        assert_eq!(err.code_str(), "LRL_CLI_ALREADY_INITIALIZED");
    }

    #[test]
    fn test_commands_require_init() {
        let dir = TempDir::new().unwrap();
        let config_path = write_config(&dir);

        let err = status(&config_path).unwrap_err();
        assert_eq!(err.code_str(), "LRL_CLI_NOT_INITIALIZED");
    }

    #[test]
    fn test_status_and_audit_on_fresh_ledger() {
        let dir = TempDir::new().unwrap();
        let config_path = write_config(&dir);
        init(&config_path).unwrap();

        status(&config_path).unwrap();
        audit(&config_path, Some("RESERVATION_RELEASED")).unwrap();
    }

    #[test]
    fn test_release_unknown_token() {
        let dir = TempDir::new().unwrap();
        let config_path = write_config(&dir);
        init(&config_path).unwrap();

        let err = release(&config_path, "not-a-uuid", "ops").unwrap_err();
        assert_eq!(err.code_str(), "LRL_CLI_CONFIG_ERROR");

        let err = release(&config_path, &Uuid::new_v4().to_string(), "ops").unwrap_err();
        assert_eq!(err.code_str(), "LRL_CLI_COMMAND_FAILED");
    }
}
