//! Crash test harness for subprocess management
//!
//! - Initializes a data directory through `lrledger init`
//! - Runs `lrledger process` with a crash point injected via env var
//! - Reopens the ledger in-process to inspect what survived

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use lrledger::ledger::{FileLedger, LedgerStore};
use lrledger::sequence::SequenceScope;
use lrledger::stabilization::content_hash;
use serde_json::{json, Value};
use tempfile::TempDir;

pub const CRASH_ENV: &str = "LRLEDGER_CRASH_POINT";

/// Outcome of one `lrledger` invocation
#[derive(Debug)]
pub struct RunResult {
    /// Whether the process ended without a successful exit
    pub crashed: bool,
    pub stdout: String,
    pub stderr: String,
}

impl RunResult {
    /// The `data` object of the command's JSON response.
    ///
    /// Log lines share stdout with the response, which is always last.
    pub fn data(&self) -> Value {
        self.stdout
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .find(|value| value.get("status").is_some())
            .and_then(|value| value.get("data").cloned())
            .unwrap_or_else(|| panic!("no response in stdout:\n{}\nstderr:\n{}", self.stdout, self.stderr))
    }

    pub fn state(&self) -> String {
        self.data()["state"].as_str().unwrap_or_default().to_string()
    }
}

/// A data directory with its config, initialized and ready for `process`.
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        fs::create_dir_all(dir.path().join("drop")).expect("Failed to create drop dir");

        let config = json!({
            "data_dir": dir.path().join("data"),
            "branch_code": "BR01",
            "identifier_pattern": "{branch_code}-{sequence:04}",
            "reset_cadence": "never",
            "stabilization_seconds": 0,
        });
        fs::write(dir.path().join("lrledger.json"), config.to_string()).expect("Failed to write config");

        let workspace = Self { dir };
        let init = workspace.run(&["init"], None);
        assert!(!init.crashed, "init failed: {}", init.stderr);
        workspace
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    fn config_path(&self) -> PathBuf {
        self.dir.path().join("lrledger.json")
    }

    /// Drop a batch of `rows` valid invoices.
    pub fn write_batch(&self, name: &str, rows: usize) -> PathBuf {
        let rows: Vec<_> = (0..rows)
            .map(|i| {
                json!({
                    "invoice_number": format!("INV-{}", i),
                    "date": "2025-04-28",
                    "consignor_name": "Acme Mills",
                    "consignee_name": "Delta Traders",
                    "weight": 12.5,
                    "packages": 2,
                    "destination": "Pune"
                })
            })
            .collect();
        let path = self.dir.path().join("drop").join(name);
        fs::write(&path, Value::Array(rows).to_string()).expect("Failed to write batch");
        path
    }

    /// `lrledger process <file>`, aborting at `crash_point` when given.
    pub fn process(&self, file: &Path, crash_point: Option<&str>) -> RunResult {
        let file = file.to_string_lossy().to_string();
        self.run(&["process", &file], crash_point)
    }

    fn run(&self, args: &[&str], crash_point: Option<&str>) -> RunResult {
        let config = self.config_path().to_string_lossy().to_string();
        let mut command = Command::new(env!("CARGO_BIN_EXE_lrledger"));
        command.args(args).args(["--config", &config]);
        match crash_point {
            Some(point) => command.env(CRASH_ENV, point),
            None => command.env_remove(CRASH_ENV),
        };

        let output = command.output().expect("Failed to execute lrledger");
        RunResult {
            crashed: !output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }

    /// Open the ledger the way the next process would.
    pub fn ledger(&self) -> FileLedger {
        FileLedger::open(&self.data_dir()).expect("Ledger must reopen after a crash")
    }

    pub fn highest_committed(&self) -> Option<u64> {
        self.ledger()
            .scope(&scope())
            .expect("Failed to read scope")
            .and_then(|row| row.highest_committed)
    }

    pub fn manifests(&self) -> Vec<PathBuf> {
        match fs::read_dir(self.data_dir().join("output")) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Scope of every batch under a `never` cadence
pub fn scope() -> SequenceScope {
    SequenceScope::new("BR01", "ALL")
}

pub fn hash_of(path: &Path) -> String {
    content_hash(&fs::read(path).expect("Failed to read batch"))
}

/// Run to `point`, then again without it; returns both runs.
pub fn crash_then_restart(workspace: &Workspace, file: &Path, point: &str) -> (RunResult, RunResult) {
    let crashed = workspace.process(file, Some(point));
    assert!(
        crashed.crashed,
        "expected a crash at {}: stdout {} stderr {}",
        point, crashed.stdout, crashed.stderr
    );
    assert!(crashed.stderr.contains(point), "{}", crashed.stderr);

    let restarted = workspace.process(file, None);
    assert!(!restarted.crashed, "restart failed: {}", restarted.stderr);
    (crashed, restarted)
}
