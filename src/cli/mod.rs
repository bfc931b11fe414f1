//! CLI module for lrledger
//!
//! Provides command-line interface for:
//! - init: Create directory structure
//! - watch: Ingest files from the inbox until Ctrl-C
//! - process: Ingest one file
//! - status / audit: Operator views of the ledger and audit log
//! - release: Force-release an expired reservation

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{audit, init, process, release, run, run_command, status, watch_inbox};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_error, write_response};
