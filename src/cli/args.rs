//! CLI argument definitions using clap
//!
//! Commands:
//! - lrledger init --config <path>
//! - lrledger watch --config <path>
//! - lrledger process <file> --config <path>
//! - lrledger status --config <path>
//! - lrledger audit --config <path>
//! - lrledger release <token> --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// lrledger - gapless lorry-receipt numbering for invoice batches
#[derive(Parser, Debug)]
#[command(name = "lrledger")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the data, inbox and output directories
    Init {
        /// Path to configuration file
        #[arg(long, default_value = "./lrledger.json")]
        config: PathBuf,
    },

    /// Watch the inbox and ingest files until Ctrl-C
    Watch {
        /// Path to configuration file
        #[arg(long, default_value = "./lrledger.json")]
        config: PathBuf,
    },

    /// Ingest a single file and exit
    Process {
        /// Invoice batch file
        file: PathBuf,

        /// Path to configuration file
        #[arg(long, default_value = "./lrledger.json")]
        config: PathBuf,
    },

    /// Show scopes, failed batches and released ranges
    Status {
        /// Path to configuration file
        #[arg(long, default_value = "./lrledger.json")]
        config: PathBuf,
    },

    /// Print the operator audit log
    Audit {
        /// Path to configuration file
        #[arg(long, default_value = "./lrledger.json")]
        config: PathBuf,

        /// Only records with this action, e.g. RESERVATION_RELEASED
        #[arg(long)]
        action: Option<String>,
    },

    /// Release an outstanding reservation whose TTL has passed
    Release {
        /// Reservation token
        token: String,

        /// Path to configuration file
        #[arg(long, default_value = "./lrledger.json")]
        config: PathBuf,

        /// Operator name recorded in the audit log
        #[arg(long, default_value = "operator")]
        operator: String,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
