//! Stabilization tracker errors

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type TrackerResult<T> = Result<T, TrackerError>;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("File {path} did not stabilize within {waited_secs}s")]
    StabilizationTimeout { path: PathBuf, waited_secs: u64 },

    #[error("File {path} unreadable after {attempts} attempts: {source}")]
    Unreadable {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("Tracker registry lock poisoned")]
    Poisoned,
}

impl TrackerError {
    pub fn code(&self) -> &'static str {
        match self {
            TrackerError::StabilizationTimeout { .. } => "LRL_TRACKER_STABILIZATION_TIMEOUT",
            TrackerError::Unreadable { .. } => "LRL_TRACKER_UNREADABLE",
            TrackerError::Poisoned => "LRL_TRACKER_POISONED",
        }
    }
}
