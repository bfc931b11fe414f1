//! Filesystem probe with bounded retry
//!
//! Transient read failures (permissions being fixed, a share remounting)
//! are retried with exponential backoff. A file that disappears is not an
//! error: the caller retires it.

use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::observability::{log_event_with_fields, Event};
use crate::retry::RetryPolicy;

use super::descriptor::{content_hash, FileDescriptor};
use super::errors::{TrackerError, TrackerResult};

#[derive(Debug, Clone)]
pub struct Prober {
    policy: RetryPolicy,
}

impl Prober {
    /// `policy.max_attempts` bounds the reads of one probe
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Observe `path` at `now`. `None` when the file no longer exists.
    pub async fn probe(&self, path: &Path, now: DateTime<Utc>) -> TrackerResult<Option<FileDescriptor>> {
        let mut attempt = 1;
        loop {
            match read(path).await {
                Ok((size, hash)) => return Ok(Some(FileDescriptor::observed(path, size, hash, now))),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) if self.policy.allows_another(attempt) => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    log_event_with_fields(
                        Event::FileUnreadable,
                        &[
                            ("path", &path.display().to_string()),
                            ("attempt", &attempt.to_string()),
                            ("delay_ms", &delay.as_millis().to_string()),
                            ("error", &e.to_string()),
                        ],
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(TrackerError::Unreadable {
                        path: path.to_path_buf(),
                        attempts: attempt,
                        source: e,
                    })
                }
            }
        }
    }
}

async fn read(path: &Path) -> io::Result<(u64, String)> {
    let bytes = tokio::fs::read(path).await?;
    Ok((bytes.len() as u64, content_hash(&bytes)))
}
