//! File descriptors and content hashing

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// One observation of a candidate file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub size: u64,
    pub content_hash: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl FileDescriptor {
    /// A fresh observation taken at `now`
    pub fn observed(path: impl Into<PathBuf>, size: u64, content_hash: String, now: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            size,
            content_hash,
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Same size and content as `other`
    pub fn agrees_with(&self, other: &FileDescriptor) -> bool {
        self.size == other.size && self.content_hash == other.content_hash
    }
}

/// SHA-256 of `bytes`, lowercase hex
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
