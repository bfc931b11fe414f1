//! Artifact sinks
//!
//! Committed records leave the core through an `ArtifactSink`: the PDF and
//! print layers sit behind it. Delivery is at-least-once. A sink failure is
//! logged and audited but never rolls back a commit.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::commit::InvoiceRecord;
use crate::sequence::SequenceScope;

use super::errors::{IngestError, IngestResult};

/// Committed records of one source file, in commit order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchArtifact {
    pub source_path: String,
    pub scope: SequenceScope,
    pub idempotency_key: String,
    pub first_id: String,
    pub last_id: String,
    pub committed_at: DateTime<Utc>,
    pub records: Vec<InvoiceRecord>,
}

pub trait ArtifactSink: Send + Sync {
    /// Hand over one committed batch. Returns where it landed, if anywhere.
    fn emit(&self, artifact: &BatchArtifact) -> IngestResult<Option<PathBuf>>;
}

/// Writes `lr_batch_{branch}_{first}-{last}.json` manifests to a directory.
pub struct ManifestSink {
    output_dir: PathBuf,
}

impl ManifestSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn manifest_path(&self, artifact: &BatchArtifact) -> PathBuf {
        self.output_dir.join(format!(
            "lr_batch_{}_{}-{}.json",
            artifact.scope.branch_code, artifact.first_id, artifact.last_id
        ))
    }
}

impl ArtifactSink for ManifestSink {
    fn emit(&self, artifact: &BatchArtifact) -> IngestResult<Option<PathBuf>> {
        let sink_err = |what: &str, path: &Path, e: std::io::Error| {
            IngestError::Sink(format!("{} {}: {}", what, path.display(), e))
        };

        fs::create_dir_all(&self.output_dir)
            .map_err(|e| sink_err("create", &self.output_dir, e))?;

        let path = self.manifest_path(artifact);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(artifact)
            .map_err(|e| IngestError::Sink(format!("serialize manifest: {}", e)))?;

        let mut file = File::create(&tmp).map_err(|e| sink_err("create", &tmp, e))?;
        file.write_all(&json).map_err(|e| sink_err("write", &tmp, e))?;
        file.sync_all().map_err(|e| sink_err("fsync", &tmp, e))?;
        // Re-emitting after a crash overwrites the same manifest
        fs::rename(&tmp, &path).map_err(|e| sink_err("rename", &path, e))?;

        Ok(Some(path))
    }
}

/// Discards every artifact
#[derive(Debug, Default)]
pub struct NullSink;

impl ArtifactSink for NullSink {
    fn emit(&self, _artifact: &BatchArtifact) -> IngestResult<Option<PathBuf>> {
        Ok(None)
    }
}

/// Keeps emitted artifacts in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    artifacts: Mutex<Vec<BatchArtifact>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifacts(&self) -> Vec<BatchArtifact> {
        self.artifacts
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }
}

impl ArtifactSink for MemorySink {
    fn emit(&self, artifact: &BatchArtifact) -> IngestResult<Option<PathBuf>> {
        self.artifacts
            .lock()
            .map_err(|_| IngestError::Sink("memory sink poisoned".to_string()))?
            .push(artifact.clone());
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::InvoiceFields;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn artifact() -> BatchArtifact {
        let record = InvoiceRecord {
            sequence: 1,
            receipt_id: "BR012504280001".into(),
            fields: InvoiceFields {
                invoice_number: "A1".into(),
                date: NaiveDate::from_ymd_opt(2025, 4, 28).unwrap(),
                consignor_name: "Acme".into(),
                consignee_name: "Delta".into(),
                weight: 1.5,
                packages: 1,
                destination: "Pune".into(),
                extra: BTreeMap::new(),
            },
        };
        BatchArtifact {
            source_path: "drop/a.json".into(),
            scope: SequenceScope::new("BR01", "20250428"),
            idempotency_key: "k".into(),
            first_id: "BR012504280001".into(),
            last_id: "BR012504280001".into(),
            committed_at: Utc::now(),
            records: vec![record],
        }
    }

    #[test]
    fn test_manifest_sink_writes_named_manifest() {
        let dir = TempDir::new().unwrap();
        let sink = ManifestSink::new(dir.path().join("out"));

        let path = sink.emit(&artifact()).unwrap().unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "lr_batch_BR01_BR012504280001-BR012504280001.json"
        );

        let written: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["records"][0]["receipt_id"], "BR012504280001");

        // Emitting again replaces the manifest
        assert_eq!(sink.emit(&artifact()).unwrap().unwrap(), path);
        assert_eq!(fs::read_dir(dir.path().join("out")).unwrap().count(), 1);
    }

    #[test]
    fn test_memory_and_null_sinks() {
        let memory = MemorySink::new();
        memory.emit(&artifact()).unwrap();
        assert_eq!(memory.artifacts().len(), 1);
        assert!(NullSink.emit(&artifact()).unwrap().is_none());
    }
}
