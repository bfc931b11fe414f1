//! Configuration file
//!
//! One JSON file, loaded once at startup. Only `data_dir` and `branch_code`
//! are required; every other field has a default. `validate` runs on load
//! and rejects values the core cannot honor.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ingest::{OrchestratorConfig, ReaderConfig, WatchConfig};
use crate::retry::RetryPolicy;
use crate::sequence::{AuthorityConfig, IdentifierPattern, ResetCadence, DEFAULT_PATTERN};
use crate::stabilization::TrackerConfig;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Read { .. } => "LRL_CONFIG_READ",
            ConfigError::Parse(_) => "LRL_CONFIG_PARSE",
            ConfigError::Invalid(_) => "LRL_CONFIG_INVALID",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for CommitSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSettings {
    /// Directory to watch; `<data_dir>/inbox` when unset
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default = "default_patterns")]
    pub patterns: Vec<String>,
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub delete_after_processing: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            dir: None,
            patterns: default_patterns(),
            ignore_patterns: default_ignore_patterns(),
            poll_interval_ms: default_poll_interval_ms(),
            delete_after_processing: false,
            max_workers: default_max_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Ledger and audit log location (required)
    pub data_dir: String,

    /// Branch whose files this process ingests (required)
    pub branch_code: String,

    /// Artifact manifests; `<data_dir>/output` when unset
    #[serde(default)]
    pub output_dir: Option<String>,

    #[serde(default = "default_identifier_pattern")]
    pub identifier_pattern: String,

    #[serde(default)]
    pub reset_cadence: ResetCadence,

    #[serde(default = "default_stabilization_seconds")]
    pub stabilization_seconds: u64,

    #[serde(default = "default_stabilization_timeout_seconds")]
    pub stabilization_timeout_seconds: u64,

    /// How long processed content keeps matching duplicates
    #[serde(default = "default_retention_seconds")]
    pub retention_seconds: u64,

    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,

    #[serde(default = "default_probe_backoff_ms")]
    pub probe_backoff_ms: u64,

    #[serde(default = "default_reservation_ttl_seconds")]
    pub reservation_ttl_seconds: u64,

    #[serde(default)]
    pub commit: CommitSettings,

    #[serde(default)]
    pub watch: WatchSettings,

    #[serde(default)]
    pub reader: ReaderConfig,
}

fn default_identifier_pattern() -> String {
    DEFAULT_PATTERN.to_string()
}
fn default_stabilization_seconds() -> u64 {
    5
}
fn default_stabilization_timeout_seconds() -> u64 {
    300
}
fn default_retention_seconds() -> u64 {
    86400
} // 24h
fn default_probe_attempts() -> u32 {
    5
}
fn default_probe_backoff_ms() -> u64 {
    500
}
fn default_reservation_ttl_seconds() -> u64 {
    600
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_backoff_ms() -> u64 {
    200
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_patterns() -> Vec<String> {
    vec!["*.json".to_string()]
}
fn default_ignore_patterns() -> Vec<String> {
    vec!["~$*".to_string(), ".*".to_string(), "*.tmp".to_string()]
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_max_workers() -> usize {
    4
}

impl Config {
    /// Load and validate configuration from file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> ConfigResult<Self> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.data_dir.trim().is_empty() {
            return Err(ConfigError::Invalid("data_dir must not be empty".into()));
        }
        if self.branch_code.trim().is_empty() || self.branch_code.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "branch_code '{}' must be non-empty and must not contain '/'",
                self.branch_code
            )));
        }
        let pattern = self.pattern()?;
        if self.reset_cadence != ResetCadence::Never && !pattern.distinguishes_periods() {
            return Err(ConfigError::Invalid(format!(
                "identifier_pattern '{}' needs {{period}}, {{YYMMDD}} or {{YYYYMMDD}} when reset_cadence is {}",
                self.identifier_pattern,
                self.reset_cadence.as_str()
            )));
        }

        if self.reservation_ttl_seconds == 0 {
            return Err(ConfigError::Invalid("reservation_ttl_seconds must be > 0".into()));
        }
        if self.stabilization_timeout_seconds < self.stabilization_seconds {
            return Err(ConfigError::Invalid(
                "stabilization_timeout_seconds must be >= stabilization_seconds".into(),
            ));
        }
        if self.probe_attempts == 0 || self.commit.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "probe_attempts and commit.max_attempts must be > 0".into(),
            ));
        }
        if self.commit.base_backoff_ms > self.commit.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "commit.base_backoff_ms must be <= commit.max_backoff_ms".into(),
            ));
        }
        if self.watch.max_workers == 0 || self.watch.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "watch.max_workers and watch.poll_interval_ms must be > 0".into(),
            ));
        }
        if self.watch.patterns.is_empty() {
            return Err(ConfigError::Invalid("watch.patterns must not be empty".into()));
        }

        let mut seen = BTreeSet::new();
        for field in self.reader.column_mapping.values() {
            if !seen.insert(field.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "reader.column_mapping maps two columns to '{}'",
                    field
                )));
            }
        }
        Ok(())
    }

    pub fn data_path(&self) -> &Path {
        Path::new(&self.data_dir)
    }

    pub fn output_path(&self) -> PathBuf {
        match &self.output_dir {
            Some(dir) => PathBuf::from(dir),
            None => self.data_path().join("output"),
        }
    }

    pub fn watch_path(&self) -> PathBuf {
        match &self.watch.dir {
            Some(dir) => PathBuf::from(dir),
            None => self.data_path().join("inbox"),
        }
    }

    pub fn pattern(&self) -> ConfigResult<IdentifierPattern> {
        IdentifierPattern::parse(&self.identifier_pattern)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn commit_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.commit.max_attempts,
            Duration::from_millis(self.commit.base_backoff_ms),
            Duration::from_millis(self.commit.max_backoff_ms),
        )
    }

    pub fn authority_config(&self) -> AuthorityConfig {
        AuthorityConfig {
            reservation_ttl: chrono::Duration::seconds(self.reservation_ttl_seconds as i64),
            retry: self.commit_policy(),
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        let backoff = Duration::from_millis(self.probe_backoff_ms);
        TrackerConfig {
            interval: Duration::from_secs(self.stabilization_seconds),
            timeout: Duration::from_secs(self.stabilization_timeout_seconds),
            retention: Duration::from_secs(self.retention_seconds),
            probe: RetryPolicy::new(self.probe_attempts, backoff, backoff * 16),
        }
    }

    pub fn orchestrator_config(&self) -> ConfigResult<OrchestratorConfig> {
        Ok(OrchestratorConfig {
            branch_code: self.branch_code.clone(),
            cadence: self.reset_cadence,
            pattern: self.pattern()?,
            delete_after_processing: self.watch.delete_after_processing,
            batch_date: None,
        })
    }

    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            dir: self.watch_path(),
            patterns: self.watch.patterns.clone(),
            ignore_patterns: self.watch.ignore_patterns.clone(),
            poll_interval: Duration::from_millis(self.watch.poll_interval_ms),
            max_workers: self.watch.max_workers,
            // Prune at most once per stabilization timeout
            prune_interval: Duration::from_secs(self.stabilization_timeout_seconds.max(1)),
        }
    }
}
