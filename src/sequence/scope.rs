//! Sequence scopes and reset cadence
//!
//! A scope is one independent identifier sequence: a branch code paired with
//! a period key. The period key is derived from the calendar date according to
//! the configured reset cadence.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::errors::AuthorityError;

/// How often a branch's sequence restarts at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetCadence {
    /// New scope every calendar day (`YYYYMMDD`)
    Daily,
    /// New scope every calendar month (`YYYYMM`)
    Monthly,
    /// One scope forever (`ALL`)
    Never,
}

impl ResetCadence {
    /// Period key for the given date.
    pub fn period_key(&self, date: NaiveDate) -> String {
        match self {
            ResetCadence::Daily => date.format("%Y%m%d").to_string(),
            ResetCadence::Monthly => date.format("%Y%m").to_string(),
            ResetCadence::Never => "ALL".to_string(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResetCadence::Daily => "daily",
            ResetCadence::Monthly => "monthly",
            ResetCadence::Never => "never",
        }
    }
}

impl Default for ResetCadence {
    fn default() -> Self {
        ResetCadence::Daily
    }
}

impl FromStr for ResetCadence {
    type Err = AuthorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(ResetCadence::Daily),
            "monthly" => Ok(ResetCadence::Monthly),
            "never" => Ok(ResetCadence::Never),
            other => Err(AuthorityError::InvalidScope(format!(
                "unknown reset cadence '{}'",
                other
            ))),
        }
    }
}

/// A (branch_code, period_key) pair defining one identifier sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceScope {
    pub branch_code: String,
    pub period_key: String,
}

impl SequenceScope {
    pub fn new(branch_code: impl Into<String>, period_key: impl Into<String>) -> Self {
        Self {
            branch_code: branch_code.into(),
            period_key: period_key.into(),
        }
    }

    /// Scope for `branch_code` on `date` under `cadence`.
    pub fn for_date(branch_code: impl Into<String>, cadence: ResetCadence, date: NaiveDate) -> Self {
        Self::new(branch_code, cadence.period_key(date))
    }

    /// Parse the `BRANCH/PERIOD` form produced by `Display`.
    pub fn parse(value: &str) -> Result<Self, AuthorityError> {
        match value.split_once('/') {
            Some((branch, period)) if !branch.is_empty() && !period.is_empty() => {
                Ok(Self::new(branch, period))
            }
            _ => Err(AuthorityError::InvalidScope(format!(
                "expected BRANCH/PERIOD, got '{}'",
                value
            ))),
        }
    }
}

impl fmt::Display for SequenceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.branch_code, self.period_key)
    }
}
