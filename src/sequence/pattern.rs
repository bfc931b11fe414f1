//! Receipt identifier rendering
//!
//! A pattern is literal text with placeholders:
//!
//! | placeholder     | value                                   |
//! |-----------------|-----------------------------------------|
//! | `{branch_code}` | scope branch code                       |
//! | `{period}`      | scope period key                        |
//! | `{YYMMDD}`      | batch date, two-digit year              |
//! | `{YYYYMMDD}`    | batch date, four-digit year             |
//! | `{sequence}`    | numeric offset, unpadded                |
//! | `{sequence:0N}` | numeric offset, zero-padded to N digits |
//!
//! Rendering is a pure function of its inputs. An offset wider than a fixed
//! sequence field is an error, never truncated.

use std::fmt;

use chrono::NaiveDate;
use regex::Regex;

use super::errors::{AuthorityError, AuthorityResult};

/// Default pattern, e.g. `BR01250428` + `0007`
pub const DEFAULT_PATTERN: &str = "{branch_code}{YYMMDD}{sequence:04}";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    BranchCode,
    Period,
    ShortDate,
    LongDate,
    Sequence { width: Option<usize> },
}

/// Parsed identifier pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierPattern {
    source: String,
    segments: Vec<Segment>,
}

impl IdentifierPattern {
    pub fn parse(pattern: &str) -> AuthorityResult<Self> {
        let placeholder = Regex::new(r"\{([A-Za-z_]+)(?::0(\d+)d?)?\}")
            .map_err(|e| AuthorityError::InvalidPattern(e.to_string()))?;

        let mut segments = Vec::new();
        let mut last = 0;
        for captures in placeholder.captures_iter(pattern) {
            let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            if whole.start() > last {
                segments.push(Self::literal(&pattern[last..whole.start()])?);
            }
            let width = match captures.get(2) {
                Some(w) => Some(w.as_str().parse::<usize>().map_err(|_| {
                    AuthorityError::InvalidPattern(format!("bad width in '{}'", whole.as_str()))
                })?),
                None => None,
            };

            let segment = match (name.as_str(), width) {
                ("branch_code", None) => Segment::BranchCode,
                ("period", None) => Segment::Period,
                ("YYMMDD", None) => Segment::ShortDate,
                ("YYYYMMDD", None) => Segment::LongDate,
                ("sequence", Some(0)) => {
                    return Err(AuthorityError::InvalidPattern(
                        "sequence width must be at least 1".to_string(),
                    ))
                }
                ("sequence", width) => Segment::Sequence { width },
                (other, _) => {
                    return Err(AuthorityError::InvalidPattern(format!(
                        "unknown placeholder '{}'",
                        other
                    )))
                }
            };
            segments.push(segment);
            last = whole.end();
        }
        if last < pattern.len() {
            segments.push(Self::literal(&pattern[last..])?);
        }

        if !segments
            .iter()
            .any(|s| matches!(s, Segment::Sequence { .. }))
        {
            return Err(AuthorityError::InvalidPattern(format!(
                "'{}' has no {{sequence}} placeholder",
                pattern
            )));
        }

        Ok(Self {
            source: pattern.to_string(),
            segments,
        })
    }

    fn literal(text: &str) -> AuthorityResult<Segment> {
        if text.contains('{') || text.contains('}') {
            return Err(AuthorityError::InvalidPattern(format!(
                "unbalanced or malformed placeholder near '{}'",
                text
            )));
        }
        Ok(Segment::Literal(text.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Render the identifier for `offset`.
    pub fn render(
        &self,
        branch_code: &str,
        period_key: &str,
        date: NaiveDate,
        offset: u64,
    ) -> AuthorityResult<String> {
        let mut out = String::with_capacity(self.source.len() + 8);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::BranchCode => out.push_str(branch_code),
                Segment::Period => out.push_str(period_key),
                Segment::ShortDate => out.push_str(&date.format("%y%m%d").to_string()),
                Segment::LongDate => out.push_str(&date.format("%Y%m%d").to_string()),
                Segment::Sequence { width: None } => out.push_str(&offset.to_string()),
                Segment::Sequence { width: Some(width) } => {
                    let digits = offset.to_string();
                    if digits.len() > *width {
                        return Err(AuthorityError::PatternOverflow {
                            offset,
                            width: *width,
                        });
                    }
                    out.push_str(&format!("{:0>width$}", digits, width = *width));
                }
            }
        }
        Ok(out)
    }

    /// True when rendered identifiers carry the period or date. Without one,
    /// a sequence that resets would repeat identifiers.
    pub fn distinguishes_periods(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Period | Segment::ShortDate | Segment::LongDate))
    }

    /// Largest offset every fixed-width sequence field can hold
    pub fn capacity(&self) -> Option<u64> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Sequence { width: Some(w) } if *w < 20 => Some(10u64.pow(*w as u32) - 1),
                _ => None,
            })
            .min()
    }
}

impl Default for IdentifierPattern {
    fn default() -> Self {
        Self {
            source: DEFAULT_PATTERN.to_string(),
            segments: vec![
                Segment::BranchCode,
                Segment::ShortDate,
                Segment::Sequence { width: Some(4) },
            ],
        }
    }
}

impl fmt::Display for IdentifierPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
