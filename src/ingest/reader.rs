//! Batch readers
//!
//! A reader turns the bytes of a stabilized file into ordered, validated
//! invoice rows. `JsonBatchReader` reads a JSON array of row objects, the
//! export format of the branch spreadsheets, and applies the configured
//! column mapping, required fields and field types.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::commit::InvoiceFields;

use super::errors::{IngestError, IngestResult};

/// Column types a field can be converted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Date,
    Float,
    Int,
    String,
}

/// A row that failed validation. Rows are numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    pub row: usize,
    pub message: String,
}

/// Rows read from one file
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutcome {
    pub records: Vec<InvoiceFields>,
    /// Invalid rows dropped under `skip_invalid_rows`
    pub skipped: Vec<RowError>,
}

/// Parser and validator for one batch file.
pub trait InvoiceReader: Send + Sync {
    fn read(&self, path: &Path, bytes: &[u8]) -> IngestResult<ReadOutcome>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Source column -> invoice field. Empty means columns are already field names.
    pub column_mapping: BTreeMap<String, String>,
    pub required_fields: Vec<String>,
    pub field_types: BTreeMap<String, FieldType>,
    pub skip_invalid_rows: bool,
}

const FIXED_FIELDS: [&str; 7] = [
    "invoice_number",
    "date",
    "consignor_name",
    "consignee_name",
    "weight",
    "packages",
    "destination",
];

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%d-%m-%Y", "%d/%m/%Y", "%Y/%m/%d"];

#[derive(Debug, Clone)]
pub struct JsonBatchReader {
    config: ReaderConfig,
}

impl JsonBatchReader {
    pub fn new(config: ReaderConfig) -> Self {
        Self { config }
    }

    fn field_type(&self, field: &str) -> FieldType {
        if let Some(t) = self.config.field_types.get(field) {
            return *t;
        }
        match field {
            "date" => FieldType::Date,
            "weight" => FieldType::Float,
            "packages" => FieldType::Int,
            _ => FieldType::String,
        }
    }

    /// Apply the column mapping to every row, checking that each mapped
    /// source column appears in the file.
    fn map_columns(&self, rows: Vec<Map<String, Value>>) -> IngestResult<Vec<Map<String, Value>>> {
        if self.config.column_mapping.is_empty() {
            return Ok(rows);
        }

        let present: BTreeSet<&str> = rows
            .iter()
            .flat_map(|row| row.keys().map(String::as_str))
            .collect();
        let missing: Vec<String> = self
            .config
            .column_mapping
            .keys()
            .filter(|column| !present.contains(column.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(IngestError::MissingColumns(missing));
        }

        Ok(rows
            .into_iter()
            .map(|mut row| {
                self.config
                    .column_mapping
                    .iter()
                    .filter_map(|(column, field)| row.remove(column).map(|v| (field.clone(), v)))
                    .collect()
            })
            .collect())
    }

    fn check_required_columns(&self, rows: &[Map<String, Value>]) -> IngestResult<()> {
        let columns: BTreeSet<&str> = if self.config.column_mapping.is_empty() {
            rows.iter()
                .flat_map(|row| row.keys().map(String::as_str))
                .collect()
        } else {
            self.config.column_mapping.values().map(String::as_str).collect()
        };

        let missing: Vec<String> = self
            .config
            .required_fields
            .iter()
            .filter(|field| !columns.contains(field.as_str()))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(IngestError::MissingColumns(missing))
        }
    }

    fn convert_row(&self, mut row: Map<String, Value>) -> Result<InvoiceFields, String> {
        let mut errors = Vec::new();
        for field in &self.config.required_fields {
            if row.get(field).map_or(true, Value::is_null) {
                errors.push(format!("Missing required field: {}", field));
            }
        }
        for field in FIXED_FIELDS {
            if row.get(field).map_or(true, Value::is_null)
                && !self.config.required_fields.iter().any(|f| f == field)
            {
                errors.push(format!("Missing required field: {}", field));
            }
        }
        if !errors.is_empty() {
            return Err(errors.join("; "));
        }

        let mut converted = Map::new();
        for (field, value) in std::mem::take(&mut row) {
            if value.is_null() {
                continue;
            }
            match convert(&value, self.field_type(&field)) {
                Ok(v) => {
                    converted.insert(field, v);
                }
                Err(e) => errors.push(format!("{}: {}", field, e)),
            }
        }
        if !errors.is_empty() {
            return Err(errors.join("; "));
        }

        let mut take = |field: &str| converted.remove(field).unwrap_or(Value::Null);
        let invoice_number = as_string(take("invoice_number"));
        let date = take("date");
        let consignor_name = as_string(take("consignor_name"));
        let consignee_name = as_string(take("consignee_name"));
        let weight = take("weight");
        let packages = take("packages");
        let destination = as_string(take("destination"));

        let date = date
            .as_str()
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            .ok_or_else(|| "date: expected a date".to_string())?;
        let weight = weight
            .as_f64()
            .ok_or_else(|| "weight: expected a number".to_string())?;
        let packages = packages
            .as_i64()
            .ok_or_else(|| "packages: expected an integer".to_string())?;

        Ok(InvoiceFields {
            invoice_number,
            date,
            consignor_name,
            consignee_name,
            weight,
            packages,
            destination,
            extra: converted.into_iter().collect(),
        })
    }
}

impl InvoiceReader for JsonBatchReader {
    fn read(&self, path: &Path, bytes: &[u8]) -> IngestResult<ReadOutcome> {
        let malformed = |reason: String| IngestError::Malformed {
            path: path.to_path_buf(),
            reason,
        };

        let value: Value = serde_json::from_slice(bytes).map_err(|e| malformed(e.to_string()))?;
        let rows = match value {
            Value::Array(rows) => rows,
            _ => return Err(malformed("expected a JSON array of rows".to_string())),
        };
        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| match row {
                Value::Object(map) => Ok(map),
                _ => Err(malformed(format!("row {} is not an object", i + 1))),
            })
            .collect::<IngestResult<Vec<_>>>()?;

        let rows = self.map_columns(rows)?;
        self.check_required_columns(&rows)?;

        let mut records = Vec::with_capacity(rows.len());
        let mut errors = Vec::new();
        for (i, row) in rows.into_iter().enumerate() {
            match self.convert_row(row) {
                Ok(record) => records.push(record),
                Err(message) => errors.push(RowError { row: i + 1, message }),
            }
        }

        if !errors.is_empty() && !self.config.skip_invalid_rows {
            return Err(IngestError::InvalidRows(errors));
        }
        if records.is_empty() {
            return Err(IngestError::NoValidRows);
        }
        Ok(ReadOutcome {
            records,
            skipped: errors,
        })
    }
}

fn convert(value: &Value, field_type: FieldType) -> Result<Value, String> {
    match field_type {
        FieldType::String => Ok(Value::String(as_string(value.clone()))),
        FieldType::Float => match value {
            Value::Number(n) => n
                .as_f64()
                .map(Value::from)
                .ok_or_else(|| format!("{} is not a number", n)),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| format!("'{}' is not a number", s)),
            other => Err(format!("{} is not a number", other)),
        },
        FieldType::Int => {
            let parsed = match value {
                Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(whole)),
                Value::String(s) => {
                    let s = s.trim();
                    s.parse::<i64>()
                        .ok()
                        .or_else(|| s.parse::<f64>().ok().and_then(whole))
                }
                _ => None,
            };
            parsed
                .map(Value::from)
                .ok_or_else(|| format!("{} is not an integer", value))
        }
        FieldType::Date => {
            let s = value
                .as_str()
                .ok_or_else(|| format!("{} is not a date", value))?;
            parse_date(s)
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .ok_or_else(|| format!("'{}' is not a date", s))
        }
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(s, format).ok())
        .or_else(|| {
            ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
                .map(|dt| dt.date())
        })
}

/// 4.0 -> 4; 4.5 -> None
fn whole(f: f64) -> Option<i64> {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn as_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(config: ReaderConfig) -> JsonBatchReader {
        JsonBatchReader::new(config)
    }

    fn row(invoice: &str) -> Value {
        serde_json::json!({
            "invoice_number": invoice,
            "date": "2025-04-28",
            "consignor_name": "Acme Mills",
            "consignee_name": "Delta Traders",
            "weight": "120.5",
            "packages": 4.0,
            "destination": "Pune",
            "remarks": "fragile"
        })
    }

    fn read(r: &JsonBatchReader, rows: Value) -> IngestResult<ReadOutcome> {
        r.read(Path::new("a.json"), rows.to_string().as_bytes())
    }

    #[test]
    fn test_reads_rows_in_order_with_conversions() {
        let out = read(&reader(ReaderConfig::default()), Value::Array(vec![row("A1"), row("A2")])).unwrap();
        assert_eq!(out.records.len(), 2);
        let first = &out.records[0];
        assert_eq!(first.invoice_number, "A1");
        assert_eq!(first.date, NaiveDate::from_ymd_opt(2025, 4, 28).unwrap());
        assert_eq!(first.weight, 120.5);
        assert_eq!(first.packages, 4);
        assert_eq!(first.extra["remarks"], "fragile");
        assert_eq!(out.records[1].invoice_number, "A2");
    }

    #[test]
    fn test_column_mapping() {
        let mut config = ReaderConfig::default();
        for (column, field) in [
            ("Invoice No", "invoice_number"),
            ("Invoice Date", "date"),
            ("Consignor", "consignor_name"),
            ("Consignee", "consignee_name"),
            ("Weight", "weight"),
            ("Pkgs", "packages"),
            ("To", "destination"),
        ] {
            config.column_mapping.insert(column.into(), field.into());
        }
        let rows = serde_json::json!([{
            "Invoice No": 1001,
            "Invoice Date": "28/04/2025",
            "Consignor": "Acme",
            "Consignee": "Delta",
            "Weight": 10,
            "Pkgs": "2",
            "To": "Nashik",
            "Unmapped": "dropped"
        }]);

        let out = read(&reader(config), rows).unwrap();
        let record = &out.records[0];
        assert_eq!(record.invoice_number, "1001");
        assert_eq!(record.date, NaiveDate::from_ymd_opt(2025, 4, 28).unwrap());
        assert_eq!(record.packages, 2);
        assert!(record.extra.is_empty());
    }

    #[test]
    fn test_missing_mapped_column_rejects_file() {
        let mut config = ReaderConfig::default();
        config.column_mapping.insert("LR Weight".into(), "weight".into());
        let err = read(&reader(config), Value::Array(vec![row("A1")])).unwrap_err();
        assert!(matches!(err, IngestError::MissingColumns(ref c) if c == &vec!["LR Weight".to_string()]));
    }

    #[test]
    fn test_invalid_rows_reject_or_skip() {
        let mut bad = row("A2");
        bad["weight"] = Value::from("heavy");
        let rows = Value::Array(vec![row("A1"), bad, row("A3")]);

        let err = read(&reader(ReaderConfig::default()), rows.clone()).unwrap_err();
        match err {
            IngestError::InvalidRows(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].row, 2);
                assert!(errors[0].message.contains("weight"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let config = ReaderConfig {
            skip_invalid_rows: true,
            ..ReaderConfig::default()
        };
        let out = read(&reader(config), rows).unwrap();
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.skipped[0].row, 2);
    }

    #[test]
    fn test_required_field_null() {
        let mut bad = row("A1");
        bad["destination"] = Value::Null;
        let err = read(&reader(ReaderConfig::default()), Value::Array(vec![bad])).unwrap_err();
        assert!(err.to_string().contains("Missing required field: destination"));
    }

    #[test]
    fn test_malformed_and_empty() {
        let r = reader(ReaderConfig::default());
        assert!(matches!(
            r.read(Path::new("a.json"), b"{\"not\": \"rows\"}"),
            Err(IngestError::Malformed { .. })
        ));
        assert!(matches!(
            r.read(Path::new("a.json"), b"not json"),
            Err(IngestError::Malformed { .. })
        ));
        assert!(matches!(r.read(Path::new("a.json"), b"[]"), Err(IngestError::NoValidRows)));
    }
}
