// ABOUTME: Splits a packed two-date field of a loaded table into start and end date columns
// ABOUTME: Stateless bulk job that overwrites its output table and reports row counts

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::time::Instant;

use crate::destination::{Destination, WriteMode};
use crate::error::{Stage, SyncError};
use crate::load::LoadOutcome;
use crate::record::Record;
use crate::utils::validate_identifier;

pub const DEFAULT_PACKED_FIELD: &str = "billing_period";
pub const DEFAULT_START_COLUMN: &str = "start_date";
pub const DEFAULT_END_COLUMN: &str = "end_date";

/// Width of a packed value: `YYYYMMDD?YYYYMMDD`.
const PACKED_WIDTH: usize = 17;

/// What to decompose and where to write the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecomposeJob {
    pub input_table: String,
    pub output_table: String,
    pub packed_field: String,
    pub start_column: String,
    pub end_column: String,
}

impl DecomposeJob {
    pub fn new(input_table: &str, output_table: &str) -> Self {
        Self {
            input_table: input_table.to_string(),
            output_table: output_table.to_string(),
            packed_field: DEFAULT_PACKED_FIELD.to_string(),
            start_column: DEFAULT_START_COLUMN.to_string(),
            end_column: DEFAULT_END_COLUMN.to_string(),
        }
    }

    pub fn with_packed_field(mut self, field: &str) -> Self {
        self.packed_field = field.to_string();
        self
    }

    pub fn with_columns(mut self, start: &str, end: &str) -> Self {
        self.start_column = start.to_string();
        self.end_column = end.to_string();
        self
    }

    fn validate(&self) -> Result<(), SyncError> {
        for (what, name) in [
            ("input table", &self.input_table),
            ("output table", &self.output_table),
        ] {
            validate_identifier(name)
                .map_err(|e| SyncError::Configuration(format!("{}: {}", what, e)))?;
        }
        if self.packed_field.trim().is_empty() {
            return Err(SyncError::Configuration(
                "packed field name cannot be empty".to_string(),
            ));
        }
        if self.start_column == self.end_column {
            return Err(SyncError::Configuration(format!(
                "start and end columns must differ (both '{}')",
                self.start_column
            )));
        }
        Ok(())
    }
}

/// Result of one decomposition job.
#[derive(Debug, Clone, Serialize)]
pub struct DecomposeReport {
    pub input_table: String,
    pub output_table: String,
    pub rows_read: u64,
    pub rows_written: u64,
    /// Rows whose packed field yielded two dates
    pub decomposed: u64,
    /// Rows passed through with null date columns
    pub malformed: u64,
    pub duration_ms: u64,
    pub outcome: LoadOutcome,
}

impl DecomposeReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == LoadOutcome::Succeeded
    }

    fn fail(&mut self, stage: Stage, error: &SyncError) {
        tracing::error!(
            "Decomposing '{}' into '{}' failed at {}: {}",
            self.input_table,
            self.output_table,
            stage,
            error.detail()
        );
        self.outcome = LoadOutcome::Failed {
            stage,
            error: error.detail(),
        };
    }
}

fn parse_segment(segment: &str) -> Option<NaiveDate> {
    if segment.len() != 8 || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(segment, "%Y%m%d").ok()
}

/// Split a packed value into its two dates.
///
/// The value must be exactly 17 ASCII characters: the first date at offset 0
/// and the second at offset 9, each 8 digits `YYYYMMDD` forming a real
/// calendar date. The separator character at offset 8 is not checked.
pub fn split_packed_range(packed: &str) -> Option<(NaiveDate, NaiveDate)> {
    if packed.len() != PACKED_WIDTH || !packed.is_ascii() {
        return None;
    }
    let start = parse_segment(&packed[0..8])?;
    let end = parse_segment(&packed[9..17])?;
    Some((start, end))
}

/// Copy a row with the two date columns added. Returns whether the packed
/// field could be decomposed.
pub fn decompose_record(record: &Record, job: &DecomposeJob) -> (Record, bool) {
    let dates = record
        .get(&job.packed_field)
        .and_then(JsonValue::as_str)
        .and_then(split_packed_range);

    let mut out = record.clone();
    let (start, end, ok) = match dates {
        Some((start, end)) => (
            JsonValue::String(start.format("%Y-%m-%d").to_string()),
            JsonValue::String(end.format("%Y-%m-%d").to_string()),
            true,
        ),
        None => (JsonValue::Null, JsonValue::Null, false),
    };
    out.insert(job.start_column.clone(), start);
    out.insert(job.end_column.clone(), end);
    (out, ok)
}

/// Read every row of the input table, decompose its packed field and
/// overwrite the output table with the result.
///
/// Malformed values never fail the job; only configuration, read and write
/// errors do. The job holds no state and may be re-run at any time.
pub async fn decompose<D: Destination>(destination: &D, job: &DecomposeJob) -> DecomposeReport {
    let started = Instant::now();
    let mut report = DecomposeReport {
        input_table: job.input_table.clone(),
        output_table: job.output_table.clone(),
        rows_read: 0,
        rows_written: 0,
        decomposed: 0,
        malformed: 0,
        duration_ms: 0,
        outcome: LoadOutcome::Succeeded,
    };

    run(destination, job, &mut report).await;

    report.duration_ms = started.elapsed().as_millis() as u64;
    if report.succeeded() {
        tracing::info!(
            "Decomposed '{}' into '{}': {} row(s), {} malformed",
            job.input_table,
            job.output_table,
            report.rows_written,
            report.malformed
        );
    }
    report
}

async fn run<D: Destination>(destination: &D, job: &DecomposeJob, report: &mut DecomposeReport) {
    if let Err(err) = job.validate() {
        return report.fail(Stage::Configure, &err);
    }

    let rows = match destination.read_table(&job.input_table).await {
        Ok(rows) => rows,
        Err(source) => {
            let err = SyncError::ReadFailure {
                table: job.input_table.clone(),
                source,
            };
            return report.fail(Stage::Extract, &err);
        }
    };
    report.rows_read = rows.len() as u64;

    let mut output = Vec::with_capacity(rows.len());
    for row in &rows {
        let (out, ok) = decompose_record(row, job);
        if ok {
            report.decomposed += 1;
        } else {
            report.malformed += 1;
            tracing::debug!(
                "Malformed '{}' value {:?}; date columns set to null",
                job.packed_field,
                row.get(&job.packed_field)
            );
        }
        output.push(out);
    }

    match destination
        .write(&job.output_table, output, WriteMode::Overwrite)
        .await
    {
        Ok(written) => report.rows_written = written,
        Err(source) => {
            let err = SyncError::WriteFailure {
                table: job.output_table.clone(),
                source,
            };
            report.fail(Stage::Load, &err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_split_valid_range() {
        assert_eq!(
            split_packed_range("20160101-20160201"),
            Some((date(2016, 1, 1), date(2016, 2, 1)))
        );
        // separator is positional only
        assert_eq!(
            split_packed_range("20160101_20160201"),
            Some((date(2016, 1, 1), date(2016, 2, 1)))
        );
    }

    #[test]
    fn test_split_rejects_bad_width_and_dates() {
        assert_eq!(split_packed_range("garbage"), None);
        assert_eq!(split_packed_range(""), None);
        assert_eq!(split_packed_range("20160101-201602011"), None);
        assert_eq!(split_packed_range("20160101-2016020"), None);
        assert_eq!(split_packed_range("20160230-20160301"), None);
        assert_eq!(split_packed_range("2016010a-20160201"), None);
        assert_eq!(split_packed_range("+2016010-20160201"), None);
        assert_eq!(split_packed_range("20160101-2016é201"), None);
    }

    #[test]
    fn test_decompose_record_keeps_fields() {
        let job = DecomposeJob::new("subscription", "subscription_periods");
        let row = json!({"id": 1, "billing_period": "20160101-20160201"})
            .as_object()
            .cloned()
            .unwrap();
        let (out, ok) = decompose_record(&row, &job);
        assert!(ok);
        assert_eq!(out["id"], json!(1));
        assert_eq!(out["billing_period"], json!("20160101-20160201"));
        assert_eq!(out["start_date"], json!("2016-01-01"));
        assert_eq!(out["end_date"], json!("2016-02-01"));
    }

    #[test]
    fn test_decompose_record_non_string_is_malformed() {
        let job = DecomposeJob::new("a", "b");
        let row = json!({"billing_period": 20160101})
            .as_object()
            .cloned()
            .unwrap();
        let (out, ok) = decompose_record(&row, &job);
        assert!(!ok);
        assert_eq!(out["start_date"], JsonValue::Null);
        assert_eq!(out["end_date"], JsonValue::Null);
    }

    #[test]
    fn test_job_validation() {
        assert!(DecomposeJob::new("a", "b").validate().is_ok());
        assert!(DecomposeJob::new("a", "bad-name").validate().is_err());
        assert!(DecomposeJob::new("a", "b")
            .with_columns("d", "d")
            .validate()
            .is_err());
    }
}
