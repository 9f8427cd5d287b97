// ABOUTME: Applies a unit's disposition to extracted records and commits the watermark
// ABOUTME: Always produces a LoadInfo describing the run, success or failure

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use uuid::Uuid;

use crate::config::{Disposition, SyncUnit};
use crate::destination::{Destination, WriteMode};
use crate::error::{Stage, SyncError};
use crate::extract::Extraction;
use crate::record::{key_string, record_hash, Record};
use crate::watermark::{Advance, WatermarkStore, WatermarkTracker, WatermarkValue};

/// Final state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadOutcome {
    Succeeded,
    Failed { stage: Stage, error: String },
}

/// Summary of one run of one sync unit, returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct LoadInfo {
    pub load_id: Uuid,
    pub unit: String,
    pub table: String,
    pub disposition: Disposition,
    pub partitions: usize,
    /// Records received from the extractor
    pub records_extracted: u64,
    /// Rows the destination reported as written
    pub records_written: u64,
    /// Records removed by in-run de-duplication
    pub duplicates_dropped: u64,
    /// Records at the lower bound skipped because an earlier run wrote them
    pub boundary_skipped: u64,
    pub mapping_collisions: u64,
    pub watermark_before: Option<WatermarkValue>,
    pub watermark_after: Option<WatermarkValue>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: LoadOutcome,
}

impl LoadInfo {
    pub fn new(unit: &SyncUnit) -> Self {
        Self {
            load_id: Uuid::new_v4(),
            unit: unit.name.clone(),
            table: unit.table.clone(),
            disposition: unit.disposition,
            partitions: 0,
            records_extracted: 0,
            records_written: 0,
            duplicates_dropped: 0,
            boundary_skipped: 0,
            mapping_collisions: 0,
            watermark_before: None,
            watermark_after: None,
            started_at: Utc::now(),
            duration_ms: 0,
            outcome: LoadOutcome::Succeeded,
        }
    }

    /// A LoadInfo for a run that failed before producing any records.
    pub fn failed(unit: &SyncUnit, stage: Stage, error: &SyncError) -> Self {
        let mut info = Self::new(unit);
        info.fail(stage, error);
        info
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == LoadOutcome::Succeeded
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            LoadOutcome::Succeeded => None,
            LoadOutcome::Failed { error, .. } => Some(error),
        }
    }

    pub fn failed_stage(&self) -> Option<Stage> {
        match &self.outcome {
            LoadOutcome::Succeeded => None,
            LoadOutcome::Failed { stage, .. } => Some(*stage),
        }
    }

    fn fail(&mut self, stage: Stage, error: &SyncError) {
        tracing::error!("Unit '{}' failed at {}: {}", self.unit, stage, error.detail());
        self.outcome = LoadOutcome::Failed {
            stage,
            error: error.detail(),
        };
    }
}

/// Drop duplicate records before writing.
///
/// Replace and append keep the first of identical records; merge keeps the
/// last record for each key, at the position of its first occurrence.
fn deduplicate(
    records: Vec<Record>,
    disposition: Disposition,
    primary_key: Option<&str>,
) -> Result<(Vec<Record>, u64), SyncError> {
    let total = records.len();
    let batch = match (disposition, primary_key) {
        (Disposition::Merge, Some(key)) => {
            let mut slots: HashMap<String, usize> = HashMap::with_capacity(total);
            let mut batch: Vec<Record> = Vec::with_capacity(total);
            for (idx, record) in records.into_iter().enumerate() {
                let Some(id) = record.get(key).and_then(key_string) else {
                    return Err(SyncError::Configuration(format!(
                        "record {} has no value for primary key '{}'",
                        idx, key
                    )));
                };
                match slots.get(&id) {
                    Some(&slot) => batch[slot] = record,
                    None => {
                        slots.insert(id, batch.len());
                        batch.push(record);
                    }
                }
            }
            batch
        }
        (Disposition::Merge, None) => {
            return Err(SyncError::Configuration(
                "merge disposition requires a primary key".to_string(),
            ))
        }
        _ => {
            let mut seen = HashSet::with_capacity(total);
            records
                .into_iter()
                .filter(|record| seen.insert(record_hash(record)))
                .collect()
        }
    };
    let dropped = (total - batch.len()) as u64;
    Ok((batch, dropped))
}

/// Highest cursor value among `records` plus the hashes of records holding it.
fn candidate_watermark(
    records: &[Record],
    cursor_field: &str,
    row_count: u64,
) -> Result<Option<Advance>, SyncError> {
    let mut best: Option<(WatermarkValue, Vec<String>)> = None;
    for record in records {
        let Some(value) = record.get(cursor_field).and_then(WatermarkValue::from_json) else {
            continue;
        };
        best = match best {
            None => Some((value, vec![record_hash(record)])),
            Some((current, mut hashes)) => {
                let ordering = value.compare(&current).map_err(|e| {
                    SyncError::Configuration(format!("cursor '{}': {}", cursor_field, e))
                })?;
                match ordering {
                    Ordering::Greater => Some((value, vec![record_hash(record)])),
                    Ordering::Equal => {
                        hashes.push(record_hash(record));
                        Some((current, hashes))
                    }
                    Ordering::Less => Some((current, hashes)),
                }
            }
        };
    }
    Ok(best.map(|(value, boundary_hashes)| Advance {
        value,
        boundary_hashes,
        row_count,
    }))
}

/// Writes extracted records with the unit's disposition and, once the write
/// is confirmed, advances the unit's watermark.
pub struct LoadReconciler<'a, D, W> {
    destination: &'a D,
    tracker: &'a WatermarkTracker<W>,
}

impl<'a, D: Destination, W: WatermarkStore> LoadReconciler<'a, D, W> {
    pub fn new(destination: &'a D, tracker: &'a WatermarkTracker<W>) -> Self {
        Self {
            destination,
            tracker,
        }
    }

    /// Drain `extraction` into the destination.
    ///
    /// Never fails: errors are reported through the returned LoadInfo. A
    /// failure at any stage before `commit` leaves the watermark untouched.
    pub async fn reconcile(&self, unit: &SyncUnit, extraction: Extraction) -> LoadInfo {
        let started = Instant::now();
        let mut info = LoadInfo::new(unit);
        info.partitions = extraction.partitions;
        info.watermark_before = extraction.bounds.lower.clone();
        info.watermark_after = extraction.bounds.lower.clone();

        self.run(unit, extraction, &mut info).await;

        info.duration_ms = started.elapsed().as_millis() as u64;
        if info.succeeded() {
            tracing::info!(
                "Unit '{}' loaded: {} extracted, {} written, {} duplicate(s) dropped ({} ms)",
                info.unit,
                info.records_extracted,
                info.records_written,
                info.duplicates_dropped,
                info.duration_ms
            );
        }
        info
    }

    async fn run(&self, unit: &SyncUnit, extraction: Extraction, info: &mut LoadInfo) {
        let Extraction {
            bounds,
            stats,
            mut records,
            ..
        } = extraction;

        let mut collected = Vec::new();
        while let Some(item) = records.next().await {
            match item {
                Ok(record) => collected.push(record),
                Err(err) => {
                    info.records_extracted = collected.len() as u64;
                    info.boundary_skipped = stats.skipped_boundary();
                    info.mapping_collisions = stats.collisions();
                    info.fail(Stage::Extract, &err);
                    return;
                }
            }
        }
        drop(records);
        info.records_extracted = collected.len() as u64;
        info.boundary_skipped = stats.skipped_boundary();
        info.mapping_collisions = stats.collisions();

        let (batch, dropped) =
            match deduplicate(collected, unit.disposition, unit.primary_key.as_deref()) {
                Ok(deduped) => deduped,
                Err(err) => return info.fail(Stage::Load, &err),
            };
        info.duplicates_dropped = dropped;
        if dropped > 0 {
            tracing::info!(
                "Unit '{}': dropped {} duplicate record(s) before write",
                unit.name,
                dropped
            );
        }

        let batch_len = batch.len() as u64;
        let candidate = match unit.cursor_field.as_deref() {
            Some(field) => match candidate_watermark(&batch, field, batch_len) {
                Ok(None) if !batch.is_empty() => {
                    // Written records must move the watermark
                    let err = SyncError::Configuration(format!(
                        "unit '{}': none of {} record(s) has an integer or RFC 3339 value in cursor '{}'",
                        unit.name, batch_len, field
                    ));
                    return info.fail(Stage::Load, &err);
                }
                Ok(candidate) => candidate,
                Err(err) => return info.fail(Stage::Load, &err),
            },
            None => None,
        };

        if batch.is_empty() && unit.disposition != Disposition::Replace {
            tracing::info!("Unit '{}': nothing new to load", unit.name);
            return;
        }

        let mode = match (unit.disposition, unit.primary_key.as_ref()) {
            (Disposition::Replace, _) => WriteMode::Overwrite,
            (Disposition::Append, _) => WriteMode::Append,
            (Disposition::Merge, Some(key)) => WriteMode::Upsert { key: key.clone() },
            (Disposition::Merge, None) => {
                let err = SyncError::Configuration(format!(
                    "unit '{}' uses merge but declares no primary_key",
                    unit.name
                ));
                return info.fail(Stage::Load, &err);
            }
        };

        match self.destination.write(&unit.table, batch, mode).await {
            Ok(written) => info.records_written = written,
            Err(source) => {
                let err = SyncError::WriteFailure {
                    table: unit.table.clone(),
                    source,
                };
                return info.fail(Stage::Load, &err);
            }
        }

        let Some(candidate) = candidate else {
            return;
        };
        match self.tracker.advance(&unit.name, &bounds, candidate).await {
            Ok(Some(value)) => info.watermark_after = Some(value),
            Ok(None) => {}
            Err(err) => info.fail(Stage::Commit, &err),
        }
    }
}
