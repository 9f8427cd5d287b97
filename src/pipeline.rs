// ABOUTME: Orchestrates sync runs: validate, extract, reconcile, report
// ABOUTME: Supports full refresh and loading every collection of the source database

use serde::Serialize;

use crate::config::{Disposition, ExtractConfig, SyncUnit};
use crate::destination::Destination;
use crate::error::{Stage, SyncError};
use crate::extract::RecordExtractor;
use crate::load::{LoadInfo, LoadReconciler};
use crate::source::Source;
use crate::watermark::{WatermarkStore, WatermarkTracker};

/// Per-run switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Forget the unit's watermark first. Append units overwrite their table
    /// for this run so the reload does not duplicate rows.
    pub full_refresh: bool,
}

/// Outcome of running several units.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub records_written: u64,
    pub loads: Vec<LoadInfo>,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    fn record(&mut self, info: LoadInfo) {
        if info.succeeded() {
            self.succeeded += 1;
            self.records_written += info.records_written;
        } else {
            self.failed += 1;
        }
        self.loads.push(info);
    }
}

/// Turn a collection name into a valid table name.
pub fn table_name_for(collection: &str) -> String {
    let mut name: String = collection
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .take(63)
        .collect();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
        name.truncate(63);
    }
    name
}

/// A source, a destination and a watermark store wired together.
pub struct Pipeline<S, D, W> {
    extractor: RecordExtractor<S>,
    destination: D,
    tracker: WatermarkTracker<W>,
}

impl<S, D, W> Pipeline<S, D, W>
where
    S: Source + 'static,
    D: Destination,
    W: WatermarkStore,
{
    pub fn new(source: S, destination: D, store: W, settings: ExtractConfig) -> Self {
        Self {
            extractor: RecordExtractor::new(source, settings),
            destination,
            tracker: WatermarkTracker::new(store),
        }
    }

    pub fn source(&self) -> &S {
        self.extractor.source()
    }

    pub fn destination(&self) -> &D {
        &self.destination
    }

    pub fn tracker(&self) -> &WatermarkTracker<W> {
        &self.tracker
    }

    /// Run one unit end to end. Failures are reported in the LoadInfo.
    pub async fn run_unit(&self, unit: &SyncUnit, options: RunOptions) -> LoadInfo {
        if let Err(err) = unit.validate() {
            return LoadInfo::failed(unit, Stage::Configure, &err);
        }

        let mut unit = unit.clone();
        if options.full_refresh {
            if let Err(err) = self.tracker.reset(&unit.name).await {
                return LoadInfo::failed(&unit, Stage::Configure, &err);
            }
            if unit.disposition == Disposition::Append {
                unit.disposition = Disposition::Replace;
            }
            tracing::info!("Full refresh of unit '{}'", unit.name);
        }

        let extraction = match self.extractor.extract(&unit, &self.tracker).await {
            Ok(extraction) => extraction,
            Err(err) => {
                let stage = match err {
                    SyncError::Configuration(_) => Stage::Configure,
                    _ => Stage::Extract,
                };
                return LoadInfo::failed(&unit, stage, &err);
            }
        };

        LoadReconciler::new(&self.destination, &self.tracker)
            .reconcile(&unit, extraction)
            .await
    }

    /// Run units one after another. A failing unit does not stop the others.
    pub async fn run(&self, units: &[SyncUnit], options: RunOptions) -> RunSummary {
        let mut summary = RunSummary::default();
        for unit in units {
            summary.record(self.run_unit(unit, options).await);
        }
        tracing::info!(
            "Sync finished: {} unit(s) succeeded, {} failed, {} row(s) written",
            summary.succeeded,
            summary.failed,
            summary.records_written
        );
        summary
    }

    /// One replace unit per source collection, without field mapping.
    pub async fn discover_units(&self) -> Result<Vec<SyncUnit>, SyncError> {
        let collections = self
            .source()
            .list_collections()
            .await
            .map_err(|source| SyncError::SourceQuery {
                unit: "*".to_string(),
                source,
            })?;

        tracing::info!(
            "Discovered {} collection(s) in {}",
            collections.len(),
            self.source().name()
        );
        Ok(collections
            .iter()
            .map(|collection| {
                SyncUnit::new(collection, Disposition::Replace)
                    .with_table(&table_name_for(collection))
            })
            .collect())
    }
}
