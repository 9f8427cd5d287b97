// ABOUTME: Record extraction over the watermark range with optional parallel partitions
// ABOUTME: Retries transient source errors per partition and normalizes every record

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ExtractConfig, SyncUnit};
use crate::error::{SourceError, SyncError};
use crate::mapping::{normalize_with_report, FieldMapping};
use crate::record::{record_hash, Record};
use crate::source::{QueryRequest, Source};
use crate::utils::retry_with_backoff;
use crate::watermark::{Bounds, WatermarkStore, WatermarkTracker, WatermarkValue};

/// Counters updated while an extraction stream is consumed.
#[derive(Debug, Default)]
pub struct ExtractStats {
    fetched: AtomicU64,
    skipped_boundary: AtomicU64,
    collisions: AtomicU64,
    partitions_done: AtomicU64,
}

impl ExtractStats {
    /// Raw documents returned by the source
    pub fn fetched(&self) -> u64 {
        self.fetched.load(Ordering::Relaxed)
    }

    /// Records at the lower bound that an earlier run already wrote
    pub fn skipped_boundary(&self) -> u64 {
        self.skipped_boundary.load(Ordering::Relaxed)
    }

    /// Canonical-name collisions reported by the field mapper
    pub fn collisions(&self) -> u64 {
        self.collisions.load(Ordering::Relaxed)
    }

    pub fn partitions_done(&self) -> u64 {
        self.partitions_done.load(Ordering::Relaxed)
    }
}

/// A lazy, finite, single-use sequence of normalized records for one unit.
///
/// Records within one partition keep the source order; partitions complete in
/// any order.
pub struct Extraction {
    pub unit: String,
    pub bounds: Bounds,
    pub partitions: usize,
    pub stats: Arc<ExtractStats>,
    pub records: BoxStream<'static, Result<Record, SyncError>>,
}

impl std::fmt::Debug for Extraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extraction")
            .field("unit", &self.unit)
            .field("bounds", &self.bounds)
            .field("partitions", &self.partitions)
            .finish_non_exhaustive()
    }
}

/// Shared state of the partition fetches of one extraction.
struct PartitionContext {
    unit: String,
    cursor_field: Option<String>,
    lower: Option<WatermarkValue>,
    seen_at_lower: HashSet<String>,
    mapping: FieldMapping,
    max_retries: u32,
    retry_delay: Duration,
    stats: Arc<ExtractStats>,
}

impl PartitionContext {
    /// True when the record sits exactly on the lower bound and was written
    /// by an earlier run.
    fn already_delivered(&self, record: &Record) -> bool {
        if self.seen_at_lower.is_empty() {
            return false;
        }
        let (Some(field), Some(lower)) = (&self.cursor_field, &self.lower) else {
            return false;
        };
        let at_lower = record
            .get(field)
            .and_then(WatermarkValue::from_json)
            .is_some_and(|value| &value == lower);
        at_lower && self.seen_at_lower.contains(&record_hash(record))
    }
}

/// Run a source operation, retrying transient failures with backoff.
async fn retry_source<T, F, Fut>(
    unit: &str,
    operation_name: &str,
    max_retries: u32,
    retry_delay: Duration,
    operation: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    retry_with_backoff(
        operation,
        SourceError::is_transient,
        max_retries,
        retry_delay,
        operation_name,
    )
    .await
    .map_err(|(source, attempts)| {
        if source.is_transient() {
            SyncError::SourceUnavailable {
                unit: unit.to_string(),
                attempts,
                source,
            }
        } else {
            SyncError::SourceQuery {
                unit: unit.to_string(),
                source,
            }
        }
    })
}

async fn fetch_partition<S: Source>(
    source: &S,
    ctx: &PartitionContext,
    request: QueryRequest,
) -> Result<Vec<Record>, SyncError> {
    let operation_name = format!("Query {}", request.describe());
    let raw = retry_source(
        &ctx.unit,
        &operation_name,
        ctx.max_retries,
        ctx.retry_delay,
        || source.query(&request),
    )
    .await?;

    ctx.stats
        .fetched
        .fetch_add(raw.len() as u64, Ordering::Relaxed);

    let mut records = Vec::with_capacity(raw.len());
    let mut skipped = 0u64;
    for document in &raw {
        let (record, collisions) = normalize_with_report(document, &ctx.mapping);
        if collisions > 0 {
            ctx.stats
                .collisions
                .fetch_add(collisions as u64, Ordering::Relaxed);
        }
        if ctx.already_delivered(&record) {
            skipped += 1;
            continue;
        }
        records.push(record);
    }

    ctx.stats
        .skipped_boundary
        .fetch_add(skipped, Ordering::Relaxed);
    ctx.stats.partitions_done.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(
        "Partition {} of '{}' yielded {} record(s) ({} already delivered)",
        request.partition,
        ctx.unit,
        records.len(),
        skipped
    );
    Ok(records)
}

/// Pulls records of a sync unit from a source within its watermark range.
pub struct RecordExtractor<S> {
    source: Arc<S>,
    settings: ExtractConfig,
}

impl<S: Source + 'static> RecordExtractor<S> {
    pub fn new(source: S, settings: ExtractConfig) -> Self {
        Self::from_arc(Arc::new(source), settings)
    }

    pub fn from_arc(source: Arc<S>, settings: ExtractConfig) -> Self {
        Self { source, settings }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn settings(&self) -> &ExtractConfig {
        &self.settings
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.settings.retry_delay_ms)
    }

    /// Read the unit's bounds from the tracker and start extracting.
    ///
    /// Every call re-reads the bounds, so a new extraction resumes from the
    /// current watermark.
    pub async fn extract<W: WatermarkStore>(
        &self,
        unit: &SyncUnit,
        tracker: &WatermarkTracker<W>,
    ) -> Result<Extraction, SyncError> {
        let bounds = tracker.bounds(unit).await?;
        self.extract_range(unit, bounds).await
    }

    /// Extract records of `unit` within explicit bounds.
    pub async fn extract_range(
        &self,
        unit: &SyncUnit,
        bounds: Bounds,
    ) -> Result<Extraction, SyncError> {
        let requests = self.plan(unit, &bounds).await?;
        let partitions = requests.len();
        let stats = Arc::new(ExtractStats::default());

        tracing::info!(
            "Extracting '{}' from {} '{}' in {} partition(s), range [{}, {})",
            unit.name,
            self.source.name(),
            unit.source,
            partitions,
            bounds
                .lower
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "*".to_string()),
            bounds
                .upper
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "*".to_string())
        );

        let ctx = Arc::new(PartitionContext {
            unit: unit.name.clone(),
            cursor_field: unit.cursor_field.clone(),
            lower: bounds.lower.clone(),
            seen_at_lower: bounds.seen_at_lower.clone(),
            mapping: unit.mapping.clone(),
            max_retries: self.settings.max_retries,
            retry_delay: self.retry_delay(),
            stats: Arc::clone(&stats),
        });
        let source = Arc::clone(&self.source);

        let records = stream::iter(requests)
            .map(move |request| {
                let source = Arc::clone(&source);
                let ctx = Arc::clone(&ctx);
                async move { fetch_partition(source.as_ref(), &ctx, request).await }
            })
            .buffer_unordered(self.settings.parallelism.max(1))
            .map_ok(|records| stream::iter(records.into_iter().map(Ok::<Record, SyncError>)))
            .try_flatten()
            .boxed();

        Ok(Extraction {
            unit: unit.name.clone(),
            bounds,
            partitions,
            stats,
            records,
        })
    }

    /// Cut the unit's range into partition queries.
    ///
    /// Without parallel mode (or without data to probe) there is a single
    /// query over `[lower, upper)`. In parallel mode the probed cursor span,
    /// clamped to the bounds, is split evenly; the first partition keeps the
    /// original lower bound and the last keeps the original upper bound, so
    /// the partitions cover exactly the unsplit range.
    async fn plan(&self, unit: &SyncUnit, bounds: &Bounds) -> Result<Vec<QueryRequest>, SyncError> {
        let single = QueryRequest {
            collection: unit.source.clone(),
            cursor_field: unit.cursor_field.clone(),
            lower: bounds.lower.clone(),
            upper: bounds.upper.clone(),
            partition: 0,
        };

        let field = match unit.cursor_field.as_deref() {
            Some(field) if unit.parallel && self.settings.partitions > 1 => field,
            _ => return Ok(vec![single]),
        };

        let probe_name = format!("Probe cursor range of '{}'", unit.source);
        let probed = retry_source(
            &unit.name,
            &probe_name,
            self.settings.max_retries,
            self.retry_delay(),
            || self.source.cursor_range(&unit.source, field),
        )
        .await?;
        let Some((min, max)) = probed else {
            return Ok(vec![single]);
        };

        let cursor_type_error = |e: anyhow::Error| {
            SyncError::Configuration(format!("unit '{}' cursor '{}': {}", unit.name, field, e))
        };
        let low = match &bounds.lower {
            Some(lower) if lower.compare(&min).map_err(cursor_type_error)? == CmpOrdering::Greater => {
                lower.clone()
            }
            _ => min,
        };
        let high = match &bounds.upper {
            Some(upper) if upper.compare(&max).map_err(cursor_type_error)? == CmpOrdering::Less => {
                upper.clone()
            }
            _ => max,
        };

        let cuts = WatermarkValue::split_points(&low, &high, self.settings.partitions)
            .map_err(cursor_type_error)?;
        if cuts.is_empty() {
            return Ok(vec![single]);
        }

        let mut edges = Vec::with_capacity(cuts.len() + 2);
        edges.push(bounds.lower.clone());
        edges.extend(cuts.into_iter().map(Some));
        edges.push(bounds.upper.clone());

        Ok(edges
            .windows(2)
            .enumerate()
            .map(|(partition, edge)| QueryRequest {
                partition,
                lower: edge[0].clone(),
                upper: edge[1].clone(),
                ..single.clone()
            })
            .collect())
    }
}
