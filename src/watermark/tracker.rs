// ABOUTME: Decides extraction bounds per sync unit and advances watermarks after commits
// ABOUTME: Enforces monotonic advancement and single-writer compare-and-set

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};

use chrono::Utc;

use super::state::WatermarkState;
use super::store::{StoreError, WatermarkStore};
use super::value::WatermarkValue;
use crate::config::SyncUnit;
use crate::error::SyncError;

/// Extraction range for one run of a unit: `[lower, upper)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bounds {
    /// Inclusive lower bound, `None` for an unbounded first run
    pub lower: Option<WatermarkValue>,
    /// Exclusive upper bound for bounded backfills
    pub upper: Option<WatermarkValue>,
    /// Hashes of records already written at exactly `lower`
    pub seen_at_lower: HashSet<String>,
    /// Version of the stored state the bounds were read from (0 = none)
    pub version: u64,
}

/// Proposed new watermark, computed from records that were durably written.
#[derive(Debug, Clone, PartialEq)]
pub struct Advance {
    pub value: WatermarkValue,
    /// Hashes of the written records whose cursor equals `value`
    pub boundary_hashes: Vec<String>,
    pub row_count: u64,
}

/// Reads and advances per-unit watermarks on an injected store.
pub struct WatermarkTracker<W> {
    store: W,
}

impl<W: WatermarkStore> WatermarkTracker<W> {
    pub fn new(store: W) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &W {
        &self.store
    }

    /// Compute the extraction bounds of a unit.
    ///
    /// The persisted watermark wins; otherwise the unit's configured
    /// `initial_value` is used, and without one the range is unbounded below.
    /// A missing watermark is a normal first run, not an error.
    pub async fn bounds(&self, unit: &SyncUnit) -> Result<Bounds, SyncError> {
        let stored = self
            .store
            .get(&unit.name)
            .await
            .map_err(|source| SyncError::WatermarkStore {
                unit: unit.name.clone(),
                source,
            })?;

        let bounds = match stored {
            Some(state) => {
                tracing::debug!(
                    "Unit '{}' resumes from watermark {} (version {})",
                    unit.name,
                    state.value,
                    state.version
                );
                Bounds {
                    lower: Some(state.value),
                    upper: unit.end_value.clone(),
                    seen_at_lower: state.boundary_hashes.into_iter().collect(),
                    version: state.version,
                }
            }
            None => {
                tracing::debug!(
                    "Unit '{}' has no watermark; starting from {}",
                    unit.name,
                    unit.initial_value
                        .as_ref()
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "the beginning".to_string())
                );
                Bounds {
                    lower: unit.initial_value.clone(),
                    upper: unit.end_value.clone(),
                    seen_at_lower: HashSet::new(),
                    version: 0,
                }
            }
        };

        if let (Some(lower), Some(upper)) = (&bounds.lower, &bounds.upper) {
            if !lower.same_kind(upper) {
                return Err(SyncError::Configuration(format!(
                    "unit '{}' watermark is a {} but end_value is a {}",
                    unit.name,
                    lower.kind(),
                    upper.kind()
                )));
            }
        }

        Ok(bounds)
    }

    /// Persist a new watermark for `unit` in a single atomic write.
    ///
    /// Returns the stored value, or `None` when the candidate is below the
    /// current watermark and was ignored. A candidate equal to the lower bound
    /// keeps the boundary hashes of earlier runs.
    pub async fn advance(
        &self,
        unit: &str,
        bounds: &Bounds,
        candidate: Advance,
    ) -> Result<Option<WatermarkValue>, SyncError> {
        let mut hashes: BTreeSet<String> = candidate.boundary_hashes.into_iter().collect();

        if let Some(lower) = &bounds.lower {
            let ordering = candidate.value.compare(lower).map_err(|e| {
                SyncError::Configuration(format!("unit '{}' cursor changed type: {}", unit, e))
            })?;
            match ordering {
                Ordering::Less => {
                    tracing::warn!(
                        "Unit '{}': candidate watermark {} is below current {}; keeping current",
                        unit,
                        candidate.value,
                        lower
                    );
                    return Ok(None);
                }
                Ordering::Equal => hashes.extend(bounds.seen_at_lower.iter().cloned()),
                Ordering::Greater => {}
            }
        }

        let state = WatermarkState {
            unit: unit.to_string(),
            value: candidate.value.clone(),
            boundary_hashes: hashes.into_iter().collect(),
            version: bounds.version + 1,
            last_row_count: candidate.row_count,
            updated_at: Utc::now(),
        };

        self.store
            .set(&state, bounds.version)
            .await
            .map_err(|e| match e {
                StoreError::Conflict { expected, found } => SyncError::ConcurrentUpdate {
                    unit: unit.to_string(),
                    expected,
                    found,
                },
                StoreError::Other(source) => SyncError::WatermarkStore {
                    unit: unit.to_string(),
                    source,
                },
            })?;

        tracing::info!(
            "Unit '{}' watermark advanced to {} (version {})",
            unit,
            state.value,
            state.version
        );
        Ok(Some(state.value))
    }

    /// Forget the watermark of a unit so the next run starts from its default.
    pub async fn reset(&self, unit: &str) -> Result<bool, SyncError> {
        let removed = self
            .store
            .remove(unit)
            .await
            .map_err(|source| SyncError::WatermarkStore {
                unit: unit.to_string(),
                source,
            })?;
        if removed {
            tracing::info!("Reset watermark for unit '{}'", unit);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Disposition;
    use crate::watermark::MemoryWatermarkStore;

    fn unit() -> SyncUnit {
        SyncUnit::new("invoice", Disposition::Append)
            .with_cursor("seq", Some(WatermarkValue::Int(100)))
    }

    fn advance_to(value: i64, hashes: &[&str]) -> Advance {
        Advance {
            value: WatermarkValue::Int(value),
            boundary_hashes: hashes.iter().map(|h| h.to_string()).collect(),
            row_count: 1,
        }
    }

    #[tokio::test]
    async fn test_first_run_uses_initial_value() {
        let tracker = WatermarkTracker::new(MemoryWatermarkStore::new());
        let bounds = tracker.bounds(&unit()).await.unwrap();
        assert_eq!(bounds.lower, Some(WatermarkValue::Int(100)));
        assert_eq!(bounds.upper, None);
        assert_eq!(bounds.version, 0);
        assert!(bounds.seen_at_lower.is_empty());
    }

    #[tokio::test]
    async fn test_first_run_without_default_is_unbounded() {
        let tracker = WatermarkTracker::new(MemoryWatermarkStore::new());
        let unit = SyncUnit::new("company", Disposition::Append).with_cursor("seq", None);
        let bounds = tracker.bounds(&unit).await.unwrap();
        assert_eq!(bounds, Bounds::default());
    }

    #[tokio::test]
    async fn test_advance_then_resume() {
        let tracker = WatermarkTracker::new(MemoryWatermarkStore::new());
        let unit = unit();

        let bounds = tracker.bounds(&unit).await.unwrap();
        let stored = tracker
            .advance(&unit.name, &bounds, advance_to(150, &["h1"]))
            .await
            .unwrap();
        assert_eq!(stored, Some(WatermarkValue::Int(150)));

        let resumed = tracker.bounds(&unit).await.unwrap();
        assert_eq!(resumed.lower, Some(WatermarkValue::Int(150)));
        assert_eq!(resumed.version, 1);
        assert!(resumed.seen_at_lower.contains("h1"));
    }

    #[tokio::test]
    async fn test_lower_candidate_is_ignored() {
        let tracker = WatermarkTracker::new(MemoryWatermarkStore::new());
        let unit = unit();

        let bounds = tracker.bounds(&unit).await.unwrap();
        tracker
            .advance(&unit.name, &bounds, advance_to(200, &[]))
            .await
            .unwrap();

        let bounds = tracker.bounds(&unit).await.unwrap();
        let stored = tracker
            .advance(&unit.name, &bounds, advance_to(120, &[]))
            .await
            .unwrap();
        assert_eq!(stored, None);
        assert_eq!(
            tracker.bounds(&unit).await.unwrap().lower,
            Some(WatermarkValue::Int(200))
        );
    }

    #[tokio::test]
    async fn test_equal_candidate_unions_boundary_hashes() {
        let tracker = WatermarkTracker::new(MemoryWatermarkStore::new());
        let unit = unit();

        let bounds = tracker.bounds(&unit).await.unwrap();
        tracker
            .advance(&unit.name, &bounds, advance_to(300, &["a"]))
            .await
            .unwrap();
        let bounds = tracker.bounds(&unit).await.unwrap();
        tracker
            .advance(&unit.name, &bounds, advance_to(300, &["b"]))
            .await
            .unwrap();

        let seen = tracker.bounds(&unit).await.unwrap().seen_at_lower;
        assert!(seen.contains("a") && seen.contains("b"));
    }

    #[tokio::test]
    async fn test_stale_bounds_report_concurrent_update() {
        let tracker = WatermarkTracker::new(MemoryWatermarkStore::new());
        let unit = unit();

        let stale = tracker.bounds(&unit).await.unwrap();
        tracker
            .advance(&unit.name, &stale, advance_to(110, &[]))
            .await
            .unwrap();

        let err = tracker
            .advance(&unit.name, &stale, advance_to(120, &[]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::ConcurrentUpdate {
                expected: 0,
                found: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_configuration_error() {
        let tracker = WatermarkTracker::new(MemoryWatermarkStore::new());
        let unit = unit();
        let bounds = tracker.bounds(&unit).await.unwrap();
        let candidate = Advance {
            value: WatermarkValue::parse("2020-01-01").unwrap(),
            boundary_hashes: Vec::new(),
            row_count: 1,
        };
        assert!(matches!(
            tracker.advance(&unit.name, &bounds, candidate).await,
            Err(SyncError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_returns_to_default() {
        let tracker = WatermarkTracker::new(MemoryWatermarkStore::new());
        let unit = unit();
        let bounds = tracker.bounds(&unit).await.unwrap();
        tracker
            .advance(&unit.name, &bounds, advance_to(999, &[]))
            .await
            .unwrap();

        assert!(tracker.reset(&unit.name).await.unwrap());
        assert_eq!(
            tracker.bounds(&unit).await.unwrap().lower,
            Some(WatermarkValue::Int(100))
        );
    }
}
