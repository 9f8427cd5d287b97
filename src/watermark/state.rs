// ABOUTME: Persisted watermark state per sync unit and the JSON file store
// ABOUTME: Writes the whole state document atomically via temp file + rename

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

use super::store::{StoreError, WatermarkStore};
use super::value::WatermarkValue;

/// Watermark for a single sync unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkState {
    /// Sync unit name
    pub unit: String,
    /// Highest cursor value durably written (inclusive lower bound of the next run)
    pub value: WatermarkValue,
    /// Content hashes of records whose cursor equals `value`.
    /// The next run re-reads that value and skips these records.
    #[serde(default)]
    pub boundary_hashes: Vec<String>,
    /// Compare-and-set token, incremented on every write
    pub version: u64,
    /// Rows written by the run that produced this state
    pub last_row_count: u64,
    /// When this state was written
    pub updated_at: DateTime<Utc>,
}

impl WatermarkState {
    /// Create the first state for a unit.
    pub fn new(unit: &str, value: WatermarkValue) -> Self {
        Self {
            unit: unit.to_string(),
            value,
            boundary_hashes: Vec::new(),
            version: 0,
            last_row_count: 0,
            updated_at: Utc::now(),
        }
    }
}

/// On-disk document holding the watermarks of all units.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateDocument {
    /// Version of the state format for future migrations
    version: u32,
    units: BTreeMap<String, WatermarkState>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl StateDocument {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            version: 1,
            units: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Watermark store backed by a single JSON file.
///
/// Every write rewrites the document to a sibling temp file and renames it
/// over the original, so readers never observe a partially written state.
/// Writers inside one process are serialized by a mutex; the version check
/// rejects updates based on a stale read.
pub struct FileWatermarkStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Get the default state file path for the current directory
    pub fn default_path() -> PathBuf {
        PathBuf::from(".collection-sync/watermarks.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<StateDocument> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(StateDocument::new());
        }
        let contents = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read watermark state from {:?}", self.path))?;
        let doc = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse watermark state from {:?}", self.path))?;
        Ok(doc)
    }

    async fn save(&self, doc: &StateDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let contents =
            serde_json::to_string_pretty(doc).context("Failed to serialize watermark state")?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, contents)
            .await
            .with_context(|| format!("Failed to write watermark state to {:?}", tmp_path))?;
        fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("Failed to move watermark state into {:?}", self.path))?;
        Ok(())
    }
}

impl WatermarkStore for FileWatermarkStore {
    async fn get(&self, unit: &str) -> Result<Option<WatermarkState>> {
        let _guard = self.lock.lock().await;
        let doc = self.load().await?;
        Ok(doc.units.get(unit).cloned())
    }

    async fn set(&self, state: &WatermarkState, expected_version: u64) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load().await?;

        let found = doc.units.get(&state.unit).map(|s| s.version).unwrap_or(0);
        if found != expected_version {
            return Err(StoreError::Conflict {
                expected: expected_version,
                found,
            });
        }

        doc.units.insert(state.unit.clone(), state.clone());
        doc.updated_at = Utc::now();
        self.save(&doc).await?;
        Ok(())
    }

    async fn remove(&self, unit: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load().await?;
        let removed = doc.units.remove(unit).is_some();
        if removed {
            doc.updated_at = Utc::now();
            self.save(&doc).await?;
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<WatermarkState>> {
        let _guard = self.lock.lock().await;
        let doc = self.load().await?;
        Ok(doc.units.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn state(unit: &str, value: i64, version: u64) -> WatermarkState {
        WatermarkState {
            version,
            ..WatermarkState::new(unit, WatermarkValue::Int(value))
        }
    }

    #[tokio::test]
    async fn test_missing_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("none.json"));
        assert!(store.get("comments").await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_then_get_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("watermarks.json");

        let store = FileWatermarkStore::new(&path);
        store.set(&state("comments", 10, 1), 0).await.unwrap();
        drop(store);

        let reopened = FileWatermarkStore::new(&path);
        let loaded = reopened.get("comments").await.unwrap().unwrap();
        assert_eq!(loaded.value, WatermarkValue::Int(10));
        assert_eq!(loaded.version, 1);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let dir = tempdir().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("w.json"));
        store.set(&state("movies", 10, 1), 0).await.unwrap();

        let err = store.set(&state("movies", 20, 1), 0).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 0,
                found: 1
            }
        ));
        assert_eq!(
            store.get("movies").await.unwrap().unwrap().value,
            WatermarkValue::Int(10)
        );
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempdir().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("w.json"));
        store.set(&state("user", 1, 1), 0).await.unwrap();
        assert!(store.remove("user").await.unwrap());
        assert!(!store.remove("user").await.unwrap());
        assert!(store.get("user").await.unwrap().is_none());
    }
}
