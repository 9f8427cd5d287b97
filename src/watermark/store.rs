// ABOUTME: WatermarkStore trait and the in-memory and config-selected stores
// ABOUTME: set() is a compare-and-set on the state version (single-writer invariant)

use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use thiserror::Error;
use tokio::sync::Mutex;

use super::sqlite::SqliteWatermarkStore;
use super::state::{FileWatermarkStore, WatermarkState};
use crate::config::{StateBackend, StateConfig};

/// Error from a conditional watermark write.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored version differs from the version the writer read
    #[error("watermark version conflict (expected {expected}, found {found})")]
    Conflict { expected: u64, found: u64 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Durable storage for per-unit watermarks.
///
/// Implementations must make `set` a single atomic update: either the new
/// state is fully visible afterwards or the old one is. A version of `0`
/// means "no state stored yet".
pub trait WatermarkStore: Send + Sync {
    /// Read the current state of a unit, if any.
    fn get(&self, unit: &str) -> impl Future<Output = Result<Option<WatermarkState>>> + Send;

    /// Store `state` if the stored version still equals `expected_version`.
    fn set(
        &self,
        state: &WatermarkState,
        expected_version: u64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Forget a unit's state. Returns whether anything was removed.
    fn remove(&self, unit: &str) -> impl Future<Output = Result<bool>> + Send;

    /// All stored states.
    fn list(&self) -> impl Future<Output = Result<Vec<WatermarkState>>> + Send;
}

/// Process-local watermark store, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    states: Mutex<HashMap<String, WatermarkState>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WatermarkStore for MemoryWatermarkStore {
    async fn get(&self, unit: &str) -> Result<Option<WatermarkState>> {
        Ok(self.states.lock().await.get(unit).cloned())
    }

    async fn set(&self, state: &WatermarkState, expected_version: u64) -> Result<(), StoreError> {
        let mut states = self.states.lock().await;
        let found = states.get(&state.unit).map(|s| s.version).unwrap_or(0);
        if found != expected_version {
            return Err(StoreError::Conflict {
                expected: expected_version,
                found,
            });
        }
        states.insert(state.unit.clone(), state.clone());
        Ok(())
    }

    async fn remove(&self, unit: &str) -> Result<bool> {
        Ok(self.states.lock().await.remove(unit).is_some())
    }

    async fn list(&self) -> Result<Vec<WatermarkState>> {
        let mut states: Vec<WatermarkState> =
            self.states.lock().await.values().cloned().collect();
        states.sort_by(|a, b| a.unit.cmp(&b.unit));
        Ok(states)
    }
}

/// Store selected by the pipeline configuration.
pub enum ConfiguredStore {
    File(FileWatermarkStore),
    Sqlite(SqliteWatermarkStore),
}

impl ConfiguredStore {
    pub fn open(config: &StateConfig) -> Result<Self> {
        let path = config.resolved_path();
        tracing::debug!("Using {:?} watermark store at {}", config.backend, path.display());
        Ok(match config.backend {
            StateBackend::File => ConfiguredStore::File(FileWatermarkStore::new(path)),
            StateBackend::Sqlite => ConfiguredStore::Sqlite(SqliteWatermarkStore::open(path)?),
        })
    }
}

impl WatermarkStore for ConfiguredStore {
    async fn get(&self, unit: &str) -> Result<Option<WatermarkState>> {
        match self {
            ConfiguredStore::File(store) => store.get(unit).await,
            ConfiguredStore::Sqlite(store) => store.get(unit).await,
        }
    }

    async fn set(&self, state: &WatermarkState, expected_version: u64) -> Result<(), StoreError> {
        match self {
            ConfiguredStore::File(store) => store.set(state, expected_version).await,
            ConfiguredStore::Sqlite(store) => store.set(state, expected_version).await,
        }
    }

    async fn remove(&self, unit: &str) -> Result<bool> {
        match self {
            ConfiguredStore::File(store) => store.remove(unit).await,
            ConfiguredStore::Sqlite(store) => store.remove(unit).await,
        }
    }

    async fn list(&self) -> Result<Vec<WatermarkState>> {
        match self {
            ConfiguredStore::File(store) => store.list().await,
            ConfiguredStore::Sqlite(store) => store.list().await,
        }
    }
}
