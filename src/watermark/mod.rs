// ABOUTME: Watermark tracking for incremental extraction
// ABOUTME: Cursor values, persisted state, pluggable stores and the tracker

pub mod sqlite;
pub mod state;
pub mod store;
pub mod tracker;
pub mod value;

pub use sqlite::SqliteWatermarkStore;
pub use state::{FileWatermarkStore, WatermarkState};
pub use store::{ConfiguredStore, MemoryWatermarkStore, StoreError, WatermarkStore};
pub use tracker::{Advance, Bounds, WatermarkTracker};
pub use value::WatermarkValue;
