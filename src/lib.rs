// ABOUTME: Library root for collection-sync
// ABOUTME: Incremental document-collection loading with field normalization and dispositions

pub mod config;
pub mod decompose;
pub mod destination;
pub mod error;
pub mod extract;
pub mod load;
pub mod mapping;
pub mod pipeline;
pub mod postgres;
pub mod record;
pub mod source;
pub mod utils;
pub mod watermark;

pub use config::{Disposition, PipelineConfig, SyncUnit};
pub use error::{SourceError, Stage, SyncError};
pub use load::{LoadInfo, LoadOutcome};
pub use pipeline::{Pipeline, RunOptions, RunSummary};
pub use record::Record;
