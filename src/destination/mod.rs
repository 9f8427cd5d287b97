// ABOUTME: Destination collaborator interface used by the load reconciler
// ABOUTME: Write modes map dispositions onto overwrite, append and upsert

pub mod memory;
pub mod postgres;

use anyhow::Result;
use std::future::Future;

use crate::record::Record;

pub use memory::MemoryDestination;
pub use postgres::PgDestination;

/// How a batch is applied to a destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace the whole table content atomically
    Overwrite,
    /// Insert every record as a new row
    Append,
    /// Insert or update rows matching `key`
    Upsert { key: String },
}

/// A table store that accepts batches of records.
///
/// Each `write` is one logical unit: when it returns an error the table must
/// hold exactly what it held before the call. Tables are created on first
/// write and accept records of any shape.
pub trait Destination: Send + Sync {
    fn name(&self) -> &str;

    /// Apply `records` to `table`, returning the number of rows written.
    fn write(
        &self,
        table: &str,
        records: Vec<Record>,
        mode: WriteMode,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Every row of a table in insertion order. A missing table reads as empty.
    fn read_table(&self, table: &str) -> impl Future<Output = Result<Vec<Record>>> + Send;
}
