// ABOUTME: Source collaborator interface used by the record extractor
// ABOUTME: Defines range queries over a collection plus MongoDB and in-memory adapters

pub mod converter;
pub mod memory;
pub mod mongo;

use std::future::Future;

use crate::error::SourceError;
use crate::record::Record;
use crate::watermark::WatermarkValue;

pub use memory::MemorySource;
pub use mongo::MongoSource;

/// Range query against one collection.
///
/// Records are selected where `lower <= cursor < upper`; a missing bound is
/// open. Without a cursor field the whole collection is returned.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub collection: String,
    pub cursor_field: Option<String>,
    pub lower: Option<WatermarkValue>,
    pub upper: Option<WatermarkValue>,
    /// Index of the partition this query belongs to, for logging
    pub partition: usize,
}

impl QueryRequest {
    pub fn describe(&self) -> String {
        let bound = |v: &Option<WatermarkValue>| {
            v.as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "*".to_string())
        };
        match &self.cursor_field {
            Some(field) => format!(
                "{}[{}] {} in [{}, {})",
                self.collection,
                self.partition,
                field,
                bound(&self.lower),
                bound(&self.upper)
            ),
            None => format!("{}[{}] full scan", self.collection, self.partition),
        }
    }
}

/// A store of self-describing documents grouped in collections.
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    /// Names of all collections in the source database.
    fn list_collections(&self) -> impl Future<Output = Result<Vec<String>, SourceError>> + Send;

    /// Minimum and maximum cursor values present in a collection.
    ///
    /// Returns `None` when the collection is empty or the cursor field holds
    /// values that cannot be partitioned.
    fn cursor_range(
        &self,
        collection: &str,
        cursor_field: &str,
    ) -> impl Future<Output = Result<Option<(WatermarkValue, WatermarkValue)>, SourceError>> + Send;

    /// Fetch every document matching the request, ascending by cursor field
    /// when one is given.
    fn query(
        &self,
        request: &QueryRequest,
    ) -> impl Future<Output = Result<Vec<Record>, SourceError>> + Send;
}
