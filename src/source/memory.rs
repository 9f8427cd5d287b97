// ABOUTME: In-memory source for tests and embedding
// ABOUTME: Evaluates range queries over stored records and can inject query failures

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::Mutex;

use super::{QueryRequest, Source};
use crate::error::SourceError;
use crate::record::Record;
use crate::watermark::WatermarkValue;

#[derive(Debug, Default)]
struct Inner {
    collections: BTreeMap<String, Vec<Record>>,
    failures: Vec<InjectedFailure>,
    queries: Vec<QueryRequest>,
}

#[derive(Debug, Clone, Copy)]
struct InjectedFailure {
    transient: bool,
}

/// Source holding collections in memory.
///
/// Clones share the same data, so a test can keep a handle to inspect the
/// queries issued by the extractor.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    inner: Arc<Mutex<Inner>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append documents to a collection, creating it if needed.
    pub async fn insert(&self, collection: &str, records: impl IntoIterator<Item = Record>) {
        let mut inner = self.inner.lock().await;
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .extend(records);
    }

    /// Make the next `count` queries fail.
    pub async fn fail_next_queries(&self, count: usize, transient: bool) {
        let mut inner = self.inner.lock().await;
        inner
            .failures
            .extend(std::iter::repeat(InjectedFailure { transient }).take(count));
    }

    /// Every query issued so far, failed ones included.
    pub async fn queries(&self) -> Vec<QueryRequest> {
        self.inner.lock().await.queries.clone()
    }
}

fn cursor_of(record: &Record, field: &str) -> Option<WatermarkValue> {
    record.get(field).and_then(WatermarkValue::from_json)
}

fn matches(record: &Record, request: &QueryRequest) -> Result<bool, SourceError> {
    let Some(field) = &request.cursor_field else {
        return Ok(true);
    };
    if request.lower.is_none() && request.upper.is_none() {
        return Ok(true);
    }
    match cursor_of(record, field) {
        Some(value) => value
            .in_range(request.lower.as_ref(), request.upper.as_ref())
            .map_err(SourceError::Permanent),
        None => Ok(false),
    }
}

impl Source for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_collections(&self) -> Result<Vec<String>, SourceError> {
        Ok(self.inner.lock().await.collections.keys().cloned().collect())
    }

    async fn cursor_range(
        &self,
        collection: &str,
        cursor_field: &str,
    ) -> Result<Option<(WatermarkValue, WatermarkValue)>, SourceError> {
        let inner = self.inner.lock().await;
        let Some(records) = inner.collections.get(collection) else {
            return Ok(None);
        };

        let mut range: Option<(WatermarkValue, WatermarkValue)> = None;
        for value in records.iter().filter_map(|r| cursor_of(r, cursor_field)) {
            range = match range {
                None => Some((value.clone(), value)),
                Some((min, max)) => {
                    let min = if value.compare(&min).map_err(SourceError::Permanent)?
                        == Ordering::Less
                    {
                        value.clone()
                    } else {
                        min
                    };
                    let max = if value.compare(&max).map_err(SourceError::Permanent)?
                        == Ordering::Greater
                    {
                        value
                    } else {
                        max
                    };
                    Some((min, max))
                }
            };
        }
        Ok(range)
    }

    async fn query(&self, request: &QueryRequest) -> Result<Vec<Record>, SourceError> {
        let mut inner = self.inner.lock().await;
        inner.queries.push(request.clone());

        if let Some(failure) = inner.failures.pop() {
            let err = anyhow!("injected failure for {}", request.describe());
            return Err(if failure.transient {
                SourceError::Transient(err)
            } else {
                SourceError::Permanent(err)
            });
        }

        let Some(records) = inner.collections.get(&request.collection) else {
            return Ok(Vec::new());
        };

        let mut selected = Vec::new();
        for record in records {
            if matches(record, request)? {
                selected.push(record.clone());
            }
        }

        if let Some(field) = &request.cursor_field {
            // Documents without a cursor sort first, as in MongoDB
            selected.sort_by(|a, b| match (cursor_of(a, field), cursor_of(b, field)) {
                (Some(x), Some(y)) => x.compare(&y).unwrap_or(Ordering::Equal),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            });
        }
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(seq: i64) -> Record {
        json!({"seq": seq, "body": format!("r{}", seq)})
            .as_object()
            .cloned()
            .unwrap()
    }

    fn request(lower: Option<i64>, upper: Option<i64>) -> QueryRequest {
        QueryRequest {
            collection: "events".to_string(),
            cursor_field: Some("seq".to_string()),
            lower: lower.map(WatermarkValue::Int),
            upper: upper.map(WatermarkValue::Int),
            partition: 0,
        }
    }

    #[tokio::test]
    async fn test_query_filters_and_sorts() {
        let source = MemorySource::new();
        source
            .insert("events", [rec(5), rec(1), rec(3), rec(9)])
            .await;

        let records = source.query(&request(Some(3), Some(9))).await.unwrap();
        let seqs: Vec<i64> = records.iter().map(|r| r["seq"].as_i64().unwrap()).collect();
        assert_eq!(seqs, vec![3, 5]);
    }

    #[tokio::test]
    async fn test_cursor_range() {
        let source = MemorySource::new();
        source.insert("events", [rec(5), rec(1), rec(9)]).await;
        assert_eq!(
            source.cursor_range("events", "seq").await.unwrap(),
            Some((WatermarkValue::Int(1), WatermarkValue::Int(9)))
        );
        assert_eq!(source.cursor_range("missing", "seq").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let source = MemorySource::new();
        source.insert("events", [rec(1)]).await;
        source.fail_next_queries(1, true).await;

        let err = source.query(&request(None, None)).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(source.query(&request(None, None)).await.unwrap().len(), 1);
        assert_eq!(source.queries().await.len(), 2);
    }
}
