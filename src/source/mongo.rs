// ABOUTME: MongoDB source adapter built on the official async driver
// ABOUTME: Runs cursor-range queries and classifies driver errors as transient or permanent

use anyhow::{Context, Result};
use bson::{Bson, Document};
use futures::TryStreamExt;
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};

use super::converter::{bson_to_watermark, document_to_record, watermark_to_bson};
use super::{QueryRequest, Source};
use crate::error::SourceError;
use crate::record::Record;
use crate::utils::sanitize_url;
use crate::watermark::WatermarkValue;

/// Source reading one MongoDB database.
pub struct MongoSource {
    client: Client,
    database: String,
}

impl MongoSource {
    /// Connect and verify the server answers a ping.
    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        tracing::info!(
            "Connecting to MongoDB at {} (database '{}')",
            sanitize_url(uri),
            database
        );

        let mut options = ClientOptions::parse(uri)
            .await
            .context("Failed to parse MongoDB connection string")?;
        options.app_name = Some(env!("CARGO_PKG_NAME").to_string());

        let client = Client::with_options(options).context("Failed to create MongoDB client")?;
        client
            .database(database)
            .run_command(bson::doc! { "ping": 1 })
            .await
            .with_context(|| format!("MongoDB ping failed for database '{}'", database))?;

        Ok(Self {
            client,
            database: database.to_string(),
        })
    }

    fn db(&self) -> Database {
        self.client.database(&self.database)
    }
}

/// Decide whether a driver error is worth retrying.
///
/// Network I/O, server selection timeouts, cleared connection pools and
/// errors the server labels as retryable are transient.
pub fn classify(err: MongoError) -> SourceError {
    let transient = matches!(
        *err.kind,
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } | ErrorKind::ConnectionPoolCleared { .. }
    ) || err.contains_label("RetryableWriteError")
        || err.contains_label("TransientTransactionError")
        || err.contains_label("ResumableChangeStreamError");

    if transient {
        SourceError::Transient(err.into())
    } else {
        SourceError::Permanent(err.into())
    }
}

/// Filter selecting `lower <= cursor < upper`.
///
/// Query operators only compare values of the same BSON type, so timestamp
/// bounds also match cursor values stored as date strings by converting
/// them on the server.
fn range_filter(request: &QueryRequest) -> Document {
    let mut filter = Document::new();
    let Some(field) = &request.cursor_field else {
        return filter;
    };

    let mut range = Document::new();
    if let Some(lower) = &request.lower {
        range.insert("$gte", watermark_to_bson(lower));
    }
    if let Some(upper) = &request.upper {
        range.insert("$lt", watermark_to_bson(upper));
    }
    if range.is_empty() {
        return filter;
    }

    let timestamp_bounds = [&request.lower, &request.upper]
        .into_iter()
        .flatten()
        .any(|bound| matches!(bound, WatermarkValue::Timestamp(_)));
    if !timestamp_bounds {
        filter.insert(field.clone(), range);
        return filter;
    }

    let converted = bson::doc! {
        "$convert": {
            "input": format!("${}", field),
            "to": "date",
            "onError": Bson::Null,
            "onNull": Bson::Null,
        }
    };
    let mut checks = vec![Bson::Document(bson::doc! { "$ne": [converted.clone(), Bson::Null] })];
    for (op, bound) in range.iter() {
        let mut check = Document::new();
        check.insert(op.clone(), vec![Bson::Document(converted.clone()), bound.clone()]);
        checks.push(Bson::Document(check));
    }

    let mut as_date = Document::new();
    as_date.insert(field.clone(), range);
    let mut is_string = Document::new();
    is_string.insert(field.clone(), bson::doc! { "$type": "string" });
    let as_string = bson::doc! {
        "$and": [is_string, { "$expr": { "$and": checks } }]
    };
    filter.insert("$or", vec![as_date, as_string]);
    filter
}

impl Source for MongoSource {
    fn name(&self) -> &str {
        "mongodb"
    }

    async fn list_collections(&self) -> Result<Vec<String>, SourceError> {
        let mut names = self.db().list_collection_names().await.map_err(classify)?;
        names.retain(|name| !name.starts_with("system."));
        names.sort();
        Ok(names)
    }

    async fn cursor_range(
        &self,
        collection: &str,
        cursor_field: &str,
    ) -> Result<Option<(WatermarkValue, WatermarkValue)>, SourceError> {
        let field_ref = format!("${}", cursor_field);

        let mut exists = Document::new();
        exists.insert(cursor_field, bson::doc! { "$exists": true, "$ne": Bson::Null });
        let pipeline = vec![
            bson::doc! { "$match": exists },
            bson::doc! {
                "$group": {
                    "_id": Bson::Null,
                    "min": { "$min": field_ref.clone() },
                    "max": { "$max": field_ref },
                }
            },
        ];

        let mut cursor = self
            .db()
            .collection::<Document>(collection)
            .aggregate(pipeline)
            .await
            .map_err(classify)?;
        let Some(group) = cursor.try_next().await.map_err(classify)? else {
            return Ok(None);
        };

        let min = group.get("min").and_then(bson_to_watermark);
        let max = group.get("max").and_then(bson_to_watermark);
        match (min, max) {
            (Some(min), Some(max)) if min.same_kind(&max) => Ok(Some((min, max))),
            _ => {
                tracing::debug!(
                    "Cursor '{}' of '{}' cannot be partitioned; using a single range",
                    cursor_field,
                    collection
                );
                Ok(None)
            }
        }
    }

    async fn query(&self, request: &QueryRequest) -> Result<Vec<Record>, SourceError> {
        tracing::debug!("Querying {}", request.describe());

        let collection = self.db().collection::<Document>(&request.collection);
        let mut find = collection.find(range_filter(request));
        if let Some(field) = &request.cursor_field {
            let mut sort = Document::new();
            sort.insert(field.clone(), 1);
            find = find.sort(sort);
        }

        let cursor = find.await.map_err(classify)?;
        let documents: Vec<Document> = cursor.try_collect().await.map_err(classify)?;
        Ok(documents.iter().map(document_to_record).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_range_filter_bounds() {
        let request = QueryRequest {
            collection: "invoice".to_string(),
            cursor_field: Some("date".to_string()),
            lower: Some(WatermarkValue::Int(10)),
            upper: Some(WatermarkValue::Int(20)),
            partition: 0,
        };
        assert_eq!(
            range_filter(&request),
            bson::doc! { "date": { "$gte": 10_i64, "$lt": 20_i64 } }
        );
    }

    #[test]
    fn test_range_filter_open() {
        let mut request = QueryRequest {
            collection: "invoice".to_string(),
            cursor_field: Some("date".to_string()),
            lower: None,
            upper: None,
            partition: 0,
        };
        assert!(range_filter(&request).is_empty());

        request.lower = Some(WatermarkValue::Int(1));
        request.cursor_field = None;
        assert!(range_filter(&request).is_empty());
    }

    #[test]
    fn test_range_filter_timestamp_matches_date_strings() {
        let lower = Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap();
        let request = QueryRequest {
            collection: "comments".to_string(),
            cursor_field: Some("date".to_string()),
            lower: Some(WatermarkValue::Timestamp(lower)),
            upper: None,
            partition: 0,
        };
        let since = bson::DateTime::from_millis(lower.timestamp_millis());
        let converted = bson::doc! {
            "$convert": { "input": "$date", "to": "date", "onError": Bson::Null, "onNull": Bson::Null }
        };
        assert_eq!(
            range_filter(&request),
            bson::doc! {
                "$or": [
                    { "date": { "$gte": since } },
                    {
                        "$and": [
                            { "date": { "$type": "string" } },
                            { "$expr": { "$and": [
                                { "$ne": [converted.clone(), Bson::Null] },
                                { "$gte": [converted, since] },
                            ] } },
                        ]
                    },
                ]
            }
        );
    }
}
