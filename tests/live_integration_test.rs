// ABOUTME: Integration tests against live MongoDB and PostgreSQL servers
// ABOUTME: Skipped unless TEST_MONGO_URL and TEST_TARGET_URL are set; run with --ignored

use collection_sync::config::{Disposition, ExtractConfig, SyncUnit};
use collection_sync::destination::{Destination, PgDestination, WriteMode};
use collection_sync::source::{MongoSource, QueryRequest, Source};
use collection_sync::watermark::{MemoryWatermarkStore, WatermarkValue};
use collection_sync::{Pipeline, Record, RunOptions};
use serde_json::json;
use std::env;

const TEST_DATABASE: &str = "collection_sync_test";
const TEST_DATASET: &str = "collection_sync_test";

/// Helper to get test server URLs from environment
fn get_test_urls() -> Option<(String, String)> {
    let mongo = env::var("TEST_MONGO_URL").ok()?;
    let target = env::var("TEST_TARGET_URL").ok()?;
    Some((mongo, target))
}

fn record(value: serde_json::Value) -> Record {
    value.as_object().cloned().unwrap()
}

/// Replace a collection's contents with `docs`
async fn seed_collection(mongo_url: &str, collection: &str, docs: Vec<bson::Document>) {
    let client = mongodb::Client::with_uri_str(mongo_url).await.unwrap();
    let coll = client
        .database(TEST_DATABASE)
        .collection::<bson::Document>(collection);
    coll.drop().await.unwrap();
    if !docs.is_empty() {
        coll.insert_many(docs).await.unwrap();
    }
}

async fn drop_dataset(target_url: &str) {
    let client = collection_sync::postgres::connect(target_url).await.unwrap();
    let _ = client
        .batch_execute(&format!(
            r#"DROP SCHEMA IF EXISTS "{}" CASCADE"#,
            TEST_DATASET
        ))
        .await;
}

#[tokio::test]
#[ignore]
async fn test_pg_destination_write_modes() {
    let Some((_, target_url)) = get_test_urls() else {
        println!("Skipping: TEST_MONGO_URL / TEST_TARGET_URL not set");
        return;
    };
    drop_dataset(&target_url).await;
    let destination = PgDestination::connect(&target_url, TEST_DATASET)
        .await
        .unwrap();

    // Overwrite replaces, append adds
    let written = destination
        .write(
            "company",
            vec![record(json!({"id": "c1"})), record(json!({"id": "c2"}))],
            WriteMode::Overwrite,
        )
        .await
        .unwrap();
    assert_eq!(written, 2);
    destination
        .write("company", vec![record(json!({"id": "c3"}))], WriteMode::Overwrite)
        .await
        .unwrap();
    destination
        .write("company", vec![record(json!({"id": "c4"}))], WriteMode::Append)
        .await
        .unwrap();
    let rows = destination.read_table("company").await.unwrap();
    assert_eq!(rows, vec![record(json!({"id": "c3"})), record(json!({"id": "c4"}))]);

    // Upsert updates in place
    let upsert = WriteMode::Upsert {
        key: "id".to_string(),
    };
    destination
        .write(
            "user",
            vec![
                record(json!({"id": "u1", "email": "a@x.io"})),
                record(json!({"id": "u2", "email": "b@x.io"})),
            ],
            upsert.clone(),
        )
        .await
        .unwrap();
    destination
        .write(
            "user",
            vec![record(json!({"id": "u1", "email": "new@x.io"}))],
            upsert,
        )
        .await
        .unwrap();
    let users = destination.read_table("user").await.unwrap();
    assert_eq!(users.len(), 2);
    let u1 = users.iter().find(|r| r["id"] == json!("u1")).unwrap();
    assert_eq!(u1["email"], json!("new@x.io"));

    // Unknown tables read as empty
    assert!(destination.read_table("missing").await.unwrap().is_empty());

    drop_dataset(&target_url).await;
}

#[tokio::test]
#[ignore]
async fn test_mongo_source_range_query() {
    let Some((mongo_url, _)) = get_test_urls() else {
        println!("Skipping: TEST_MONGO_URL / TEST_TARGET_URL not set");
        return;
    };
    let docs = (1..=10)
        .map(|i| bson::doc! { "_id": format!("inv{}", i), "seq": i as i64 })
        .collect();
    seed_collection(&mongo_url, "invoice", docs).await;

    let source = MongoSource::connect(&mongo_url, TEST_DATABASE).await.unwrap();
    assert!(source
        .list_collections()
        .await
        .unwrap()
        .contains(&"invoice".to_string()));
    assert_eq!(
        source.cursor_range("invoice", "seq").await.unwrap(),
        Some((WatermarkValue::Int(1), WatermarkValue::Int(10)))
    );

    let rows = source
        .query(&QueryRequest {
            collection: "invoice".to_string(),
            cursor_field: Some("seq".to_string()),
            lower: Some(WatermarkValue::Int(3)),
            upper: Some(WatermarkValue::Int(6)),
            partition: 0,
        })
        .await
        .unwrap();
    let seqs: Vec<i64> = rows.iter().map(|r| r["seq"].as_i64().unwrap()).collect();
    assert_eq!(seqs, vec![3, 4, 5]);
}

#[tokio::test]
#[ignore]
async fn test_mongo_timestamp_range_matches_date_strings() {
    let Some((mongo_url, _)) = get_test_urls() else {
        println!("Skipping: TEST_MONGO_URL / TEST_TARGET_URL not set");
        return;
    };
    let millis = |literal: &str| match WatermarkValue::parse(literal).unwrap() {
        WatermarkValue::Timestamp(ts) => bson::DateTime::from_millis(ts.timestamp_millis()),
        other => panic!("not a timestamp: {}", other),
    };
    let docs = vec![
        bson::doc! { "_id": "c1", "date": "2016-01-01T10:00:00Z" },
        bson::doc! { "_id": "c2", "date": millis("2016-01-02T10:00:00Z") },
        bson::doc! { "_id": "c3", "date": "2016-01-03T10:00:00+02:00" },
        bson::doc! { "_id": "c4", "date": "not a date" },
        bson::doc! { "_id": "c5", "date": millis("2016-01-05T10:00:00Z") },
    ];
    seed_collection(&mongo_url, "comments", docs).await;

    let source = MongoSource::connect(&mongo_url, TEST_DATABASE).await.unwrap();
    let rows = source
        .query(&QueryRequest {
            collection: "comments".to_string(),
            cursor_field: Some("date".to_string()),
            lower: Some(WatermarkValue::parse("2016-01-01T12:00:00Z").unwrap()),
            upper: Some(WatermarkValue::parse("2016-01-05").unwrap()),
            partition: 0,
        })
        .await
        .unwrap();
    let mut ids: Vec<&str> = rows.iter().map(|r| r["_id"].as_str().unwrap()).collect();
    ids.sort();
    assert_eq!(ids, vec!["c2", "c3"]);
}

#[tokio::test]
#[ignore]
async fn test_incremental_sync_end_to_end() {
    let Some((mongo_url, target_url)) = get_test_urls() else {
        println!("Skipping: TEST_MONGO_URL / TEST_TARGET_URL not set");
        return;
    };
    drop_dataset(&target_url).await;
    let docs = (1..=5)
        .map(|i| bson::doc! { "_id": format!("p{}", i), "seq": i as i64, "e": "a@x.io" })
        .collect();
    seed_collection(&mongo_url, "subscription_payments", docs).await;

    let source = MongoSource::connect(&mongo_url, TEST_DATABASE).await.unwrap();
    let destination = PgDestination::connect(&target_url, TEST_DATASET)
        .await
        .unwrap();
    let pipeline = Pipeline::new(
        source,
        destination,
        MemoryWatermarkStore::new(),
        ExtractConfig::default(),
    );
    let unit = SyncUnit::new("subscription_payments", Disposition::Append)
        .with_cursor("seq", None)
        .parallel();

    let first = pipeline.run_unit(&unit, RunOptions::default()).await;
    assert!(first.succeeded(), "{:?}", first.outcome);
    assert_eq!(first.records_written, 5);

    let second = pipeline.run_unit(&unit, RunOptions::default()).await;
    assert!(second.succeeded(), "{:?}", second.outcome);
    assert_eq!(second.records_written, 0);

    let rows = pipeline
        .destination()
        .read_table("subscription_payments")
        .await
        .unwrap();
    assert_eq!(rows.len(), 5);

    drop_dataset(&target_url).await;
}
