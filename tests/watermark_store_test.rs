// ABOUTME: Tests for the durable watermark stores (JSON file and SQLite)
// ABOUTME: Verifies compare-and-set, persistence across reopen and tracker integration

use chrono::{TimeZone, Utc};
use collection_sync::config::{Disposition, StateBackend, StateConfig, SyncUnit};
use collection_sync::watermark::{
    Advance, ConfiguredStore, FileWatermarkStore, SqliteWatermarkStore, StoreError,
    WatermarkState, WatermarkStore, WatermarkTracker, WatermarkValue,
};
use collection_sync::SyncError;
use tempfile::tempdir;

fn state(unit: &str, value: WatermarkValue, version: u64) -> WatermarkState {
    WatermarkState {
        version,
        boundary_hashes: vec![format!("{}-hash", unit)],
        last_row_count: 7,
        ..WatermarkState::new(unit, value)
    }
}

async fn check_compare_and_set<W: WatermarkStore>(store: &W) {
    let first = state("invoice", WatermarkValue::Int(10), 1);
    store.set(&first, 0).await.unwrap();

    // A second writer that also believed nothing was stored loses
    match store.set(&first, 0).await {
        Err(StoreError::Conflict { expected, found }) => {
            assert_eq!(expected, 0);
            assert_eq!(found, 1);
        }
        other => panic!("expected conflict, got {:?}", other),
    }

    let second = state("invoice", WatermarkValue::Int(20), 2);
    store.set(&second, 1).await.unwrap();
    assert!(matches!(
        store.set(&second, 1).await,
        Err(StoreError::Conflict { found: 2, .. })
    ));

    let stored = store.get("invoice").await.unwrap().unwrap();
    assert_eq!(stored.value, WatermarkValue::Int(20));
    assert_eq!(stored.version, 2);
    assert_eq!(stored.boundary_hashes, vec!["invoice-hash".to_string()]);
    assert_eq!(stored.last_row_count, 7);
}

async fn check_list_and_remove<W: WatermarkStore>(store: &W) {
    let ts = Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap();
    store
        .set(&state("subscription", WatermarkValue::Timestamp(ts), 1), 0)
        .await
        .unwrap();
    store
        .set(&state("company", WatermarkValue::Int(3), 1), 0)
        .await
        .unwrap();

    let units: Vec<String> = store
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.unit)
        .collect();
    assert_eq!(units, vec!["company", "subscription"]);

    assert!(store.remove("company").await.unwrap());
    assert!(!store.remove("company").await.unwrap());
    assert!(store.get("company").await.unwrap().is_none());

    let kept = store.get("subscription").await.unwrap().unwrap();
    assert_eq!(kept.value, WatermarkValue::Timestamp(ts));

    // A removed unit starts again from version 0
    store
        .set(&state("company", WatermarkValue::Int(1), 1), 0)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_file_store_compare_and_set() {
    let dir = tempdir().unwrap();
    let store = FileWatermarkStore::new(dir.path().join("watermarks.json"));
    check_compare_and_set(&store).await;
}

#[tokio::test]
async fn test_file_store_list_and_remove() {
    let dir = tempdir().unwrap();
    let store = FileWatermarkStore::new(dir.path().join("watermarks.json"));
    check_list_and_remove(&store).await;
}

#[tokio::test]
async fn test_sqlite_store_compare_and_set() {
    let dir = tempdir().unwrap();
    let store = SqliteWatermarkStore::open(dir.path().join("watermarks.db")).unwrap();
    check_compare_and_set(&store).await;
}

#[tokio::test]
async fn test_sqlite_store_list_and_remove() {
    let dir = tempdir().unwrap();
    let store = SqliteWatermarkStore::open(dir.path().join("watermarks.db")).unwrap();
    check_list_and_remove(&store).await;
}

#[tokio::test]
async fn test_sqlite_store_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state").join("watermarks.db");
    {
        let store = SqliteWatermarkStore::open(&path).unwrap();
        store
            .set(&state("invoice", WatermarkValue::Int(42), 1), 0)
            .await
            .unwrap();
    }

    let reopened = SqliteWatermarkStore::open(&path).unwrap();
    let stored = reopened.get("invoice").await.unwrap().unwrap();
    assert_eq!(stored.value, WatermarkValue::Int(42));
    assert_eq!(stored.version, 1);
}

#[tokio::test]
async fn test_configured_store_selects_backend() {
    let dir = tempdir().unwrap();

    let sqlite = StateConfig {
        backend: StateBackend::Sqlite,
        path: Some(dir.path().join("w.db")),
    };
    let store = ConfiguredStore::open(&sqlite).unwrap();
    assert!(matches!(store, ConfiguredStore::Sqlite(_)));
    check_compare_and_set(&store).await;
    assert!(dir.path().join("w.db").exists());

    let file = StateConfig {
        backend: StateBackend::File,
        path: Some(dir.path().join("w.json")),
    };
    let store = ConfiguredStore::open(&file).unwrap();
    assert!(matches!(store, ConfiguredStore::File(_)));
    check_list_and_remove(&store).await;
    assert!(dir.path().join("w.json").exists());
}

#[tokio::test]
async fn test_tracker_detects_concurrent_writer_on_sqlite() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("watermarks.db");
    let first = WatermarkTracker::new(SqliteWatermarkStore::open(&path).unwrap());
    let second = WatermarkTracker::new(SqliteWatermarkStore::open(&path).unwrap());
    let unit = SyncUnit::new("invoice", Disposition::Append).with_cursor("seq", None);

    let bounds_a = first.bounds(&unit).await.unwrap();
    let bounds_b = second.bounds(&unit).await.unwrap();

    let advance = |v: i64| Advance {
        value: WatermarkValue::Int(v),
        boundary_hashes: vec![],
        row_count: 1,
    };
    assert_eq!(
        first.advance("invoice", &bounds_a, advance(5)).await.unwrap(),
        Some(WatermarkValue::Int(5))
    );
    match second.advance("invoice", &bounds_b, advance(9)).await {
        Err(SyncError::ConcurrentUpdate { .. }) => {}
        other => panic!("expected concurrent update, got {:?}", other),
    }

    let resumed = second.bounds(&unit).await.unwrap();
    assert_eq!(resumed.lower, Some(WatermarkValue::Int(5)));
}
