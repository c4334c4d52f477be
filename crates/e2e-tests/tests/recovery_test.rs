//! Startup recovery: rebuilding, catching up and restarting on disk.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use e2e_tests::{ids_under, layout, test_config, values_under, TestHarness};
use keyindex_core::testing::MemorySource;
use keyindex_core::{IndexEntry, KeyIndex, KeyRange, Mapped, ProgressMarker, RecoveryKind, Source};
use keyindex_storage::{BatchOp, EntryKey, KeySpace, KeyValue};

fn by_key(data: &Value, _id: &KeyValue) -> anyhow::Result<Mapped> {
    Ok(data["key"]
        .as_str()
        .map(|key| IndexEntry::with_value(key, data["value"].clone()))
        .into())
}

fn entry(key: &str, id: i64, value: Value) -> BatchOp {
    BatchOp::put(
        EntryKey::new(key.into(), id.into()).to_bytes(),
        serde_json::to_vec(&value).unwrap(),
    )
}

/// Index space holding marker 5 and entries for ids 3, 7 and 9.
fn seeded_space(harness: &TestHarness) -> Arc<dyn KeySpace> {
    let space = harness.index_space("by_key");
    space
        .batch(&[
            ProgressMarker::new(5).to_op().unwrap(),
            entry("c", 3, json!(3)),
            entry("old7", 7, json!(70)),
            entry("old9", 9, json!(90)),
        ])
        .unwrap();
    space
}

fn memory_source() -> Arc<MemorySource> {
    let source = MemorySource::new("items");
    source.insert_silently(3, 2, json!({"key": "c", "value": 3}));
    source.insert_silently(7, 6, json!({"key": "new7", "value": 7}));
    source.insert_silently(9, 8, json!({"key": "new9", "value": 9}));
    source
}

fn open_index(source: &Arc<MemorySource>, space: Arc<dyn KeySpace>) -> Arc<KeyIndex> {
    let source: Arc<dyn Source> = source.clone();
    KeyIndex::builder("by_key", source, by_key)
        .config(test_config())
        .open(space)
        .unwrap()
}

#[tokio::test]
async fn test_catch_up_replaces_entries_of_changed_ids() {
    let harness = TestHarness::new(layout("items", &["by_key"]));
    let space = seeded_space(&harness);
    let source = memory_source();
    let index = open_index(&source, space.clone());

    let recovery = index.resume().await.unwrap();
    assert_eq!(recovery.kind, RecoveryKind::CaughtUp);
    assert_eq!(recovery.marker, 5);
    assert_eq!(recovery.enqueued, 2);
    recovery.wait().await;

    assert!(ids_under(&index, "old7").is_empty());
    assert!(ids_under(&index, "old9").is_empty());
    assert_eq!(ids_under(&index, "new7"), vec![KeyValue::Int(7)]);
    assert_eq!(ids_under(&index, "new9"), vec![KeyValue::Int(9)]);
    // Unchanged id keeps its entry
    assert_eq!(values_under(&index, "c").await, vec![json!(3)]);

    assert_eq!(ProgressMarker::load(space.as_ref()).unwrap(), 8);
    assert_eq!(index.last_indexed_version(), 8);
}

#[tokio::test]
async fn test_full_reset_clears_namespace() {
    let harness = TestHarness::new(layout("items", &["by_key"]));
    let space = seeded_space(&harness);
    space.batch(&[entry("orphan", 42, json!(0))]).unwrap();
    let source = memory_source();
    source.set_full_reset(true);
    let index = open_index(&source, space.clone());

    let recovery = index.resume().await.unwrap();
    assert_eq!(recovery.kind, RecoveryKind::Rebuilt);
    assert_eq!(recovery.enqueued, 3);
    recovery.wait().await;

    let keys = index.index_keys(KeyRange::all()).await.unwrap();
    assert_eq!(
        keys,
        vec![KeyValue::from("c"), KeyValue::from("new7"), KeyValue::from("new9")]
    );
    assert!(ids_under(&index, "orphan").is_empty());
    assert_eq!(ProgressMarker::load(space.as_ref()).unwrap(), 8);
}

#[tokio::test]
async fn test_empty_namespace_rebuilds_from_table() {
    let harness = TestHarness::new(layout("items", &["by_key"]));
    let table = harness.table("items");
    for id in 1..=4i64 {
        table
            .put(id, json!({"key": if id % 2 == 0 { "even" } else { "odd" }, "value": id}))
            .await
            .unwrap();
    }

    let source: Arc<dyn Source> = table.clone();
    let index = harness.index("by_key", source, by_key);
    let recovery = index.resume().await.unwrap();
    assert_eq!(recovery.kind, RecoveryKind::Rebuilt);
    assert_eq!(recovery.marker, 0);
    recovery.wait().await;

    assert_eq!(values_under(&index, "even").await, vec![json!(2), json!(4)]);
    assert_eq!(values_under(&index, "odd").await, vec![json!(1), json!(3)]);
    assert_eq!(index.last_indexed_version(), 4);
}

#[tokio::test]
async fn test_recreated_table_behind_marker_restarts_progress() {
    let harness = TestHarness::new(layout("items", &["by_key"]));
    let space = harness.index_space("by_key");
    space
        .batch(&[ProgressMarker::new(100).to_op().unwrap(), entry("stale", 50, json!(50))])
        .unwrap();
    let table = harness.table("items");
    for id in 1..=3i64 {
        table.put(id, json!({"key": "k", "value": id})).await.unwrap();
    }

    let source: Arc<dyn Source> = table.clone();
    let index = harness.index("by_key", source, by_key);
    let recovery = index.resume().await.unwrap();
    assert_eq!(recovery.kind, RecoveryKind::Rebuilt);
    assert_eq!(recovery.marker, 100);
    recovery.wait().await;

    assert!(ids_under(&index, "stale").is_empty());
    assert_eq!(values_under(&index, "k").await, vec![json!(1), json!(2), json!(3)]);
    assert_eq!(ProgressMarker::load(space.as_ref()).unwrap(), 3);

    let recovery = index.resume().await.unwrap();
    assert_eq!(recovery.kind, RecoveryKind::UpToDate);
    assert_eq!(recovery.marker, 3);
}

#[tokio::test]
async fn test_restart_only_reprocesses_changes() {
    let harness = TestHarness::new(layout("items", &["by_key"]));
    {
        let table = harness.table("items");
        let source: Arc<dyn Source> = table.clone();
        let index = harness.index("by_key", source, by_key);
        index.resume().await.unwrap().wait().await;

        table.put(1, json!({"key": "a", "value": 1})).await.unwrap();
        table.put(2, json!({"key": "a", "value": 2})).await.unwrap();
        index.when_indexed(table.version()).await;
        index.when_idle().await;
        assert_eq!(index.last_indexed_version(), 2);
    }

    // Nothing changed while closed
    let harness = harness.reopen().await;
    {
        let table = harness.table("items");
        assert_eq!(table.version(), 2);
        let source: Arc<dyn Source> = table.clone();
        let index = harness.index("by_key", source, by_key);
        let recovery = index.resume().await.unwrap();
        assert_eq!(recovery.kind, RecoveryKind::UpToDate);
        assert_eq!(recovery.marker, 2);
        assert_eq!(values_under(&index, "a").await, vec![json!(1), json!(2)]);
    }

    // Entity 2 moves while no index is running
    let harness = harness.reopen().await;
    {
        let table = harness.table("items");
        table.put(2, json!({"key": "b", "value": 20})).await.unwrap();
    }

    let harness = harness.reopen().await;
    {
        let table = harness.table("items");
        let source: Arc<dyn Source> = table.clone();
        let index = harness.index("by_key", source, by_key);
        let recovery = index.resume().await.unwrap();
        assert_eq!(recovery.kind, RecoveryKind::CaughtUp);
        assert_eq!(recovery.enqueued, 1);
        recovery.wait().await;

        assert_eq!(ids_under(&index, "a"), vec![KeyValue::Int(1)]);
        assert_eq!(values_under(&index, "b").await, vec![json!(20)]);
        assert_eq!(index.last_indexed_version(), 3);
    }
}

#[tokio::test]
async fn test_cleared_namespace_is_rebuilt_after_restart() {
    let harness = TestHarness::new(layout("items", &["by_key"]));
    {
        let table = harness.table("items");
        let source: Arc<dyn Source> = table.clone();
        let index = harness.index("by_key", source, by_key);
        index.resume().await.unwrap().wait().await;
        table.put(1, json!({"key": "a", "value": 1})).await.unwrap();
        index.when_indexed(table.version()).await;
        index.when_idle().await;
    }

    harness
        .storage
        .clear_cf(&keyindex_storage::index_cf("by_key"))
        .unwrap();

    let harness = harness.reopen().await;
    let table = harness.table("items");
    let source: Arc<dyn Source> = table.clone();
    let index = harness.index("by_key", source, by_key);
    let recovery = index.resume().await.unwrap();
    assert_eq!(recovery.kind, RecoveryKind::Rebuilt);
    recovery.wait().await;

    assert_eq!(values_under(&index, "a").await, vec![json!(1)]);
}

#[tokio::test]
async fn test_reset_all_rebuilds_running_index() {
    let harness = TestHarness::new(layout("items", &["by_key"]));
    let table = harness.table("items");
    let source: Arc<dyn Source> = table.clone();
    let index = harness.index("by_key", source, by_key);
    index.resume().await.unwrap().wait().await;

    table.put(1, json!({"key": "a", "value": 1})).await.unwrap();
    table.put(2, json!({"key": "b", "value": 2})).await.unwrap();
    index.when_indexed(table.version()).await;

    let recovery = index.reset_all().await.unwrap();
    assert_eq!(recovery.kind, RecoveryKind::Rebuilt);
    assert_eq!(recovery.enqueued, 2);
    recovery.wait().await;

    let keys = index.index_keys(KeyRange::all()).await.unwrap();
    assert_eq!(keys, vec![KeyValue::from("a"), KeyValue::from("b")]);
    assert_eq!(index.last_indexed_version(), 2);
}
