//! Chained indices: an index consuming another index as its source.
//!
//! `by_city` files people under their city. `city_sizes` is built over
//! `by_city` and files each city under its number of residents.

use std::sync::{Arc, Weak};

use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use e2e_tests::{ids_under, layout, values_under, TestHarness};
use keyindex_core::testing::{MemoryKeySpace, RecordingListener};
use keyindex_core::{
    ChangeListener, IndexEntry, KeyIndex, Mapped, Readable, RecoveryKind, Source,
    INITIALIZING_TRIGGER,
};
use keyindex_storage::KeyValue;

fn by_city(data: &Value, _id: &KeyValue) -> anyhow::Result<Mapped> {
    Ok(data["city"]
        .as_str()
        .map(|city| IndexEntry::with_value(city, data["name"].clone()))
        .into())
}

fn by_size(data: &Value, _id: &KeyValue) -> anyhow::Result<Mapped> {
    Ok(data
        .as_array()
        .map(|residents| IndexEntry::key(residents.len() as i64))
        .into())
}

struct Chain {
    _harness: TestHarness,
    table: Arc<keyindex_core::EntityTable>,
    cities: Arc<KeyIndex>,
    sizes: Arc<KeyIndex>,
}

fn chain() -> Chain {
    let harness = TestHarness::new(layout("people", &["by_city", "city_sizes"]));
    let table = harness.table("people");
    let source: Arc<dyn Source> = table.clone();
    let cities = harness.index("by_city", source, by_city);
    let upstream: Arc<dyn Source> = cities.clone();
    let sizes = harness.index("city_sizes", upstream, by_size);
    Chain {
        _harness: harness,
        table,
        cities,
        sizes,
    }
}

impl Chain {
    async fn settle(&self) {
        self.cities.when_indexed(self.table.version()).await;
        self.cities.when_fully_readable().await;
        self.sizes.when_idle().await;
    }
}

#[tokio::test]
async fn test_changes_propagate_downstream() {
    let chain = chain();
    chain.table.put(1, json!({"name": "ada", "city": "London"})).await.unwrap();
    chain.table.put(2, json!({"name": "bob", "city": "London"})).await.unwrap();
    chain.table.put(3, json!({"name": "cy", "city": "Paris"})).await.unwrap();
    chain.settle().await;

    assert_eq!(ids_under(&chain.sizes, 2i64), vec![KeyValue::from("London")]);
    assert_eq!(ids_under(&chain.sizes, 1i64), vec![KeyValue::from("Paris")]);
    // Reference entries resolve through the upstream index
    assert_eq!(
        values_under(&chain.sizes, 2i64).await,
        vec![json!(["ada", "bob"])]
    );

    // bob moves: London shrinks and Paris grows
    chain.table.put(2, json!({"name": "bob", "city": "Paris"})).await.unwrap();
    chain.settle().await;

    assert_eq!(ids_under(&chain.sizes, 1i64), vec![KeyValue::from("London")]);
    assert_eq!(ids_under(&chain.sizes, 2i64), vec![KeyValue::from("Paris")]);

    // cy leaves: Paris shrinks back
    chain.table.delete(3).await.unwrap();
    chain.settle().await;

    assert_eq!(
        ids_under(&chain.sizes, 1i64),
        vec![KeyValue::from("London"), KeyValue::from("Paris")]
    );
    assert!(ids_under(&chain.sizes, 2i64).is_empty());
}

#[tokio::test]
async fn test_downstream_rebuilds_from_upstream() {
    let chain = chain();
    chain.table.put(1, json!({"name": "ada", "city": "Oslo"})).await.unwrap();
    chain.settle().await;

    // A fresh downstream over the same upstream rebuilds from its keys
    let upstream: Arc<dyn Source> = chain.cities.clone();
    let rebuilt = KeyIndex::builder("city_sizes_copy", upstream, by_size)
        .config(e2e_tests::test_config())
        .open(Arc::new(MemoryKeySpace::new("city_sizes_copy")))
        .unwrap();
    let recovery = rebuilt.resume().await.unwrap();
    assert_eq!(recovery.kind, RecoveryKind::Rebuilt);
    assert_eq!(recovery.enqueued, 1);
    recovery.wait().await;

    assert_eq!(ids_under(&rebuilt, 1i64), vec![KeyValue::from("Oslo")]);
}

#[tokio::test]
async fn test_notifications_carry_previous_values() {
    let chain = chain();
    let listener = RecordingListener::new();
    let weak: Weak<dyn ChangeListener> = Arc::<RecordingListener>::downgrade(&listener);
    chain.cities.attach(weak);

    chain.table.put(1, json!({"name": "ada", "city": "Rome"})).await.unwrap();
    chain.settle().await;
    listener.clear();

    chain.table.put(1, json!({"name": "ada", "city": "Milan"})).await.unwrap();
    chain.settle().await;

    let mut events = listener.events();
    events.sort_by(|a, b| a.id.cmp(&b.id));
    let ids: Vec<_> = events.iter().map(|event| event.id.clone()).collect();
    assert_eq!(ids, vec![KeyValue::from("Milan"), KeyValue::from("Rome")]);

    let rome = events.into_iter().nth(1).unwrap();
    assert!(rome.sources.iter().any(|source| source.starts_with("by_city@")));
    assert!(!rome.triggers.contains(INITIALIZING_TRIGGER));
    let previous = rome.previous_state.unwrap().resolve().await;
    assert_eq!(previous, Some(json!(["ada"])));
}
