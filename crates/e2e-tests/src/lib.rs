//! End-to-end test infrastructure for keyindex.
//!
//! Provides a shared TestHarness owning a temporary RocksDB database, plus
//! helpers for opening entity tables and indices over it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use keyindex_core::{EntityTable, IndexBy, IndexingConfig, KeyIndex, Source};
use keyindex_storage::{index_cf, KeySpace, KeyValue, Storage, StorageLayout};

/// Shared test harness for E2E tests.
pub struct TestHarness {
    /// Keeps temp dir alive for the lifetime of the harness
    pub _temp_dir: tempfile::TempDir,
    /// Shared storage instance
    pub storage: Arc<Storage>,
    layout: StorageLayout,
}

impl TestHarness {
    /// Create a harness whose database has the given tables and indices.
    pub fn new(layout: StorageLayout) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let storage =
            Arc::new(Storage::open(temp_dir.path(), &layout).expect("Failed to open test storage"));
        Self {
            _temp_dir: temp_dir,
            storage,
            layout,
        }
    }

    pub fn path(&self) -> &Path {
        self._temp_dir.path()
    }

    /// Close and reopen the database at the same path.
    ///
    /// Every table and index opened from this harness must have been
    /// dropped first. Background tasks may hold the last handle for a
    /// moment after going idle, so the open is retried briefly.
    pub async fn reopen(self) -> Self {
        let Self {
            _temp_dir,
            storage,
            layout,
        } = self;
        drop(storage);

        let mut attempts = 0;
        let storage = loop {
            match Storage::open(_temp_dir.path(), &layout) {
                Ok(storage) => break Arc::new(storage),
                Err(_) if attempts < 100 => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => panic!("Failed to reopen test storage: {}", e),
            }
        };
        Self {
            _temp_dir,
            storage,
            layout,
        }
    }

    pub fn table(&self, name: &str) -> Arc<EntityTable> {
        EntityTable::open(self.storage.clone(), name).expect("Failed to open table")
    }

    pub fn index_space(&self, name: &str) -> Arc<dyn KeySpace> {
        self.storage
            .key_space(&index_cf(name))
            .expect("Failed to open index key space")
    }

    /// Open an index over `source` with the test configuration.
    pub fn index(
        &self,
        name: &str,
        source: Arc<dyn Source>,
        index_by: impl IndexBy + 'static,
    ) -> Arc<KeyIndex> {
        KeyIndex::builder(name, source, index_by)
            .config(test_config())
            .open(self.index_space(name))
            .expect("Failed to open index")
    }
}

/// Indexing configuration without niceness delays.
pub fn test_config() -> IndexingConfig {
    IndexingConfig::default().with_nice(Duration::ZERO)
}

/// Layout with one table and the given indices.
pub fn layout(table: &str, indices: &[&str]) -> StorageLayout {
    indices
        .iter()
        .fold(StorageLayout::new().with_table(table), |layout, index| {
            layout.with_index(*index)
        })
}

/// Sorted source ids filed under `key`.
pub fn ids_under(index: &KeyIndex, key: impl Into<KeyValue>) -> Vec<KeyValue> {
    let mut ids = index
        .source_ids(&key.into())
        .expect("Failed to read index");
    ids.sort();
    ids
}

/// Resolved values under `key`, sorted by their JSON text.
pub async fn values_under(index: &KeyIndex, key: impl Into<KeyValue>) -> Vec<Value> {
    let resolved = index.values(&key.into()).await.expect("Failed to read index");
    let mut values = Vec::clone(&resolved);
    values.sort_by_key(|value| value.to_string());
    values
}
