//! RocksDB-backed versioned entity table.
//!
//! Every write assigns the next table version and stores, in one atomic
//! batch, the entity row and a changelog row keyed by that version. The
//! changelog keeps only the latest version of each id, so
//! `changed_since(v)` is a bounded scan from `v + 1`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use keyindex_storage::{changelog_cf, entity_cf, BatchOp, KeyValue, Storage, VersionKey};

use crate::error::IndexError;
use crate::request::ChangeEvent;
use crate::source::{ChangeListener, ChangeSet, ChangedId, Listeners, Readable, Source};

/// Entity row; deletions keep a tombstone so the superseded changelog row
/// can still be found.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntity {
    version: u64,
    value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChangelogRow {
    id: KeyValue,
    deleted: bool,
}

/// A named table of JSON entities acting as an index [`Source`].
pub struct EntityTable {
    name: String,
    storage: Arc<Storage>,
    entity_cf: String,
    changelog_cf: String,
    version: AtomicU64,
    write_lock: tokio::sync::Mutex<()>,
    listeners: Listeners,
}

impl EntityTable {
    /// Open a table whose column families exist in `storage`.
    pub fn open(storage: Arc<Storage>, name: &str) -> Result<Arc<Self>, IndexError> {
        let entity_cf = entity_cf(name);
        let changelog_cf = changelog_cf(name);

        let version = match storage.last_key(&changelog_cf)? {
            Some(key) => VersionKey::from_bytes(&key)?.version,
            None => 0,
        };
        if !storage.has_cf(&entity_cf) {
            return Err(keyindex_storage::StorageError::ColumnFamilyNotFound(entity_cf).into());
        }

        info!(table = %name, version, "Opened entity table");

        Ok(Arc::new(Self {
            name: name.to_string(),
            storage,
            entity_cf,
            changelog_cf,
            version: AtomicU64::new(version),
            write_lock: tokio::sync::Mutex::new(()),
            listeners: Listeners::new(),
        }))
    }

    /// Highest version assigned so far
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn read_row(&self, id: &KeyValue) -> Result<Option<StoredEntity>, IndexError> {
        match self.storage.get(&self.entity_cf, &id.to_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Current value of an entity
    pub fn get(&self, id: &KeyValue) -> Result<Option<Value>, IndexError> {
        Ok(self.read_row(id)?.and_then(|row| row.value))
    }

    /// Store a value, returning the version assigned to the write.
    pub async fn put(&self, id: impl Into<KeyValue>, value: Value) -> Result<u64, IndexError> {
        self.write(id.into(), Some(value)).await
    }

    /// Delete an entity, returning the version assigned to the deletion.
    pub async fn delete(&self, id: impl Into<KeyValue>) -> Result<u64, IndexError> {
        self.write(id.into(), None).await
    }

    async fn write(&self, id: KeyValue, value: Option<Value>) -> Result<u64, IndexError> {
        // Held through notification so listeners see versions in write order
        let _guard = self.write_lock.lock().await;

        let previous = self.read_row(&id)?;
        let version = self.version.load(Ordering::SeqCst) + 1;
        let deleted = value.is_none();

        let row = StoredEntity { version, value };
        let mut changelog_ops = vec![BatchOp::put(
            VersionKey::new(version).to_bytes(),
            serde_json::to_vec(&ChangelogRow {
                id: id.clone(),
                deleted,
            })?,
        )];
        if let Some(previous) = &previous {
            changelog_ops.push(BatchOp::delete(VersionKey::new(previous.version).to_bytes()));
        }
        let entity_ops = [BatchOp::put(id.to_bytes(), serde_json::to_vec(&row)?)];

        self.storage.write(&[
            (self.entity_cf.as_str(), &entity_ops[..]),
            (self.changelog_cf.as_str(), &changelog_ops[..]),
        ])?;
        self.version.store(version, Ordering::SeqCst);

        debug!(table = %self.name, id = %id, version, deleted, "Stored entity");

        let mut event = ChangeEvent::new(id, version)
            .with_previous(previous.and_then(|row| row.value))
            .with_source(format!("{}@{}", self.name, version));
        if deleted {
            event = event.deleted();
        }
        self.listeners.notify(&self.name, event).await;

        Ok(version)
    }

    fn scan_changelog(&self, after: u64) -> Result<Vec<ChangedId>, IndexError> {
        let lower = VersionKey::new(after.saturating_add(1)).to_bytes();
        let mut changed = Vec::new();
        for item in self.storage.scan(&self.changelog_cf, &lower, None, true)? {
            let (key, value) = item?;
            let version = VersionKey::from_bytes(&key)?.version;
            let row: ChangelogRow = serde_json::from_slice(value.as_deref().unwrap_or_default())?;
            changed.push(ChangedId {
                id: row.id,
                version,
            });
        }
        Ok(changed)
    }
}

#[async_trait]
impl Readable for EntityTable {
    async fn when_processing_complete(&self) {}
}

#[async_trait]
impl Source for EntityTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, id: &KeyValue) -> Result<Option<Value>, IndexError> {
        self.get(id)
    }

    async fn changed_since(&self, version: u64) -> Result<ChangeSet, IndexError> {
        let current = self.version();
        if version > current {
            // Table is older than the index that consumed it
            info!(table = %self.name, requested = version, current, "Table behind index, full reset");
            return Ok(ChangeSet::full_reset(self.scan_changelog(0)?));
        }
        Ok(ChangeSet::incremental(self.scan_changelog(version)?))
    }

    fn subscribe(&self, listener: Weak<dyn ChangeListener>) {
        self.listeners.add(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyindex_storage::StorageLayout;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn create_test_table() -> (Arc<EntityTable>, Arc<Storage>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(
            Storage::open(temp_dir.path(), &StorageLayout::new().with_table("items")).unwrap(),
        );
        let table = EntityTable::open(storage.clone(), "items").unwrap();
        (table, storage, temp_dir)
    }

    struct Recorder(Mutex<Vec<ChangeEvent>>);

    #[async_trait]
    impl ChangeListener for Recorder {
        async fn changed(&self, event: ChangeEvent) -> Result<(), IndexError> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_put_assigns_versions() {
        let (table, _storage, _temp) = create_test_table();

        assert_eq!(table.put(1, json!({"color": "red"})).await.unwrap(), 1);
        assert_eq!(table.put(2, json!({"color": "blue"})).await.unwrap(), 2);
        assert_eq!(table.version(), 2);
        assert_eq!(
            table.fetch(&KeyValue::Int(1)).await.unwrap(),
            Some(json!({"color": "red"}))
        );
    }

    #[tokio::test]
    async fn test_changed_since_keeps_latest_version_only() {
        let (table, _storage, _temp) = create_test_table();
        table.put(1, json!("a")).await.unwrap();
        table.put(2, json!("b")).await.unwrap();
        table.put(1, json!("c")).await.unwrap();
        table.delete(2).await.unwrap();

        let changes = table.changed_since(0).await.unwrap();
        assert!(!changes.full_reset);
        assert_eq!(
            changes.entries,
            vec![
                ChangedId { id: KeyValue::Int(1), version: 3 },
                ChangedId { id: KeyValue::Int(2), version: 4 },
            ]
        );

        let changes = table.changed_since(3).await.unwrap();
        assert_eq!(changes.entries.len(), 1);
        assert_eq!(table.get(&KeyValue::Int(2)).unwrap(), None);
    }

    #[tokio::test]
    async fn test_full_reset_when_index_is_ahead() {
        let (table, _storage, _temp) = create_test_table();
        table.put("x", json!(1)).await.unwrap();

        let changes = table.changed_since(50).await.unwrap();
        assert!(changes.full_reset);
        assert_eq!(changes.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_version_restored_on_reopen() {
        let (table, storage, _temp) = create_test_table();
        table.put(1, json!(1)).await.unwrap();
        table.put(2, json!(2)).await.unwrap();
        drop(table);

        let table = EntityTable::open(storage, "items").unwrap();
        assert_eq!(table.version(), 2);
        assert_eq!(table.put(3, json!(3)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_listeners_receive_previous_state() {
        let (table, _storage, _temp) = create_test_table();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let listener: Arc<dyn ChangeListener> = recorder.clone();
        table.subscribe(Arc::downgrade(&listener));

        table.put(1, json!("old")).await.unwrap();
        table.put(1, json!("new")).await.unwrap();
        table.delete(1).await.unwrap();

        let events = recorder.0.lock().unwrap().clone();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].version, 2);
        assert!(events[2].deleted);

        let previous = events[1].previous_state.clone().unwrap().resolve().await;
        assert_eq!(previous, Some(json!("old")));
        let first = events[0].previous_state.clone().unwrap().resolve().await;
        assert_eq!(first, None);
    }
}
