//! RocksDB wrapper for keyindex storage.
//!
//! Provides:
//! - Database open with per-table and per-index column families
//! - Atomic write batches spanning several column families
//! - Single-key reads and bounded range scans
//! - Namespace clear, compaction and statistics

use rocksdb::{Direction, IteratorMode, Options, ReadOptions, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::column_families::{build_cf_descriptors, StorageLayout};
use crate::error::StorageError;
use crate::key_space::{BatchOp, ColumnFamilySpace, KeySpace, ScanIter};

/// Exclusive upper bound used when clearing a namespace. No encoded key
/// starts with 0xFF.
const CLEAR_UPPER_BOUND: &[u8] = &[0xFF];

/// Main storage interface for keyindex
pub struct Storage {
    db: DB,
    cf_names: Vec<String>,
}

impl Storage {
    /// Open storage at the given path, creating if necessary.
    ///
    /// Column families already present on disk are opened alongside the
    /// ones the layout requires.
    pub fn open(path: &Path, layout: &StorageLayout) -> Result<Self, StorageError> {
        info!("Opening storage at {:?}", path);

        let db_opts = Self::db_options();

        let mut cf_names = DB::list_cf(&db_opts, path).unwrap_or_default();
        for name in layout.cf_names() {
            if !cf_names.contains(&name) {
                cf_names.push(name);
            }
        }
        cf_names.retain(|name| name != rocksdb::DEFAULT_COLUMN_FAMILY_NAME);
        cf_names.sort();

        let db = DB::open_cf_descriptors(&db_opts, path, build_cf_descriptors(&cf_names))?;
        debug!(column_families = cf_names.len(), "Storage opened");

        Ok(Self { db, cf_names })
    }

    /// Open an existing database with whatever column families it has.
    pub fn open_existing(path: &Path) -> Result<Self, StorageError> {
        let db_opts = Self::db_options();
        let mut cf_names = DB::list_cf(&db_opts, path)?;
        cf_names.retain(|name| name != rocksdb::DEFAULT_COLUMN_FAMILY_NAME);
        cf_names.sort();

        let db = DB::open_cf_descriptors(&db_opts, path, build_cf_descriptors(&cf_names))?;
        info!(path = ?path, column_families = cf_names.len(), "Opened existing storage");

        Ok(Self { db, cf_names })
    }

    fn db_options() -> Options {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_background_jobs(4);
        db_opts
    }

    fn cf(&self, cf_name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(cf_name)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(cf_name.to_string()))
    }

    /// Names of all column families (excluding the default one)
    pub fn cf_names(&self) -> &[String] {
        &self.cf_names
    }

    /// Whether a column family exists
    pub fn has_cf(&self, cf_name: &str) -> bool {
        self.db.cf_handle(cf_name).is_some()
    }

    /// Bind a [`KeySpace`] to one column family.
    pub fn key_space(self: &Arc<Self>, cf_name: &str) -> Result<Arc<dyn KeySpace>, StorageError> {
        self.cf(cf_name)?;
        Ok(Arc::new(ColumnFamilySpace::new(
            Arc::clone(self),
            cf_name.to_string(),
        )))
    }

    /// Get a value from a specific column family.
    pub fn get(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self.cf(cf_name)?;
        let result = self.db.get_cf(cf, key)?;
        Ok(result)
    }

    /// Put a value into a specific column family.
    pub fn put(&self, cf_name: &str, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let cf = self.cf(cf_name)?;
        self.db.put_cf(cf, key, value)?;
        Ok(())
    }

    /// Delete a value from a specific column family.
    pub fn delete(&self, cf_name: &str, key: &[u8]) -> Result<(), StorageError> {
        let cf = self.cf(cf_name)?;
        self.db.delete_cf(cf, key)?;
        Ok(())
    }

    /// Apply operations against several column families in one atomic batch.
    pub fn write(&self, writes: &[(&str, &[BatchOp])]) -> Result<(), StorageError> {
        let mut batch = WriteBatch::default();
        let mut count = 0usize;

        for (cf_name, ops) in writes {
            let cf = self.cf(cf_name)?;
            for op in ops.iter() {
                match op {
                    BatchOp::Put { key, value } => batch.put_cf(cf, key, value),
                    BatchOp::Delete { key } => batch.delete_cf(cf, key),
                }
                count += 1;
            }
        }

        if count == 0 {
            return Ok(());
        }

        self.db.write(batch)?;
        debug!(ops = count, "Wrote batch");
        Ok(())
    }

    /// Scan `[lower, upper)` in a column family in ascending key order.
    pub fn scan(
        &self,
        cf_name: &str,
        lower: &[u8],
        upper: Option<&[u8]>,
        include_values: bool,
    ) -> Result<ScanIter<'_>, StorageError> {
        let cf = self.cf(cf_name)?;

        let mut read_opts = ReadOptions::default();
        if let Some(upper) = upper {
            read_opts.set_iterate_upper_bound(upper.to_vec());
        }

        let iter = self
            .db
            .iterator_cf_opt(cf, read_opts, IteratorMode::From(lower, Direction::Forward))
            .map(move |item| -> Result<_, StorageError> {
                let (key, value) = item?;
                let value = include_values.then(|| value.to_vec());
                Ok((key.to_vec(), value))
            });

        Ok(Box::new(iter))
    }

    /// Highest key in a column family, if any
    pub fn last_key(&self, cf_name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self.cf(cf_name)?;
        let mut iter = self.db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(Some(key.to_vec()))
            }
            None => Ok(None),
        }
    }

    /// Remove every key in a column family.
    pub fn clear_cf(&self, cf_name: &str) -> Result<(), StorageError> {
        let cf = self.cf(cf_name)?;
        let mut batch = WriteBatch::default();
        batch.delete_range_cf(cf, &[] as &[u8], CLEAR_UPPER_BOUND);
        self.db.write(batch)?;
        info!(cf = %cf_name, "Cleared column family");
        Ok(())
    }

    /// Count entries in a column family.
    pub fn count_entries(&self, cf_name: &str) -> Result<u64, StorageError> {
        let cf = self.cf(cf_name)?;
        let mut count = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Flush all column families to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        for cf_name in &self.cf_names {
            if let Some(cf) = self.db.cf_handle(cf_name) {
                self.db.flush_cf(cf)?;
            }
        }
        Ok(())
    }

    /// Trigger manual compaction on all column families.
    pub fn compact(&self) -> Result<(), StorageError> {
        info!("Starting full compaction...");
        self.db.compact_range::<&[u8], &[u8]>(None, None);

        for cf_name in &self.cf_names {
            if let Some(cf) = self.db.cf_handle(cf_name) {
                self.db.compact_range_cf::<&[u8], &[u8]>(cf, None, None);
            }
        }
        info!("Compaction complete");
        Ok(())
    }

    /// Get database statistics.
    pub fn get_stats(&self) -> Result<StorageStats, StorageError> {
        let mut stats = StorageStats::default();

        for cf_name in &self.cf_names {
            stats.column_families.push(CfStats {
                name: cf_name.clone(),
                entries: self.count_entries(cf_name)?,
            });
        }

        stats.disk_usage_bytes = self.get_disk_usage();
        Ok(stats)
    }

    fn get_disk_usage(&self) -> u64 {
        let mut total_size = 0u64;

        if let Ok(entries) = std::fs::read_dir(self.db.path()) {
            for entry in entries.flatten() {
                if let Ok(metadata) = entry.metadata() {
                    total_size += metadata.len();
                }
            }
        }

        total_size
    }
}

/// Entry count for one column family
#[derive(Debug, Clone)]
pub struct CfStats {
    pub name: String,
    pub entries: u64,
}

/// Statistics about the storage.
#[derive(Debug, Default)]
pub struct StorageStats {
    /// Per column family entry counts, sorted by name
    pub column_families: Vec<CfStats>,
    /// Total disk usage in bytes
    pub disk_usage_bytes: u64,
}

impl StorageStats {
    pub fn entries(&self, cf_name: &str) -> Option<u64> {
        self.column_families
            .iter()
            .find(|cf| cf.name == cf_name)
            .map(|cf| cf.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column_families::{changelog_cf, entity_cf, index_cf};
    use tempfile::TempDir;

    fn test_layout() -> StorageLayout {
        StorageLayout::new()
            .with_table("items")
            .with_index("items_by_color")
    }

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path(), &test_layout()).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_open_creates_column_families() {
        let (storage, _temp) = create_test_storage();
        for cf_name in test_layout().cf_names() {
            assert!(storage.has_cf(&cf_name), "CF {} should exist", cf_name);
        }
        assert_eq!(storage.cf_names().len(), 3);
    }

    #[test]
    fn test_put_get_delete() {
        let (storage, _temp) = create_test_storage();
        let cf = entity_cf("items");

        storage.put(&cf, b"k", b"v").unwrap();
        assert_eq!(storage.get(&cf, b"k").unwrap(), Some(b"v".to_vec()));

        storage.delete(&cf, b"k").unwrap();
        assert_eq!(storage.get(&cf, b"k").unwrap(), None);
    }

    #[test]
    fn test_unknown_column_family() {
        let (storage, _temp) = create_test_storage();
        let result = storage.get("index:missing", b"k");
        assert!(matches!(result, Err(StorageError::ColumnFamilyNotFound(_))));
    }

    #[test]
    fn test_write_spans_column_families() {
        let (storage, _temp) = create_test_storage();
        let entities = entity_cf("items");
        let changelog = changelog_cf("items");

        storage
            .write(&[
                (entities.as_str(), &[BatchOp::put(b"1".to_vec(), b"x".to_vec())]),
                (changelog.as_str(), &[BatchOp::put(b"ver:1".to_vec(), b"1".to_vec())]),
            ])
            .unwrap();

        assert!(storage.get(&entities, b"1").unwrap().is_some());
        assert_eq!(storage.last_key(&changelog).unwrap(), Some(b"ver:1".to_vec()));
    }

    #[test]
    fn test_write_fails_atomically_on_missing_cf() {
        let (storage, _temp) = create_test_storage();
        let entities = entity_cf("items");

        let result = storage.write(&[
            (entities.as_str(), &[BatchOp::put(b"1".to_vec(), b"x".to_vec())]),
            ("entity:missing", &[BatchOp::put(b"1".to_vec(), b"x".to_vec())]),
        ]);

        assert!(result.is_err());
        assert_eq!(storage.get(&entities, b"1").unwrap(), None);
    }

    #[test]
    fn test_reopen_keeps_extra_column_families() {
        let temp_dir = TempDir::new().unwrap();
        {
            let storage = Storage::open(temp_dir.path(), &test_layout()).unwrap();
            storage.put(&index_cf("items_by_color"), b"k", b"v").unwrap();
        }

        let storage = Storage::open(temp_dir.path(), &StorageLayout::new()).unwrap();
        assert_eq!(
            storage.get(&index_cf("items_by_color"), b"k").unwrap(),
            Some(b"v".to_vec())
        );

        drop(storage);
        let storage = Storage::open_existing(temp_dir.path()).unwrap();
        assert_eq!(storage.cf_names().len(), 3);
    }

    #[test]
    fn test_stats_and_clear() {
        let (storage, _temp) = create_test_storage();
        let cf = index_cf("items_by_color");

        for i in 0..5u8 {
            storage.put(&cf, &[0x20, b'a' + i], b"").unwrap();
        }

        let stats = storage.get_stats().unwrap();
        assert_eq!(stats.entries(&cf), Some(5));
        assert!(stats.disk_usage_bytes > 0);

        storage.clear_cf(&cf).unwrap();
        assert_eq!(storage.count_entries(&cf).unwrap(), 0);
    }

    #[test]
    fn test_compact_and_flush() {
        let (storage, _temp) = create_test_storage();
        storage.put(&entity_cf("items"), b"k", b"v").unwrap();
        storage.flush().unwrap();
        storage.compact().unwrap();
        assert_eq!(storage.get(&entity_cf("items"), b"k").unwrap(), Some(b"v".to_vec()));
    }
}
