//! Ordered key space abstraction used by the indexing engine.
//!
//! A key space is one ordered byte-key/byte-value namespace supporting point
//! reads, atomic batches and bounded forward scans. [`ColumnFamilySpace`]
//! binds the trait to one RocksDB column family.

use std::sync::Arc;

use crate::db::Storage;
use crate::error::StorageError;

/// One write inside an atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl BatchOp {
    pub fn put(key: Vec<u8>, value: Vec<u8>) -> Self {
        BatchOp::Put { key, value }
    }

    pub fn delete(key: Vec<u8>) -> Self {
        BatchOp::Delete { key }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }

    /// Bytes this operation adds to a pending batch
    pub fn byte_len(&self) -> usize {
        match self {
            BatchOp::Put { key, value } => key.len() + value.len(),
            BatchOp::Delete { key } => key.len(),
        }
    }
}

/// A scanned row: key plus the value when values were requested
pub type ScanItem = (Vec<u8>, Option<Vec<u8>>);

/// Lazy ordered scan over a key space
pub type ScanIter<'a> = Box<dyn Iterator<Item = Result<ScanItem, StorageError>> + 'a>;

/// Storage contract consumed by indices.
pub trait KeySpace: Send + Sync {
    /// Namespace name, used in logs
    fn name(&self) -> &str;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Apply all operations atomically, in order
    fn batch(&self, ops: &[BatchOp]) -> Result<(), StorageError>;

    /// Scan keys in `[lower, upper)` in ascending order
    fn scan(
        &self,
        lower: &[u8],
        upper: Option<&[u8]>,
        include_values: bool,
    ) -> Result<ScanIter<'_>, StorageError>;

    /// Remove every key in the namespace
    fn clear(&self) -> Result<(), StorageError>;
}

/// A [`KeySpace`] backed by one column family of a shared [`Storage`]
pub struct ColumnFamilySpace {
    storage: Arc<Storage>,
    cf_name: String,
}

impl ColumnFamilySpace {
    pub(crate) fn new(storage: Arc<Storage>, cf_name: String) -> Self {
        Self { storage, cf_name }
    }
}

impl KeySpace for ColumnFamilySpace {
    fn name(&self) -> &str {
        &self.cf_name
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.storage.get(&self.cf_name, key)
    }

    fn batch(&self, ops: &[BatchOp]) -> Result<(), StorageError> {
        self.storage.write(&[(self.cf_name.as_str(), ops)])
    }

    fn scan(
        &self,
        lower: &[u8],
        upper: Option<&[u8]>,
        include_values: bool,
    ) -> Result<ScanIter<'_>, StorageError> {
        self.storage
            .scan(&self.cf_name, lower, upper, include_values)
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.storage.clear_cf(&self.cf_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column_families::{index_cf, StorageLayout};
    use tempfile::TempDir;

    fn create_test_space() -> (Arc<dyn KeySpace>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let layout = StorageLayout::new().with_index("test");
        let storage = Arc::new(Storage::open(temp_dir.path(), &layout).unwrap());
        let space = storage.key_space(&index_cf("test")).unwrap();
        (space, temp_dir)
    }

    #[test]
    fn test_batch_op_byte_len() {
        assert_eq!(BatchOp::put(vec![1, 2], vec![3]).byte_len(), 3);
        assert_eq!(BatchOp::delete(vec![1, 2]).byte_len(), 2);
    }

    #[test]
    fn test_batch_applies_in_order() {
        let (space, _temp) = create_test_space();

        space
            .batch(&[
                BatchOp::put(b"a".to_vec(), b"1".to_vec()),
                BatchOp::put(b"b".to_vec(), b"2".to_vec()),
                BatchOp::delete(b"a".to_vec()),
            ])
            .unwrap();

        assert_eq!(space.get(b"a").unwrap(), None);
        assert_eq!(space.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_scan_respects_bounds() {
        let (space, _temp) = create_test_space();
        let ops: Vec<BatchOp> = ["a", "b", "c", "d"]
            .iter()
            .map(|k| BatchOp::put(k.as_bytes().to_vec(), k.as_bytes().to_vec()))
            .collect();
        space.batch(&ops).unwrap();

        let keys: Vec<Vec<u8>> = space
            .scan(b"b", Some(b"d"), false)
            .unwrap()
            .map(|item| item.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);

        let rows: Vec<ScanItem> = space
            .scan(b"c", None, true)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].1, Some(b"c".to_vec()));
    }

    #[test]
    fn test_clear_removes_everything() {
        let (space, _temp) = create_test_space();
        space
            .batch(&[
                BatchOp::put(vec![0x01, 0x02], b"marker".to_vec()),
                BatchOp::put(vec![0x20, b'x'], Vec::new()),
            ])
            .unwrap();

        space.clear().unwrap();

        assert_eq!(space.scan(&[], None, false).unwrap().count(), 0);
    }
}
