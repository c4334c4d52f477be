//! Storage layer for keyindex.
//!
//! Provides RocksDB-backed storage with:
//! - One column family per index and per entity table
//! - Order-preserving key encoding for range scans
//! - Atomic multi-column-family write batches
//! - The [`KeySpace`] contract consumed by the indexing engine

pub mod column_families;
pub mod db;
pub mod error;
pub mod key_space;
pub mod keys;

pub use column_families::{changelog_cf, entity_cf, index_cf, CfKind, StorageLayout};
pub use db::{CfStats, Storage, StorageStats};
pub use error::StorageError;
pub use key_space::{BatchOp, KeySpace, ScanItem, ScanIter};
pub use keys::{EntryKey, KeyValue, VersionKey, PROGRESS_MARKER_KEY, SEPARATOR, SEPARATOR_NEXT};
