//! Incremental secondary-index maintenance.
//!
//! This crate keeps secondary indices consistent with the entities they are
//! built from as those entities change, without rescanning the dataset.
//!
//! ## Key Components
//!
//! - [`KeyIndex`]: An index over one [`Source`], with its queue, scheduler
//!   and commit pipeline
//! - [`IndexQueue`]: Coalescing per-id queue of pending [`IndexRequest`]s
//! - [`IndexBy`]: User mapping from an entity to the entries it owns
//! - [`ProgressMarker`]: Durable version boundary used for crash recovery
//! - [`EntityTable`]: RocksDB-backed versioned table acting as a source
//! - [`ExpirationStrategy`]: Size-weighted LRU shared by index read caches
//! - [`IndexRegistry`]: Status of every open index
//!
//! ## Flow
//!
//! 1. A source change is delivered to the index as a [`ChangeEvent`]
//! 2. The queue coalesces it with any pending request for the same id
//! 3. A run drains the queue, recomputing entries per id concurrently
//! 4. Each window of results is committed atomically, then announced to
//!    downstream listeners
//! 5. The progress marker advances once the announcement round completes
//! 6. On restart, [`KeyIndex::resume`] catches up from the marker
//!
//! ## Example
//!
//! ```ignore
//! use keyindex_core::{EntityTable, IndexEntry, KeyIndex, Mapped};
//!
//! let table = EntityTable::open(storage.clone(), "people")?;
//! let index = KeyIndex::builder("people_by_city", table.clone(), |data: &Value, _id: &KeyValue| {
//!     Ok(data["city"].as_str().map(IndexEntry::key).into())
//! })
//! .open(storage.key_space(&index_cf("people_by_city"))?)?;
//! index.resume().await?;
//!
//! table.put(1, json!({"name": "Ada", "city": "London"})).await?;
//! index.when_indexed(table.version()).await;
//! let people = index.values(&KeyValue::from("London")).await?;
//! ```

pub mod commit;
pub mod config;
pub mod error;
pub mod expiration;
pub mod index;
pub mod mapping;
pub mod progress;
pub mod queue;
pub mod read;
pub mod recompute;
pub mod recovery;
pub mod registry;
pub mod request;
mod scheduler;
pub mod source;
pub mod state;
pub mod table;
pub mod throttle;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use commit::PendingWrites;
pub use config::{IndexingConfig, Settings};
pub use error::IndexError;
pub use expiration::{Expirable, ExpirationStrategy};
pub use index::{KeyIndex, KeyIndexBuilder};
pub use mapping::{IndexBy, IndexEntry, Mapped};
pub use progress::{ProgressMarker, ProgressTracker};
pub use queue::IndexQueue;
pub use read::{IndexRange, KeyRange, RawIndexEntry};
pub use recompute::{diff_entries, EntryDiff};
pub use recovery::{Recovery, RecoveryKind, INITIALIZING_TRIGGER};
pub use registry::{IndexRegistry, IndexStatus};
pub use request::{ChangeEvent, EntryUpdate, IndexRequest, PreviousState};
pub use source::{ChangeListener, ChangeSet, ChangedId, Listeners, Readable, Source};
pub use state::{Completion, IndexState, RunState, RunSummary};
pub use table::EntityTable;

pub use keyindex_storage::KeyValue;
