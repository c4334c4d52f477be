//! The user-supplied mapping from an entity to the index entries it owns.
//!
//! A mapping must be a pure function of `(data, id)`: it runs on both the
//! current and the previous snapshot of an entity, and the difference
//! between the two results decides what gets written and what gets removed.

use serde_json::Value;

use keyindex_storage::KeyValue;

/// One entry produced by a mapping.
///
/// An entry without a value is stored as a reference: readers resolve it
/// by fetching the source entity itself.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub key: KeyValue,
    pub value: Option<Value>,
}

impl IndexEntry {
    /// A reference entry filed under `key`
    pub fn key(key: impl Into<KeyValue>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    pub fn with_value(key: impl Into<KeyValue>, value: Value) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
        }
    }
}

impl From<KeyValue> for IndexEntry {
    fn from(key: KeyValue) -> Self {
        IndexEntry::key(key)
    }
}

impl From<&str> for IndexEntry {
    fn from(key: &str) -> Self {
        IndexEntry::key(key)
    }
}

impl From<String> for IndexEntry {
    fn from(key: String) -> Self {
        IndexEntry::key(key)
    }
}

impl From<i64> for IndexEntry {
    fn from(key: i64) -> Self {
        IndexEntry::key(key)
    }
}

/// Result of mapping one entity: nothing, a single entry, or several.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Mapped {
    #[default]
    None,
    One(IndexEntry),
    Many(Vec<IndexEntry>),
}

impl Mapped {
    pub fn into_entries(self) -> Vec<IndexEntry> {
        match self {
            Mapped::None => Vec::new(),
            Mapped::One(entry) => vec![entry],
            Mapped::Many(entries) => entries,
        }
    }
}

impl From<IndexEntry> for Mapped {
    fn from(entry: IndexEntry) -> Self {
        Mapped::One(entry)
    }
}

impl From<Vec<IndexEntry>> for Mapped {
    fn from(entries: Vec<IndexEntry>) -> Self {
        Mapped::Many(entries)
    }
}

impl From<KeyValue> for Mapped {
    fn from(key: KeyValue) -> Self {
        Mapped::One(IndexEntry::key(key))
    }
}

impl From<&str> for Mapped {
    fn from(key: &str) -> Self {
        Mapped::One(IndexEntry::key(key))
    }
}

impl<T: Into<Mapped>> From<Option<T>> for Mapped {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_default()
    }
}

/// Maps an entity to its index entries.
pub trait IndexBy: Send + Sync {
    fn index_by(&self, data: &Value, id: &KeyValue) -> anyhow::Result<Mapped>;
}

impl<F> IndexBy for F
where
    F: Fn(&Value, &KeyValue) -> anyhow::Result<Mapped> + Send + Sync,
{
    fn index_by(&self, data: &Value, id: &KeyValue) -> anyhow::Result<Mapped> {
        self(data, id)
    }
}
