//! Read path: entries filed under an index key.
//!
//! Entry values are decoded lazily; an empty stored value is a reference to
//! the source entity with the same id and is resolved through the source.
//! Every resolved read reports its approximate size to the shared
//! expiration strategy, scaled so index results expire before entity values.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use keyindex_storage::{EntryKey, KeySpace, KeyValue};

use crate::error::IndexError;
use crate::index::KeyIndex;
use crate::source::Readable;

/// One stored entry, before reference resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct RawIndexEntry {
    pub source_id: KeyValue,
    /// Decoded payload; `None` for a reference entry
    pub value: Option<Value>,
    /// Key plus value length, with a floor for references
    pub approximate_size: u64,
}

/// Bounds for listing index keys: `lower` inclusive, `upper` exclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyRange {
    pub lower: Option<KeyValue>,
    pub upper: Option<KeyValue>,
}

impl KeyRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn starting_at(lower: impl Into<KeyValue>) -> Self {
        Self {
            lower: Some(lower.into()),
            upper: None,
        }
    }

    pub fn between(lower: impl Into<KeyValue>, upper: impl Into<KeyValue>) -> Self {
        Self {
            lower: Some(lower.into()),
            upper: Some(upper.into()),
        }
    }
}

fn decode_entry(
    key: &[u8],
    value: Option<&[u8]>,
    missing_value_size: u64,
) -> Result<RawIndexEntry, IndexError> {
    let entry = EntryKey::from_bytes(key)?;
    let (value, value_size) = match value {
        Some(bytes) if !bytes.is_empty() => (Some(serde_json::from_slice(bytes)?), bytes.len() as u64),
        _ => (None, missing_value_size),
    };
    Ok(RawIndexEntry {
        source_id: entry.source_id,
        value,
        approximate_size: key.len() as u64 + value_size,
    })
}

/// Every entry filed under `key`, in source-id order.
pub(crate) fn read_raw_entries(
    space: &dyn KeySpace,
    key: &KeyValue,
    missing_value_size: u64,
) -> Result<Vec<RawIndexEntry>, IndexError> {
    let (lower, upper) = EntryKey::range_for(key);
    let mut entries = Vec::new();
    for item in space.scan(&lower, Some(&upper), true)? {
        let (key, value) = item?;
        entries.push(decode_entry(&key, value.as_deref(), missing_value_size)?);
    }
    Ok(entries)
}

/// Restartable view of the entries under one index key.
///
/// Each call to [`IndexRange::entries`] starts a fresh scan, so the view
/// reflects whatever has been committed at that moment.
pub struct IndexRange {
    space: Arc<dyn KeySpace>,
    key: KeyValue,
    missing_value_size: u64,
}

impl IndexRange {
    pub fn key(&self) -> &KeyValue {
        &self.key
    }

    pub fn entries(
        &self,
    ) -> Result<impl Iterator<Item = Result<RawIndexEntry, IndexError>> + '_, IndexError> {
        let (lower, upper) = EntryKey::range_for(&self.key);
        let scan = self.space.scan(&lower, Some(&upper), true)?;
        let missing_value_size = self.missing_value_size;
        Ok(scan.map(move |item| {
            let (key, value) = item?;
            decode_entry(&key, value.as_deref(), missing_value_size)
        }))
    }
}

impl KeyIndex {
    /// Lazy entries under `key`; references are left unresolved.
    pub fn range(&self, key: impl Into<KeyValue>) -> IndexRange {
        IndexRange {
            space: Arc::clone(&self.space),
            key: key.into(),
            missing_value_size: self.config.missing_value_size,
        }
    }

    /// Source ids filed under `key`
    pub fn source_ids(&self, key: &KeyValue) -> Result<Vec<KeyValue>, IndexError> {
        let (lower, upper) = EntryKey::range_for(key);
        let mut ids = Vec::new();
        for item in self.space.scan(&lower, Some(&upper), false)? {
            let (key, _) = item?;
            ids.push(EntryKey::from_bytes(&key)?.source_id);
        }
        Ok(ids)
    }

    /// Resolved values under `key`, served from the cache when possible.
    ///
    /// References whose source entity no longer exists are skipped.
    pub async fn values(&self, key: &KeyValue) -> Result<Arc<Vec<Value>>, IndexError> {
        if let Some(cached) = self.cache.get(key) {
            return Ok(Arc::clone(cached.value()));
        }

        let epoch = self.cache_epoch.load(Ordering::SeqCst);
        let entries = read_raw_entries(self.space.as_ref(), key, self.config.missing_value_size)?;
        let mut size = 0;
        let mut values = Vec::with_capacity(entries.len());
        for entry in entries {
            size += entry.approximate_size;
            match entry.value {
                Some(value) => values.push(value),
                None => match self.source.fetch(&entry.source_id).await {
                    Ok(Some(value)) => values.push(value),
                    Ok(None) => {
                        debug!(index = %self.name, id = %entry.source_id, "Referenced entity missing");
                    }
                    Err(e) => {
                        warn!(index = %self.name, id = %entry.source_id, error = %e, "Failed to resolve index reference");
                    }
                },
            }
        }

        let values = Arc::new(values);
        if let Some(expiration) = &self.expiration {
            if !self.cache_values(key, &values, epoch) {
                debug!(index = %self.name, key = %key, "Index changed during read, not caching");
                return Ok(values);
            }
            let size = if size == 0 { self.config.default_entry_size } else { size };
            expiration.use_entry(
                self.as_expirable(),
                &self.name,
                key,
                size * self.config.index_cost_multiplier,
            );
        }
        Ok(values)
    }

    /// Distinct index keys within `range`, once processing has settled.
    pub async fn index_keys(&self, range: KeyRange) -> Result<Vec<KeyValue>, IndexError> {
        self.when_processing_complete().await;

        let lower = range.lower.as_ref().map(KeyValue::to_bytes).unwrap_or_default();
        let upper = range.upper.as_ref().map(KeyValue::to_bytes);

        let mut keys: Vec<KeyValue> = Vec::new();
        for item in self.space.scan(&lower, upper.as_deref(), false)? {
            let (key, _) = item?;
            if !EntryKey::is_entry_key(&key) {
                continue;
            }
            let entry = EntryKey::from_bytes(&key)?;
            if keys.last() != Some(&entry.index_key) {
                keys.push(entry.index_key);
            }
        }
        Ok(keys)
    }
}
