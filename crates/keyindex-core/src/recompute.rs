//! Per-id recomputation: diff the entries an entity used to own against
//! the entries it owns now.
//!
//! A recompute only takes effect if the id is still queued at the version it
//! started with. Anything else means a newer change superseded it, and the
//! attempt is dropped without a trace; the newer request will run instead.
//!
//! An entity whose current state cannot be fetched or mapped is treated as
//! owning no entries, so whatever it used to own is still removed.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::FutureExt;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, warn};

use keyindex_storage::{BatchOp, EntryKey, KeyValue};

use crate::error::IndexError;
use crate::index::KeyIndex;
use crate::mapping::IndexEntry;
use crate::request::IndexRequest;

/// How one recompute ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Applied,
    /// Superseded by a newer version; the id stays queued
    Stale,
    /// Error logged and the id dropped; entries of the previous state are
    /// still removed when only the current state failed
    Failed,
}

/// Diff for one id, and whether the current state could not be indexed.
struct Computed {
    diff: EntryDiff,
    current_failed: bool,
}

/// Operations for one id plus every index key they affect.
#[derive(Debug, Default)]
pub struct EntryDiff {
    pub ops: Vec<BatchOp>,
    /// Keys written, removed, or found unchanged
    pub touched: Vec<KeyValue>,
}

fn encode_value(value: &Option<Value>) -> Result<Vec<u8>, IndexError> {
    match value {
        Some(value) => Ok(serde_json::to_vec(value)?),
        None => Ok(Vec::new()),
    }
}

/// Diff previous and current entries of `id`.
///
/// Unchanged entries produce no operation but are still reported as
/// touched. Removals are emitted before puts.
pub fn diff_entries(
    id: &KeyValue,
    previous: Vec<IndexEntry>,
    current: Vec<IndexEntry>,
) -> Result<EntryDiff, IndexError> {
    let mut to_remove: IndexMap<KeyValue, Vec<u8>> = IndexMap::with_capacity(previous.len());
    for entry in previous {
        let encoded = encode_value(&entry.value)?;
        to_remove.insert(entry.key, encoded);
    }

    let mut puts = Vec::new();
    let mut touched = Vec::new();
    for entry in current {
        let encoded = encode_value(&entry.value)?;
        let unchanged = to_remove
            .shift_remove(&entry.key)
            .is_some_and(|old| old == encoded);
        if !unchanged {
            puts.push(BatchOp::put(
                EntryKey::new(entry.key.clone(), id.clone()).to_bytes(),
                encoded,
            ));
        }
        touched.push(entry.key);
    }

    let mut ops = Vec::with_capacity(to_remove.len() + puts.len());
    for (key, _) in to_remove {
        ops.push(BatchOp::delete(EntryKey::new(key.clone(), id.clone()).to_bytes()));
        touched.push(key);
    }
    ops.extend(puts);

    Ok(EntryDiff { ops, touched })
}

impl KeyIndex {
    fn is_stale(&self, id: &KeyValue, version: u64) -> bool {
        self.lock_queue().version_of(id) != Some(version)
    }

    fn map_entries(&self, data: &Value, id: &KeyValue) -> Result<Vec<IndexEntry>, IndexError> {
        self.index_by
            .index_by(data, id)
            .map(|mapped| mapped.into_entries())
            .map_err(|e| IndexError::Mapping(format!("{:#}", e)))
    }

    /// Current value of `id`, retried before giving up.
    async fn fetch_value(&self, id: &KeyValue) -> Result<Option<Value>, IndexError> {
        let attempts = self.config.value_fetch_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.source.fetch(id).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    debug!(index = %self.name, id = %id, attempt, error = %e, "Retrying value fetch");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Entries the entity used to own. Failures count as nothing to remove.
    async fn previous_entries(&self, id: &KeyValue, request: &IndexRequest) -> Vec<IndexEntry> {
        let Some(state) = request.previous_state.clone() else {
            return Vec::new();
        };
        match state.resolve().await {
            Some(data) => self.map_entries(&data, id).unwrap_or_else(|e| {
                warn!(index = %self.name, id = %id, error = %e, "Failed to map previous state");
                Vec::new()
            }),
            None => Vec::new(),
        }
    }

    /// Entries the entity owns now.
    async fn current_entries(&self, id: &KeyValue) -> Result<Vec<IndexEntry>, IndexError> {
        match self.fetch_value(id).await? {
            Some(data) => self.map_entries(&data, id),
            None => Ok(Vec::new()),
        }
    }

    /// Compute the diff for `id`, or `None` if the request went stale.
    async fn compute_diff(
        &self,
        id: &KeyValue,
        request: &IndexRequest,
    ) -> Result<Option<Computed>, IndexError> {
        let previous = self.previous_entries(id, request).await;
        if self.is_stale(id, request.version) {
            return Ok(None);
        }

        let mut current_failed = false;
        let current = if request.deleted {
            Vec::new()
        } else {
            match self.current_entries(id).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(
                        index = %self.name,
                        id = %id,
                        version = request.version,
                        error = %e,
                        "Failed to index entity, removing its previous entries"
                    );
                    current_failed = true;
                    Vec::new()
                }
            }
        };
        if self.is_stale(id, request.version) {
            return Ok(None);
        }

        let diff = diff_entries(id, previous, current)?;
        Ok(Some(Computed { diff, current_failed }))
    }

    /// Hand the diff to the pending buffers if the request is still current.
    fn apply(&self, id: &KeyValue, request: &IndexRequest, computed: Computed) -> Outcome {
        let mut queue = self.lock_queue();
        if queue.version_of(id) != Some(request.version) {
            return Outcome::Stale;
        }
        self.lock_pending()
            .append(computed.diff, &request.sources, &request.triggers);
        queue.remove(id);
        if request.version > 0 {
            self.watermark.fetch_max(request.version, Ordering::SeqCst);
        }
        if computed.current_failed {
            Outcome::Failed
        } else {
            Outcome::Applied
        }
    }

    fn drop_failed(&self, id: &KeyValue, version: u64) -> Outcome {
        if self.lock_queue().remove_if_version(id, version) {
            Outcome::Failed
        } else {
            Outcome::Stale
        }
    }

    /// Recompute one id. Errors and panics are logged and swallowed.
    pub(crate) async fn recompute(self: Arc<Self>, id: KeyValue, request: IndexRequest) -> Outcome {
        let result = AssertUnwindSafe(self.compute_diff(&id, &request))
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(Some(computed))) => self.apply(&id, &request, computed),
            Ok(Ok(None)) => Outcome::Stale,
            Ok(Err(e)) => {
                warn!(index = %self.name, id = %id, version = request.version, error = %e, "Failed to index entity");
                self.drop_failed(&id, request.version)
            }
            Err(_) => {
                warn!(index = %self.name, id = %id, version = request.version, "Mapping panicked while indexing entity");
                self.drop_failed(&id, request.version)
            }
        }
    }
}
