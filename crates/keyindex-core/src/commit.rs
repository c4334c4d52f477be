//! Commit pipeline: persist accumulated operations, then notify.
//!
//! Ordering per batch is: operations durable, then downstream notified,
//! then the progress value covering the batch becomes eligible for the
//! next marker write. Notification rounds are chained so a later round
//! never overtakes an earlier one.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, error, warn};

use keyindex_storage::{BatchOp, KeySpace, KeyValue};

use crate::error::IndexError;
use crate::index::KeyIndex;
use crate::read::read_raw_entries;
use crate::recompute::EntryDiff;
use crate::request::{ChangeEvent, EntryUpdate, PreviousState};

/// Operations Buffer plus Updated-Entries Map, swapped out as a unit.
#[derive(Debug, Default)]
pub struct PendingWrites {
    ops: Vec<BatchOp>,
    byte_count: usize,
    /// Insertion order is recency order; re-touching a key moves it last.
    updated: IndexMap<KeyValue, EntryUpdate>,
}

impl PendingWrites {
    pub fn append(&mut self, diff: EntryDiff, sources: &BTreeSet<String>, triggers: &BTreeSet<String>) {
        self.byte_count += diff.ops.iter().map(BatchOp::byte_len).sum::<usize>();
        self.ops.extend(diff.ops);
        for key in diff.touched {
            let mut update = self.updated.shift_remove(&key).unwrap_or_default();
            update.absorb(sources, triggers);
            self.updated.insert(key, update);
        }
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn updated(&self) -> &IndexMap<KeyValue, EntryUpdate> {
        &self.updated
    }

    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    /// No operations and no pending notifications
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.updated.is_empty()
    }

    pub fn take(&mut self) -> PendingWrites {
        std::mem::take(self)
    }
}

impl KeyIndex {
    /// Highest version the marker may claim right now.
    fn eligible_progress(&self, lowest_queued: Option<u64>) -> u64 {
        let watermark = self.watermark();
        match lowest_queued {
            Some(lowest) => watermark.min(lowest.saturating_sub(1)),
            None => watermark,
        }
    }

    /// Committed values of each touched key, as downstream previous states.
    fn capture_previous(&self, keys: impl Iterator<Item = KeyValue>) -> HashMap<KeyValue, PreviousState> {
        let mut previous = HashMap::new();
        for key in keys {
            if let Some(cached) = self.cache.get(&key) {
                let values = Vec::clone(cached.value());
                previous.insert(key, ready_state(values));
                continue;
            }
            let entries = match read_raw_entries(self.space.as_ref(), &key, self.config.missing_value_size) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(index = %self.name, key = %key, error = %e, "Failed to read previous entries");
                    continue;
                }
            };
            if entries.iter().all(|entry| entry.value.is_some()) {
                let values = entries.into_iter().filter_map(|entry| entry.value).collect();
                previous.insert(key, ready_state(values));
                continue;
            }
            let source = Arc::clone(&self.source);
            previous.insert(
                key,
                PreviousState::pending(async move {
                    let mut values = Vec::with_capacity(entries.len());
                    for entry in entries {
                        match entry.value {
                            Some(value) => values.push(value),
                            None => {
                                if let Ok(Some(value)) = source.fetch(&entry.source_id).await {
                                    values.push(value);
                                }
                            }
                        }
                    }
                    (!values.is_empty()).then_some(Value::Array(values))
                }),
            );
        }
        previous
    }

    /// Persist pending operations as one atomic batch and start the
    /// notification round for them.
    pub(crate) async fn commit(self: &Arc<Self>) -> Result<(), IndexError> {
        let (progress, writes) = {
            let queue = self.lock_queue();
            let progress = self.eligible_progress(queue.min_version());
            let writes = self.lock_pending().take();
            (progress, writes)
        };

        if writes.is_empty() {
            // Nothing to write: remember the progress for the next batch
            match self.progress.take_round() {
                Some(prior) => {
                    let index = Arc::clone(self);
                    self.progress.set_round(tokio::spawn(async move {
                        let _ = prior.await;
                        index.progress.queue(progress);
                    }));
                }
                None => self.progress.queue(progress),
            }
            return Ok(());
        }

        let PendingWrites {
            mut ops,
            byte_count,
            updated,
        } = writes;

        let mut marker_version = None;
        if let Some(marker) = self.progress.take_ready() {
            marker_version = Some(marker.last_indexed_version);
            ops.push(marker.to_op()?);
        }

        let previous = if self.listeners.is_empty() {
            HashMap::new()
        } else {
            self.capture_previous(updated.keys().cloned())
        };

        debug!(
            index = %self.name,
            ops = ops.len(),
            bytes = byte_count,
            keys = updated.len(),
            marker = ?marker_version,
            "Committing index batch"
        );

        let space: Arc<dyn KeySpace> = Arc::clone(&self.space);
        let result = tokio::task::spawn_blocking(move || space.batch(&ops))
            .await
            .map_err(IndexError::from)
            .and_then(|result| result.map_err(IndexError::from));
        if let Err(e) = result {
            // The lost operations must be rederived; keep the marker where it is
            self.progress.freeze();
            error!(index = %self.name, queued = self.queued(), error = %e, "Failed to commit index batch");
            self.set_last_error(Some(e.to_string()));
            return Err(e);
        }

        self.set_last_error(None);
        self.invalidate(updated.keys());
        if let Some(version) = marker_version {
            self.progress.mark_written(version);
        }
        self.start_round(progress, updated, previous);
        Ok(())
    }

    fn start_round(
        self: &Arc<Self>,
        progress: u64,
        updated: IndexMap<KeyValue, EntryUpdate>,
        previous: HashMap<KeyValue, PreviousState>,
    ) {
        let prior = self.progress.take_round();
        let index = Arc::clone(self);
        self.progress.set_round(tokio::spawn(async move {
            if let Some(prior) = prior {
                let _ = prior.await;
            }
            index.send_updates(progress, updated, previous).await;
            index.progress.queue(progress);
        }));
    }

    /// Notify listeners of every updated key, most recently touched first,
    /// and resolve once all of them have accepted.
    async fn send_updates(
        &self,
        progress: u64,
        updated: IndexMap<KeyValue, EntryUpdate>,
        mut previous: HashMap<KeyValue, PreviousState>,
    ) {
        let listeners = self.listeners.live();
        if listeners.is_empty() || updated.is_empty() {
            return;
        }

        let version = self.progress.next_notification_version(progress);
        let token = format!("{}@{}", self.name, version);
        let mut signals = Vec::with_capacity(updated.len() * listeners.len());
        for (key, update) in updated.into_iter().rev() {
            let mut event = ChangeEvent::new(key.clone(), version)
                .with_sources(update.sources)
                .with_source(token.clone())
                .with_triggers(update.triggers);
            if let Some(state) = previous.remove(&key) {
                event = event.with_previous_state(state);
            }
            for listener in &listeners {
                let listener = Arc::clone(listener);
                let event = event.clone();
                let name = self.name.as_str();
                signals.push(async move {
                    let key = event.id.clone();
                    if let Err(e) = listener.changed(event).await {
                        warn!(index = %name, key = %key, error = %e, "Downstream listener failed");
                    }
                });
            }
        }
        join_all(signals).await;
    }

    /// Wait for the current notification round, then write the progress
    /// it released on its own.
    pub(crate) async fn finish_round(&self) -> Result<(), IndexError> {
        if let Some(round) = self.progress.take_round() {
            if let Err(e) = round.await {
                warn!(index = %self.name, error = %e, "Notification round failed");
            }
        }

        let Some(marker) = self.progress.take_ready() else {
            return Ok(());
        };
        let version = marker.last_indexed_version;
        let op = marker.to_op()?;
        let space: Arc<dyn KeySpace> = Arc::clone(&self.space);
        tokio::task::spawn_blocking(move || space.batch(&[op])).await??;
        self.progress.mark_written(version);
        debug!(index = %self.name, version, "Recorded index progress");
        Ok(())
    }
}

fn ready_state(values: Vec<Value>) -> PreviousState {
    PreviousState::Ready((!values.is_empty()).then_some(Value::Array(values)))
}
