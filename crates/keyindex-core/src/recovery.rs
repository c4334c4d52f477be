//! Startup recovery and full rebuilds.
//!
//! On resume the persisted progress marker is compared with what the source
//! reports as changed since then:
//!
//! | marker | changed set          | action                                   |
//! |--------|----------------------|------------------------------------------|
//! | 0      | any                  | clear the namespace, enqueue everything  |
//! | any    | full reset requested | clear the namespace, enqueue everything  |
//! | > 0    | non-empty            | delete entries of changed ids, enqueue   |
//! | > 0    | empty                | nothing to do                            |
//!
//! Entries of changed ids are found by a full scan filtered on the embedded
//! source id, since their old index keys cannot be derived without the
//! values they were computed from.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use keyindex_storage::{BatchOp, EntryKey, KeySpace, KeyValue};

use crate::error::IndexError;
use crate::index::KeyIndex;
use crate::progress::ProgressMarker;
use crate::request::ChangeEvent;
use crate::state::Completion;

/// Trigger attached to requests enqueued by recovery
pub const INITIALIZING_TRIGGER: &str = "is-initializing";

/// Which recovery branch ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKind {
    /// Namespace cleared and rebuilt from scratch
    Rebuilt,
    /// Entries of changed ids removed and re-enqueued
    CaughtUp,
    /// Nothing changed since the marker
    UpToDate,
}

/// Result of [`KeyIndex::resume`].
#[derive(Debug)]
pub struct Recovery {
    pub kind: RecoveryKind,
    /// Marker found on disk
    pub marker: u64,
    pub enqueued: usize,
    /// Completion of the catch-up run, if one was requested
    pub completion: Option<Completion>,
}

impl Recovery {
    /// Wait for the catch-up run, if any.
    pub async fn wait(self) {
        if let Some(completion) = self.completion {
            completion.wait().await;
        }
    }
}

/// Delete every entry whose source id is in `ids`, in bounded batches.
fn delete_entries_of(
    space: &dyn KeySpace,
    ids: &HashSet<KeyValue>,
    batch_size: usize,
) -> Result<usize, IndexError> {
    let mut batch = Vec::with_capacity(batch_size);
    let mut deleted = 0;
    for item in space.scan(&[], None, false)? {
        let (key, _) = item?;
        if !EntryKey::is_entry_key(&key) {
            continue;
        }
        let entry = match EntryKey::from_bytes(&key) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(space = %space.name(), error = %e, "Skipping undecodable index key");
                continue;
            }
        };
        if ids.contains(&entry.source_id) {
            batch.push(BatchOp::delete(key));
            if batch.len() >= batch_size {
                deleted += batch.len();
                space.batch(&batch)?;
                batch.clear();
            }
        }
    }
    if !batch.is_empty() {
        deleted += batch.len();
        space.batch(&batch)?;
    }
    Ok(deleted)
}

impl KeyIndex {
    /// Catch up with changes made while the index was not running.
    ///
    /// Returns once the namespace has been prepared and affected ids are
    /// queued; recomputation happens through the normal scheduler.
    pub async fn resume(self: &Arc<Self>) -> Result<Recovery, IndexError> {
        let marker = ProgressMarker::load(self.space.as_ref())?;
        self.progress.restore(marker);
        self.watermark.fetch_max(marker, Ordering::SeqCst);

        let changes = self.source.changed_since(marker).await?;

        let kind = if marker == 0 || changes.full_reset {
            info!(
                index = %self.name,
                marker,
                full_reset = changes.full_reset,
                ids = changes.entries.len(),
                "Rebuilding index"
            );
            self.clear_namespace().await?;
            // The cleared namespace took the marker with it
            self.progress.reset();
            self.watermark.store(0, Ordering::SeqCst);
            RecoveryKind::Rebuilt
        } else if !changes.entries.is_empty() {
            let ids: HashSet<KeyValue> = changes.entries.iter().map(|changed| changed.id.clone()).collect();
            let space: Arc<dyn KeySpace> = Arc::clone(&self.space);
            let batch_size = self.config.recovery_batch_size;
            let deleted =
                tokio::task::spawn_blocking(move || delete_entries_of(space.as_ref(), &ids, batch_size)).await??;
            self.clear_cache();
            info!(
                index = %self.name,
                marker,
                ids = changes.entries.len(),
                deleted,
                "Catching up index"
            );
            RecoveryKind::CaughtUp
        } else {
            debug!(index = %self.name, marker, "Index up to date");
            RecoveryKind::UpToDate
        };

        let enqueued = changes.entries.len();
        if enqueued == 0 {
            return Ok(Recovery {
                kind,
                marker,
                enqueued,
                completion: None,
            });
        }

        {
            let mut queue = self.lock_queue();
            for changed in changes.entries {
                if changed.version == 0 {
                    warn!(index = %self.name, id = %changed.id, "Changed id reported without version");
                }
                queue.enqueue(
                    ChangeEvent::new(changed.id, changed.version)
                        .with_source(format!("{}@{}", self.source.name(), changed.version))
                        .with_trigger(INITIALIZING_TRIGGER),
                );
            }
        }
        let completion = self.request_processing(self.config.catch_up_nice());

        Ok(Recovery {
            kind,
            marker,
            enqueued,
            completion: Some(completion),
        })
    }

    async fn clear_namespace(&self) -> Result<(), IndexError> {
        let space: Arc<dyn KeySpace> = Arc::clone(&self.space);
        tokio::task::spawn_blocking(move || space.clear()).await??;
        self.clear_cache();
        Ok(())
    }

    /// Throw away the index and rebuild it from the source.
    pub async fn reset_all(self: &Arc<Self>) -> Result<Recovery, IndexError> {
        info!(index = %self.name, "Resetting index");
        self.cancel_indexing();
        self.when_idle().await;

        if let Some(round) = self.progress.take_round() {
            let _ = round.await;
        }
        self.lock_pending().take();
        self.progress.reset();
        self.watermark.store(0, Ordering::SeqCst);

        self.clear_namespace().await?;
        let op = ProgressMarker::new(0).to_op()?;
        let space: Arc<dyn KeySpace> = Arc::clone(&self.space);
        tokio::task::spawn_blocking(move || space.batch(&[op])).await??;

        self.resume().await
    }
}
