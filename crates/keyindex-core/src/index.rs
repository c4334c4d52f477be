//! `KeyIndex`: a secondary index maintained incrementally over a [`Source`].
//!
//! An index subscribes to its source on open. Every change event lands in
//! the [`IndexQueue`]; a single scheduler run per index drains the queue,
//! recomputes each id's entries, and commits the resulting operations in
//! atomic batches. Committed keys are announced to downstream listeners, so
//! an index can itself be the source of another index.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use keyindex_storage::{KeySpace, KeyValue};

use crate::commit::PendingWrites;
use crate::config::IndexingConfig;
use crate::error::IndexError;
use crate::expiration::{Expirable, ExpirationStrategy};
use crate::mapping::IndexBy;
use crate::progress::ProgressTracker;
use crate::queue::IndexQueue;
use crate::registry::IndexStatus;
use crate::request::ChangeEvent;
use crate::source::{ChangeListener, ChangeSet, ChangedId, Listeners, Readable, Source};
use crate::state::{Completion, IndexState, RunState};

/// Scheduler bookkeeping guarded by one lock: only one run may be active.
pub(crate) struct SchedulerState {
    pub(crate) active: bool,
    pub(crate) nice: Duration,
    pub(crate) run_id: u64,
    pub(crate) cancel: CancellationToken,
}

/// Builder for [`KeyIndex`].
pub struct KeyIndexBuilder {
    name: String,
    source: Arc<dyn Source>,
    index_by: Arc<dyn IndexBy>,
    config: IndexingConfig,
    expiration: Option<Arc<ExpirationStrategy>>,
}

impl KeyIndexBuilder {
    pub fn config(mut self, config: IndexingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn expiration(mut self, expiration: Arc<ExpirationStrategy>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Create the index over `space` and subscribe it to its source.
    ///
    /// Call [`KeyIndex::resume`] afterwards to catch up with changes made
    /// while the index was not running.
    pub fn open(self, space: Arc<dyn KeySpace>) -> Result<Arc<KeyIndex>, IndexError> {
        self.config.validate().map_err(IndexError::Config)?;

        let (state_tx, _) = watch::channel(RunState::default());
        let nice = self.config.default_nice();
        let index = Arc::new_cyclic(|self_ref| KeyIndex {
            name: self.name,
            source: self.source,
            index_by: self.index_by,
            config: self.config,
            space,
            expiration: self.expiration,
            self_ref: self_ref.clone(),
            queue: Mutex::new(IndexQueue::new()),
            pending: Mutex::new(PendingWrites::default()),
            watermark: AtomicU64::new(0),
            progress: ProgressTracker::new(),
            scheduler: Mutex::new(SchedulerState {
                active: false,
                nice,
                run_id: 0,
                cancel: CancellationToken::new(),
            }),
            state_tx,
            listeners: Listeners::new(),
            cache: DashMap::new(),
            cache_epoch: AtomicU64::new(0),
            last_error: Mutex::new(None),
        });

        let weak: Weak<KeyIndex> = Arc::downgrade(&index);
        let listener: Weak<dyn ChangeListener> = weak;
        index.source.subscribe(listener);

        info!(index = %index.name, source = %index.source.name(), "Opened index");
        Ok(index)
    }
}

/// Secondary index over one source.
pub struct KeyIndex {
    pub(crate) name: String,
    pub(crate) source: Arc<dyn Source>,
    pub(crate) index_by: Arc<dyn IndexBy>,
    pub(crate) config: IndexingConfig,
    pub(crate) space: Arc<dyn KeySpace>,
    pub(crate) expiration: Option<Arc<ExpirationStrategy>>,
    pub(crate) self_ref: Weak<KeyIndex>,
    pub(crate) queue: Mutex<IndexQueue>,
    /// Operations Buffer and Updated-Entries Map
    pub(crate) pending: Mutex<PendingWrites>,
    /// Highest version whose recompute has completed
    pub(crate) watermark: AtomicU64,
    pub(crate) progress: ProgressTracker,
    pub(crate) scheduler: Mutex<SchedulerState>,
    pub(crate) state_tx: watch::Sender<RunState>,
    pub(crate) listeners: Listeners,
    /// Resolved values per index key
    pub(crate) cache: DashMap<KeyValue, Arc<Vec<Value>>>,
    /// Bumped by every invalidation; reads started before a bump are not cached
    pub(crate) cache_epoch: AtomicU64,
    pub(crate) last_error: Mutex<Option<String>>,
}

impl KeyIndex {
    pub fn builder(
        name: impl Into<String>,
        source: Arc<dyn Source>,
        index_by: impl IndexBy + 'static,
    ) -> KeyIndexBuilder {
        KeyIndexBuilder {
            name: name.into(),
            source,
            index_by: Arc::new(index_by),
            config: IndexingConfig::default(),
            expiration: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &IndexingConfig {
        &self.config
    }

    pub(crate) fn lock_queue(&self) -> MutexGuard<'_, IndexQueue> {
        self.queue.lock().expect("index queue mutex poisoned")
    }

    pub(crate) fn lock_pending(&self) -> MutexGuard<'_, PendingWrites> {
        self.pending.lock().expect("pending writes mutex poisoned")
    }

    pub(crate) fn lock_scheduler(&self) -> MutexGuard<'_, SchedulerState> {
        self.scheduler.lock().expect("scheduler mutex poisoned")
    }

    pub(crate) fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock().expect("last error mutex poisoned") = error;
    }

    /// Number of ids waiting to be recomputed
    pub fn queued(&self) -> usize {
        self.lock_queue().len()
    }

    /// Highest version whose recompute has completed; not necessarily durable.
    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::SeqCst)
    }

    /// Progress marker value last written to disk
    pub fn last_indexed_version(&self) -> u64 {
        self.progress.persisted()
    }

    pub fn state(&self) -> IndexState {
        self.state_tx.borrow().state
    }

    /// Observe run state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.state_tx.subscribe()
    }

    pub fn status(&self) -> IndexStatus {
        IndexStatus {
            name: self.name.clone(),
            queued: self.queued(),
            state: self.state(),
            last_indexed_version: self.last_indexed_version(),
            watermark: self.watermark(),
            last_error: self.last_error.lock().expect("last error mutex poisoned").clone(),
        }
    }

    /// Subscribe a downstream consumer to committed key changes.
    pub fn attach(&self, downstream: Weak<dyn ChangeListener>) {
        self.listeners.add(downstream);
    }

    /// Queue a change. New ids schedule processing; merges only do so when
    /// no run is active.
    pub fn enqueue(&self, event: ChangeEvent) {
        let is_new = self.lock_queue().enqueue(event);
        if is_new || !self.lock_scheduler().active {
            self.request_processing(self.config.default_nice());
        }
    }

    /// Start a run, or lower the niceness of the active one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request_processing(&self, nice: Duration) -> Completion {
        let mut scheduler = self.lock_scheduler();
        if scheduler.active {
            if nice < scheduler.nice {
                debug!(index = %self.name, nice_ms = nice.as_millis() as u64, "Raising indexing priority");
                scheduler.nice = nice;
            }
            return Completion::new(scheduler.run_id, self.state_tx.subscribe());
        }

        scheduler.active = true;
        scheduler.nice = nice;
        scheduler.run_id += 1;
        scheduler.cancel = CancellationToken::new();
        let run_id = scheduler.run_id;
        let cancel = scheduler.cancel.clone();

        self.state_tx.send_modify(|state| {
            state.state = IndexState::Pending;
            state.active = true;
            state.started_runs = run_id;
        });
        let completion = Completion::new(run_id, self.state_tx.subscribe());
        drop(scheduler);

        if let Some(index) = self.self_ref.upgrade() {
            tokio::spawn(async move { index.run(run_id, cancel).await });
        }
        completion
    }

    /// Ask the active run, if any, to stop between dispatches.
    pub fn cancel_indexing(&self) {
        let scheduler = self.lock_scheduler();
        if scheduler.active {
            scheduler.cancel.cancel();
        }
    }

    /// Wait until every change up to `version` has been recomputed,
    /// processing at top priority if needed.
    pub async fn when_indexed(&self, version: u64) {
        if self.watermark() < version {
            self.request_processing(Duration::ZERO).wait().await;
        }
    }

    /// Wait for the active run, if any, to finish.
    pub async fn when_idle(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|state| !state.active).await;
    }

    pub(crate) fn as_expirable(&self) -> Weak<dyn Expirable> {
        let weak: Weak<KeyIndex> = self.self_ref.clone();
        weak
    }

    /// Invalidate cached values for keys a batch just rewrote.
    pub(crate) fn invalidate<'a>(&self, keys: impl IntoIterator<Item = &'a KeyValue>) {
        self.cache_epoch.fetch_add(1, Ordering::SeqCst);
        for key in keys {
            if self.cache.remove(key).is_some() {
                if let Some(expiration) = &self.expiration {
                    expiration.forget(&self.name, key);
                }
            }
        }
    }

    /// Cache values read since `epoch`, unless an invalidation happened
    /// in between. Returns whether the values were kept.
    pub(crate) fn cache_values(&self, key: &KeyValue, values: &Arc<Vec<Value>>, epoch: u64) -> bool {
        if self.cache_epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        self.cache.insert(key.clone(), Arc::clone(values));
        if self.cache_epoch.load(Ordering::SeqCst) != epoch {
            self.cache.remove(key);
            return false;
        }
        true
    }

    pub(crate) fn clear_cache(&self) {
        let keys: Vec<KeyValue> = self.cache.iter().map(|entry| entry.key().clone()).collect();
        self.invalidate(keys.iter());
    }
}

#[async_trait]
impl ChangeListener for KeyIndex {
    async fn changed(&self, event: ChangeEvent) -> Result<(), IndexError> {
        self.enqueue(event);
        Ok(())
    }

    async fn when_settled(&self) {
        Readable::when_fully_readable(self).await
    }
}

#[async_trait]
impl Readable for KeyIndex {
    async fn when_processing_complete(&self) {
        self.when_idle().await
    }

    async fn when_fully_readable(&self) {
        self.when_idle().await;
        for listener in self.listeners.live() {
            listener.when_settled().await;
        }
    }
}

#[async_trait]
impl Source for KeyIndex {
    fn name(&self) -> &str {
        &self.name
    }

    /// Values filed under an index key, absent when there are none.
    async fn fetch(&self, key: &KeyValue) -> Result<Option<Value>, IndexError> {
        let values = self.values(key).await?;
        if values.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Value::Array(Vec::clone(&values))))
        }
    }

    async fn changed_since(&self, version: u64) -> Result<ChangeSet, IndexError> {
        let notified = self.progress.notified();
        if version > 0 && version <= notified {
            return Ok(ChangeSet::incremental(Vec::new()));
        }
        // Either a fresh consumer or one that saw versions this index no
        // longer remembers: list every key.
        let version = notified.max(1);
        let entries = self
            .index_keys(crate::read::KeyRange::all())
            .await?
            .into_iter()
            .map(|id| ChangedId { id, version })
            .collect();
        Ok(ChangeSet::full_reset(entries))
    }

    fn subscribe(&self, listener: Weak<dyn ChangeListener>) {
        self.attach(listener);
    }
}

impl Expirable for KeyIndex {
    fn expire(&self, key: &KeyValue) {
        self.cache.remove(key);
    }
}
