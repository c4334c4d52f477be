//! Batch scheduler: one run per index drains the queue in passes.
//!
//! A pass snapshots the queue and dispatches recomputes onto a `JoinSet`.
//! After each window of dispatches it waits for them, commits, and re-samples
//! CPU usage to size the next window. The run repeats passes until a pass
//! ends with an empty queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::IndexError;
use crate::index::KeyIndex;
use crate::recompute::Outcome;
use crate::source::Readable;
use crate::state::{IndexState, RunSummary};
use crate::throttle::AdaptiveWindow;

impl KeyIndex {
    fn current_nice(&self) -> Duration {
        self.lock_scheduler().nice
    }

    async fn nice_delay(&self) {
        let nice = self.current_nice();
        if nice.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(nice).await;
        }
    }

    fn set_state(&self, state: IndexState) {
        self.state_tx.send_modify(|run| run.state = state);
    }

    async fn collect(in_flight: &mut JoinSet<Outcome>, summary: &mut RunSummary) {
        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(Outcome::Applied) => summary.processed += 1,
                Ok(Outcome::Stale) => summary.stale += 1,
                Ok(Outcome::Failed) => summary.failed += 1,
                Err(e) => {
                    warn!(error = %e, "Recompute task aborted");
                    summary.failed += 1;
                }
            }
        }
    }

    /// One drain-and-commit pass over a snapshot of the queue.
    async fn process_queue(
        self: &Arc<Self>,
        window: &mut AdaptiveWindow,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, IndexError> {
        let mut summary = RunSummary::default();
        self.nice_delay().await;

        let batch = self.lock_queue().snapshot();
        let mut in_flight = JoinSet::new();
        let mut dispatched = 0;

        for (id, request) in batch {
            if cancel.is_cancelled() {
                info!(index = %self.name, "Canceling current indexing process");
                // Dispatched work still lands in the buffer for the next run
                Self::collect(&mut in_flight, &mut summary).await;
                summary.cancelled = true;
                return Ok(summary);
            }

            in_flight.spawn(Arc::clone(self).recompute(id, request));
            dispatched += 1;
            // Dispatched work gets to start before the next cancellation check
            tokio::task::yield_now().await;

            if dispatched >= window.limit() {
                Self::collect(&mut in_flight, &mut summary).await;
                self.commit().await?;
                summary.commits += 1;
                window.sample();
                dispatched = 0;
                self.nice_delay().await;
            }
        }

        Self::collect(&mut in_flight, &mut summary).await;
        self.commit().await?;
        summary.commits += 1;
        self.finish_round().await?;
        Ok(summary)
    }

    /// Body of one run, spawned by `request_processing`.
    pub(crate) async fn run(self: Arc<Self>, run_id: u64, cancel: CancellationToken) {
        // Upstream indices finish their own runs first
        self.source.when_processing_complete().await;
        self.set_state(IndexState::Processing);

        let mut window = AdaptiveWindow::new(&self.config);
        let mut summary = RunSummary::default();

        loop {
            let queued = self.queued();
            info!(
                index = %self.name,
                queued,
                "Indexing {} {} for {}",
                queued,
                self.source.name(),
                self.name
            );

            match self.process_queue(&mut window, &cancel).await {
                Ok(pass) => summary.absorb(pass),
                Err(e) => {
                    error!(
                        index = %self.name,
                        remaining = self.queued(),
                        error = %e,
                        "Error indexing {}",
                        self.name
                    );
                    summary.commit_error = Some(e.to_string());
                }
            }
            self.set_state(IndexState::Processed);

            let mut scheduler = self.lock_scheduler();
            let stop = summary.cancelled || summary.commit_error.is_some();
            if stop || self.lock_queue().is_empty() {
                scheduler.active = false;
                let finished = summary.clone();
                self.state_tx.send_modify(|state| {
                    state.state = IndexState::Ready;
                    state.active = false;
                    state.completed_runs = run_id;
                    state.last_summary = Some(finished);
                });
                break;
            }
            drop(scheduler);
            self.set_state(IndexState::Processing);
        }

        info!(
            index = %self.name,
            processed = summary.processed,
            failed = summary.failed,
            stale = summary.stale,
            commits = summary.commits,
            cancelled = summary.cancelled,
            "Finished indexing"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexingConfig;
    use crate::mapping::{IndexEntry, Mapped};
    use crate::request::ChangeEvent;
    use crate::source::Source;
    use crate::source::{ChangeListener, ChangeSet};
    use crate::testing::{MemoryKeySpace, MemorySource};
    use async_trait::async_trait;
    use keyindex_storage::KeyValue;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{OnceLock, Weak};

    /// Source that cancels the index reading it on its first fetch.
    struct CancellingSource {
        inner: Arc<MemorySource>,
        index: OnceLock<Weak<KeyIndex>>,
        armed: AtomicBool,
    }

    #[async_trait]
    impl Readable for CancellingSource {
        async fn when_processing_complete(&self) {}
    }

    #[async_trait]
    impl Source for CancellingSource {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn fetch(&self, id: &KeyValue) -> Result<Option<Value>, IndexError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                if let Some(index) = self.index.get().and_then(Weak::upgrade) {
                    index.cancel_indexing();
                }
            }
            self.inner.fetch(id).await
        }

        async fn changed_since(&self, version: u64) -> Result<ChangeSet, IndexError> {
            self.inner.changed_since(version).await
        }

        fn subscribe(&self, listener: Weak<dyn ChangeListener>) {
            self.inner.subscribe(listener);
        }
    }

    fn by_group(data: &Value, _id: &KeyValue) -> anyhow::Result<Mapped> {
        Ok(data["group"].as_i64().map(IndexEntry::key).into())
    }

    fn open_index(source: &Arc<MemorySource>, config: IndexingConfig) -> Arc<KeyIndex> {
        let source: Arc<dyn Source> = source.clone();
        KeyIndex::builder("by_group", source, by_group)
            .config(config)
            .open(Arc::new(MemoryKeySpace::new("by_group")))
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_drains_in_windows() {
        let source = MemorySource::new("items");
        for id in 0..100 {
            source.insert_silently(id, (id + 1) as u64, json!({"group": id % 5}));
        }
        let config = IndexingConfig::default()
            .with_nice(Duration::ZERO)
            .with_concurrency(4)
            .with_initial_cpu_factor(1.0);
        let index = open_index(&source, config);

        for id in 0..100 {
            index.lock_queue().enqueue(ChangeEvent::new(id, (id + 1) as u64));
        }
        let summary = index.request_processing(Duration::ZERO).wait().await.unwrap();

        assert_eq!(summary.processed, 100);
        assert!(summary.commits > 1);
        assert_eq!(index.queued(), 0);
        assert_eq!(index.watermark(), 100);
        assert_eq!(index.last_indexed_version(), 100);
        assert_eq!(index.source_ids(&KeyValue::Int(3)).unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_cancel_leaves_work_queued() {
        let source = MemorySource::new("items");
        for id in 0..10 {
            source.insert_silently(id, (id + 1) as u64, json!({"group": 1}));
        }
        let index = open_index(&source, IndexingConfig::default().with_nice(Duration::from_millis(20)));
        for id in 0..10 {
            index.lock_queue().enqueue(ChangeEvent::new(id, (id + 1) as u64));
        }

        let completion = index.request_processing(Duration::from_millis(20));
        index.cancel_indexing();
        let summary = completion.wait().await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(index.queued(), 10);
        assert_eq!(index.state(), IndexState::Ready);

        // A fresh run picks the work back up
        let summary = index.request_processing(Duration::ZERO).wait().await.unwrap();
        assert!(!summary.cancelled);
        assert_eq!(index.queued(), 0);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let source = MemorySource::new("items");
        source.insert_silently(1, 1, json!({"group": 2}));
        let index = open_index(&source, IndexingConfig::default().with_nice(Duration::ZERO));
        let mut states = index.subscribe_state();

        index.lock_queue().enqueue(ChangeEvent::new(1, 1));
        let completion = index.request_processing(Duration::ZERO);
        assert_eq!(states.borrow_and_update().state, IndexState::Pending);

        completion.wait().await;
        let state = states.borrow_and_update().clone();
        assert_eq!(state.state, IndexState::Ready);
        assert!(!state.active);
        assert_eq!(state.completed_runs, 1);
        assert_eq!(state.last_summary.unwrap().processed, 1);
    }

    #[tokio::test]
    async fn test_cancel_keeps_dispatched_results_for_next_run() {
        let inner = MemorySource::new("items");
        for id in 0..10 {
            inner.insert_silently(id, (id + 1) as u64, json!({"group": 1}));
        }
        let source = Arc::new(CancellingSource {
            inner,
            index: OnceLock::new(),
            armed: AtomicBool::new(true),
        });
        let cancelling: Arc<dyn Source> = source.clone();
        let index = KeyIndex::builder("by_group", cancelling, by_group)
            .config(IndexingConfig::default().with_nice(Duration::ZERO))
            .open(Arc::new(MemoryKeySpace::new("by_group")))
            .unwrap();
        let _ = source.index.set(Arc::downgrade(&index));
        for id in 0..10 {
            index.lock_queue().enqueue(ChangeEvent::new(id, (id + 1) as u64));
        }

        let summary = index.request_processing(Duration::ZERO).wait().await.unwrap();
        assert!(summary.cancelled);
        assert!(summary.processed >= 1);
        assert_eq!(index.queued(), 10 - summary.processed);
        // Recomputed but not yet committed
        assert!(!index.lock_pending().is_empty());
        assert!(index.source_ids(&KeyValue::Int(1)).unwrap().is_empty());

        let summary = index.request_processing(Duration::ZERO).wait().await.unwrap();
        assert!(!summary.cancelled);
        assert_eq!(index.queued(), 0);
        assert!(index.lock_pending().is_empty());
        assert_eq!(index.source_ids(&KeyValue::Int(1)).unwrap().len(), 10);
        assert_eq!(index.last_indexed_version(), 10);
    }
}
