//! Collaborator traits between sources and the indices built over them.

use std::sync::{RwLock, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use keyindex_storage::KeyValue;

use crate::error::IndexError;
use crate::request::ChangeEvent;

/// Readiness signals a source exposes to the indices that consume it.
#[async_trait]
pub trait Readable: Send + Sync {
    /// Resolves once the current processing run (if any) has finished.
    async fn when_processing_complete(&self);

    /// Resolves once results are readable everywhere downstream.
    async fn when_fully_readable(&self) {
        self.when_processing_complete().await
    }
}

/// One id reported by [`Source::changed_since`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedId {
    pub id: KeyValue,
    pub version: u64,
}

/// Ids changed after a version, or a request to rebuild from scratch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub entries: Vec<ChangedId>,
    /// The source cannot answer incrementally; every listed id is current.
    pub full_reset: bool,
}

impl ChangeSet {
    pub fn full_reset(entries: Vec<ChangedId>) -> Self {
        Self {
            entries,
            full_reset: true,
        }
    }

    pub fn incremental(entries: Vec<ChangedId>) -> Self {
        Self {
            entries,
            full_reset: false,
        }
    }
}

/// Entities an index can be built over.
#[async_trait]
pub trait Source: Readable {
    fn name(&self) -> &str;

    /// Current value of an entity, `None` if it does not exist
    async fn fetch(&self, id: &KeyValue) -> Result<Option<Value>, IndexError>;

    /// Every id whose version is greater than `version`
    async fn changed_since(&self, version: u64) -> Result<ChangeSet, IndexError>;

    /// Register for change notifications
    fn subscribe(&self, listener: Weak<dyn ChangeListener>);
}

/// Receives change notifications from a [`Source`].
#[async_trait]
pub trait ChangeListener: Send + Sync {
    async fn changed(&self, event: ChangeEvent) -> Result<(), IndexError>;

    /// Resolves once the listener has absorbed everything it was sent.
    async fn when_settled(&self) {}
}

/// Weakly held listener list shared by source implementations.
#[derive(Default)]
pub struct Listeners {
    inner: RwLock<Vec<Weak<dyn ChangeListener>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Weak<dyn ChangeListener>) {
        self.inner
            .write()
            .expect("listeners lock poisoned")
            .push(listener);
    }

    /// Live listeners; dropped ones are pruned.
    pub fn live(&self) -> Vec<std::sync::Arc<dyn ChangeListener>> {
        let mut inner = self.inner.write().expect("listeners lock poisoned");
        inner.retain(|listener| listener.strong_count() > 0);
        inner.iter().filter_map(Weak::upgrade).collect()
    }

    /// True when no registered listener is still alive.
    pub fn is_empty(&self) -> bool {
        !self
            .inner
            .read()
            .expect("listeners lock poisoned")
            .iter()
            .any(|listener| listener.strong_count() > 0)
    }

    /// Deliver one event to every listener, logging failures.
    pub async fn notify(&self, source: &str, event: ChangeEvent) {
        for listener in self.live() {
            if let Err(e) = listener.changed(event.clone()).await {
                warn!(source = %source, id = %event.id, error = %e, "Change listener failed");
            }
        }
    }
}
