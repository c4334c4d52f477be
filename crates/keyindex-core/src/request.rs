//! Change events and the pending index requests built from them.

use std::collections::BTreeSet;
use std::fmt;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;

use keyindex_storage::KeyValue;

/// A previous value that may still be loading.
pub type SharedValue = Shared<BoxFuture<'static, Option<Value>>>;

/// Snapshot of an entity before a change, used only to work out which
/// entries it used to contribute.
#[derive(Clone)]
pub enum PreviousState {
    /// Known value; `None` means the entity did not exist
    Ready(Option<Value>),
    /// Value resolved lazily
    Pending(SharedValue),
}

impl PreviousState {
    pub fn pending<F>(future: F) -> Self
    where
        F: std::future::Future<Output = Option<Value>> + Send + 'static,
    {
        PreviousState::Pending(future.boxed().shared())
    }

    pub async fn resolve(self) -> Option<Value> {
        match self {
            PreviousState::Ready(value) => value,
            PreviousState::Pending(future) => future.await,
        }
    }
}

impl fmt::Debug for PreviousState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreviousState::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            PreviousState::Pending(_) => f.write_str("Pending"),
        }
    }
}

/// Pending work for one source id.
#[derive(Debug, Clone)]
pub struct IndexRequest {
    pub previous_state: Option<PreviousState>,
    pub deleted: bool,
    /// Upstream provenance tokens
    pub sources: BTreeSet<String>,
    pub version: u64,
    /// Cause tokens, for diagnostics and propagation
    pub triggers: BTreeSet<String>,
}

impl IndexRequest {
    pub fn new(version: u64) -> Self {
        Self {
            previous_state: None,
            deleted: false,
            sources: BTreeSet::new(),
            version,
            triggers: BTreeSet::new(),
        }
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.triggers.insert(trigger.into());
        self
    }

    /// Fold a newer change for the same id into this request.
    ///
    /// The version never decreases and the first previous state is kept,
    /// since it describes what is actually on disk.
    pub fn merge(&mut self, event: ChangeEvent) {
        self.version = self.version.max(event.version);
        self.deleted = event.deleted;
        self.sources.extend(event.sources);
        self.triggers.extend(event.triggers);
        if self.previous_state.is_none() {
            self.previous_state = event.previous_state;
        }
    }
}

impl From<ChangeEvent> for IndexRequest {
    fn from(event: ChangeEvent) -> Self {
        Self {
            previous_state: event.previous_state,
            deleted: event.deleted,
            sources: event.sources,
            version: event.version,
            triggers: event.triggers,
        }
    }
}

/// A change notification for one entity.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub id: KeyValue,
    pub version: u64,
    pub deleted: bool,
    pub previous_state: Option<PreviousState>,
    pub sources: BTreeSet<String>,
    pub triggers: BTreeSet<String>,
}

impl ChangeEvent {
    pub fn new(id: impl Into<KeyValue>, version: u64) -> Self {
        Self {
            id: id.into(),
            version,
            deleted: false,
            previous_state: None,
            sources: BTreeSet::new(),
            triggers: BTreeSet::new(),
        }
    }

    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    pub fn with_previous(mut self, previous: Option<Value>) -> Self {
        self.previous_state = Some(PreviousState::Ready(previous));
        self
    }

    pub fn with_previous_state(mut self, previous: PreviousState) -> Self {
        self.previous_state = Some(previous);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.sources.insert(source.into());
        self
    }

    pub fn with_sources(mut self, sources: impl IntoIterator<Item = String>) -> Self {
        self.sources.extend(sources);
        self
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.triggers.insert(trigger.into());
        self
    }

    pub fn with_triggers(mut self, triggers: impl IntoIterator<Item = String>) -> Self {
        self.triggers.extend(triggers);
        self
    }
}

/// Provenance accumulated for one index key since the last notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryUpdate {
    pub sources: BTreeSet<String>,
    pub triggers: BTreeSet<String>,
}

impl EntryUpdate {
    pub fn absorb(&mut self, sources: &BTreeSet<String>, triggers: &BTreeSet<String>) {
        self.sources.extend(sources.iter().cloned());
        self.triggers.extend(triggers.iter().cloned());
    }
}
