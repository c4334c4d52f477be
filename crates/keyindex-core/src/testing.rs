//! In-memory collaborators for tests.
//!
//! Enabled for this crate's own tests and, through the `test-support`
//! feature, for downstream test crates.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use serde_json::Value;

use keyindex_storage::{BatchOp, KeySpace, KeyValue, ScanItem, ScanIter, StorageError};

use crate::error::IndexError;
use crate::request::ChangeEvent;
use crate::source::{ChangeListener, ChangeSet, ChangedId, Listeners, Readable, Source};

#[derive(Default)]
struct SourceState {
    /// id -> (version, value); `None` marks a deletion
    entities: BTreeMap<KeyValue, (u64, Option<Value>)>,
    version: u64,
    full_reset: bool,
    failing_fetches: usize,
}

/// Versioned in-memory entity source.
pub struct MemorySource {
    name: String,
    state: Mutex<SourceState>,
    listeners: Listeners,
}

impl MemorySource {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(SourceState::default()),
            listeners: Listeners::new(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SourceState> {
        self.state.lock().expect("memory source mutex poisoned")
    }

    /// Store a value at an explicit version without notifying anyone.
    pub fn insert_silently(&self, id: impl Into<KeyValue>, version: u64, value: Value) {
        let mut state = self.lock();
        state.entities.insert(id.into(), (version, Some(value)));
        state.version = state.version.max(version);
    }

    pub async fn put(&self, id: impl Into<KeyValue>, value: Value) -> u64 {
        self.write(id.into(), Some(value)).await
    }

    pub async fn delete(&self, id: impl Into<KeyValue>) -> u64 {
        self.write(id.into(), None).await
    }

    async fn write(&self, id: KeyValue, value: Option<Value>) -> u64 {
        let deleted = value.is_none();
        let (version, previous) = {
            let mut state = self.lock();
            state.version += 1;
            let version = state.version;
            let previous = state
                .entities
                .insert(id.clone(), (version, value))
                .and_then(|(_, value)| value);
            (version, previous)
        };

        let mut event = ChangeEvent::new(id, version)
            .with_previous(previous)
            .with_source(format!("{}@{}", self.name, version));
        if deleted {
            event = event.deleted();
        }
        self.listeners.notify(&self.name, event).await;
        version
    }

    /// Make the next `count` fetches fail.
    pub fn fail_next_fetches(&self, count: usize) {
        self.lock().failing_fetches = count;
    }

    /// Answer every `changed_since` with a full reset.
    pub fn set_full_reset(&self, full_reset: bool) {
        self.lock().full_reset = full_reset;
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }
}

#[async_trait]
impl Readable for MemorySource {
    async fn when_processing_complete(&self) {}
}

#[async_trait]
impl Source for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, id: &KeyValue) -> Result<Option<Value>, IndexError> {
        let mut state = self.lock();
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(IndexError::Source(format!("injected fetch failure for {}", id)));
        }
        Ok(state.entities.get(id).and_then(|(_, value)| value.clone()))
    }

    async fn changed_since(&self, version: u64) -> Result<ChangeSet, IndexError> {
        let state = self.lock();
        let after = if state.full_reset { 0 } else { version };
        let mut entries: Vec<ChangedId> = state
            .entities
            .iter()
            .filter(|(_, (changed, _))| *changed > after)
            .map(|(id, (changed, _))| ChangedId {
                id: id.clone(),
                version: *changed,
            })
            .collect();
        entries.sort_by_key(|changed| changed.version);
        Ok(ChangeSet {
            entries,
            full_reset: state.full_reset,
        })
    }

    fn subscribe(&self, listener: Weak<dyn ChangeListener>) {
        self.listeners.add(listener);
    }
}

/// Ordered in-memory key space whose batches can be made to fail.
pub struct MemoryKeySpace {
    name: String,
    rows: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    failing: AtomicBool,
}

impl MemoryKeySpace {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rows: RwLock::new(BTreeMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every following batch fail until switched off.
    pub fn fail_batches(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.rows.read().expect("memory key space lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeySpace for MemoryKeySpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .rows
            .read()
            .expect("memory key space lock poisoned")
            .get(key)
            .cloned())
    }

    fn batch(&self, ops: &[BatchOp]) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(format!("injected batch failure in {}", self.name)));
        }
        let mut rows = self.rows.write().expect("memory key space lock poisoned");
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    rows.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key } => {
                    rows.remove(key);
                }
            }
        }
        Ok(())
    }

    fn scan(
        &self,
        lower: &[u8],
        upper: Option<&[u8]>,
        include_values: bool,
    ) -> Result<ScanIter<'_>, StorageError> {
        let rows = self.rows.read().expect("memory key space lock poisoned");
        // Rows are copied out so callers may write while iterating
        let items: Vec<_> = rows
            .range(lower.to_vec()..)
            .take_while(|(key, _)| upper.map_or(true, |upper| key.as_slice() < upper))
            .map(|(key, value)| Ok::<ScanItem, StorageError>((key.clone(), include_values.then(|| value.clone()))))
            .collect();
        Ok(Box::new(items.into_iter()))
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.rows.write().expect("memory key space lock poisoned").clear();
        Ok(())
    }
}

/// Listener recording every event it receives.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ChangeEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().expect("recording listener mutex poisoned").clone()
    }

    pub fn clear(&self) {
        self.events.lock().expect("recording listener mutex poisoned").clear();
    }
}

#[async_trait]
impl ChangeListener for RecordingListener {
    async fn changed(&self, event: ChangeEvent) -> Result<(), IndexError> {
        self.events
            .lock()
            .expect("recording listener mutex poisoned")
            .push(event);
        Ok(())
    }
}
