//! Registry of open indices for operational introspection.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::index::KeyIndex;
use crate::state::IndexState;

/// Point-in-time status of one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStatus {
    pub name: String,
    /// Ids waiting to be recomputed
    pub queued: usize,
    pub state: IndexState,
    /// Durable progress marker
    pub last_indexed_version: u64,
    pub watermark: u64,
    /// Error of the last failed commit, cleared by the next successful one
    pub last_error: Option<String>,
}

/// Named collection of indices.
#[derive(Default)]
pub struct IndexRegistry {
    indices: RwLock<BTreeMap<String, Arc<KeyIndex>>>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an index under its own name, replacing any previous one.
    pub fn register(&self, index: Arc<KeyIndex>) {
        self.indices
            .write()
            .expect("registry lock poisoned")
            .insert(index.name().to_string(), index);
    }

    pub fn get(&self, name: &str) -> Option<Arc<KeyIndex>> {
        self.indices
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.indices
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Status of every registered index, ordered by name.
    pub fn current_status(&self) -> Vec<IndexStatus> {
        let indices: Vec<Arc<KeyIndex>> = self
            .indices
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        indices.iter().map(|index| index.status()).collect()
    }
}
