//! Per-index queue of pending requests, coalescing repeated changes.
//!
//! Ids are kept in recency order: a new change for an id that is already
//! queued merges into its request and moves it to the back. A secondary
//! ordered set tracks the lowest outstanding version, which bounds how far
//! the progress marker may advance.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::warn;

use keyindex_storage::KeyValue;

use crate::request::{ChangeEvent, IndexRequest};

struct Queued {
    request: IndexRequest,
    seq: u64,
}

/// Coalescing queue of [`IndexRequest`]s keyed by source id.
#[derive(Default)]
pub struct IndexQueue {
    entries: HashMap<KeyValue, Queued>,
    order: BTreeMap<u64, KeyValue>,
    versions: BTreeSet<(u64, KeyValue)>,
    next_seq: u64,
}

impl IndexQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or merge a change. Returns true when the id was not queued.
    pub fn enqueue(&mut self, event: ChangeEvent) -> bool {
        if event.version == 0 {
            warn!(id = %event.id, "Index request missing version");
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let id = event.id.clone();

        match self.entries.get_mut(&id) {
            Some(queued) => {
                self.order.remove(&queued.seq);
                self.versions.remove(&(queued.request.version, id.clone()));

                queued.request.merge(event);
                queued.seq = seq;

                self.order.insert(seq, id.clone());
                self.versions.insert((queued.request.version, id));
                false
            }
            None => {
                let request = IndexRequest::from(event);
                self.order.insert(seq, id.clone());
                self.versions.insert((request.version, id.clone()));
                self.entries.insert(id, Queued { request, seq });
                true
            }
        }
    }

    /// Copy of every queued request in recency order, for one pass.
    ///
    /// Requests stay queued until their recompute removes them.
    pub fn snapshot(&self) -> Vec<(KeyValue, IndexRequest)> {
        self.order
            .values()
            .filter_map(|id| {
                self.entries
                    .get(id)
                    .map(|queued| (id.clone(), queued.request.clone()))
            })
            .collect()
    }

    pub fn version_of(&self, id: &KeyValue) -> Option<u64> {
        self.entries.get(id).map(|queued| queued.request.version)
    }

    pub fn remove(&mut self, id: &KeyValue) -> Option<IndexRequest> {
        let queued = self.entries.remove(id)?;
        self.order.remove(&queued.seq);
        self.versions.remove(&(queued.request.version, id.clone()));
        Some(queued.request)
    }

    /// Remove `id` only if its request is still at `version`.
    pub fn remove_if_version(&mut self, id: &KeyValue, version: u64) -> bool {
        if self.version_of(id) == Some(version) {
            self.remove(id);
            true
        } else {
            false
        }
    }

    /// Lowest version among queued requests
    pub fn min_version(&self) -> Option<u64> {
        self.versions.first().map(|(version, _)| *version)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(queue: &IndexQueue) -> Vec<KeyValue> {
        queue.snapshot().into_iter().map(|(id, _)| id).collect()
    }

    #[test]
    fn test_enqueue_new_and_merge() {
        let mut queue = IndexQueue::new();
        assert!(queue.enqueue(ChangeEvent::new(1, 1)));
        assert!(queue.enqueue(ChangeEvent::new(2, 2)));
        assert!(!queue.enqueue(ChangeEvent::new(1, 3)));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.version_of(&KeyValue::Int(1)), Some(3));
        assert_eq!(ids(&queue), vec![KeyValue::Int(2), KeyValue::Int(1)]);
    }

    #[test]
    fn test_coalescing_unions_provenance() {
        let mut queue = IndexQueue::new();
        queue.enqueue(ChangeEvent::new("a", 4).with_trigger("t1").with_previous(None));
        queue.enqueue(ChangeEvent::new("a", 6).with_trigger("t2").with_source("s"));
        queue.enqueue(ChangeEvent::new("a", 5).with_trigger("t3"));

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 1);
        let request = &snapshot[0].1;
        assert_eq!(request.version, 6);
        assert_eq!(request.triggers.len(), 3);
        assert_eq!(request.sources.len(), 1);
        assert!(request.previous_state.is_some());
    }

    #[test]
    fn test_min_version_tracks_merges_and_removals() {
        let mut queue = IndexQueue::new();
        assert_eq!(queue.min_version(), None);

        queue.enqueue(ChangeEvent::new(7, 6));
        queue.enqueue(ChangeEvent::new(9, 8));
        assert_eq!(queue.min_version(), Some(6));

        queue.enqueue(ChangeEvent::new(7, 10));
        assert_eq!(queue.min_version(), Some(8));

        queue.remove(&KeyValue::Int(9));
        assert_eq!(queue.min_version(), Some(10));
    }

    #[test]
    fn test_remove_if_version() {
        let mut queue = IndexQueue::new();
        queue.enqueue(ChangeEvent::new(1, 1));
        queue.enqueue(ChangeEvent::new(1, 2));

        assert!(!queue.remove_if_version(&KeyValue::Int(1), 1));
        assert_eq!(queue.len(), 1);
        assert!(queue.remove_if_version(&KeyValue::Int(1), 2));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_zero_version_is_accepted() {
        let mut queue = IndexQueue::new();
        assert!(queue.enqueue(ChangeEvent::new(1, 0)));
        assert_eq!(queue.min_version(), Some(0));
    }
}
