//! Progress marker persistence and the state deciding when it may advance.
//!
//! The marker records the highest source version at or below which every
//! entity is durably indexed. A new value only becomes eligible for writing
//! once the notification round for the batch it covers has finished, and it
//! rides along with the next batch (or is written on its own at the end of
//! a pass).

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use keyindex_storage::{BatchOp, KeySpace, PROGRESS_MARKER_KEY};

use crate::error::IndexError;

/// Persisted progress marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressMarker {
    pub last_indexed_version: u64,

    /// When the marker was written (milliseconds since epoch for JSON compatibility)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl ProgressMarker {
    pub fn new(last_indexed_version: u64) -> Self {
        Self {
            last_indexed_version,
            updated_at: Utc::now(),
        }
    }

    /// Serialize to JSON bytes for storage
    pub fn to_bytes(&self) -> Result<Vec<u8>, IndexError> {
        serde_json::to_vec(self).map_err(IndexError::from)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexError> {
        serde_json::from_slice(bytes)
            .map_err(|e| IndexError::Progress(format!("unreadable marker: {}", e)))
    }

    /// Batch operation writing this marker
    pub fn to_op(&self) -> Result<BatchOp, IndexError> {
        Ok(BatchOp::put(PROGRESS_MARKER_KEY.to_vec(), self.to_bytes()?))
    }

    /// Read the marker from a key space; absent means 0.
    pub fn load(space: &dyn KeySpace) -> Result<u64, IndexError> {
        match space.get(PROGRESS_MARKER_KEY)? {
            Some(bytes) => Ok(Self::from_bytes(&bytes)?.last_indexed_version),
            None => Ok(0),
        }
    }
}

#[derive(Default)]
struct TrackerState {
    /// Last value known to be on disk
    persisted: u64,
    /// Eligible value waiting for the next write
    queued: Option<u64>,
    /// Highest version handed to downstream notifications
    notified: u64,
    /// Set after a failed batch: the lost window must be reprocessed on restart
    frozen: bool,
    /// Current notification round
    round: Option<JoinHandle<()>>,
}

/// Shared progress state of one index.
#[derive(Default)]
pub struct ProgressTracker {
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().expect("progress tracker mutex poisoned")
    }

    /// Reset to a marker just read from disk.
    pub fn restore(&self, persisted: u64) {
        let mut state = self.lock();
        state.persisted = persisted;
        state.queued = None;
        state.frozen = false;
        state.notified = state.notified.max(persisted);
    }

    pub fn persisted(&self) -> u64 {
        self.lock().persisted
    }

    pub fn is_frozen(&self) -> bool {
        self.lock().frozen
    }

    pub fn freeze(&self) {
        self.lock().frozen = true;
    }

    /// Make `progress` eligible for the next write.
    pub fn queue(&self, progress: u64) {
        let mut state = self.lock();
        state.queued = Some(state.queued.map_or(progress, |queued| queued.max(progress)));
    }

    /// Take the eligible marker, if it would move the persisted one forward.
    pub fn take_ready(&self) -> Option<ProgressMarker> {
        let mut state = self.lock();
        if state.frozen {
            return None;
        }
        let queued = state.queued.take()?;
        (queued > state.persisted).then(|| ProgressMarker::new(queued))
    }

    pub fn mark_written(&self, version: u64) {
        let mut state = self.lock();
        state.persisted = state.persisted.max(version);
    }

    /// Next version to stamp on outgoing notifications; strictly increasing
    /// and never below `progress`.
    pub fn next_notification_version(&self, progress: u64) -> u64 {
        let mut state = self.lock();
        state.notified = (state.notified + 1).max(progress);
        state.notified
    }

    pub fn notified(&self) -> u64 {
        self.lock().notified
    }

    pub fn take_round(&self) -> Option<JoinHandle<()>> {
        self.lock().round.take()
    }

    pub fn set_round(&self, round: JoinHandle<()>) {
        self.lock().round = Some(round);
    }

    /// Forget everything for a rebuild from version 0.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.persisted = 0;
        state.queued = None;
        state.frozen = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_json_roundtrip() {
        let marker = ProgressMarker::new(42);
        let bytes = marker.to_bytes().unwrap();
        let json = String::from_utf8(bytes.clone()).unwrap();
        assert!(json.contains("\"last_indexed_version\":42"));
        assert!(json.contains("\"updated_at\":"));

        let decoded = ProgressMarker::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.last_indexed_version, 42);
        assert_eq!(
            decoded.updated_at.timestamp_millis(),
            marker.updated_at.timestamp_millis()
        );
    }

    #[test]
    fn test_corrupt_marker() {
        let err = ProgressMarker::from_bytes(b"not json").unwrap_err();
        assert!(matches!(err, IndexError::Progress(_)));
    }

    #[test]
    fn test_take_ready_only_moves_forward() {
        let tracker = ProgressTracker::new();
        tracker.restore(10);

        tracker.queue(8);
        assert!(tracker.take_ready().is_none());

        tracker.queue(12);
        tracker.queue(11);
        let marker = tracker.take_ready().unwrap();
        assert_eq!(marker.last_indexed_version, 12);
        assert!(tracker.take_ready().is_none());

        tracker.mark_written(12);
        assert_eq!(tracker.persisted(), 12);
    }

    #[test]
    fn test_frozen_tracker_withholds_marker() {
        let tracker = ProgressTracker::new();
        tracker.freeze();
        tracker.queue(5);
        assert!(tracker.take_ready().is_none());

        tracker.reset();
        tracker.queue(5);
        assert!(tracker.take_ready().is_some());
    }

    #[test]
    fn test_notification_versions_increase() {
        let tracker = ProgressTracker::new();
        tracker.restore(3);
        assert_eq!(tracker.next_notification_version(0), 4);
        assert_eq!(tracker.next_notification_version(0), 5);
        assert_eq!(tracker.next_notification_version(9), 9);
        assert_eq!(tracker.next_notification_version(9), 10);
    }
}
