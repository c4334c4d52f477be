//! Run state published by each index.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle of an index's processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    /// Idle, results readable
    #[default]
    Ready,
    /// Run requested, waiting on upstream sources
    Pending,
    /// Draining the queue
    Processing,
    /// Queue drained, final bookkeeping in progress
    Processed,
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexState::Ready => write!(f, "ready"),
            IndexState::Pending => write!(f, "pending"),
            IndexState::Processing => write!(f, "processing"),
            IndexState::Processed => write!(f, "processed"),
        }
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Recomputes whose effects were applied
    pub processed: usize,
    /// Recomputes that failed and were dropped from the queue; entries of
    /// their previous state are still removed
    pub failed: usize,
    /// Recomputes abandoned because a newer version arrived
    pub stale: usize,
    pub commits: usize,
    pub cancelled: bool,
    pub commit_error: Option<String>,
}

impl RunSummary {
    pub fn absorb(&mut self, other: RunSummary) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.stale += other.stale;
        self.commits += other.commits;
        self.cancelled |= other.cancelled;
        if other.commit_error.is_some() {
            self.commit_error = other.commit_error;
        }
    }
}

/// Snapshot published on every state change.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub state: IndexState,
    /// A run is in progress (pending or processing)
    pub active: bool,
    pub started_runs: u64,
    pub completed_runs: u64,
    pub last_summary: Option<RunSummary>,
}

/// Resolves when a particular run has finished.
#[derive(Debug, Clone)]
pub struct Completion {
    run_id: u64,
    rx: watch::Receiver<RunState>,
}

impl Completion {
    pub(crate) fn new(run_id: u64, rx: watch::Receiver<RunState>) -> Self {
        Self { run_id, rx }
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Wait for the run and return the summary of the latest finished run.
    pub async fn wait(mut self) -> Option<RunSummary> {
        let run_id = self.run_id;
        match self.rx.wait_for(|state| state.completed_runs >= run_id).await {
            Ok(state) => state.last_summary.clone(),
            Err(_) => None,
        }
    }
}
