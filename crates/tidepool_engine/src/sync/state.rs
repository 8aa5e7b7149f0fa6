//! Sync state machine and counters.

use serde::{Deserialize, Serialize};

/// The current state of the sync coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// No pass has run yet.
    #[default]
    Idle,
    /// Pulling changes from the backend.
    Pulling,
    /// Pushing queued mutations.
    Pushing,
    /// The last pass completed.
    Synced,
    /// The last pass failed.
    Error,
    /// The last request fell inside the minimum interval.
    Throttled,
}

impl SyncState {
    /// Returns true while a pass is running.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Pulling | SyncState::Pushing)
    }
}

/// Options for one sync request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Bypass the minimum interval.
    pub force: bool,
    /// Caller believes this is the first sync. Only honored when the local
    /// store is empty.
    pub is_first_sync: bool,
}

impl SyncOptions {
    /// Options that bypass throttling.
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    /// Passes that completed.
    pub cycles_completed: u64,
    /// Passes that failed.
    pub cycles_failed: u64,
    /// Remote rows applied locally.
    pub records_pulled: u64,
    /// Mutations accepted by the backend.
    pub mutations_pushed: u64,
    /// Pull conflicts resolved.
    pub conflicts_resolved: u64,
    /// Push retries.
    pub retries: u64,
    /// Requests skipped by the minimum interval.
    pub throttled: u64,
    /// Requests skipped because a pass was running.
    pub contended: u64,
    /// Passes abandoned at the lock timeout.
    pub forced_releases: u64,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Status published to the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Current state.
    pub state: SyncState,
    /// Failed passes since the last success.
    pub consecutive_failures: u32,
    /// Time of the last successful pass in milliseconds.
    pub last_success_at: Option<i64>,
    /// Current cursor value.
    pub cursor: u64,
    /// Actionable message, set once failures cross the alert threshold.
    pub message: Option<String>,
}

impl SyncStatus {
    /// Returns true if the status carries an actionable alert.
    pub fn needs_attention(&self) -> bool {
        self.message.is_some()
    }
}
