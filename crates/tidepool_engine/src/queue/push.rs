//! Push seams of the write queue.

use crate::error::EngineResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tidepool_protocol::OutboundMutation;

/// Result of pushing one mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// The backend accepted the write.
    Synced,
    /// The backend refused the write because the row already exists.
    Conflict {
        /// The server's copy, if returned.
        server_record: Option<Value>,
    },
    /// The push failed.
    Failed {
        /// Error message.
        error: String,
        /// Whether the mutation may be retried.
        retryable: bool,
    },
}

impl MutationOutcome {
    /// Creates a retryable failure.
    pub fn retryable(error: impl Into<String>) -> Self {
        MutationOutcome::Failed {
            error: error.into(),
            retryable: true,
        }
    }

    /// Creates a failure that must not be retried.
    pub fn rejected(error: impl Into<String>) -> Self {
        MutationOutcome::Failed {
            error: error.into(),
            retryable: false,
        }
    }
}

/// Sends batches of mutations to the backend.
#[async_trait]
pub trait MutationPusher: Send + Sync {
    /// Pushes one batch, returning an outcome per mutation id.
    ///
    /// Mutations missing from the result are treated as retryable
    /// failures.
    async fn push_batch(&self, batch: &[OutboundMutation]) -> Vec<(String, MutationOutcome)>;
}

/// Receives flush requests from the queue's timers.
#[async_trait]
pub trait FlushHandler: Send + Sync {
    /// Drains what is ready in the queue.
    async fn flush_requested(&self) -> EngineResult<FlushReport>;
}

/// Summary of one processing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    /// Mutations accepted.
    pub synced: usize,
    /// Mutations settled through conflict resolution.
    pub conflicts: usize,
    /// Mutations scheduled for another attempt.
    pub retried: usize,
    /// Mutations that reached `Failed`.
    pub failed: usize,
    /// The pass did not run because another one was in progress.
    pub deferred: bool,
}

impl FlushReport {
    /// A pass that did not run.
    pub fn deferred() -> Self {
        Self {
            deferred: true,
            ..Self::default()
        }
    }

    /// Mutations that reached a terminal state.
    pub fn settled(&self) -> usize {
        self.synced + self.conflicts + self.failed
    }
}
