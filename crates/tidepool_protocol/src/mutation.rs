//! Outbound mutations recorded by the offline write queue.

use crate::table::Table;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationAction {
    /// Row was created locally.
    Create,
    /// Row was updated locally.
    Update,
    /// Row was deleted locally.
    Delete,
}

/// Lifecycle of an outbound mutation.
///
/// `Pending` and `Sent` are active states. `Synced` and `Failed` are
/// terminal: a mutation always ends in one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    /// Waiting to be pushed.
    Pending,
    /// Included in an in-flight push.
    Sent,
    /// Exhausted its retries or was rejected as invalid.
    Failed,
    /// Accepted by the backend or superseded by the server copy.
    Synced,
}

impl MutationStatus {
    /// Returns true for `Synced` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MutationStatus::Synced | MutationStatus::Failed)
    }
}

/// Priority tier of a mutation. Higher tiers are pushed first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// User-visible writes such as sent messages.
    High,
    /// Ordinary edits.
    #[default]
    Normal,
    /// Background bookkeeping.
    Low,
}

/// A local write waiting to reach the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMutation {
    /// Unique mutation id.
    pub id: String,
    /// Table the write targets.
    pub entity_type: Table,
    /// Primary key of the written row.
    pub entity_id: String,
    /// Kind of write.
    pub action: MutationAction,
    /// Row payload as written locally (may carry bookkeeping fields).
    pub payload: Value,
    /// Priority tier.
    pub priority: Priority,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: i64,
    /// Number of failed push attempts so far.
    pub retry_count: u32,
    /// Current lifecycle state.
    pub status: MutationStatus,
    /// Enqueue sequence number, used as the FIFO tie-breaker.
    pub sequence: u64,
    /// Earliest time of the next attempt after a failure.
    #[serde(default)]
    pub next_attempt_at: Option<i64>,
    /// Last error seen while pushing.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Time the mutation reached `Synced`.
    #[serde(default)]
    pub synced_at: Option<i64>,
}

impl OutboundMutation {
    /// Creates a pending mutation with a fresh id.
    pub fn new(
        entity_type: Table,
        entity_id: impl Into<String>,
        action: MutationAction,
        payload: Value,
        priority: Priority,
        created_at: i64,
        sequence: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type,
            entity_id: entity_id.into(),
            action,
            payload,
            priority,
            created_at,
            retry_count: 0,
            status: MutationStatus::Pending,
            sequence,
            next_attempt_at: None,
            last_error: None,
            synced_at: None,
        }
    }

    /// Returns true while the mutation still belongs to the active queue.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Ordering key: priority tier first, then enqueue order.
    pub fn queue_key(&self) -> (Priority, u64) {
        (self.priority, self.sequence)
    }

    /// Returns true if the mutation may be attempted at `now`.
    pub fn is_ready(&self, now: i64) -> bool {
        self.status == MutationStatus::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Produces the compact record kept after archiving.
    pub fn summary(&self) -> MutationSummary {
        MutationSummary {
            id: self.id.clone(),
            entity_type: self.entity_type,
            entity_id: self.entity_id.clone(),
            action: self.action,
            created_at: self.created_at,
            synced_at: self.synced_at,
            retry_count: self.retry_count,
        }
    }
}

/// Compact archive record of a synced mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationSummary {
    /// Mutation id.
    pub id: String,
    /// Table the write targeted.
    pub entity_type: Table,
    /// Primary key of the written row.
    pub entity_id: String,
    /// Kind of write.
    pub action: MutationAction,
    /// Creation time in milliseconds.
    pub created_at: i64,
    /// Time the mutation reached `Synced`.
    pub synced_at: Option<i64>,
    /// Attempts it took.
    pub retry_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mutation(priority: Priority, sequence: u64) -> OutboundMutation {
        OutboundMutation::new(
            Table::Messages,
            "m-1",
            MutationAction::Create,
            json!({"id": "m-1"}),
            priority,
            1_000,
            sequence,
        )
    }

    #[test]
    fn new_mutation_is_pending() {
        let m = mutation(Priority::Normal, 1);
        assert_eq!(m.status, MutationStatus::Pending);
        assert_eq!(m.retry_count, 0);
        assert!(m.is_active());
        assert!(m.is_ready(0));
        assert!(!m.id.is_empty());
    }

    #[test]
    fn queue_key_orders_priority_then_fifo() {
        let mut items = [
            mutation(Priority::Low, 1),
            mutation(Priority::High, 3),
            mutation(Priority::Normal, 2),
            mutation(Priority::High, 2),
        ];
        items.sort_by_key(OutboundMutation::queue_key);
        let keys: Vec<_> = items.iter().map(OutboundMutation::queue_key).collect();
        assert_eq!(
            keys,
            vec![
                (Priority::High, 2),
                (Priority::High, 3),
                (Priority::Normal, 2),
                (Priority::Low, 1)
            ]
        );
    }

    #[test]
    fn backoff_gate() {
        let mut m = mutation(Priority::Normal, 1);
        m.next_attempt_at = Some(5_000);
        assert!(!m.is_ready(4_999));
        assert!(m.is_ready(5_000));
    }

    #[test]
    fn terminal_states() {
        assert!(MutationStatus::Synced.is_terminal());
        assert!(MutationStatus::Failed.is_terminal());
        assert!(!MutationStatus::Sent.is_terminal());
    }
}
