//! Property-based test generators using proptest.
//!
//! Provides strategies for rows, queued writes and backend fault plans.

use crate::fixtures::{conversation, message, profile, task};
use proptest::prelude::*;
use serde_json::Value;
use tidepool_protocol::{MutationAction, Priority, Table};

/// Strategy for synced tables.
pub fn table_strategy() -> impl Strategy<Value = Table> {
    prop::sample::select(Table::ALL.to_vec())
}

/// Strategy for row ids.
pub fn entity_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z0-9]{4,12}").expect("Invalid regex")
}

/// Strategy for short human-readable text.
pub fn text_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z ]{0,40}").expect("Invalid regex")
}

/// Strategy for a valid row of `table` with the given id.
pub fn row_strategy(table: Table, id: String) -> impl Strategy<Value = Value> {
    text_strategy().prop_map(move |text| match table {
        Table::Profiles => profile(&id, &text),
        Table::Conversations => conversation(&id, &text, "u-1"),
        Table::Messages => message(&id, "c-1", "u-1", &text),
        Table::Tasks => task(&id, "u-1", &text),
    })
}

/// Strategy for mutation actions.
pub fn action_strategy() -> impl Strategy<Value = MutationAction> {
    prop_oneof![
        Just(MutationAction::Create),
        Just(MutationAction::Update),
        Just(MutationAction::Delete),
    ]
}

/// Strategy for mutation priorities.
pub fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop_oneof![Just(Priority::High), Just(Priority::Normal), Just(Priority::Low)]
}

/// A local write to feed into the queue.
#[derive(Debug, Clone)]
pub struct QueuedWrite {
    /// Target table.
    pub table: Table,
    /// Row id.
    pub id: String,
    /// Kind of write.
    pub action: MutationAction,
    /// Row payload.
    pub payload: Value,
    /// Queue priority.
    pub priority: Priority,
}

/// Strategy for a single queued write with a valid payload.
pub fn queued_write_strategy() -> impl Strategy<Value = QueuedWrite> {
    (table_strategy(), entity_id_strategy())
        .prop_flat_map(|(table, id)| {
            (
                Just(table),
                Just(id.clone()),
                action_strategy(),
                row_strategy(table, id),
                priority_strategy(),
            )
        })
        .prop_map(|(table, id, action, payload, priority)| QueuedWrite {
            table,
            id,
            action,
            payload,
            priority,
        })
}

/// Strategy for a batch of queued writes.
pub fn queued_writes_strategy(max: usize) -> impl Strategy<Value = Vec<QueuedWrite>> {
    prop::collection::vec(queued_write_strategy(), 1..=max.max(1))
}

/// What the backend does during one processing round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendFault {
    /// Calls succeed.
    Healthy,
    /// The next `n` pushes fail with a retryable error.
    FailPushes(u32),
    /// The backend is unreachable for the round.
    Offline,
}

/// Strategy for a sequence of per-round backend behaviors.
pub fn fault_plan_strategy(rounds: usize) -> impl Strategy<Value = Vec<BackendFault>> {
    prop::collection::vec(
        prop_oneof![
            3 => Just(BackendFault::Healthy),
            2 => (1u32..4).prop_map(BackendFault::FailPushes),
            1 => Just(BackendFault::Offline),
        ],
        rounds,
    )
}

/// Configuration for property-based tests.
#[derive(Debug, Clone, Copy)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self { cases: 64 }
    }
}

impl PropTestConfig {
    /// A small configuration for engine-level properties.
    pub fn quick() -> Self {
        Self { cases: 16 }
    }

    /// Converts to a proptest configuration.
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig::with_cases(self.cases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_protocol::Record;

    proptest! {
        #![proptest_config(PropTestConfig::default().to_proptest_config())]

        #[test]
        fn generated_rows_decode(write in queued_write_strategy()) {
            let record = Record::decode(write.table, &write.payload);
            prop_assert!(record.is_ok());
            let record = record.unwrap();
            prop_assert_eq!(record.id(), write.id.as_str());
        }

        #[test]
        fn fault_plans_have_requested_length(plan in fault_plan_strategy(5)) {
            prop_assert_eq!(plan.len(), 5);
        }
    }
}
