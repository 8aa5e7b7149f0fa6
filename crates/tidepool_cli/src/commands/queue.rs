//! Queue command implementation.

use super::{open_queue, open_store};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use tidepool_engine::QueueConfig;
use tidepool_protocol::timestamp::millis_to_canonical;
use tidepool_protocol::{MutationStatus, OutboundMutation};

/// One listed mutation.
#[derive(Debug, Serialize)]
pub struct QueueEntry {
    /// Mutation id.
    pub id: String,
    /// Target table.
    pub table: String,
    /// Row id.
    pub entity_id: String,
    /// Kind of write.
    pub action: String,
    /// Priority tier.
    pub priority: String,
    /// Lifecycle state.
    pub status: MutationStatus,
    /// Creation time.
    pub created_at: String,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Last push error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Row payload (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl QueueEntry {
    fn from_mutation(mutation: OutboundMutation, with_payload: bool) -> Self {
        Self {
            id: mutation.id,
            table: mutation.entity_type.to_string(),
            entity_id: mutation.entity_id,
            action: format!("{:?}", mutation.action).to_lowercase(),
            priority: format!("{:?}", mutation.priority).to_lowercase(),
            status: mutation.status,
            created_at: millis_to_canonical(mutation.created_at),
            retry_count: mutation.retry_count,
            last_error: mutation.last_error,
            payload: with_payload.then_some(mutation.payload),
        }
    }
}

/// Loads persisted mutations in push order.
pub fn collect(
    path: &Path,
    status: Option<MutationStatus>,
    with_payloads: bool,
) -> Result<Vec<QueueEntry>, Box<dyn std::error::Error>> {
    let queue = open_queue(open_store(path)?, QueueConfig::default())?;
    Ok(queue
        .mutations(status)
        .into_iter()
        .map(|m| QueueEntry::from_mutation(m, with_payloads))
        .collect())
}

/// Runs the queue command.
pub fn run(
    path: &Path,
    status: Option<MutationStatus>,
    with_payloads: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let entries = collect(path, status, with_payloads)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            print_text_output(&entries);
        }
    }

    Ok(())
}

fn print_text_output(entries: &[QueueEntry]) {
    if entries.is_empty() {
        println!("Queue is empty");
        return;
    }

    println!(
        "{:<38} {:<14} {:<8} {:<7} {:<8} {:>7}  ENTITY",
        "ID", "TABLE", "ACTION", "PRIO", "STATUS", "RETRIES"
    );
    for entry in entries {
        println!(
            "{:<38} {:<14} {:<8} {:<7} {:<8} {:>7}  {}",
            entry.id,
            entry.table,
            entry.action,
            entry.priority,
            format!("{:?}", entry.status).to_lowercase(),
            entry.retry_count,
            entry.entity_id,
        );
        if let Some(error) = &entry.last_error {
            println!("    last error: {error}");
        }
        if let Some(payload) = &entry.payload {
            println!("    payload: {payload}");
        }
    }
    println!();
    println!("{} mutation(s)", entries.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tidepool_protocol::{MutationAction, Priority, Table};
    use tidepool_storage::FileStore;

    #[test]
    fn lists_persisted_mutations_in_push_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tidepool.json");
        {
            let store = Arc::new(FileStore::open(&path).unwrap());
            let queue = open_queue(store, QueueConfig::default()).unwrap();
            queue
                .enqueue(
                    Table::Tasks,
                    "t-1",
                    MutationAction::Update,
                    json!({"id": "t-1"}),
                    Priority::Low,
                )
                .unwrap();
            queue
                .enqueue(
                    Table::Messages,
                    "m-1",
                    MutationAction::Create,
                    json!({"id": "m-1"}),
                    Priority::High,
                )
                .unwrap();
        }

        let entries = collect(&path, None, false).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].entity_id, "m-1");
        assert_eq!(entries[0].priority, "high");
        assert!(entries[0].payload.is_none());

        let failed = collect(&path, Some(MutationStatus::Failed), true).unwrap();
        assert!(failed.is_empty());
    }

    #[test]
    fn missing_store_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(collect(&dir.path().join("absent.json"), None, false).is_err());
    }
}
