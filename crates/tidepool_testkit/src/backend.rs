//! A stateful in-memory backend.
//!
//! [`ReferenceBackend`] keeps server rows and a change log in commit order.
//! Pulls replay the log since the requested cursor; pushes merge into the
//! rows and append to the log. Other clients are simulated with
//! [`ReferenceBackend::seed`].

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tidepool_engine::{EngineError, EngineResult, RemoteBackend};
use tidepool_protocol::{
    ChangeSet, PullRequest, PullResponse, PushConflict, PushConflictKind, PushRequest,
    PushResponse, SyncCursor, Table,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
struct LoggedChange {
    sequence: u64,
    table: Table,
    id: String,
    kind: ChangeKind,
}

#[derive(Debug, Default)]
struct ServerState {
    rows: BTreeMap<(Table, String), Value>,
    log: Vec<LoggedChange>,
    cursor: u64,
}

impl ServerState {
    fn record(&mut self, table: Table, id: String, kind: ChangeKind) {
        self.cursor += 1;
        self.log.push(LoggedChange {
            sequence: self.cursor,
            table,
            id,
            kind,
        });
    }

    fn upsert(&mut self, table: Table, id: String, row: Value) {
        let key = (table, id.clone());
        let kind = match self.rows.get_mut(&key) {
            Some(existing) => {
                merge(existing, row);
                ChangeKind::Updated
            }
            None => {
                self.rows.insert(key, row);
                ChangeKind::Created
            }
        };
        self.record(table, id, kind);
    }

    fn remove(&mut self, table: Table, id: &str) -> bool {
        let removed = self.rows.remove(&(table, id.to_string())).is_some();
        if removed {
            self.record(table, id.to_string(), ChangeKind::Deleted);
        }
        removed
    }

    fn changes_since(&self, cursor: u64) -> ChangeSet {
        // Latest kind per entity, and whether it was created inside the window.
        let mut latest: HashMap<(Table, &str), (ChangeKind, bool)> = HashMap::new();
        let mut order: Vec<(Table, &str)> = Vec::new();
        for change in self.log.iter().filter(|c| c.sequence > cursor) {
            let key = (change.table, change.id.as_str());
            match latest.get_mut(&key) {
                Some(entry) => entry.0 = change.kind,
                None => {
                    latest.insert(key, (change.kind, change.kind == ChangeKind::Created));
                    order.push(key);
                }
            }
        }

        let mut set = ChangeSet::with_tables(&Table::ALL);
        for key in order {
            let Some(&(kind, created)) = latest.get(&key) else {
                continue;
            };
            let (table, id) = key;
            let changes = set.table_mut(table);
            if kind == ChangeKind::Deleted {
                changes.deleted.push(id.to_string());
                continue;
            }
            let Some(row) = self.rows.get(&(table, id.to_string())) else {
                continue;
            };
            if created {
                changes.created.push(row.clone());
            } else {
                changes.updated.push(row.clone());
            }
        }
        set
    }

    fn snapshot(&self) -> BTreeMap<String, Vec<Value>> {
        let mut tables: BTreeMap<String, Vec<Value>> = Table::ALL
            .iter()
            .map(|t| (t.as_str().to_string(), Vec::new()))
            .collect();
        for ((table, _), row) in &self.rows {
            if let Some(rows) = tables.get_mut(table.as_str()) {
                rows.push(row.clone());
            }
        }
        tables
    }
}

fn merge(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Object(current), Value::Object(fields)) => current.extend(fields),
        (slot, other) => *slot = other,
    }
}

fn row_id(row: &Value) -> Option<String> {
    row.get("id").and_then(Value::as_str).map(str::to_string)
}

/// Server-side rows and change log behind the [`RemoteBackend`] surface.
///
/// Created rows whose id already exists are refused with a
/// `UniqueViolation` conflict carrying the server copy. Updated rows are
/// merged field by field. Deletes of unknown rows are ignored.
#[derive(Debug)]
pub struct ReferenceBackend {
    state: Mutex<ServerState>,
    online: AtomicBool,
    push_failures: AtomicU32,
    pull_failures: AtomicU32,
    delay: Mutex<Duration>,
    pull_calls: AtomicUsize,
    push_calls: AtomicUsize,
    pushes: Mutex<Vec<PushRequest>>,
}

impl ReferenceBackend {
    /// Creates an empty, reachable backend.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            online: AtomicBool::new(true),
            push_failures: AtomicU32::new(0),
            pull_failures: AtomicU32::new(0),
            delay: Mutex::new(Duration::ZERO),
            pull_calls: AtomicUsize::new(0),
            push_calls: AtomicUsize::new(0),
            pushes: Mutex::new(Vec::new()),
        }
    }

    /// Writes a row as another client would. Returns the new cursor.
    ///
    /// # Panics
    ///
    /// Panics if the row has no string `id`.
    pub fn seed(&self, table: Table, row: Value) -> SyncCursor {
        let id = row_id(&row).expect("seeded row needs an id");
        let mut state = self.state.lock();
        state.upsert(table, id, row);
        SyncCursor::new(state.cursor)
    }

    /// Deletes a row as another client would.
    pub fn delete(&self, table: Table, id: &str) -> bool {
        self.state.lock().remove(table, id)
    }

    /// Returns the server copy of a row.
    pub fn row(&self, table: Table, id: &str) -> Option<Value> {
        self.state.lock().rows.get(&(table, id.to_string())).cloned()
    }

    /// Returns every row of a table, ordered by id.
    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.state
            .lock()
            .rows
            .iter()
            .filter(|((t, _), _)| *t == table)
            .map(|(_, row)| row.clone())
            .collect()
    }

    /// Returns the latest cursor.
    pub fn cursor(&self) -> SyncCursor {
        SyncCursor::new(self.state.lock().cursor)
    }

    /// Returns the number of logged changes.
    pub fn change_count(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Sets reachability. Unreachable calls fail with `NotConnected`.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Makes the next `count` pushes fail with a retryable error.
    pub fn fail_pushes(&self, count: u32) {
        self.push_failures.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` pulls fail with a retryable error.
    pub fn fail_pulls(&self, count: u32) {
        self.pull_failures.store(count, Ordering::SeqCst);
    }

    /// Delays every call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Number of pulls received.
    pub fn pull_calls(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }

    /// Number of pushes received.
    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    /// Push requests received, in order.
    pub fn push_requests(&self) -> Vec<PushRequest> {
        self.pushes.lock().clone()
    }

    async fn enter(&self, failures: &AtomicU32, what: &str) -> EngineResult<()> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(EngineError::NotConnected);
        }
        let injected = failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(EngineError::transport_retryable(format!(
                "simulated {what} failure"
            )));
        }
        Ok(())
    }
}

impl Default for ReferenceBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteBackend for ReferenceBackend {
    async fn pull(&self, request: PullRequest) -> EngineResult<PullResponse> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(&self.pull_failures, "pull").await?;

        let state = self.state.lock();
        let cursor = SyncCursor::new(state.cursor);
        match request.last_cursor {
            Some(since) if !request.turbo => {
                Ok(PullResponse::changes(&state.changes_since(since.value()), cursor))
            }
            _ => Ok(PullResponse::Snapshot {
                tables: state.snapshot(),
                cursor,
            }),
        }
    }

    async fn push(&self, request: PushRequest) -> EngineResult<PushResponse> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        self.pushes.lock().push(request.clone());
        self.enter(&self.push_failures, "push").await?;

        let mut conflicts = Vec::new();
        let mut state = self.state.lock();
        for (table, changes) in request.changes.iter() {
            for row in &changes.created {
                let Some(id) = row_id(row) else { continue };
                if let Some(existing) = state.rows.get(&(*table, id.clone())) {
                    conflicts.push(PushConflict {
                        table: *table,
                        id,
                        kind: PushConflictKind::UniqueViolation,
                        server_record: Some(existing.clone()),
                    });
                    continue;
                }
                state.upsert(*table, id, row.clone());
            }
            for row in &changes.updated {
                if let Some(id) = row_id(row) {
                    state.upsert(*table, id, row.clone());
                }
            }
            for id in &changes.deleted {
                state.remove(*table, id);
            }
        }
        Ok(PushResponse::with_conflicts(conflicts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(id: &str, title: &str) -> Value {
        json!({"id": id, "owner_id": "u-1", "title": title})
    }

    fn push(changes: ChangeSet) -> PushRequest {
        PushRequest {
            changes,
            last_cursor: SyncCursor::INITIAL,
            user_id: "u-1".into(),
        }
    }

    #[tokio::test]
    async fn incremental_pull_collapses_changes_per_row() {
        let backend = ReferenceBackend::new();
        backend.seed(Table::Tasks, task("t-1", "one"));
        let after_first = backend.cursor();
        backend.seed(Table::Tasks, task("t-1", "one, edited"));
        backend.seed(Table::Tasks, task("t-2", "two"));
        backend.seed(Table::Tasks, task("t-3", "three"));
        backend.delete(Table::Tasks, "t-3");

        let response = backend
            .pull(PullRequest::incremental("u-1", after_first))
            .await
            .unwrap();
        assert_eq!(response.cursor(), SyncCursor::new(5));
        let (set, _, unknown) = response.into_change_set(&Table::ALL);
        assert!(unknown.is_empty());
        let tasks = set.table(Table::Tasks).unwrap();
        assert_eq!(tasks.updated, vec![task("t-1", "one, edited")]);
        assert_eq!(tasks.created, vec![task("t-2", "two")]);
        assert_eq!(tasks.deleted, vec!["t-3".to_string()]);
    }

    #[tokio::test]
    async fn first_sync_returns_snapshot() {
        let backend = ReferenceBackend::new();
        backend.seed(Table::Tasks, task("t-1", "one"));
        let response = backend.pull(PullRequest::first_sync("u-1")).await.unwrap();
        assert!(response.is_snapshot());
        assert_eq!(response.cursor(), SyncCursor::new(1));
    }

    #[tokio::test]
    async fn duplicate_create_is_a_conflict() {
        let backend = ReferenceBackend::new();
        backend.seed(Table::Tasks, task("t-1", "server"));

        let mut changes = ChangeSet::with_tables(&Table::ALL);
        changes.table_mut(Table::Tasks).created.push(task("t-1", "client"));
        changes.table_mut(Table::Tasks).created.push(task("t-2", "client"));
        let response = backend.push(push(changes)).await.unwrap();

        assert!(response.success);
        let conflict = response.conflict_for(Table::Tasks, "t-1").unwrap();
        assert_eq!(conflict.server_record, Some(task("t-1", "server")));
        assert_eq!(backend.row(Table::Tasks, "t-2"), Some(task("t-2", "client")));
        assert_eq!(backend.rows(Table::Tasks).len(), 2);
    }

    #[tokio::test]
    async fn updates_merge_fields() {
        let backend = ReferenceBackend::new();
        backend.seed(Table::Tasks, task("t-1", "one"));
        let mut changes = ChangeSet::with_tables(&Table::ALL);
        changes
            .table_mut(Table::Tasks)
            .updated
            .push(json!({"id": "t-1", "status": "done"}));
        backend.push(push(changes)).await.unwrap();

        let row = backend.row(Table::Tasks, "t-1").unwrap();
        assert_eq!(row["title"], "one");
        assert_eq!(row["status"], "done");
    }

    #[tokio::test]
    async fn injected_failures_and_offline() {
        let backend = ReferenceBackend::new();
        backend.fail_pushes(1);
        let err = backend.push(push(ChangeSet::new())).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(backend.push(push(ChangeSet::new())).await.is_ok());

        backend.set_online(false);
        let result = backend.pull(PullRequest::first_sync("u-1")).await;
        assert!(matches!(result, Err(EngineError::NotConnected)));
        assert_eq!(backend.push_calls(), 2);
        assert_eq!(backend.pull_calls(), 1);
    }
}
