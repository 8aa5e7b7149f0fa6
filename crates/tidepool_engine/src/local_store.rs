//! Local row store collaborator.
//!
//! The embedded database is opaque to the engine. [`LocalStore`] is the
//! contract the engine consumes: per-table get/find/create/update/delete,
//! an unsynced-changes query, and one transactional write primitive that
//! every engine writer (pull apply, queue sync-back, consistency repair)
//! goes through.

use crate::error::{EngineError, EngineResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tidepool_protocol::Table;

/// Sync state of a local row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    /// Matches the backend.
    Synced,
    /// Created locally, not yet pushed.
    Created,
    /// Updated locally, not yet pushed.
    Updated,
    /// Deleted locally; kept as a tombstone until pushed.
    Deleted,
}

impl RowStatus {
    /// Returns true if the row holds local changes.
    pub fn is_unsynced(&self) -> bool {
        !matches!(self, RowStatus::Synced)
    }
}

/// A row of the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRow {
    /// Table of the row.
    pub table: Table,
    /// Primary key.
    pub id: String,
    /// Row content.
    pub data: Value,
    /// Sync state.
    pub status: RowStatus,
}

/// One write inside a local transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalWrite {
    /// Insert or replace a row.
    Upsert {
        /// Table of the row.
        table: Table,
        /// Primary key.
        id: String,
        /// New content.
        data: Value,
        /// New sync state.
        status: RowStatus,
    },
    /// Remove a row.
    Remove {
        /// Table of the row.
        table: Table,
        /// Primary key.
        id: String,
    },
    /// Mark a row as matching the backend; synced tombstones are removed.
    MarkSynced {
        /// Table of the row.
        table: Table,
        /// Primary key.
        id: String,
    },
}

impl LocalWrite {
    /// Creates an upsert of a synced server row.
    pub fn server_row(table: Table, id: impl Into<String>, data: Value) -> Self {
        LocalWrite::Upsert {
            table,
            id: id.into(),
            data,
            status: RowStatus::Synced,
        }
    }
}

/// The local row store consumed by the engine.
pub trait LocalStore: Send + Sync {
    /// Reads one row.
    fn get(&self, table: Table, id: &str) -> EngineResult<Option<LocalRow>>;

    /// Returns rows whose `field` equals `value`.
    fn find(&self, table: Table, field: &str, value: &Value) -> EngineResult<Vec<LocalRow>>;

    /// Creates a row from a local write. The row must carry an `id`.
    fn create(&self, table: Table, data: Value) -> EngineResult<LocalRow>;

    /// Replaces the content of an existing row from a local write.
    fn update(&self, table: Table, id: &str, data: Value) -> EngineResult<LocalRow>;

    /// Marks a row as locally deleted. Returns false if it does not exist.
    fn mark_deleted(&self, table: Table, id: &str) -> EngineResult<bool>;

    /// Applies writes atomically.
    fn apply(&self, writes: Vec<LocalWrite>) -> EngineResult<()>;

    /// Returns true if any row holds local changes.
    fn has_unsynced_changes(&self) -> EngineResult<bool>;

    /// Returns all rows holding local changes.
    fn unsynced_rows(&self) -> EngineResult<Vec<LocalRow>>;

    /// Returns true if the store holds no rows at all.
    fn is_empty(&self) -> EngineResult<bool>;

    /// Returns the number of rows in a table.
    fn count(&self, table: Table) -> EngineResult<usize>;
}

/// An in-memory local store.
///
/// Used by tests and as the reference behavior for [`LocalStore`].
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    rows: RwLock<BTreeMap<(Table, String), LocalRow>>,
    fail_writes: AtomicBool,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a synced row, bypassing local change tracking.
    pub fn seed(&self, table: Table, data: Value) -> EngineResult<()> {
        let id = row_id(table, &data)?;
        self.apply(vec![LocalWrite::server_row(table, id, data)])
    }

    /// Makes subsequent writes fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writes(&self) -> EngineResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EngineError::LocalStore("writes disabled".into()));
        }
        Ok(())
    }
}

fn row_id(table: Table, data: &Value) -> EngineResult<String> {
    data.get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| EngineError::LocalStore(format!("{} row without id", table)))
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, table: Table, id: &str) -> EngineResult<Option<LocalRow>> {
        Ok(self.rows.read().get(&(table, id.to_string())).cloned())
    }

    fn find(&self, table: Table, field: &str, value: &Value) -> EngineResult<Vec<LocalRow>> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|row| row.table == table && row.status != RowStatus::Deleted)
            .filter(|row| row.data.get(field) == Some(value))
            .cloned()
            .collect())
    }

    fn create(&self, table: Table, data: Value) -> EngineResult<LocalRow> {
        self.check_writes()?;
        let id = row_id(table, &data)?;
        let mut rows = self.rows.write();
        let key = (table, id.clone());
        if rows.contains_key(&key) {
            return Err(EngineError::LocalStore(format!(
                "{} row {} already exists",
                table, id
            )));
        }
        let row = LocalRow {
            table,
            id,
            data,
            status: RowStatus::Created,
        };
        rows.insert(key, row.clone());
        Ok(row)
    }

    fn update(&self, table: Table, id: &str, data: Value) -> EngineResult<LocalRow> {
        self.check_writes()?;
        let mut rows = self.rows.write();
        let row = rows
            .get_mut(&(table, id.to_string()))
            .ok_or_else(|| EngineError::NotFound(format!("{} row {}", table, id)))?;
        row.data = data;
        if row.status != RowStatus::Created {
            row.status = RowStatus::Updated;
        }
        Ok(row.clone())
    }

    fn mark_deleted(&self, table: Table, id: &str) -> EngineResult<bool> {
        self.check_writes()?;
        let mut rows = self.rows.write();
        match rows.get_mut(&(table, id.to_string())) {
            Some(row) => {
                row.status = RowStatus::Deleted;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn apply(&self, writes: Vec<LocalWrite>) -> EngineResult<()> {
        self.check_writes()?;
        let mut rows = self.rows.write();
        for write in writes {
            match write {
                LocalWrite::Upsert {
                    table,
                    id,
                    data,
                    status,
                } => {
                    rows.insert(
                        (table, id.clone()),
                        LocalRow {
                            table,
                            id,
                            data,
                            status,
                        },
                    );
                }
                LocalWrite::Remove { table, id } => {
                    rows.remove(&(table, id));
                }
                LocalWrite::MarkSynced { table, id } => {
                    let key = (table, id);
                    let tombstone = match rows.get_mut(&key) {
                        Some(row) if row.status == RowStatus::Deleted => true,
                        Some(row) => {
                            row.status = RowStatus::Synced;
                            false
                        }
                        None => false,
                    };
                    if tombstone {
                        rows.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn has_unsynced_changes(&self) -> EngineResult<bool> {
        Ok(self.rows.read().values().any(|row| row.status.is_unsynced()))
    }

    fn unsynced_rows(&self) -> EngineResult<Vec<LocalRow>> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|row| row.status.is_unsynced())
            .cloned()
            .collect())
    }

    fn is_empty(&self) -> EngineResult<bool> {
        Ok(self.rows.read().is_empty())
    }

    fn count(&self, table: Table) -> EngineResult<usize> {
        Ok(self
            .rows
            .read()
            .keys()
            .filter(|(t, _)| *t == table)
            .count())
    }
}
