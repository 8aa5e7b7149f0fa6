//! Pull and push messages exchanged with the backend.

use crate::change_set::{ChangeSet, SyncCursor, TableChanges};
use crate::table::Table;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Schema version advertised on every pull.
pub const SCHEMA_VERSION: u32 = 3;

/// Describes a local schema migration the backend should account for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationInfo {
    /// Schema version before the migration.
    pub from_version: u32,
    /// Tables added by the migration; the backend sends them in full.
    pub tables: Vec<Table>,
}

/// Request for changes since a cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Last applied cursor, `None` on first sync.
    pub last_cursor: Option<SyncCursor>,
    /// Local schema version.
    pub schema_version: u32,
    /// Requesting user.
    pub user_id: String,
    /// Pending migration, if any.
    #[serde(default)]
    pub migration: Option<MigrationInfo>,
    /// Ask for a full snapshot instead of per-table diffs.
    #[serde(default)]
    pub turbo: bool,
}

impl PullRequest {
    /// Creates an incremental pull request.
    pub fn incremental(user_id: impl Into<String>, cursor: SyncCursor) -> Self {
        Self {
            last_cursor: Some(cursor),
            schema_version: SCHEMA_VERSION,
            user_id: user_id.into(),
            migration: None,
            turbo: false,
        }
    }

    /// Creates a first-sync snapshot request.
    pub fn first_sync(user_id: impl Into<String>) -> Self {
        Self {
            last_cursor: None,
            schema_version: SCHEMA_VERSION,
            user_id: user_id.into(),
            migration: None,
            turbo: true,
        }
    }
}

/// Response to a pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PullResponse {
    /// Per-table diffs since the requested cursor.
    Changes {
        /// Changes keyed by table wire name.
        changes: BTreeMap<String, TableChanges>,
        /// Cursor to store once the changes are applied.
        cursor: SyncCursor,
    },
    /// Full snapshot for a first sync.
    Snapshot {
        /// All rows keyed by table wire name.
        tables: BTreeMap<String, Vec<Value>>,
        /// Cursor to store once the snapshot is applied.
        cursor: SyncCursor,
    },
}

impl PullResponse {
    /// Creates an incremental response from a change set.
    pub fn changes(changes: &ChangeSet, cursor: SyncCursor) -> Self {
        let changes = changes
            .iter()
            .map(|(table, c)| (table.as_str().to_string(), c.clone()))
            .collect();
        PullResponse::Changes { changes, cursor }
    }

    /// Returns the cursor carried by the response.
    pub fn cursor(&self) -> SyncCursor {
        match self {
            PullResponse::Changes { cursor, .. } | PullResponse::Snapshot { cursor, .. } => *cursor,
        }
    }

    /// Returns true for snapshot responses.
    pub fn is_snapshot(&self) -> bool {
        matches!(self, PullResponse::Snapshot { .. })
    }

    /// Converts the response into a change set normalized against
    /// `expected`, returning unknown table names alongside.
    pub fn into_change_set(self, expected: &[Table]) -> (ChangeSet, SyncCursor, Vec<String>) {
        match self {
            PullResponse::Changes { changes, cursor } => {
                let (set, unknown) = ChangeSet::from_wire(changes, expected);
                (set, cursor, unknown)
            }
            PullResponse::Snapshot { tables, cursor } => {
                let (set, unknown) = ChangeSet::from_snapshot(tables, expected);
                (set, cursor, unknown)
            }
        }
    }
}

/// Batched push of local changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Sanitized changes keyed by table.
    pub changes: ChangeSet,
    /// Cursor the client last pulled, for idempotent server-side merge.
    pub last_cursor: SyncCursor,
    /// Pushing user.
    pub user_id: String,
}

/// Why the backend refused a pushed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushConflictKind {
    /// The row already exists remotely.
    UniqueViolation,
}

/// A pushed row the backend refused because of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushConflict {
    /// Table of the row.
    pub table: Table,
    /// Primary key of the row.
    pub id: String,
    /// Kind of conflict.
    pub kind: PushConflictKind,
    /// The server's copy, when the backend returns it.
    #[serde(default)]
    pub server_record: Option<Value>,
}

/// Acknowledgement of a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    /// Whether the batch was merged.
    pub success: bool,
    /// Rows refused because of conflicts; the rest of the batch is merged.
    #[serde(default)]
    pub conflicts: Vec<PushConflict>,
    /// Error message when `success` is false.
    #[serde(default)]
    pub error: Option<String>,
}

impl PushResponse {
    /// Creates a successful acknowledgement.
    pub fn success() -> Self {
        Self {
            success: true,
            conflicts: Vec::new(),
            error: None,
        }
    }

    /// Creates a successful acknowledgement with conflicting rows.
    pub fn with_conflicts(conflicts: Vec<PushConflict>) -> Self {
        Self {
            success: true,
            conflicts,
            error: None,
        }
    }

    /// Creates a rejection.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            conflicts: Vec::new(),
            error: Some(message.into()),
        }
    }

    /// Finds the conflict reported for a row.
    pub fn conflict_for(&self, table: Table, id: &str) -> Option<&PushConflict> {
        self.conflicts
            .iter()
            .find(|c| c.table == table && c.id == id)
    }
}
