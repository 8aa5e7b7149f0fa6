//! Change sets and sync cursors.

use crate::table::Table;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Created, updated and deleted rows of one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableChanges {
    /// Rows created since the cursor.
    #[serde(default)]
    pub created: Vec<Value>,
    /// Rows updated since the cursor.
    #[serde(default)]
    pub updated: Vec<Value>,
    /// Primary keys of rows deleted since the cursor.
    #[serde(default)]
    pub deleted: Vec<String>,
}

impl TableChanges {
    /// Returns true if the table has no changes.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Returns the total number of changed rows.
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

/// A table-keyed delta exchanged during one sync pass.
///
/// A normalized change set carries an entry for every expected table, even
/// when that entry is empty, so a missing key is never read as "no changes".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet {
    tables: BTreeMap<Table, TableChanges>,
}

impl ChangeSet {
    /// Creates an empty change set with no table entries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a change set with an empty entry for each table.
    pub fn with_tables(tables: &[Table]) -> Self {
        let mut set = Self::new();
        set.normalize(tables);
        set
    }

    /// Inserts empty entries for expected tables that are absent.
    ///
    /// Returns the tables that were missing.
    pub fn normalize(&mut self, expected: &[Table]) -> Vec<Table> {
        let mut missing = Vec::new();
        for table in expected {
            if !self.tables.contains_key(table) {
                self.tables.insert(*table, TableChanges::default());
                missing.push(*table);
            }
        }
        missing
    }

    /// Returns the changes of a table, if present.
    pub fn table(&self, table: Table) -> Option<&TableChanges> {
        self.tables.get(&table)
    }

    /// Returns the changes of a table, inserting an empty entry if absent.
    pub fn table_mut(&mut self, table: Table) -> &mut TableChanges {
        self.tables.entry(table).or_default()
    }

    /// Returns true if the table has an entry.
    pub fn contains_table(&self, table: Table) -> bool {
        self.tables.contains_key(&table)
    }

    /// Iterates over table entries in table order.
    pub fn iter(&self) -> impl Iterator<Item = (&Table, &TableChanges)> {
        self.tables.iter()
    }

    /// Returns true if no table has changes.
    pub fn is_empty(&self) -> bool {
        self.tables.values().all(TableChanges::is_empty)
    }

    /// Returns the total number of changed rows across tables.
    pub fn total_changes(&self) -> usize {
        self.tables.values().map(TableChanges::len).sum()
    }

    /// Builds a change set from raw table-name keys.
    ///
    /// Unknown table names are skipped and returned so the caller can log
    /// them. The result is normalized against `expected`.
    pub fn from_wire(
        raw: BTreeMap<String, TableChanges>,
        expected: &[Table],
    ) -> (Self, Vec<String>) {
        let mut set = Self::new();
        let mut unknown = Vec::new();
        for (name, changes) in raw {
            match Table::from_name(&name) {
                Ok(table) => {
                    set.tables.insert(table, changes);
                }
                Err(_) => unknown.push(name),
            }
        }
        set.normalize(expected);
        (set, unknown)
    }

    /// Builds a change set from a first-sync snapshot.
    ///
    /// Every snapshot row is treated as created.
    pub fn from_snapshot(
        raw: BTreeMap<String, Vec<Value>>,
        expected: &[Table],
    ) -> (Self, Vec<String>) {
        let tables = raw
            .into_iter()
            .map(|(name, rows)| {
                (
                    name,
                    TableChanges {
                        created: rows,
                        ..TableChanges::default()
                    },
                )
            })
            .collect();
        Self::from_wire(tables, expected)
    }
}

/// Opaque, monotonically increasing marker of the last applied pull.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SyncCursor(u64);

impl SyncCursor {
    /// The cursor of a client that has never pulled.
    pub const INITIAL: SyncCursor = SyncCursor(0);

    /// Creates a cursor from its raw value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns true if no pull has been applied yet.
    pub fn is_initial(&self) -> bool {
        self.0 == 0
    }

    /// Moves the cursor forward.
    ///
    /// Returns false and leaves the cursor unchanged if `next` would
    /// regress it.
    pub fn advance(&mut self, next: SyncCursor) -> bool {
        if next.0 < self.0 {
            return false;
        }
        self.0 = next.0;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_inserts_missing_tables() {
        let mut set = ChangeSet::new();
        set.table_mut(Table::Messages)
            .created
            .push(json!({"id": "m-1"}));

        let missing = set.normalize(&Table::ALL);
        assert_eq!(
            missing,
            vec![Table::Profiles, Table::Conversations, Table::Tasks]
        );
        for table in Table::ALL {
            assert!(set.contains_table(table));
        }
        assert_eq!(set.total_changes(), 1);
    }

    #[test]
    fn empty_tables_are_present_but_empty() {
        let set = ChangeSet::with_tables(&Table::ALL);
        assert!(set.is_empty());
        assert!(set.table(Table::Tasks).unwrap().is_empty());
    }

    #[test]
    fn from_wire_skips_unknown_tables() {
        let mut raw = BTreeMap::new();
        raw.insert("tasks".to_string(), TableChanges::default());
        raw.insert("sessions".to_string(), TableChanges::default());

        let (set, unknown) = ChangeSet::from_wire(raw, &Table::ALL);
        assert_eq!(unknown, vec!["sessions".to_string()]);
        assert!(set.contains_table(Table::Profiles));
    }

    #[test]
    fn snapshot_rows_are_created() {
        let mut raw = BTreeMap::new();
        raw.insert("profiles".to_string(), vec![json!({"id": "p-1"})]);
        let (set, _) = ChangeSet::from_snapshot(raw, &Table::ALL);
        assert_eq!(set.table(Table::Profiles).unwrap().created.len(), 1);
        assert_eq!(set.total_changes(), 1);
    }

    #[test]
    fn serialized_shape_is_table_keyed() {
        let set = ChangeSet::with_tables(&[Table::Tasks]);
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(
            json,
            json!({"tasks": {"created": [], "updated": [], "deleted": []}})
        );
    }

    #[test]
    fn cursor_never_regresses() {
        let mut cursor = SyncCursor::new(10);
        assert!(!cursor.advance(SyncCursor::new(5)));
        assert_eq!(cursor.value(), 10);
        assert!(cursor.advance(SyncCursor::new(12)));
        assert_eq!(cursor.value(), 12);
        assert!(SyncCursor::INITIAL.is_initial());
    }
}
