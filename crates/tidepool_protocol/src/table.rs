//! The fixed set of synced tables.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A table the client keeps in sync with the backend.
///
/// The set is closed: the engine only ever syncs these tables, and every
/// [`ChangeSet`](crate::ChangeSet) carries an entry for each of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// User profiles.
    Profiles,
    /// Conversations between users.
    Conversations,
    /// Messages inside a conversation.
    Messages,
    /// Tasks owned by a user.
    Tasks,
}

impl Table {
    /// All synced tables, in apply order (parents before children).
    pub const ALL: [Table; 4] = [
        Table::Profiles,
        Table::Conversations,
        Table::Messages,
        Table::Tasks,
    ];

    /// Returns the wire name of the table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Profiles => "profiles",
            Table::Conversations => "conversations",
            Table::Messages => "messages",
            Table::Tasks => "tasks",
        }
    }

    /// Looks a table up by its wire name.
    pub fn from_name(name: &str) -> ProtocolResult<Self> {
        match name {
            "profiles" => Ok(Table::Profiles),
            "conversations" => Ok(Table::Conversations),
            "messages" => Ok(Table::Messages),
            "tasks" => Ok(Table::Tasks),
            other => Err(ProtocolError::UnknownTable(other.to_string())),
        }
    }

    /// Foreign key fields that must be present and non-empty.
    pub fn required_foreign_keys(&self) -> &'static [&'static str] {
        match self {
            Table::Profiles => &[],
            Table::Conversations => &["created_by"],
            Table::Messages => &["conversation_id", "sender_id"],
            Table::Tasks => &["owner_id"],
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Table::from_name(s)
    }
}
