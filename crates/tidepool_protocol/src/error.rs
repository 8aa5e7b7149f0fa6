//! Error types for the sync protocol.

use crate::table::Table;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding or sanitizing wire records.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The table name is not one of the synced tables.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// A record's wire shape is not a JSON object.
    #[error("expected a JSON object for a {table} record")]
    NotAnObject {
        /// Table the record belongs to.
        table: Table,
    },

    /// A record has an empty or invalid primary key.
    #[error("{table} record has an empty or invalid primary key")]
    MissingPrimaryKey {
        /// Table the record belongs to.
        table: Table,
    },

    /// A record has an empty required foreign key.
    #[error("{table} record {id} has an empty required field `{field}`")]
    MissingForeignKey {
        /// Table the record belongs to.
        table: Table,
        /// Primary key of the record.
        id: String,
        /// Name of the empty foreign key field.
        field: &'static str,
    },

    /// The record does not match the table schema.
    #[error("invalid {table} record: {message}")]
    InvalidRecord {
        /// Table the record belongs to.
        table: Table,
        /// Description of the schema violation.
        message: String,
    },

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Returns true if the error indicates a local data defect that retrying
    /// cannot fix.
    pub fn is_data_defect(&self) -> bool {
        matches!(
            self,
            ProtocolError::MissingPrimaryKey { .. }
                | ProtocolError::MissingForeignKey { .. }
                | ProtocolError::NotAnObject { .. }
                | ProtocolError::InvalidRecord { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::MissingForeignKey {
            table: Table::Messages,
            id: "m-1".into(),
            field: "conversation_id",
        };
        let text = err.to_string();
        assert!(text.contains("messages"));
        assert!(text.contains("conversation_id"));
    }

    #[test]
    fn data_defects() {
        assert!(ProtocolError::MissingPrimaryKey {
            table: Table::Tasks
        }
        .is_data_defect());
        assert!(!ProtocolError::UnknownTable("x".into()).is_data_defect());
    }
}
