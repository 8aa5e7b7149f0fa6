//! Typed records for the synced tables.
//!
//! Wire payloads arrive as loosely-typed JSON objects. [`Record::decode`]
//! validates the primary key and required foreign keys, then converts the
//! object into a strongly-typed variant. Only decoded records reach the
//! conflict-resolution path.

use crate::error::{ProtocolError, ProtocolResult};
use crate::table::Table;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A user profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Primary key.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub display_name: String,
    /// Avatar image URL.
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Last modification time.
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// A conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Primary key.
    pub id: String,
    /// Conversation title.
    #[serde(default)]
    pub title: String,
    /// Profile that created the conversation.
    pub created_by: String,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<String>,
    /// Last modification time.
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// A message inside a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Primary key.
    pub id: String,
    /// Owning conversation.
    pub conversation_id: String,
    /// Sending profile.
    pub sender_id: String,
    /// Message body.
    #[serde(default)]
    pub content: String,
    /// Attached image URL.
    #[serde(default)]
    pub image_url: Option<String>,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<String>,
    /// Last modification time.
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// A task owned by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Primary key.
    pub id: String,
    /// Owning profile.
    pub owner_id: String,
    /// Task title.
    #[serde(default)]
    pub title: String,
    /// Free-form status label.
    #[serde(default)]
    pub status: String,
    /// Due time.
    #[serde(default)]
    pub due_at: Option<String>,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<String>,
    /// Last modification time.
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// A decoded row from one of the synced tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "data")]
pub enum Record {
    /// Row of [`Table::Profiles`].
    #[serde(rename = "profiles")]
    Profile(Profile),
    /// Row of [`Table::Conversations`].
    #[serde(rename = "conversations")]
    Conversation(Conversation),
    /// Row of [`Table::Messages`].
    #[serde(rename = "messages")]
    Message(Message),
    /// Row of [`Table::Tasks`].
    #[serde(rename = "tasks")]
    Task(Task),
}

impl Record {
    /// Validates and decodes a wire object into a typed record.
    ///
    /// Unknown fields are dropped. Missing or empty primary keys and
    /// required foreign keys are rejected before schema decoding so the
    /// error names the offending field.
    pub fn decode(table: Table, raw: &Value) -> ProtocolResult<Self> {
        let object = raw
            .as_object()
            .ok_or(ProtocolError::NotAnObject { table })?;
        let id = validate_keys(table, object)?;

        let invalid = |e: serde_json::Error| ProtocolError::InvalidRecord {
            table,
            message: format!("{} ({})", e, id),
        };

        let record = match table {
            Table::Profiles => Record::Profile(serde_json::from_value(raw.clone()).map_err(invalid)?),
            Table::Conversations => {
                Record::Conversation(serde_json::from_value(raw.clone()).map_err(invalid)?)
            }
            Table::Messages => Record::Message(serde_json::from_value(raw.clone()).map_err(invalid)?),
            Table::Tasks => Record::Task(serde_json::from_value(raw.clone()).map_err(invalid)?),
        };
        Ok(record)
    }

    /// Returns the table this record belongs to.
    pub fn table(&self) -> Table {
        match self {
            Record::Profile(_) => Table::Profiles,
            Record::Conversation(_) => Table::Conversations,
            Record::Message(_) => Table::Messages,
            Record::Task(_) => Table::Tasks,
        }
    }

    /// Returns the primary key.
    pub fn id(&self) -> &str {
        match self {
            Record::Profile(r) => &r.id,
            Record::Conversation(r) => &r.id,
            Record::Message(r) => &r.id,
            Record::Task(r) => &r.id,
        }
    }

    /// Converts the record back into its wire object.
    pub fn to_wire(&self) -> ProtocolResult<Value> {
        let value = match self {
            Record::Profile(r) => serde_json::to_value(r)?,
            Record::Conversation(r) => serde_json::to_value(r)?,
            Record::Message(r) => serde_json::to_value(r)?,
            Record::Task(r) => serde_json::to_value(r)?,
        };
        Ok(value)
    }

    /// Returns asset URLs referenced by this record.
    pub fn asset_urls(&self) -> Vec<&str> {
        match self {
            Record::Profile(r) => r.avatar_url.as_deref().into_iter().collect(),
            Record::Message(r) => r.image_url.as_deref().into_iter().collect(),
            Record::Conversation(_) | Record::Task(_) => Vec::new(),
        }
    }
}

/// Returns true if `key` is usable as a primary or foreign key.
pub(crate) fn is_valid_key(key: &str) -> bool {
    let trimmed = key.trim();
    !trimmed.is_empty() && trimmed != "null" && trimmed != "undefined"
}

/// Checks the primary key and required foreign keys of a wire object.
///
/// Returns the primary key on success.
pub(crate) fn validate_keys(table: Table, object: &Map<String, Value>) -> ProtocolResult<String> {
    let id = object
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| is_valid_key(id))
        .ok_or(ProtocolError::MissingPrimaryKey { table })?;

    for field in table.required_foreign_keys() {
        let present = object
            .get(*field)
            .and_then(Value::as_str)
            .is_some_and(is_valid_key);
        if !present {
            return Err(ProtocolError::MissingForeignKey {
                table,
                id: id.to_string(),
                field,
            });
        }
    }

    Ok(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_message() {
        let raw = json!({
            "id": "m-1",
            "conversation_id": "conv-1",
            "sender_id": "user-1",
            "content": "hello",
            "_status": "created"
        });
        let record = Record::decode(Table::Messages, &raw).unwrap();
        assert_eq!(record.table(), Table::Messages);
        assert_eq!(record.id(), "m-1");
        match record {
            Record::Message(m) => assert_eq!(m.content, "hello"),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn decode_rejects_missing_primary_key() {
        let raw = json!({"id": "", "display_name": "x"});
        let err = Record::decode(Table::Profiles, &raw).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingPrimaryKey { .. }));

        let raw = json!({"display_name": "x"});
        assert!(Record::decode(Table::Profiles, &raw).is_err());
    }

    #[test]
    fn decode_rejects_empty_foreign_key() {
        let raw = json!({"id": "t-1", "owner_id": "  ", "title": "x"});
        let err = Record::decode(Table::Tasks, &raw).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MissingForeignKey {
                field: "owner_id",
                ..
            }
        ));
    }

    #[test]
    fn decode_rejects_non_object() {
        let err = Record::decode(Table::Tasks, &json!([1, 2])).unwrap_err();
        assert!(matches!(err, ProtocolError::NotAnObject { .. }));
    }

    #[test]
    fn decode_rejects_wrong_types() {
        let raw = json!({"id": "c-1", "created_by": "u-1", "title": 42});
        let err = Record::decode(Table::Conversations, &raw).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidRecord { .. }));
    }

    #[test]
    fn wire_roundtrip_drops_unknown_fields() {
        let raw = json!({"id": "p-1", "display_name": "Ada", "favourite": "tea"});
        let record = Record::decode(Table::Profiles, &raw).unwrap();
        let wire = record.to_wire().unwrap();
        assert!(wire.get("favourite").is_none());
        assert_eq!(wire["display_name"], "Ada");
    }

    #[test]
    fn asset_urls() {
        let raw = json!({
            "id": "m-2",
            "conversation_id": "c",
            "sender_id": "u",
            "image_url": "https://cdn.example.com/a.png"
        });
        let record = Record::decode(Table::Messages, &raw).unwrap();
        assert_eq!(record.asset_urls(), vec!["https://cdn.example.com/a.png"]);
    }

    #[test]
    fn invalid_keys() {
        assert!(!is_valid_key(""));
        assert!(!is_valid_key("undefined"));
        assert!(!is_valid_key("null"));
        assert!(is_valid_key("abc"));
    }
}
