//! Push sanitization.
//!
//! Before a local row is pushed it is stripped of local bookkeeping fields,
//! its keys are validated, and every timestamp-like field is rewritten into
//! the canonical wire format. Unparsable timestamps are repaired to `now`
//! and reported instead of failing the batch; key violations are errors.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::validate_keys;
use crate::table::Table;
use crate::timestamp::{format_canonical, is_timestamp_field, normalize_timestamp};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Local-only fields that never leave the device.
const LOCAL_FIELDS: [&str; 3] = ["sync_status", "is_dirty", "local_revision"];

/// Returns true if the field is local bookkeeping.
pub fn is_bookkeeping_field(name: &str) -> bool {
    name.starts_with('_') || LOCAL_FIELDS.contains(&name)
}

/// What sanitization changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    /// Timestamp fields that could not be parsed and were set to now.
    pub repaired_timestamps: Vec<String>,
    /// Bookkeeping fields that were removed.
    pub stripped_fields: Vec<String>,
}

impl SanitizeReport {
    /// Returns true if any timestamp was repaired.
    pub fn has_repairs(&self) -> bool {
        !self.repaired_timestamps.is_empty()
    }
}

/// A row ready to push.
#[derive(Debug, Clone, PartialEq)]
pub struct SanitizedRecord {
    /// Primary key.
    pub id: String,
    /// Wire object.
    pub record: Map<String, Value>,
    /// Changes applied.
    pub report: SanitizeReport,
}

impl SanitizedRecord {
    /// Returns the wire object as a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.record)
    }
}

/// Sanitizes one local row for a push.
pub fn sanitize_record(
    table: Table,
    raw: &Value,
    now: DateTime<Utc>,
) -> ProtocolResult<SanitizedRecord> {
    let object = raw.as_object().ok_or(ProtocolError::NotAnObject { table })?;
    let mut report = SanitizeReport::default();
    let mut record = Map::with_capacity(object.len());

    for (name, value) in object {
        if is_bookkeeping_field(name) {
            report.stripped_fields.push(name.clone());
            continue;
        }
        let value = if is_timestamp_field(name) && !value.is_null() {
            match normalize_timestamp(value) {
                Some(canonical) => Value::String(canonical),
                None => {
                    report.repaired_timestamps.push(name.clone());
                    Value::String(format_canonical(now))
                }
            }
        } else {
            value.clone()
        };
        record.insert(name.clone(), value);
    }

    let id = validate_keys(table, &record)?;
    Ok(SanitizedRecord { id, record, report })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-05-05T05:05:05.500Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn strips_bookkeeping_and_normalizes() {
        let raw = json!({
            "id": "m-1",
            "conversation_id": "c-1",
            "sender_id": "u-1",
            "content": "hi",
            "_status": "created",
            "_changed": "content",
            "sync_status": "pending",
            "created_at": 1_772_359_200_000_i64,
        });
        let out = sanitize_record(Table::Messages, &raw, now()).unwrap();
        assert_eq!(out.id, "m-1");
        assert!(!out.record.contains_key("_status"));
        assert!(!out.record.contains_key("sync_status"));
        assert_eq!(out.report.stripped_fields.len(), 3);
        assert_eq!(out.record["created_at"], "2026-03-01T10:00:00.000Z");
        assert!(!out.report.has_repairs());
    }

    #[test]
    fn repairs_bad_timestamps_to_now() {
        let raw = json!({
            "id": "t-1",
            "owner_id": "u-1",
            "due_at": "next tuesday",
            "updated_at": null,
        });
        let out = sanitize_record(Table::Tasks, &raw, now()).unwrap();
        assert_eq!(out.record["due_at"], "2026-05-05T05:05:05.500Z");
        assert_eq!(out.report.repaired_timestamps, vec!["due_at".to_string()]);
        assert!(out.record["updated_at"].is_null());
    }

    #[test]
    fn rejects_key_violations() {
        let raw = json!({"id": "undefined", "owner_id": "u-1"});
        let err = sanitize_record(Table::Tasks, &raw, now()).unwrap_err();
        assert!(err.is_data_defect());

        let raw = json!({"id": "c-1", "created_by": ""});
        let err = sanitize_record(Table::Conversations, &raw, now()).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingForeignKey { .. }));
    }

    #[test]
    fn bookkeeping_fields() {
        assert!(is_bookkeeping_field("_raw"));
        assert!(is_bookkeeping_field("is_dirty"));
        assert!(!is_bookkeeping_field("content"));
    }
}
