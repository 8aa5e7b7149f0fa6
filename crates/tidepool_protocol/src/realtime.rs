//! Realtime channel wire contract.

use crate::table::Table;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Row-change event type a subscription listens for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Inserted rows.
    #[serde(rename = "insert")]
    Insert,
    /// Updated rows.
    #[serde(rename = "update")]
    Update,
    /// Deleted rows.
    #[serde(rename = "delete")]
    Delete,
    /// Any row change.
    #[default]
    #[serde(rename = "*")]
    All,
}

impl EventKind {
    /// Returns true if a change of `kind` passes this event filter.
    pub fn accepts(&self, kind: RowChangeKind) -> bool {
        match self {
            EventKind::All => true,
            EventKind::Insert => kind == RowChangeKind::Insert,
            EventKind::Update => kind == RowChangeKind::Update,
            EventKind::Delete => kind == RowChangeKind::Delete,
        }
    }
}

/// Equality filter on one column, written `column=eq.value` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFilter {
    /// Column to compare.
    pub column: String,
    /// Expected value, compared as text.
    pub value: String,
}

impl RowFilter {
    /// Creates an equality filter.
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Parses the `column=eq.value` wire form.
    pub fn parse(text: &str) -> Option<Self> {
        let (column, rest) = text.split_once('=')?;
        let value = rest.strip_prefix("eq.")?;
        if column.is_empty() {
            return None;
        }
        Some(Self::eq(column, value))
    }

    /// Renders the `column=eq.value` wire form.
    pub fn to_wire(&self) -> String {
        format!("{}=eq.{}", self.column, self.value)
    }

    /// Returns true if the row's column equals the filter value.
    pub fn matches(&self, row: &Value) -> bool {
        match row.get(&self.column) {
            Some(Value::String(s)) => *s == self.value,
            Some(Value::Number(n)) => n.to_string() == self.value,
            Some(Value::Bool(b)) => b.to_string() == self.value,
            _ => false,
        }
    }
}

/// Subscription filter for row-change events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelFilter {
    /// Table to watch; `None` watches every table on the topic.
    #[serde(default)]
    pub table: Option<Table>,
    /// Optional row filter.
    #[serde(default)]
    pub row: Option<RowFilter>,
    /// Event type to deliver.
    #[serde(default)]
    pub event: EventKind,
}

impl ChannelFilter {
    /// Watches every change of one table.
    pub fn table(table: Table) -> Self {
        Self {
            table: Some(table),
            row: None,
            event: EventKind::All,
        }
    }

    /// Restricts the filter to rows matching `row`.
    pub fn with_row(mut self, row: RowFilter) -> Self {
        self.row = Some(row);
        self
    }

    /// Restricts the filter to one event type.
    pub fn with_event(mut self, event: EventKind) -> Self {
        self.event = event;
        self
    }

    /// Returns true if the change passes the filter.
    pub fn matches(&self, change: &RowChange) -> bool {
        if let Some(table) = self.table {
            if table != change.table {
                return false;
            }
        }
        if !self.event.accepts(change.kind) {
            return false;
        }
        match &self.row {
            None => true,
            Some(filter) => change
                .record
                .as_ref()
                .or(change.old_record.as_ref())
                .is_some_and(|row| filter.matches(row)),
        }
    }
}

/// Kind of row change delivered by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowChangeKind {
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

/// A filtered row-change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowChange {
    /// Table of the row.
    pub table: Table,
    /// Change type.
    #[serde(rename = "eventType")]
    pub kind: RowChangeKind,
    /// New row, absent for deletes.
    #[serde(default, rename = "new")]
    pub record: Option<Value>,
    /// Previous row, when the backend sends it.
    #[serde(default, rename = "old")]
    pub old_record: Option<Value>,
    /// Commit time.
    pub commit_timestamp: String,
}

impl RowChange {
    /// Returns the primary key of the changed row.
    pub fn id(&self) -> Option<&str> {
        self.record
            .as_ref()
            .or(self.old_record.as_ref())
            .and_then(|row| row.get("id"))
            .and_then(Value::as_str)
    }
}

/// Ephemeral broadcast message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEnvelope {
    /// Application-level message type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Message body.
    pub payload: Value,
    /// Sending user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Send time.
    pub timestamp: String,
    /// Unique message id.
    pub message_id: String,
    /// Times the message has been re-sent.
    #[serde(default)]
    pub retry_count: u32,
}

impl BroadcastEnvelope {
    /// Creates an envelope with a fresh message id.
    pub fn new(kind: impl Into<String>, payload: Value, timestamp: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            user_id: None,
            timestamp: timestamp.into(),
            message_id: uuid::Uuid::new_v4().to_string(),
            retry_count: 0,
        }
    }

    /// Sets the sending user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Advertised presence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    /// Active.
    Online,
    /// Idle.
    Away,
    /// Do not disturb.
    Busy,
    /// Disconnected.
    Offline,
}

/// A geographic point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
}

/// Presence state of one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEnvelope {
    /// User the state belongs to.
    pub user_id: String,
    /// Advertised status.
    pub status: PresenceStatus,
    /// Last activity time.
    pub last_seen: String,
    /// Last known location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    /// Free-form activity label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
}

/// Presence event delivered by a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "presences", rename_all = "snake_case")]
pub enum PresenceEvent {
    /// Clients joined.
    Join(Vec<PresenceEnvelope>),
    /// Full roster replacement.
    Sync(Vec<PresenceEnvelope>),
    /// Clients left.
    Leave(Vec<PresenceEnvelope>),
}

/// Several broadcasts combined into one payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEnvelope {
    /// Batched messages in send order.
    pub messages: Vec<BroadcastEnvelope>,
    /// Batch creation time.
    pub timestamp: String,
    /// Number of messages in the batch.
    pub batch_size: usize,
}

impl BatchEnvelope {
    /// Wraps messages into a batch.
    pub fn new(messages: Vec<BroadcastEnvelope>, timestamp: impl Into<String>) -> Self {
        let batch_size = messages.len();
        Self {
            messages,
            timestamp: timestamp.into(),
            batch_size,
        }
    }
}

/// Inbound event from a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// Row change.
    RowChange(RowChange),
    /// Broadcast message.
    Broadcast(BroadcastEnvelope),
    /// Presence update.
    Presence(PresenceEvent),
}

/// Outbound payload sent on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundPayload {
    /// A single broadcast.
    Broadcast(BroadcastEnvelope),
    /// A combined batch.
    Batch(BatchEnvelope),
}

impl OutboundPayload {
    /// Number of broadcasts carried.
    pub fn message_count(&self) -> usize {
        match self {
            OutboundPayload::Broadcast(_) => 1,
            OutboundPayload::Batch(batch) => batch.batch_size,
        }
    }
}
