//! # Tidepool Sync Protocol
//!
//! Wire types shared by the Tidepool sync engine and its collaborators.
//!
//! This crate provides:
//! - [`Table`] and the typed [`Record`] variants for the fixed set of
//!   synced tables, with a validating decode step from wire JSON
//! - [`ChangeSet`] and [`SyncCursor`] exchanged during a sync pass
//! - [`OutboundMutation`] for the durable write queue
//! - Pull/push messages and realtime envelopes
//! - [`Conflict`] descriptions and the [`ConflictPolicy`]
//! - Push sanitization and timestamp normalization
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_set;
mod conflict;
mod error;
mod messages;
mod mutation;
mod realtime;
mod record;
mod sanitize;
mod table;
pub mod timestamp;

pub use change_set::{ChangeSet, SyncCursor, TableChanges};
pub use conflict::{Conflict, ConflictOrigin, ConflictPolicy, ConflictResolution};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    MigrationInfo, PullRequest, PullResponse, PushConflict, PushConflictKind, PushRequest,
    PushResponse, SCHEMA_VERSION,
};
pub use mutation::{MutationAction, MutationStatus, MutationSummary, OutboundMutation, Priority};
pub use realtime::{
    BatchEnvelope, BroadcastEnvelope, ChannelEvent, ChannelFilter, EventKind, GeoPoint,
    OutboundPayload, PresenceEnvelope, PresenceEvent, PresenceStatus, RowChange, RowChangeKind,
    RowFilter,
};
pub use record::{Conversation, Message, Profile, Record, Task};
pub use sanitize::{is_bookkeeping_field, sanitize_record, SanitizeReport, SanitizedRecord};
pub use table::Table;
