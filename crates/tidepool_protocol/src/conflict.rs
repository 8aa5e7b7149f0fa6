//! Conflict description and resolution policy.

use crate::table::Table;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a conflict was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictOrigin {
    /// A pulled remote row collided with an unsynced local row.
    Pull,
    /// The backend refused a pushed row (unique-constraint rejection).
    PushRejection,
}

/// Local and remote sides hold diverging versions of the same record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Table of the record.
    pub table: Table,
    /// Primary key of the record.
    pub entity_id: String,
    /// Local row, `None` if it no longer exists locally.
    pub local: Option<Value>,
    /// Remote row, `None` for a remote delete or an unknown server copy.
    pub remote: Option<Value>,
    /// Detection point.
    pub origin: ConflictOrigin,
    /// Queued mutation tied to the local side, if any.
    pub mutation_id: Option<String>,
    /// Resolution (if any).
    pub resolution: Option<ConflictResolution>,
}

impl Conflict {
    /// Creates a conflict detected while applying a pull.
    pub fn from_pull(
        table: Table,
        entity_id: impl Into<String>,
        local: Option<Value>,
        remote: Option<Value>,
    ) -> Self {
        Self {
            table,
            entity_id: entity_id.into(),
            local,
            remote,
            origin: ConflictOrigin::Pull,
            mutation_id: None,
            resolution: None,
        }
    }

    /// Creates a conflict from a refused push.
    pub fn from_push_rejection(
        table: Table,
        entity_id: impl Into<String>,
        local: Option<Value>,
        remote: Option<Value>,
        mutation_id: impl Into<String>,
    ) -> Self {
        Self {
            table,
            entity_id: entity_id.into(),
            local,
            remote,
            origin: ConflictOrigin::PushRejection,
            mutation_id: Some(mutation_id.into()),
            resolution: None,
        }
    }

    /// Ties the conflict to a queued mutation.
    pub fn with_mutation(mut self, mutation_id: impl Into<String>) -> Self {
        self.mutation_id = Some(mutation_id.into());
        self
    }

    /// Returns true if both sides exist and hold different content.
    pub fn differs(&self) -> bool {
        match (&self.local, &self.remote) {
            (Some(local), Some(remote)) => local != remote,
            (None, None) => false,
            _ => true,
        }
    }

    /// Returns true if the remote side deleted the record.
    pub fn is_remote_delete(&self) -> bool {
        self.origin == ConflictOrigin::Pull && self.remote.is_none()
    }

    /// Resolves the conflict with the given resolution.
    pub fn resolve(&mut self, resolution: ConflictResolution) {
        self.resolution = Some(resolution);
    }

    /// Returns true if the conflict has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Resolution for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Overwrite the local row with the remote one.
    AcceptRemote,
    /// Keep the local row.
    KeepLocal,
    /// Combine both sides.
    Merge,
}

/// Policy for automatic conflict resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ConflictPolicy {
    /// Server always wins.
    #[default]
    ServerWins,
}

impl ConflictPolicy {
    /// Returns true if this policy automatically resolves conflicts.
    pub fn auto_resolves(&self) -> bool {
        true
    }

    /// Resolves a conflict according to this policy.
    pub fn resolve(&self, conflict: &mut Conflict) {
        let resolution = match self {
            ConflictPolicy::ServerWins => ConflictResolution::AcceptRemote,
        };
        conflict.resolve(resolution);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn conflict_kinds() {
        let same = Conflict::from_pull(
            Table::Tasks,
            "t-1",
            Some(json!({"id": "t-1"})),
            Some(json!({"id": "t-1"})),
        );
        assert!(!same.differs());

        let diverged = Conflict::from_pull(
            Table::Tasks,
            "t-1",
            Some(json!({"id": "t-1", "title": "a"})),
            Some(json!({"id": "t-1", "title": "b"})),
        );
        assert!(diverged.differs());
        assert!(!diverged.is_remote_delete());

        let deleted = Conflict::from_pull(Table::Tasks, "t-1", Some(json!({"id": "t-1"})), None);
        assert!(deleted.is_remote_delete());
        assert!(deleted.differs());
    }

    #[test]
    fn push_rejection_is_not_a_remote_delete() {
        let conflict = Conflict::from_push_rejection(
            Table::Messages,
            "m-1",
            Some(json!({"id": "m-1"})),
            None,
            "mut-1",
        );
        assert_eq!(conflict.origin, ConflictOrigin::PushRejection);
        assert!(!conflict.is_remote_delete());
        assert_eq!(conflict.mutation_id.as_deref(), Some("mut-1"));
    }

    #[test]
    fn server_wins_accepts_remote() {
        let mut conflict = Conflict::from_pull(Table::Profiles, "p-1", None, Some(json!({})));
        assert!(!conflict.is_resolved());
        let policy = ConflictPolicy::default();
        assert!(policy.auto_resolves());
        policy.resolve(&mut conflict);
        assert_eq!(conflict.resolution, Some(ConflictResolution::AcceptRemote));
    }
}
