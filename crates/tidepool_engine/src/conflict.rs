//! Conflict resolution.
//!
//! Conflicts come from two places: a pulled row colliding with an unsynced
//! local row, and a push refused with a unique-constraint violation. Both
//! go through one [`ConflictResolver`], which turns the conflict into the
//! local write that settles it.

use crate::local_store::LocalWrite;
use std::fmt;
use tidepool_protocol::{Conflict, ConflictOrigin, ConflictPolicy};
use tracing::{debug, info};

/// A resolved conflict and the local write that applies the outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The conflict with its resolution set.
    pub conflict: Conflict,
    /// Write to apply to the local store, if any.
    pub write: Option<LocalWrite>,
}

/// Resolves conflicts according to a policy.
pub trait ConflictResolver: Send + Sync + fmt::Debug {
    /// The policy this resolver applies.
    fn policy(&self) -> ConflictPolicy;

    /// Resolves one conflict.
    fn resolve(&self, conflict: Conflict) -> Resolution;
}

/// The server copy always replaces the local copy.
///
/// Concurrent local edits are discarded; the discarded payload is logged
/// at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerWins;

impl ConflictResolver for ServerWins {
    fn policy(&self) -> ConflictPolicy {
        ConflictPolicy::ServerWins
    }

    fn resolve(&self, mut conflict: Conflict) -> Resolution {
        self.policy().resolve(&mut conflict);

        let write = match (&conflict.remote, conflict.origin) {
            (Some(remote), _) => Some(LocalWrite::server_row(
                conflict.table,
                conflict.entity_id.clone(),
                remote.clone(),
            )),
            (None, ConflictOrigin::Pull) => Some(LocalWrite::Remove {
                table: conflict.table,
                id: conflict.entity_id.clone(),
            }),
            (None, ConflictOrigin::PushRejection) => Some(LocalWrite::MarkSynced {
                table: conflict.table,
                id: conflict.entity_id.clone(),
            }),
        };

        info!(
            table = %conflict.table,
            entity_id = %conflict.entity_id,
            origin = ?conflict.origin,
            remote_delete = conflict.is_remote_delete(),
            "conflict resolved, server wins"
        );
        if let Some(local) = &conflict.local {
            debug!(
                table = %conflict.table,
                entity_id = %conflict.entity_id,
                discarded = %local,
                "discarded local payload"
            );
        }

        Resolution { conflict, write }
    }
}
