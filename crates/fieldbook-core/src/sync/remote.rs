//! Interface to the authoritative remote store.

use async_trait::async_trait;

use crate::error::RemoteError;
use crate::models::{PendingMutation, Snapshot};

/// Result of pushing one mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Remote accepted the write
    Ack,
    /// Remote entity was modified independently; carries its current copy when known
    Conflict(Option<Snapshot>),
    /// Transient or permanent failure
    Failure(RemoteError),
}

/// Which server-side log `list_recent` reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecentKind {
    Activity,
    SyncHistory,
}

impl RecentKind {
    pub const fn path(self) -> &'static str {
        match self {
            Self::Activity => "activity",
            Self::SyncHistory => "sync-history",
        }
    }
}

/// Remote collaborator the sync core replays mutations against.
///
/// Implementations enforce their own bounded timeout per call and report
/// an elapsed timeout as [`RemoteError::Timeout`].
#[async_trait]
pub trait RemoteCollaborator: Send + Sync {
    /// Deliver one mutation
    async fn push(&self, mutation: &PendingMutation) -> PushOutcome;

    /// Current remote copy of an entity
    async fn fetch_snapshot(&self, entity_id: &str) -> Result<Snapshot, RemoteError>;

    /// Most recent server-side entries for a scope, newest first
    async fn list_recent(
        &self,
        kind: RecentKind,
        scope_id: &str,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, RemoteError>;
}
