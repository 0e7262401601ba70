//! Remote used when no endpoint is configured.

use async_trait::async_trait;
use fieldbook_core::models::{PendingMutation, Snapshot};
use fieldbook_core::sync::{PushOutcome, RecentKind};
use fieldbook_core::{RemoteCollaborator, RemoteError};

const NOT_CONFIGURED: &str = "no remote configured";

/// Every call reports the remote as unreachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredRemote;

#[async_trait]
impl RemoteCollaborator for UnconfiguredRemote {
    async fn push(&self, _mutation: &PendingMutation) -> PushOutcome {
        PushOutcome::Failure(RemoteError::Unavailable(NOT_CONFIGURED.to_string()))
    }

    async fn fetch_snapshot(&self, _entity_id: &str) -> Result<Snapshot, RemoteError> {
        Err(RemoteError::Unavailable(NOT_CONFIGURED.to_string()))
    }

    async fn list_recent(
        &self,
        _kind: RecentKind,
        _scope_id: &str,
        _limit: usize,
    ) -> Result<Vec<serde_json::Value>, RemoteError> {
        Err(RemoteError::Unavailable(NOT_CONFIGURED.to_string()))
    }
}
