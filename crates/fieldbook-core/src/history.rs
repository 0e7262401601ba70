//! Local cache of recent sync-cycle outcomes.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::db::{keys, load_json, save_json, DurableStore};
use crate::error::{RemoteError, Result};
use crate::models::{MutationPayload, SyncHistoryRecord};
use crate::sync::{PendingMutationQueue, RecentKind, RemoteCollaborator};

/// Default number of records kept locally
pub const DEFAULT_SYNC_HISTORY_LIMIT: usize = 50;

/// Newest-first, bounded list of [`SyncHistoryRecord`]s
pub struct SyncHistory {
    store: Arc<dyn DurableStore>,
    limit: usize,
    records: Vec<SyncHistoryRecord>,
}

impl SyncHistory {
    /// Load the cached records from the store
    pub fn load(store: Arc<dyn DurableStore>, limit: usize) -> Result<Self> {
        let mut records: Vec<SyncHistoryRecord> =
            load_json(store.as_ref(), keys::SYNC_HISTORY)?.unwrap_or_default();
        records.truncate(limit);
        Ok(Self {
            store,
            limit,
            records,
        })
    }

    /// Add a record, evicting the oldest beyond the limit
    pub fn append(&mut self, record: SyncHistoryRecord) -> Result<()> {
        let mut next = Vec::with_capacity(self.records.len() + 1);
        next.push(record);
        next.extend(self.records.iter().take(self.limit.saturating_sub(1)).cloned());
        save_json(self.store.as_ref(), keys::SYNC_HISTORY, &next)?;
        self.records = next;
        Ok(())
    }

    pub fn recent(&self, limit: usize) -> &[SyncHistoryRecord] {
        &self.records[..limit.min(self.records.len())]
    }

    pub fn last(&self) -> Option<&SyncHistoryRecord> {
        self.records.first()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Server's most recent records for `user_id`, newest first.
    pub async fn fetch_recent<R: RemoteCollaborator + ?Sized>(
        remote: &R,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<SyncHistoryRecord>> {
        let rows = remote
            .list_recent(RecentKind::SyncHistory, user_id, limit)
            .await?;
        let records = rows
            .into_iter()
            .map(serde_json::from_value::<SyncHistoryRecord>)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|error| RemoteError::InvalidPayload(error.to_string()))?;
        Ok(records)
    }

    /// Replace the cache with fetched server records.
    ///
    /// Records still waiting in `queue` for replication are kept alongside
    /// the server's.
    pub fn apply_refresh(
        &mut self,
        fetched: Vec<SyncHistoryRecord>,
        queue: &PendingMutationQueue,
    ) -> Result<usize> {
        let known: HashSet<Uuid> = fetched.iter().map(|record| record.id).collect();
        let mut records: Vec<SyncHistoryRecord> = queue
            .iter()
            .filter_map(|mutation| match &mutation.payload {
                MutationPayload::SyncHistory(record) if !known.contains(&record.id) => {
                    Some(record.clone())
                }
                _ => None,
            })
            .collect();
        records.extend(fetched);
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records.truncate(self.limit);

        save_json(self.store.as_ref(), keys::SYNC_HISTORY, &records)?;
        let count = records.len();
        self.records = records;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::SyncHistoryStatus;
    use crate::sync::testing::ScriptedRemote;
    use uuid::Uuid;

    fn record(synced: usize) -> SyncHistoryRecord {
        SyncHistoryRecord {
            id: Uuid::now_v7(),
            user_id: "user-1".to_string(),
            facility_id: Some("fac-1".to_string()),
            status: SyncHistoryStatus::Success,
            synced_count: synced,
            failed_count: 0,
            error_message: None,
            started_at: 1,
            completed_at: Some(2),
        }
    }

    #[test]
    fn append_is_newest_first_and_bounded() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let mut history = SyncHistory::load(store.clone(), DEFAULT_SYNC_HISTORY_LIMIT).unwrap();

        for synced in 0..60 {
            history.append(record(synced)).unwrap();
        }

        assert_eq!(history.len(), 50);
        assert_eq!(history.last().unwrap().synced_count, 59);
        assert_eq!(history.recent(3).len(), 3);

        let reloaded = SyncHistory::load(store, DEFAULT_SYNC_HISTORY_LIMIT).unwrap();
        assert_eq!(reloaded.len(), 50);
        assert_eq!(reloaded.recent(1)[0].synced_count, 59);
    }

    #[test]
    fn failed_write_keeps_cache() {
        let memory = Arc::new(MemoryStore::new());
        let mut history = SyncHistory::load(memory.clone(), 5).unwrap();
        history.append(record(1)).unwrap();

        memory.set_fail_writes(true);
        assert!(history.append(record(2)).is_err());
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn refresh_replaces_cache_from_remote() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let queue = PendingMutationQueue::load(store.clone()).unwrap();
        let mut history = SyncHistory::load(store, 2).unwrap();
        history.append(record(9)).unwrap();

        let remote = ScriptedRemote::new();
        remote.set_recent(
            RecentKind::SyncHistory,
            vec![
                serde_json::to_value(record(3)).unwrap(),
                serde_json::to_value(record(2)).unwrap(),
                serde_json::to_value(record(1)).unwrap(),
            ],
        );

        let fetched = SyncHistory::fetch_recent(&remote, "user-1", history.limit())
            .await
            .unwrap();
        assert_eq!(history.apply_refresh(fetched, &queue).unwrap(), 2);
        assert_eq!(history.last().unwrap().synced_count, 3);
    }

    #[tokio::test]
    async fn refresh_keeps_records_not_yet_replicated() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let mut queue = PendingMutationQueue::load(store.clone()).unwrap();
        let mut history = SyncHistory::load(store, 5).unwrap();

        let mut local = record(7);
        local.started_at = 50;
        history.append(local.clone()).unwrap();
        queue.enqueue_history(local.clone(), 5).unwrap();

        let remote = ScriptedRemote::new();
        remote.set_recent(
            RecentKind::SyncHistory,
            vec![serde_json::to_value(record(1)).unwrap()],
        );
        let fetched = SyncHistory::fetch_recent(&remote, "user-1", 5).await.unwrap();

        assert_eq!(history.apply_refresh(fetched, &queue).unwrap(), 2);
        assert_eq!(history.last().unwrap().id, local.id);
        assert_eq!(history.recent(2)[1].synced_count, 1);
    }
}
