//! Per-facility audit log with deferred replication.
//!
//! Entries are cached locally (newest first, bounded per facility) and
//! queued as `Activity` mutations; the server keeps the unbounded log.

use std::collections::HashMap;
use std::sync::Arc;

use crate::db::{keys, load_json, save_json, DurableStore};
use crate::error::{RemoteError, Result};
use crate::models::{ActivityLogEntry, MutationPayload, PendingMutation};
use crate::sync::{PendingMutationQueue, RecentKind, RemoteCollaborator};

/// Default number of entries kept locally per facility
pub const DEFAULT_ACTIVITY_LIMIT: usize = 100;

pub struct ActivityLog {
    store: Arc<dyn DurableStore>,
    limit: usize,
    caches: HashMap<String, Vec<ActivityLogEntry>>,
}

impl ActivityLog {
    pub fn new(store: Arc<dyn DurableStore>, limit: usize) -> Self {
        Self {
            store,
            limit,
            caches: HashMap::new(),
        }
    }

    fn cache(&mut self, facility_id: &str) -> Result<&mut Vec<ActivityLogEntry>> {
        if !self.caches.contains_key(facility_id) {
            let mut entries: Vec<ActivityLogEntry> =
                load_json(self.store.as_ref(), &keys::activity_log(facility_id))?
                    .unwrap_or_default();
            entries.truncate(self.limit);
            self.caches.insert(facility_id.to_string(), entries);
        }
        Ok(self.caches.entry(facility_id.to_string()).or_default())
    }

    fn store_cache(&mut self, facility_id: &str, entries: Vec<ActivityLogEntry>) -> Result<()> {
        save_json(
            self.store.as_ref(),
            &keys::activity_log(facility_id),
            &entries,
        )?;
        self.caches.insert(facility_id.to_string(), entries);
        Ok(())
    }

    /// Cache the entry and queue it for replication.
    ///
    /// Either both happen or neither does.
    pub fn record(
        &mut self,
        entry: ActivityLogEntry,
        queue: &mut PendingMutationQueue,
    ) -> Result<PendingMutation> {
        let facility_id = entry.facility_id.clone();
        let limit = self.limit;
        let previous = self.cache(&facility_id)?.clone();

        let mut next = Vec::with_capacity(limit);
        next.push(entry.clone());
        next.extend(previous.iter().take(limit.saturating_sub(1)).cloned());
        self.store_cache(&facility_id, next)?;

        match queue.enqueue(MutationPayload::Activity(entry)) {
            Ok(mutation) => {
                tracing::debug!(facility_id = %facility_id, "Recorded activity entry");
                Ok(mutation)
            }
            Err(error) => {
                if let Err(rollback) = self.store_cache(&facility_id, previous) {
                    tracing::warn!(error = %rollback, "Failed to roll back activity cache");
                }
                Err(error)
            }
        }
    }

    /// Newest cached entries for a facility
    pub fn recent(&mut self, facility_id: &str, limit: usize) -> Result<Vec<ActivityLogEntry>> {
        Ok(self
            .cache(facility_id)?
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }

    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Server's most recent entries for a facility, newest first.
    pub async fn fetch_recent<R: RemoteCollaborator + ?Sized>(
        remote: &R,
        facility_id: &str,
        limit: usize,
    ) -> Result<Vec<ActivityLogEntry>> {
        let rows = remote
            .list_recent(RecentKind::Activity, facility_id, limit)
            .await?;
        let entries = rows
            .into_iter()
            .map(serde_json::from_value::<ActivityLogEntry>)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|error| RemoteError::InvalidPayload(error.to_string()))?;
        Ok(entries)
    }

    /// Replace a facility's cache with fetched server entries.
    ///
    /// Entries still waiting in `queue` for replication stay in the cache.
    pub fn apply_refresh(
        &mut self,
        facility_id: &str,
        fetched: Vec<ActivityLogEntry>,
        queue: &PendingMutationQueue,
    ) -> Result<usize> {
        let mut entries: Vec<ActivityLogEntry> = queue
            .iter()
            .filter_map(|mutation| match &mutation.payload {
                MutationPayload::Activity(entry)
                    if entry.facility_id == facility_id && !fetched.contains(entry) =>
                {
                    Some(entry.clone())
                }
                _ => None,
            })
            .collect();
        entries.extend(fetched);
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(self.limit);

        let count = entries.len();
        self.store_cache(facility_id, entries)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::RecordAction;
    use crate::sync::testing::ScriptedRemote;

    fn entry(facility: &str, n: usize) -> ActivityLogEntry {
        ActivityLogEntry::new(facility, "user-1", RecordAction::Update, "person")
            .with_entity_id(format!("p-{n}"))
    }

    #[test]
    fn cache_is_bounded_per_facility() {
        let store = Arc::new(MemoryStore::new());
        let mut queue = PendingMutationQueue::load(store.clone()).unwrap();
        let mut log = ActivityLog::new(store.clone(), DEFAULT_ACTIVITY_LIMIT);

        for n in 0..120 {
            log.record(entry("fac-a", n), &mut queue).unwrap();
        }
        log.record(entry("fac-b", 0), &mut queue).unwrap();

        let recent = log.recent("fac-a", 500).unwrap();
        assert_eq!(recent.len(), 100);
        assert_eq!(recent[0].entity_id.as_deref(), Some("p-119"));
        assert_eq!(log.recent("fac-b", 10).unwrap().len(), 1);
        assert_eq!(queue.len(), 121);

        let mut reloaded = ActivityLog::new(store, DEFAULT_ACTIVITY_LIMIT);
        assert_eq!(reloaded.recent("fac-a", 500).unwrap().len(), 100);
    }

    #[test]
    fn failed_enqueue_leaves_cache_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let mut queue = PendingMutationQueue::load(store.clone()).unwrap();
        let mut log = ActivityLog::new(store.clone(), 5);
        log.record(entry("fac-a", 1), &mut queue).unwrap();

        store.set_fail_writes(true);
        assert!(log.record(entry("fac-a", 2), &mut queue).is_err());
        assert_eq!(log.recent("fac-a", 10).unwrap().len(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn refresh_failure_keeps_cache() {
        let store = Arc::new(MemoryStore::new());
        let mut queue = PendingMutationQueue::load(store.clone()).unwrap();
        let mut log = ActivityLog::new(store, 5);
        log.record(entry("fac-a", 1), &mut queue).unwrap();

        let remote = ScriptedRemote::new();
        assert!(ActivityLog::fetch_recent(&remote, "fac-a", 5).await.is_err());
        assert_eq!(log.recent("fac-a", 10).unwrap().len(), 1);

        remote.set_recent(
            RecentKind::Activity,
            (0..8)
                .map(|n| serde_json::to_value(entry("fac-a", n)).unwrap())
                .collect(),
        );
        let fetched = ActivityLog::fetch_recent(&remote, "fac-a", log.limit())
            .await
            .unwrap();
        assert_eq!(fetched.len(), 5);
        assert_eq!(log.apply_refresh("fac-a", fetched, &queue).unwrap(), 5);
        assert_eq!(log.recent("fac-a", 10).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn refresh_keeps_entries_still_queued() {
        let store = Arc::new(MemoryStore::new());
        let mut queue = PendingMutationQueue::load(store.clone()).unwrap();
        let mut log = ActivityLog::new(store, 10);

        let mut server = entry("fac-a", 1);
        server.created_at = 1_000;
        let mut local = entry("fac-a", 2);
        local.created_at = 2_000;
        log.record(local.clone(), &mut queue).unwrap();
        let mut other_facility = entry("fac-b", 3);
        other_facility.created_at = 3_000;
        log.record(other_facility, &mut queue).unwrap();

        let remote = ScriptedRemote::new();
        remote.set_recent(
            RecentKind::Activity,
            vec![serde_json::to_value(&server).unwrap()],
        );
        let fetched = ActivityLog::fetch_recent(&remote, "fac-a", 10).await.unwrap();

        assert_eq!(log.apply_refresh("fac-a", fetched, &queue).unwrap(), 2);
        assert_eq!(log.recent("fac-a", 10).unwrap(), vec![local, server]);
    }
}
