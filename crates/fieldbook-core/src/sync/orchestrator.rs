//! Drives sync cycles from connectivity changes, retry timers and manual triggers.
//!
//! All mutable state sits behind one async mutex that is never held across
//! a remote call. A separate cycle gate (`try_lock`) makes sure at most one
//! cycle runs; a manual trigger that finds the gate taken is dropped, while
//! new work queued mid-cycle starts another cycle once the gate is free.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Datelike, Utc};
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;

use super::backoff::BackoffScheduler;
use super::conflict::{ConflictStore, Detection, Resolution};
use super::connectivity::ConnectivitySignal;
use super::queue::{
    drain, DrainContext, DrainReport, DrainTarget, MutationRepair, PendingMutationQueue,
};
use super::remote::RemoteCollaborator;
use crate::activity::ActivityLog;
use crate::config::{SyncConfig, SyncScope};
use crate::db::{keys, load_json, save_json, DurableStore};
use crate::error::{Error, Result};
use crate::history::SyncHistory;
use crate::models::{
    ActivityLogEntry, ConflictId, ConflictRecord, EntityMutation, MutationPayload,
    PendingMutation, RecordAction, ResolutionPolicy, RetryState, SyncHistoryRecord,
};
use crate::registration::{IdAllocator, RegistrationId, REGISTRATION_FIELD};
use crate::state::{SyncEvent, SyncPhase, SyncStats, SyncStatus};
use crate::util::unix_millis_now;

/// How a sync attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Success {
        synced: usize,
        conflicts: usize,
    },
    PartialFailure {
        synced: usize,
        failed: usize,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    },
    /// Retries exhausted; holds the attempt count
    Fatal(u32),
    /// Device was offline; nothing counted against the retry budget
    Offline,
    /// Another cycle was already running
    AlreadySyncing,
}

impl CycleOutcome {
    /// Turn an exhausted retry budget into an error for the caller.
    pub fn into_result(self) -> Result<Self> {
        match self {
            Self::Fatal(attempts) => Err(Error::RetriesExhausted { attempts }),
            other => Ok(other),
        }
    }
}

struct CoreState {
    retry: RetryState,
    stats: SyncStats,
    scheduler: BackoffScheduler,
    queue: PendingMutationQueue,
    conflicts: ConflictStore,
    history: SyncHistory,
    activity: ActivityLog,
    allocator: IdAllocator,
    store: Arc<dyn DurableStore>,
}

impl CoreState {
    fn persist_retry(&self) {
        if let Err(error) = save_json(self.store.as_ref(), keys::RETRY_STATE, &self.retry) {
            tracing::warn!(error = %error, "Failed to persist retry state");
        }
    }

    fn persist_stats(&self) {
        if let Err(error) = save_json(self.store.as_ref(), keys::SYNC_STATS, &self.stats) {
            tracing::warn!(error = %error, "Failed to persist sync stats");
        }
    }

    fn max_retries(&self) -> u32 {
        self.scheduler.config().max_retries
    }

    /// Put a set-aside write back so it is not lost.
    fn requeue(&mut self, write: &EntityMutation) {
        if let Err(error) = self.queue.enqueue(MutationPayload::Entity(write.clone())) {
            tracing::error!(error = %error, entity_id = %write.entity_id, "Failed to requeue write");
        }
    }
}

impl DrainTarget for CoreState {
    fn queue(&mut self) -> &mut PendingMutationQueue {
        &mut self.queue
    }

    fn history(&mut self) -> &mut SyncHistory {
        &mut self.history
    }

    fn repair(&mut self) -> Option<&mut dyn MutationRepair> {
        Some(&mut self.allocator)
    }
}

struct Shared<R: ?Sized> {
    remote: Arc<R>,
    connectivity: ConnectivitySignal,
    scope: SyncScope,
    phase: watch::Sender<SyncPhase>,
    cycle_gate: Arc<Mutex<()>>,
    state: Mutex<CoreState>,
    kick: Notify,
    /// Work was queued while the gate was taken
    rerun: AtomicBool,
    fires: StdMutex<Option<mpsc::UnboundedReceiver<u64>>>,
}

/// Cloneable handle to the device's sync core
pub struct SyncOrchestrator<R: RemoteCollaborator + ?Sized + 'static> {
    shared: Arc<Shared<R>>,
}

impl<R: RemoteCollaborator + ?Sized + 'static> Clone for SyncOrchestrator<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R: RemoteCollaborator + ?Sized + 'static> SyncOrchestrator<R> {
    /// Restore every component from `store`.
    ///
    /// A retry budget already spent before restart comes back as `Fatal`.
    pub fn new(
        config: &SyncConfig,
        store: Arc<dyn DurableStore>,
        remote: Arc<R>,
        connectivity: ConnectivitySignal,
    ) -> Result<Self> {
        let mut retry: RetryState =
            load_json(store.as_ref(), keys::RETRY_STATE)?.unwrap_or_default();
        // Timers do not survive a restart
        retry.is_retrying = false;
        retry.next_retry_at = None;
        let stats: SyncStats = load_json(store.as_ref(), keys::SYNC_STATS)?.unwrap_or_default();

        let phase = if retry.is_exhausted(config.backoff.max_retries) {
            SyncPhase::Fatal
        } else {
            SyncPhase::Idle
        };

        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        let state = CoreState {
            retry,
            stats,
            scheduler: BackoffScheduler::new(config.backoff.clone(), fire_tx),
            queue: PendingMutationQueue::load(store.clone())?,
            conflicts: ConflictStore::load(store.clone())?,
            history: SyncHistory::load(store.clone(), config.history_limit)?,
            activity: ActivityLog::new(store.clone(), config.activity_limit),
            allocator: IdAllocator::load(store.clone(), config.registration_prefix.clone())?,
            store,
        };

        tracing::debug!(
            pending = state.queue.len(),
            retry_count = state.retry.retry_count,
            "Sync core loaded"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                remote,
                connectivity,
                scope: config.scope.clone(),
                phase: watch::channel(phase).0,
                cycle_gate: Arc::new(Mutex::new(())),
                state: Mutex::new(state),
                kick: Notify::new(),
                rerun: AtomicBool::new(false),
                fires: StdMutex::new(Some(fire_rx)),
            }),
        })
    }

    pub fn scope(&self) -> &SyncScope {
        &self.shared.scope
    }

    pub fn is_online(&self) -> bool {
        self.shared.connectivity.is_online()
    }

    pub fn phase(&self) -> SyncPhase {
        *self.shared.phase.borrow()
    }

    /// Watch phase transitions
    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.shared.phase.subscribe()
    }

    fn apply(&self, event: SyncEvent) -> SyncPhase {
        let mut next = SyncPhase::Idle;
        self.shared.phase.send_modify(|phase| {
            *phase = phase.next(event);
            next = *phase;
        });
        next
    }

    pub async fn status(&self) -> SyncStatus {
        let state = self.shared.state.lock().await;
        let mut stats = state.stats.clone();
        stats.pending = state.queue.pending_writes();
        stats.conflicts_open = state.conflicts.unresolved_count();
        SyncStatus {
            phase: self.phase(),
            online: self.is_online(),
            retry: state.retry.clone(),
            stats,
            last_sync: state.history.last().cloned(),
        }
    }

    pub async fn retry_state(&self) -> RetryState {
        self.shared.state.lock().await.retry.clone()
    }

    pub async fn pending(&self) -> Vec<PendingMutation> {
        self.shared.state.lock().await.queue.snapshot()
    }

    /// Queue an entity write for delivery.
    pub async fn enqueue_entity(&self, mutation: EntityMutation) -> Result<PendingMutation> {
        let queued = {
            let mut state = self.shared.state.lock().await;
            state.queue.enqueue(MutationPayload::Entity(mutation))?
        };
        self.shared.kick.notify_one();
        Ok(queued)
    }

    /// Cache an audit entry and queue it for replication.
    pub async fn log_activity(&self, entry: ActivityLogEntry) -> Result<PendingMutation> {
        let queued = {
            let mut guard = self.shared.state.lock().await;
            let state = &mut *guard;
            state.activity.record(entry, &mut state.queue)?
        };
        self.shared.kick.notify_one();
        Ok(queued)
    }

    /// Activity entry stamped with this device's scope.
    pub fn activity_entry(&self, action: RecordAction, entity_type: &str) -> ActivityLogEntry {
        ActivityLogEntry::new(
            self.shared.scope.facility(),
            self.shared.scope.user_id.clone(),
            action,
            entity_type,
        )
    }

    pub async fn activity(
        &self,
        facility_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ActivityLogEntry>> {
        let facility_id = facility_id.unwrap_or_else(|| self.shared.scope.facility());
        self.shared
            .state
            .lock()
            .await
            .activity
            .recent(facility_id, limit)
    }

    pub async fn sync_history(&self, limit: usize) -> Vec<SyncHistoryRecord> {
        self.shared
            .state
            .lock()
            .await
            .history
            .recent(limit)
            .to_vec()
    }

    /// Pull the server's recent activity for a facility into the local cache.
    pub async fn refresh_activity(&self, facility_id: Option<&str>) -> Result<usize> {
        if !self.is_online() {
            return Err(Error::NetworkUnavailable);
        }
        let facility_id = facility_id.unwrap_or_else(|| self.shared.scope.facility());
        let limit = self.shared.state.lock().await.activity.limit();
        let fetched =
            ActivityLog::fetch_recent(self.shared.remote.as_ref(), facility_id, limit).await?;

        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        state.activity.apply_refresh(facility_id, fetched, &state.queue)
    }

    /// Pull the server's recent sync history into the local cache.
    pub async fn refresh_history(&self) -> Result<usize> {
        if !self.is_online() {
            return Err(Error::NetworkUnavailable);
        }
        let limit = self.shared.state.lock().await.history.limit();
        let fetched = SyncHistory::fetch_recent(
            self.shared.remote.as_ref(),
            &self.shared.scope.user_id,
            limit,
        )
        .await?;

        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        state.history.apply_refresh(fetched, &state.queue)
    }

    pub async fn conflicts(&self, include_resolved: bool) -> Vec<ConflictRecord> {
        let state = self.shared.state.lock().await;
        if include_resolved {
            state.conflicts.all().to_vec()
        } else {
            state.conflicts.unresolved().cloned().collect()
        }
    }

    /// Allocate the next registration ID.
    ///
    /// IDs carried by queued writes count as known alongside `existing`.
    pub async fn allocate_registration_id(
        &self,
        prefix: Option<&str>,
        existing: &[String],
        year: Option<i32>,
    ) -> Result<RegistrationId> {
        let year = year.unwrap_or_else(|| Utc::now().year());
        let mut state = self.shared.state.lock().await;
        let queued: Vec<String> = state
            .queue
            .iter()
            .filter_map(|mutation| match &mutation.payload {
                MutationPayload::Entity(write) => write
                    .fields
                    .get(REGISTRATION_FIELD)
                    .and_then(|value| value.as_str())
                    .map(ToString::to_string),
                _ => None,
            })
            .collect();
        let known = existing.iter().chain(queued.iter()).map(String::as_str);

        match prefix {
            Some(prefix) => state.allocator.allocate_with_prefix(prefix, known, year),
            None => state.allocator.allocate(known, year),
        }
    }

    /// Settle a conflict with `policy`.
    ///
    /// Any write the policy requires is queued before the record is marked
    /// resolved, and is accompanied by an `update` activity entry.
    pub async fn resolve_conflict(
        &self,
        id: ConflictId,
        policy: ResolutionPolicy,
    ) -> Result<Resolution> {
        let resolution = {
            let mut guard = self.shared.state.lock().await;
            let state = &mut *guard;
            let resolution = state.conflicts.prepare_resolution(id, &policy)?;

            if let Some(write) = &resolution.requeue {
                state
                    .queue
                    .enqueue(MutationPayload::Entity(write.clone()))?;
            }
            state.conflicts.mark_resolved(id, resolution.policy)?;

            if let Some(write) = &resolution.requeue {
                let entry = self
                    .activity_entry(RecordAction::Update, &write.entity_type)
                    .with_entity_id(write.entity_id.clone())
                    .with_data(None, Some(json!(write.fields)))
                    .with_description(format!(
                        "Conflict resolved with '{}' policy",
                        resolution.policy
                    ));
                if let Err(error) = state.activity.record(entry, &mut state.queue) {
                    tracing::warn!(error = %error, "Failed to log conflict resolution");
                }
            }
            resolution
        };

        tracing::info!(conflict_id = %id, policy = resolution.policy, "Conflict resolved");
        if resolution.requeue.is_some() {
            self.shared.kick.notify_one();
        }
        Ok(resolution)
    }

    /// Start a cycle in the background. Returns `false` when offline or a
    /// cycle is already running.
    pub fn trigger_manual_sync(&self) -> bool {
        if !self.is_online() {
            tracing::debug!("Manual sync ignored while offline");
            return false;
        }
        self.spawn_cycle(true)
    }

    /// Run a manual cycle to completion.
    pub async fn sync_now(&self) -> CycleOutcome {
        if !self.is_online() {
            return CycleOutcome::Offline;
        }
        let Ok(gate) = Arc::clone(&self.shared.cycle_gate).try_lock_owned() else {
            return CycleOutcome::AlreadySyncing;
        };
        self.run_cycle(gate, true).await
    }

    fn spawn_cycle(&self, manual: bool) -> bool {
        let Ok(gate) = Arc::clone(&self.shared.cycle_gate).try_lock_owned() else {
            tracing::debug!("Sync cycle already running");
            return false;
        };
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.run_cycle(gate, manual).await;
            tracing::debug!(?outcome, "Background sync cycle finished");
        });
        true
    }

    async fn run_cycle(&self, gate: OwnedMutexGuard<()>, manual: bool) -> CycleOutcome {
        let blocked = {
            let mut guard = self.shared.state.lock().await;
            let state = &mut *guard;

            if self.phase() == SyncPhase::Fatal && !manual {
                return CycleOutcome::Fatal(state.retry.retry_count);
            }
            if !self.is_online() {
                return CycleOutcome::Offline;
            }

            self.apply(SyncEvent::Trigger { manual });
            state.scheduler.cancel(&mut state.retry);
            tracing::info!(pending = state.queue.len(), manual, "Sync cycle started");
            state.conflicts.blocked_entities()
        };

        let report = drain(
            self.shared.remote.as_ref(),
            &self.shared.state,
            DrainContext {
                blocked: &blocked,
                scope: &self.shared.scope,
            },
        )
        .await;

        let outcome = {
            let mut guard = self.shared.state.lock().await;
            let state = &mut *guard;
            let outcome = self.finish_cycle(state, &report);
            state.persist_retry();
            state.persist_stats();
            outcome
        };

        drop(gate);
        if self.shared.rerun.swap(false, Ordering::SeqCst) {
            self.shared.kick.notify_one();
        }
        outcome
    }

    fn finish_cycle(&self, state: &mut CoreState, report: &DrainReport) -> CycleOutcome {
        let conflicts = self.record_conflicts(state, report);
        self.record_repairs(state, report);
        state.stats.synced += report.synced as u64;

        if let Some(error) = report.failure() {
            if report.store_error.is_some() {
                tracing::warn!(error = %error, "Sync cycle stopped by local store error");
            }
            return self.fail_cycle(state, report.synced, report.failed, error);
        }

        state.retry.reset();
        state.stats.last_synced_at = Some(unix_millis_now());
        self.apply(SyncEvent::CycleSucceeded);
        self.apply(SyncEvent::Settle);
        tracing::info!(synced = report.synced, conflicts, held = report.held, "Sync cycle succeeded");
        CycleOutcome::Success {
            synced: report.synced,
            conflicts,
        }
    }

    fn fail_cycle(
        &self,
        state: &mut CoreState,
        synced: usize,
        failed: usize,
        error: String,
    ) -> CycleOutcome {
        if !self.is_online() {
            // Connectivity dropped mid-cycle; not a failed attempt
            state.scheduler.cancel(&mut state.retry);
            self.apply(SyncEvent::WentOffline);
            tracing::info!("Sync cycle interrupted by loss of connectivity");
            return CycleOutcome::Offline;
        }

        state.stats.failed += failed as u64;
        state.retry.retry_count = state.retry.retry_count.saturating_add(1);
        state.retry.last_error = Some(error.clone());
        let exhausted = state.retry.is_exhausted(state.max_retries());
        self.apply(SyncEvent::CycleFailed { exhausted });

        if exhausted {
            state.scheduler.cancel(&mut state.retry);
            tracing::error!(
                attempts = state.retry.retry_count,
                error = %error,
                "Sync retries exhausted, manual retry required"
            );
            return CycleOutcome::Fatal(state.retry.retry_count);
        }

        let armed = state.scheduler.schedule_next(&mut state.retry, true);
        self.apply(SyncEvent::Settle);
        tracing::warn!(
            retry_count = state.retry.retry_count,
            error = %error,
            "Sync cycle failed, retry scheduled"
        );
        CycleOutcome::PartialFailure {
            synced,
            failed,
            retry_count: state.retry.retry_count,
            next_retry_at: armed.map(|armed| armed.next_retry_at),
        }
    }

    fn record_conflicts(&self, state: &mut CoreState, report: &DrainReport) -> usize {
        let mut surfaced = 0;
        for rejected in &report.conflicts {
            match &rejected.detection {
                Detection::Spurious => {
                    state.stats.spurious_conflicts += 1;
                    tracing::info!(
                        entity_id = %rejected.write.entity_id,
                        "Spurious conflict, adopting remote timestamp"
                    );
                }
                Detection::Conflict(record) => {
                    tracing::warn!(
                        entity_id = %record.entity_id,
                        fields = record.diffs.len(),
                        "Conflict detected"
                    );
                    if let Err(error) = state.conflicts.insert(record.clone()) {
                        tracing::error!(error = %error, "Failed to persist conflict, requeueing write");
                        state.requeue(&rejected.write);
                        continue;
                    }
                    surfaced += 1;
                }
                Detection::BaseUnchanged => state.requeue(&rejected.write),
            }
        }
        surfaced
    }

    fn record_repairs(&self, state: &mut CoreState, report: &DrainReport) {
        for repair in &report.repairs {
            let entry = self
                .activity_entry(RecordAction::Update, &repair.entity_type)
                .with_entity_id(repair.entity_id.clone())
                .with_data(
                    Some(json!({ REGISTRATION_FIELD: repair.previous })),
                    Some(json!({ REGISTRATION_FIELD: repair.replacement })),
                )
                .with_description("Registration ID reassigned after collision");
            if let Err(error) = state.activity.record(entry, &mut state.queue) {
                tracing::warn!(error = %error, "Failed to log registration ID repair");
            }
        }
    }

    /// React to a connectivity transition.
    pub async fn on_connectivity_changed(&self, online: bool) {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;

        if !online {
            state.scheduler.cancel(&mut state.retry);
            self.apply(SyncEvent::WentOffline);
            state.persist_retry();
            tracing::info!("Offline, sync paused");
            return;
        }

        if self.phase() == SyncPhase::Fatal {
            tracing::info!("Online, but sync needs a manual retry");
            return;
        }
        if state.retry.retry_count > 0 {
            state.scheduler.schedule_next(&mut state.retry, true);
            state.persist_retry();
            tracing::info!(retry_count = state.retry.retry_count, "Online, retry re-armed");
            return;
        }
        let has_work = !state.queue.is_empty();
        drop(guard);

        if has_work {
            tracing::info!("Online, starting sync");
            self.spawn_cycle(false);
        }
    }

    async fn on_timer_fired(&self, generation: u64) {
        let accepted = self
            .shared
            .state
            .lock()
            .await
            .scheduler
            .acknowledge_fire(generation);
        if accepted {
            tracing::debug!(generation, "Retry timer fired");
            self.spawn_cycle(false);
        }
    }

    async fn on_kick(&self) {
        if !self.is_online() || self.phase() == SyncPhase::Fatal {
            return;
        }
        let ready = {
            let state = self.shared.state.lock().await;
            state.retry.retry_count == 0 && !state.queue.is_empty()
        };
        if ready && !self.spawn_cycle(false) {
            self.shared.rerun.store(true, Ordering::SeqCst);
        }
    }

    /// Spawn the background task reacting to connectivity, timers and new work.
    ///
    /// Returns `None` if a driver was already started for this orchestrator.
    pub fn spawn_driver(&self) -> Option<JoinHandle<()>> {
        let mut fires = self.shared.fires.lock().ok()?.take()?;
        let this = self.clone();
        Some(tokio::spawn(async move {
            let mut signal = this.shared.connectivity.clone();
            this.on_connectivity_changed(signal.is_online()).await;
            loop {
                tokio::select! {
                    changed = signal.changed() => match changed {
                        Some(online) => this.on_connectivity_changed(online).await,
                        None => break,
                    },
                    Some(generation) = fires.recv() => this.on_timer_fired(generation).await,
                    () = this.shared.kick.notified() => this.on_kick().await,
                }
            }
            tracing::debug!("Sync driver stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::error::{Error, RemoteError};
    use crate::models::{Fields, MergeSide, Snapshot, SyncHistoryStatus};
    use crate::sync::connectivity::{connectivity, ConnectivityHandle};
    use crate::sync::remote::PushOutcome;
    use crate::sync::testing::ScriptedRemote;
    use crate::sync::BackoffConfig;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct Fixture {
        sync: SyncOrchestrator<ScriptedRemote>,
        remote: Arc<ScriptedRemote>,
        network: ConnectivityHandle,
        store: Arc<MemoryStore>,
    }

    fn config(max_retries: u32) -> SyncConfig {
        SyncConfig {
            backoff: BackoffConfig {
                max_retries,
                ..BackoffConfig::default()
            },
            scope: SyncScope::new("user-1", Some("fac-1".to_string())),
            ..SyncConfig::default()
        }
    }

    fn fixture_with(remote: ScriptedRemote, online: bool, max_retries: u32) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(remote);
        let (network, signal) = connectivity(online);
        let sync =
            SyncOrchestrator::new(&config(max_retries), store.clone(), remote.clone(), signal)
                .unwrap();
        Fixture {
            sync,
            remote,
            network,
            store,
        }
    }

    fn fixture(online: bool) -> Fixture {
        fixture_with(ScriptedRemote::new(), online, 5)
    }

    fn person(entity_id: &str, name: &str, community: &str) -> EntityMutation {
        let mut fields = Fields::new();
        fields.insert("name".to_string(), json!(name));
        fields.insert("community".to_string(), json!(community));
        EntityMutation::update("person", entity_id, 100, fields)
    }

    fn diverged_remote(entity_id: &str) -> Snapshot {
        let mut fields = Fields::new();
        fields.insert("name".to_string(), json!("Ama Owusu"));
        fields.insert("community".to_string(), json!("Madina"));
        Snapshot {
            entity_id: entity_id.to_string(),
            fields,
            updated_at: 250,
        }
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manual_sync_delivers_everything() {
        let fx = fixture(true);
        fx.sync.enqueue_entity(person("p-1", "Ama", "Nima")).await.unwrap();
        fx.sync.enqueue_entity(person("p-2", "Kofi", "Osu")).await.unwrap();

        let outcome = fx.sync.sync_now().await;

        assert_eq!(
            outcome,
            CycleOutcome::Success {
                synced: 2,
                conflicts: 0
            }
        );
        let status = fx.sync.status().await;
        assert_eq!(status.phase, SyncPhase::Idle);
        assert_eq!(status.stats.pending, 0);
        assert_eq!(status.stats.synced, 2);
        assert!(status.stats.last_synced_at.is_some());
        assert_eq!(status.retry, RetryState::default());
        assert_eq!(
            status.last_sync.unwrap().status,
            SyncHistoryStatus::Success
        );
        assert_eq!(fx.sync.sync_history(10).await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manual_trigger_is_refused_offline() {
        let fx = fixture(false);
        fx.sync.enqueue_entity(person("p-1", "Ama", "Nima")).await.unwrap();

        assert!(!fx.sync.trigger_manual_sync());
        assert_eq!(fx.sync.sync_now().await, CycleOutcome::Offline);
        assert!(matches!(
            fx.sync.refresh_history().await,
            Err(Error::NetworkUnavailable)
        ));
        assert_eq!(fx.remote.push_count(), 0);
        assert_eq!(fx.sync.retry_state().await.retry_count, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failure_increments_and_arms_retry() {
        let fx = fixture(true);
        fx.remote
            .set_fallback(Some(PushOutcome::Failure(RemoteError::Timeout)));
        fx.sync.enqueue_entity(person("p-1", "Ama", "Nima")).await.unwrap();

        let outcome = fx.sync.sync_now().await;

        let CycleOutcome::PartialFailure {
            retry_count,
            next_retry_at,
            failed,
            ..
        } = outcome
        else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(retry_count, 1);
        assert_eq!(failed, 1);
        assert!(next_retry_at.is_some());

        let retry = fx.sync.retry_state().await;
        assert!(retry.is_retrying);
        assert_eq!(retry.last_error.as_deref(), Some("request timed out"));
        assert_eq!(fx.sync.phase(), SyncPhase::Idle);

        let history = fx.sync.sync_history(1).await;
        assert_eq!(history[0].status, SyncHistoryStatus::Failed);
        assert_eq!(fx.sync.status().await.stats.pending, 1);
        let pending = fx.sync.pending().await;
        assert_eq!(pending[0].payload.entity_id(), Some("p-1"));
        assert!(matches!(pending[1].payload, MutationPayload::SyncHistory(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exhausted_retries_turn_fatal_until_manual_success() {
        let fx = fixture_with(ScriptedRemote::new(), true, 2);
        fx.remote
            .set_fallback(Some(PushOutcome::Failure(RemoteError::Timeout)));
        fx.sync.enqueue_entity(person("p-1", "Ama", "Nima")).await.unwrap();

        assert!(matches!(
            fx.sync.sync_now().await,
            CycleOutcome::PartialFailure { .. }
        ));
        let fatal = fx.sync.sync_now().await;
        assert_eq!(fatal, CycleOutcome::Fatal(2));
        assert!(matches!(
            fatal.into_result(),
            Err(Error::RetriesExhausted { attempts: 2 })
        ));
        assert_eq!(fx.sync.phase(), SyncPhase::Fatal);
        assert!(!fx.sync.retry_state().await.is_retrying);

        fx.sync.on_connectivity_changed(false).await;
        fx.sync.on_connectivity_changed(true).await;
        assert_eq!(fx.sync.phase(), SyncPhase::Fatal);
        assert!(!fx.sync.retry_state().await.is_retrying);

        fx.remote.set_fallback(None);
        assert!(matches!(
            fx.sync.sync_now().await,
            CycleOutcome::Success { .. }
        ));
        assert_eq!(fx.sync.retry_state().await, RetryState::default());
        assert_eq!(fx.sync.phase(), SyncPhase::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fatal_state_survives_restart() {
        let fx = fixture_with(ScriptedRemote::new(), true, 1);
        fx.remote
            .set_fallback(Some(PushOutcome::Failure(RemoteError::Timeout)));
        fx.sync.enqueue_entity(person("p-1", "Ama", "Nima")).await.unwrap();
        assert_eq!(fx.sync.sync_now().await, CycleOutcome::Fatal(1));

        let (_network, signal) = connectivity(true);
        let reopened =
            SyncOrchestrator::new(&config(1), fx.store.clone(), fx.remote.clone(), signal)
                .unwrap();

        assert_eq!(reopened.phase(), SyncPhase::Fatal);
        assert_eq!(reopened.retry_state().await.retry_count, 1);
        assert_eq!(reopened.pending().await.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn going_offline_mid_cycle_does_not_count() {
        let (remote, gate) = ScriptedRemote::gated();
        remote.set_fallback(Some(PushOutcome::Failure(RemoteError::Unavailable(
            "connection reset".to_string(),
        ))));
        let fx = fixture_with(remote, true, 5);
        fx.sync.enqueue_entity(person("p-1", "Ama", "Nima")).await.unwrap();

        let sync = fx.sync.clone();
        let cycle = tokio::spawn(async move { sync.sync_now().await });
        gate.entered.notified().await;
        assert_eq!(fx.sync.phase(), SyncPhase::Syncing);

        fx.network.set_online(false);
        gate.release.notify_one();

        assert_eq!(cycle.await.unwrap(), CycleOutcome::Offline);
        let retry = fx.sync.retry_state().await;
        assert_eq!(retry.retry_count, 0);
        assert!(!retry.is_retrying);
        assert_eq!(fx.sync.phase(), SyncPhase::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_and_writes_do_not_wait_for_a_push_in_flight() {
        let (remote, gate) = ScriptedRemote::gated();
        remote.set_fallback(Some(PushOutcome::Failure(RemoteError::Unavailable(
            "connection reset".to_string(),
        ))));
        let fx = fixture_with(remote, true, 5);
        fx.sync.enqueue_entity(person("p-1", "Ama", "Nima")).await.unwrap();

        let sync = fx.sync.clone();
        let cycle = tokio::spawn(async move { sync.sync_now().await });
        gate.entered.notified().await;

        let quick = Duration::from_millis(500);
        fx.network.set_online(false);
        tokio::time::timeout(quick, fx.sync.on_connectivity_changed(false))
            .await
            .expect("offline handling waited on the push");
        assert_eq!(fx.sync.phase(), SyncPhase::Idle);

        tokio::time::timeout(quick, fx.sync.enqueue_entity(person("p-2", "Kofi", "Osu")))
            .await
            .expect("enqueue waited on the push")
            .unwrap();
        let status = tokio::time::timeout(quick, fx.sync.status())
            .await
            .expect("status waited on the push");
        assert!(!status.online);
        assert_eq!(status.stats.pending, 2);
        assert!(!status.retry.is_retrying);

        gate.release.notify_one();
        assert_eq!(cycle.await.unwrap(), CycleOutcome::Offline);
        assert_eq!(fx.sync.retry_state().await.retry_count, 0);
        assert_eq!(fx.sync.phase(), SyncPhase::Idle);
        assert_eq!(fx.remote.push_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn partial_update_matching_remote_is_spurious() {
        let fx = fixture(true);
        let mut remote_fields = diverged_remote("p-1").fields;
        remote_fields.insert("name".to_string(), json!("Ama"));
        fx.remote.script([PushOutcome::Conflict(Some(Snapshot {
            entity_id: "p-1".to_string(),
            fields: remote_fields,
            updated_at: 250,
        }))]);
        let mut fields = Fields::new();
        fields.insert("name".to_string(), json!("Ama"));
        fx.sync
            .enqueue_entity(EntityMutation::update("person", "p-1", 100, fields))
            .await
            .unwrap();

        assert_eq!(
            fx.sync.sync_now().await,
            CycleOutcome::Success {
                synced: 0,
                conflicts: 0
            }
        );
        assert!(fx.sync.conflicts(true).await.is_empty());
        assert_eq!(fx.sync.status().await.stats.spurious_conflicts, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn trigger_during_cycle_is_a_noop() {
        let (remote, gate) = ScriptedRemote::gated();
        let fx = fixture_with(remote, true, 5);
        fx.sync.enqueue_entity(person("p-1", "Ama", "Nima")).await.unwrap();

        let sync = fx.sync.clone();
        let cycle = tokio::spawn(async move { sync.sync_now().await });
        gate.entered.notified().await;

        assert!(!fx.sync.trigger_manual_sync());
        assert_eq!(fx.sync.sync_now().await, CycleOutcome::AlreadySyncing);

        // entity write, then the cycle's history record
        gate.release.notify_one();
        gate.entered.notified().await;
        gate.release.notify_one();

        assert!(matches!(
            cycle.await.unwrap(),
            CycleOutcome::Success { synced: 1, .. }
        ));
        assert_eq!(fx.remote.push_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconnect_rearms_pending_retry() {
        let fx = fixture(true);
        fx.remote.script([PushOutcome::Failure(RemoteError::Timeout)]);
        fx.sync.enqueue_entity(person("p-1", "Ama", "Nima")).await.unwrap();
        fx.sync.sync_now().await;

        fx.network.set_online(false);
        fx.sync.on_connectivity_changed(false).await;
        let paused = fx.sync.retry_state().await;
        assert_eq!(paused.retry_count, 1);
        assert!(!paused.is_retrying);
        assert!(paused.next_retry_at.is_none());

        fx.network.set_online(true);
        fx.sync.on_connectivity_changed(true).await;
        let rearmed = fx.sync.retry_state().await;
        assert_eq!(rearmed.retry_count, 1);
        assert!(rearmed.is_retrying);
        assert!(rearmed.next_retry_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflict_is_surfaced_and_blocks_entity() {
        let fx = fixture(true);
        fx.remote
            .script([PushOutcome::Conflict(Some(diverged_remote("p-1")))]);
        fx.sync.enqueue_entity(person("p-1", "Ama Mensah", "Nima")).await.unwrap();
        fx.sync.enqueue_entity(person("p-1", "Ama M.", "Nima")).await.unwrap();

        let outcome = fx.sync.sync_now().await;

        assert_eq!(
            outcome,
            CycleOutcome::Success {
                synced: 0,
                conflicts: 1
            }
        );
        let conflicts = fx.sync.conflicts(false).await;
        assert_eq!(conflicts.len(), 1);
        let fields: Vec<_> = conflicts[0].diffed_fields().collect();
        assert_eq!(fields, vec!["community", "name"]);
        assert_eq!(fx.sync.status().await.stats.conflicts_open, 1);

        // held write for the same entity is not attempted
        let pushed_before = fx.remote.push_count();
        fx.sync.sync_now().await;
        let entity_pushes = fx.remote.pushed()[pushed_before..]
            .iter()
            .filter(|m| m.payload.entity_id().is_some())
            .count();
        assert_eq!(entity_pushes, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn spurious_conflict_is_dropped_and_counted() {
        let fx = fixture(true);
        let write = person("p-1", "Ama", "Nima");
        fx.remote.script([PushOutcome::Conflict(Some(Snapshot {
            entity_id: "p-1".to_string(),
            fields: write.fields.clone(),
            updated_at: 900,
        }))]);
        fx.sync.enqueue_entity(write).await.unwrap();

        assert_eq!(
            fx.sync.sync_now().await,
            CycleOutcome::Success {
                synced: 0,
                conflicts: 0
            }
        );
        assert!(fx.sync.conflicts(true).await.is_empty());
        assert_eq!(fx.sync.status().await.stats.spurious_conflicts, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keep_local_requeues_with_remote_base_and_logs() {
        let fx = fixture(true);
        fx.remote
            .script([PushOutcome::Conflict(Some(diverged_remote("p-1")))]);
        fx.sync.enqueue_entity(person("p-1", "Ama Mensah", "Nima")).await.unwrap();
        fx.sync.sync_now().await;
        let id = fx.sync.conflicts(false).await[0].id;

        let resolution = fx
            .sync
            .resolve_conflict(id, ResolutionPolicy::KeepLocal)
            .await
            .unwrap();

        assert_eq!(resolution.policy, "local");
        let requeued = fx
            .sync
            .pending()
            .await
            .into_iter()
            .find_map(|m| match m.payload {
                MutationPayload::Entity(write) => Some(write),
                _ => None,
            })
            .unwrap();
        assert_eq!(requeued.base_updated_at, Some(250));
        assert_eq!(requeued.fields["community"], json!("Nima"));

        let activity = fx.sync.activity(None, 10).await.unwrap();
        assert_eq!(activity[0].action, RecordAction::Update);
        assert_eq!(activity[0].entity_id.as_deref(), Some("p-1"));
        assert!(fx.sync.conflicts(false).await.is_empty());

        assert!(matches!(
            fx.sync
                .resolve_conflict(id, ResolutionPolicy::KeepRemote)
                .await,
            Err(Error::ConflictAlreadyResolved(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn incomplete_merge_leaves_conflict_open() {
        let fx = fixture(true);
        fx.remote
            .script([PushOutcome::Conflict(Some(diverged_remote("p-1")))]);
        fx.sync.enqueue_entity(person("p-1", "Ama Mensah", "Nima")).await.unwrap();
        fx.sync.sync_now().await;
        let id = fx.sync.conflicts(false).await[0].id;
        let pending_before = fx.sync.pending().await.len();

        let choices = BTreeMap::from([("name".to_string(), MergeSide::Local)]);
        let error = fx
            .sync
            .resolve_conflict(id, ResolutionPolicy::Merge(choices))
            .await
            .unwrap_err();

        assert!(matches!(error, Error::MergeIncomplete { ref missing } if missing == &["community"]));
        assert_eq!(fx.sync.conflicts(false).await.len(), 1);
        assert_eq!(fx.sync.pending().await.len(), pending_before);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_registration_id_is_reallocated() {
        let fx = fixture(true);
        let id = fx
            .sync
            .allocate_registration_id(None, &["GHS-2024-0007".to_string()], Some(2024))
            .await
            .unwrap();
        assert_eq!(id.to_string(), "GHS-2024-0008");

        let mut fields = Fields::new();
        fields.insert(REGISTRATION_FIELD.to_string(), json!(id.to_string()));
        fx.sync
            .enqueue_entity(EntityMutation::create("person", "p-9", fields))
            .await
            .unwrap();
        fx.remote.script([PushOutcome::Failure(RemoteError::DuplicateId(
            id.to_string(),
        ))]);

        let outcome = fx.sync.sync_now().await;

        assert!(matches!(outcome, CycleOutcome::Success { synced: 1, .. }));
        let pushed = fx.remote.pushed();
        let MutationPayload::Entity(ref retried) = pushed[1].payload else {
            panic!("expected retried entity write");
        };
        assert_eq!(retried.fields[REGISTRATION_FIELD], json!("GHS-2024-0009"));

        let activity = fx.sync.activity(Some("fac-1"), 10).await.unwrap();
        assert_eq!(activity[0].action, RecordAction::Update);
        assert_eq!(
            activity[0].new_data,
            Some(json!({ REGISTRATION_FIELD: "GHS-2024-0009" }))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn allocation_counts_queued_registration_ids() {
        let fx = fixture(false);
        let mut fields = Fields::new();
        fields.insert(REGISTRATION_FIELD.to_string(), json!("GHS-2024-0041"));
        fx.sync
            .enqueue_entity(EntityMutation::create("person", "p-1", fields))
            .await
            .unwrap();

        let id = fx
            .sync
            .allocate_registration_id(None, &[], Some(2024))
            .await
            .unwrap();
        assert_eq!(id.to_string(), "GHS-2024-0042");
    }

    #[tokio::test(start_paused = true)]
    async fn driver_syncs_on_reconnect() {
        let fx = fixture(false);
        let driver = fx.sync.spawn_driver().unwrap();
        assert!(fx.sync.spawn_driver().is_none());

        fx.sync.enqueue_entity(person("p-1", "Ama", "Nima")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.remote.push_count(), 0);

        fx.network.set_online(true);
        let sync = fx.sync.clone();
        eventually(|| {
            let sync = sync.clone();
            async move { sync.status().await.stats.pending == 0 }
        })
        .await;
        assert_eq!(fx.sync.sync_history(10).await.len(), 1);
        driver.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn driver_retries_after_backoff() {
        let fx = fixture(true);
        fx.remote.script([PushOutcome::Failure(RemoteError::Timeout)]);
        let driver = fx.sync.spawn_driver().unwrap();

        fx.sync.enqueue_entity(person("p-1", "Ama", "Nima")).await.unwrap();

        let sync = fx.sync.clone();
        eventually(|| {
            let sync = sync.clone();
            async move { sync.sync_history(10).await.len() == 2 }
        })
        .await;

        let history = fx.sync.sync_history(10).await;
        assert_eq!(history[0].status, SyncHistoryStatus::Success);
        assert_eq!(history[1].status, SyncHistoryStatus::Failed);
        assert_eq!(fx.sync.retry_state().await, RetryState::default());
        assert_eq!(fx.sync.status().await.stats.pending, 0);
        driver.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn driver_cancels_timer_when_offline() {
        let fx = fixture(true);
        fx.remote.script([PushOutcome::Failure(RemoteError::Timeout)]);
        let driver = fx.sync.spawn_driver().unwrap();
        fx.sync.enqueue_entity(person("p-1", "Ama", "Nima")).await.unwrap();

        let sync = fx.sync.clone();
        eventually(|| {
            let sync = sync.clone();
            async move { sync.retry_state().await.is_retrying }
        })
        .await;

        fx.network.set_online(false);
        let sync = fx.sync.clone();
        eventually(|| {
            let sync = sync.clone();
            async move { !sync.retry_state().await.is_retrying }
        })
        .await;

        let pushes = fx.remote.push_count();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fx.remote.push_count(), pushes);
        assert_eq!(fx.sync.retry_state().await.retry_count, 1);
        driver.abort();
    }
}
