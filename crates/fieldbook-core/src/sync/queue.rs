//! Durable FIFO of writes waiting for the remote.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use super::conflict::{detect, Detection};
use super::remote::{PushOutcome, RemoteCollaborator};
use crate::config::SyncScope;
use crate::db::{keys, load_json, save_json, DurableStore};
use crate::error::{RemoteError, Result};
use crate::history::SyncHistory;
use crate::models::{
    EntityMutation, MutationId, MutationPayload, PendingMutation, Snapshot, SyncHistoryRecord,
    SyncHistoryStatus,
};
use crate::util::unix_millis_now;

/// Local fix applied to a mutation the remote refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repair {
    pub entity_type: String,
    pub entity_id: String,
    pub previous: String,
    pub replacement: String,
}

/// Hook that can rewrite a rejected mutation so it can be retried.
pub trait MutationRepair: Send {
    /// Return the rewritten mutation, or `None` when the error is not fixable locally.
    fn repair(
        &mut self,
        mutation: &PendingMutation,
        error: &RemoteError,
    ) -> Result<Option<(PendingMutation, Repair)>>;
}

/// A write the remote refused because its copy diverged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedWrite {
    pub write: EntityMutation,
    pub remote: Snapshot,
    /// Never [`Detection::BaseUnchanged`]; such writes stay queued
    pub detection: Detection,
}

/// What one drain did
#[derive(Debug, Clone)]
pub struct DrainReport {
    pub synced: usize,
    /// Queued writes left behind by a failure; deferred history records excluded
    pub failed: usize,
    /// Mutations skipped because their entity is in conflict
    pub held: usize,
    pub last_error: Option<RemoteError>,
    /// Local store failure that stopped the drain
    pub store_error: Option<String>,
    pub conflicts: Vec<RejectedWrite>,
    pub repairs: Vec<Repair>,
    pub history: SyncHistoryRecord,
}

impl DrainReport {
    pub const fn is_success(&self) -> bool {
        self.last_error.is_none() && self.store_error.is_none()
    }

    /// Message for whichever failure stopped the drain
    pub fn failure(&self) -> Option<String> {
        self.store_error
            .clone()
            .or_else(|| self.last_error.as_ref().map(ToString::to_string))
    }
}

/// State a drain settles into, borrowed one step at a time.
pub trait DrainTarget: Send {
    fn queue(&mut self) -> &mut PendingMutationQueue;
    fn history(&mut self) -> &mut SyncHistory;
    fn repair(&mut self) -> Option<&mut dyn MutationRepair>;
}

/// Inputs to [`drain`]
pub struct DrainContext<'a> {
    /// Entities with unresolved conflicts; their writes are not attempted
    pub blocked: &'a HashSet<String>,
    pub scope: &'a SyncScope,
}

/// Pending mutations in enqueue order, persisted on every change.
pub struct PendingMutationQueue {
    store: Arc<dyn DurableStore>,
    items: VecDeque<PendingMutation>,
}

impl PendingMutationQueue {
    /// Restore the queue from the store (empty when never saved).
    pub fn load(store: Arc<dyn DurableStore>) -> Result<Self> {
        let items: Vec<PendingMutation> =
            load_json(store.as_ref(), keys::PENDING_MUTATIONS)?.unwrap_or_default();
        Ok(Self {
            store,
            items: items.into(),
        })
    }

    /// Append a mutation and persist before returning.
    ///
    /// When persisting fails the queue is left exactly as it was.
    pub fn enqueue(&mut self, payload: MutationPayload) -> Result<PendingMutation> {
        let mutation = PendingMutation::new(payload);
        let mut next = self.items.clone();
        next.push_back(mutation.clone());
        self.commit(next)?;
        tracing::debug!(id = %mutation.id, kind = mutation.payload.kind(), "Enqueued mutation");
        Ok(mutation)
    }

    /// Defer a cycle's history record, keeping at most `limit` of them queued.
    ///
    /// The oldest deferred records are dropped first.
    pub fn enqueue_history(
        &mut self,
        record: SyncHistoryRecord,
        limit: usize,
    ) -> Result<PendingMutation> {
        let mutation = PendingMutation::new(MutationPayload::SyncHistory(record));
        let mut next = self.items.clone();
        next.push_back(mutation.clone());

        let mut excess = next
            .iter()
            .filter(|item| is_history(item))
            .count()
            .saturating_sub(limit);
        if excess > 0 {
            next.retain(|item| {
                if excess > 0 && is_history(item) {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }

        self.commit(next)?;
        Ok(mutation)
    }

    /// Rewrite a queued mutation in place. Returns `false` if it is no longer queued.
    pub fn replace(&mut self, mutation: PendingMutation) -> Result<bool> {
        let Some(index) = self.position(mutation.id) else {
            return Ok(false);
        };
        let mut next = self.items.clone();
        next[index] = mutation;
        self.commit(next)?;
        Ok(true)
    }

    /// Drop a mutation once it has been dealt with.
    ///
    /// Memory only changes after the store accepted the shorter queue.
    pub fn remove(&mut self, id: MutationId) -> Result<()> {
        let Some(index) = self.position(id) else {
            return Ok(());
        };
        let mut next = self.items.clone();
        next.remove(index);
        self.commit(next)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Queued entity writes and activity entries, without deferred history records
    pub fn pending_writes(&self) -> usize {
        self.items.iter().filter(|item| !is_history(item)).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingMutation> {
        self.items.iter()
    }

    /// Owned copy of the queue, head first
    pub fn snapshot(&self) -> Vec<PendingMutation> {
        self.items.iter().cloned().collect()
    }

    /// First mutation whose entity is not held
    fn next_deliverable(&self, held: &HashSet<String>) -> Option<PendingMutation> {
        self.items
            .iter()
            .find(|item| !is_held(item, held))
            .cloned()
    }

    /// Writes from `id` onwards that a failure left undelivered
    fn undelivered_from(&self, id: MutationId, held: &HashSet<String>) -> usize {
        self.position(id).map_or(0, |index| {
            self.items
                .iter()
                .skip(index)
                .filter(|item| !is_held(item, held) && !is_history(item))
                .count()
        })
    }

    fn position(&self, id: MutationId) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    fn commit(&mut self, next: VecDeque<PendingMutation>) -> Result<()> {
        save_json(
            self.store.as_ref(),
            keys::PENDING_MUTATIONS,
            &next.iter().collect::<Vec<_>>(),
        )?;
        self.items = next;
        Ok(())
    }
}

fn is_history(mutation: &PendingMutation) -> bool {
    matches!(mutation.payload, MutationPayload::SyncHistory(_))
}

fn is_held(mutation: &PendingMutation, held: &HashSet<String>) -> bool {
    mutation
        .payload
        .entity_id()
        .is_some_and(|entity| held.contains(entity))
}

enum Delivery {
    Ack,
    Diverged(RejectedWrite),
    Failed(RemoteError),
}

/// Push one mutation; a conflict without a carried snapshot fetches the remote copy.
async fn deliver<R: RemoteCollaborator + ?Sized>(
    remote: &R,
    mutation: &PendingMutation,
) -> Delivery {
    let carried = match remote.push(mutation).await {
        PushOutcome::Ack => return Delivery::Ack,
        PushOutcome::Failure(error) => return Delivery::Failed(error),
        PushOutcome::Conflict(carried) => carried,
    };
    let MutationPayload::Entity(write) = &mutation.payload else {
        return Delivery::Failed(RemoteError::InvalidPayload(format!(
            "conflict reported for {} mutation {}",
            mutation.payload.kind(),
            mutation.id
        )));
    };

    tracing::warn!(entity_id = %write.entity_id, "Remote rejected write, entity diverged");
    let snapshot = match carried {
        Some(snapshot) => snapshot,
        None => match remote.fetch_snapshot(&write.entity_id).await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                tracing::warn!(error = %error, "Could not fetch remote copy");
                return Delivery::Failed(error);
            }
        },
    };

    match detect(write, &snapshot) {
        Detection::BaseUnchanged => Delivery::Failed(RemoteError::InvalidPayload(format!(
            "conflict reported but {} is unchanged since {}",
            write.entity_id, snapshot.updated_at
        ))),
        detection => Delivery::Diverged(RejectedWrite {
            write: write.clone(),
            remote: snapshot,
            detection,
        }),
    }
}

fn try_repair<T: DrainTarget + ?Sized>(
    target: &mut T,
    mutation: &PendingMutation,
    error: &RemoteError,
) -> Result<Option<Repair>> {
    let Some(hook) = target.repair() else {
        return Ok(None);
    };
    let Some((rewritten, repair)) = hook.repair(mutation, error)? else {
        return Ok(None);
    };
    target.queue().replace(rewritten)?;
    Ok(Some(repair))
}

/// Push every deliverable mutation in FIFO order.
///
/// `target` is locked for each bookkeeping step and released while a push
/// is in flight, so writers and status readers never wait on the network.
/// Stops at the first failure so nothing is attempted ahead of it. A
/// conflicting entity write leaves the queue and is returned in the report;
/// later writes for that entity are held. Exactly one [`SyncHistoryRecord`]
/// is appended per call, including when the local store fails mid-drain.
pub async fn drain<R, T>(remote: &R, target: &Mutex<T>, ctx: DrainContext<'_>) -> DrainReport
where
    R: RemoteCollaborator + ?Sized,
    T: DrainTarget,
{
    let started_at = unix_millis_now();
    let mut held: HashSet<String> = ctx.blocked.clone();
    let mut repaired: HashSet<MutationId> = HashSet::new();
    let mut synced = 0;
    let mut last_error = None;
    let mut store_error = None;
    let mut stopped_at = None;
    let mut conflicts = Vec::new();
    let mut repairs = Vec::new();

    loop {
        let next = target.lock().await.queue().next_deliverable(&held);
        let Some(mutation) = next else {
            break;
        };

        match deliver(remote, &mutation).await {
            Delivery::Ack => {
                tracing::debug!(id = %mutation.id, kind = mutation.payload.kind(), "Mutation acknowledged");
                let removed = target.lock().await.queue().remove(mutation.id);
                if let Err(error) = removed {
                    tracing::error!(error = %error, "Failed to drop acknowledged mutation, stopping drain");
                    stopped_at = Some(mutation.id);
                    store_error = Some(error.to_string());
                    break;
                }
                synced += 1;
            }
            Delivery::Diverged(rejected) => {
                let removed = target.lock().await.queue().remove(mutation.id);
                if let Err(error) = removed {
                    tracing::error!(error = %error, "Failed to set aside conflicting write, stopping drain");
                    stopped_at = Some(mutation.id);
                    store_error = Some(error.to_string());
                    break;
                }
                held.insert(rejected.write.entity_id.clone());
                conflicts.push(rejected);
            }
            Delivery::Failed(error) => {
                if !repaired.contains(&mutation.id) {
                    let attempt = try_repair(&mut *target.lock().await, &mutation, &error);
                    match attempt {
                        Ok(Some(repair)) => {
                            tracing::info!(
                                entity_id = %repair.entity_id,
                                previous = %repair.previous,
                                replacement = %repair.replacement,
                                "Rewrote rejected mutation, retrying"
                            );
                            repaired.insert(mutation.id);
                            repairs.push(repair);
                            continue;
                        }
                        Ok(None) => {}
                        Err(local) => {
                            tracing::error!(error = %local, "Failed to repair rejected mutation");
                            store_error = Some(local.to_string());
                        }
                    }
                }
                tracing::warn!(id = %mutation.id, error = %error, "Push failed, stopping drain");
                stopped_at = Some(mutation.id);
                last_error = Some(error);
                break;
            }
        }
    }

    let mut guard = target.lock().await;
    let failed = stopped_at.map_or(0, |id| guard.queue().undelivered_from(id, &held));
    let held_count = guard
        .queue()
        .iter()
        .filter(|item| is_held(item, &held))
        .count();

    let error_message = store_error
        .clone()
        .or_else(|| last_error.as_ref().map(ToString::to_string));
    // A stuck deferred history record still makes the cycle a failure
    let status = if error_message.is_some() {
        SyncHistoryStatus::from_counts(synced, failed.max(1))
    } else {
        SyncHistoryStatus::Success
    };
    let history = SyncHistoryRecord {
        id: Uuid::now_v7(),
        user_id: ctx.scope.user_id.clone(),
        facility_id: ctx.scope.facility_id.clone(),
        status,
        synced_count: synced,
        failed_count: failed,
        error_message,
        started_at,
        completed_at: Some(unix_millis_now()),
    };
    if let Err(error) = guard.history().append(history.clone()) {
        tracing::warn!(error = %error, "Failed to cache sync history record");
    }
    drop(guard);

    let push_now = last_error.is_none() && store_error.is_none();
    replicate_history(remote, target, &history, push_now).await;

    DrainReport {
        synced,
        failed,
        held: held_count,
        last_error,
        store_error,
        conflicts,
        repairs,
        history,
    }
}

/// Deliver the cycle's history record now, or defer it through the queue.
async fn replicate_history<R, T>(
    remote: &R,
    target: &Mutex<T>,
    record: &SyncHistoryRecord,
    push_now: bool,
) where
    R: RemoteCollaborator + ?Sized,
    T: DrainTarget,
{
    if push_now {
        let mutation = PendingMutation::new(MutationPayload::SyncHistory(record.clone()));
        match remote.push(&mutation).await {
            PushOutcome::Ack => return,
            outcome => {
                tracing::debug!(?outcome, "Deferring sync history replication");
            }
        }
    }

    let mut guard = target.lock().await;
    let limit = guard.history().limit();
    if let Err(error) = guard.queue().enqueue_history(record.clone(), limit) {
        tracing::warn!(error = %error, "Failed to queue sync history record");
    }
}
