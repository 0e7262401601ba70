//! Conflict detection and policy-driven resolution.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::db::{keys, load_json, save_json, DurableStore};
use crate::error::{Error, Result};
use crate::models::{
    ConflictId, ConflictRecord, EntityMutation, FieldDiff, Fields, MergeSide, RecordAction,
    ResolutionPolicy, Snapshot,
};
use crate::util::unix_millis_now;

/// Resolved records kept for display; unresolved ones are never pruned
const RESOLVED_RETENTION: usize = 50;

/// Every field the local write sets to something other than the remote value,
/// ordered by field name.
///
/// Only keys carried by `local` are compared: a partial update says nothing
/// about the fields it leaves alone. A key missing remotely compares as `null`.
pub fn diff_fields(local: &Fields, remote: &Fields) -> Vec<FieldDiff> {
    local
        .iter()
        .filter_map(|(name, local_value)| {
            let remote_value = remote.get(name).unwrap_or(&Value::Null);
            (local_value != remote_value).then(|| FieldDiff {
                field: name.clone(),
                local_value: local_value.clone(),
                remote_value: remote_value.clone(),
            })
        })
        .collect()
}

/// Result of comparing a rejected write with the remote copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// Remote still carries the write's base timestamp; nothing diverged
    BaseUnchanged,
    /// Payloads agree on every field the write sets; the local write can be dropped
    Spurious,
    Conflict(ConflictRecord),
}

/// Compare a rejected write against the current remote snapshot.
pub fn detect(write: &EntityMutation, remote: &Snapshot) -> Detection {
    if write.base_updated_at == Some(remote.updated_at) {
        return Detection::BaseUnchanged;
    }
    let diffs = diff_fields(&write.fields, &remote.fields);
    if diffs.is_empty() {
        return Detection::Spurious;
    }

    Detection::Conflict(ConflictRecord {
        id: ConflictId::new(),
        entity_id: write.entity_id.clone(),
        entity_type: write.entity_type.clone(),
        operation: write.operation,
        local_version: write.fields.clone(),
        remote_version: remote.fields.clone(),
        local_timestamp: write.base_updated_at,
        remote_timestamp: remote.updated_at,
        detected_at: unix_millis_now(),
        resolved: false,
        diffs,
        resolution: None,
        resolved_at: None,
    })
}

/// Effects of resolving one conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub conflict_id: ConflictId,
    pub policy: &'static str,
    /// Write to send on top of the remote version, if any
    pub requeue: Option<EntityMutation>,
    /// Copy the caller should now treat as current
    pub adopted: Snapshot,
}

/// Persisted conflict records
pub struct ConflictStore {
    store: Arc<dyn DurableStore>,
    records: Vec<ConflictRecord>,
}

impl ConflictStore {
    pub fn load(store: Arc<dyn DurableStore>) -> Result<Self> {
        let records = load_json(store.as_ref(), keys::CONFLICTS)?.unwrap_or_default();
        Ok(Self { store, records })
    }

    fn persist(&self) -> Result<()> {
        save_json(self.store.as_ref(), keys::CONFLICTS, &self.records)
    }

    /// Persist a newly detected conflict.
    pub fn insert(&mut self, record: ConflictRecord) -> Result<()> {
        self.records.push(record);
        if let Err(error) = self.persist() {
            self.records.pop();
            return Err(error);
        }
        Ok(())
    }

    pub fn get(&self, id: ConflictId) -> Option<&ConflictRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    pub fn all(&self) -> &[ConflictRecord] {
        &self.records
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &ConflictRecord> {
        self.records.iter().filter(|record| !record.resolved)
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved().count()
    }

    /// Entities whose queued writes must wait for a resolution
    pub fn blocked_entities(&self) -> HashSet<String> {
        self.unresolved()
            .map(|record| record.entity_id.clone())
            .collect()
    }

    /// Work out what `policy` would do without changing anything.
    pub fn prepare_resolution(
        &self,
        id: ConflictId,
        policy: &ResolutionPolicy,
    ) -> Result<Resolution> {
        let record = self
            .get(id)
            .ok_or_else(|| Error::ConflictNotFound(id.to_string()))?;
        if record.resolved {
            return Err(Error::ConflictAlreadyResolved(id.to_string()));
        }

        let remote = Snapshot {
            entity_id: record.entity_id.clone(),
            fields: record.remote_version.clone(),
            updated_at: record.remote_timestamp,
        };

        let (requeue, adopted) = match policy {
            ResolutionPolicy::KeepRemote => (None, remote),
            ResolutionPolicy::KeepLocal => {
                let mut merged = remote.fields.clone();
                for diff in &record.diffs {
                    merged.insert(diff.field.clone(), diff.local_value.clone());
                }
                let write = requeued_write(record, record.local_version.clone());
                (Some(write), Snapshot { fields: merged, ..remote })
            }
            ResolutionPolicy::Merge(choices) => {
                let missing: Vec<String> = record
                    .diffed_fields()
                    .filter(|field| !choices.contains_key(*field))
                    .map(ToString::to_string)
                    .collect();
                if !missing.is_empty() {
                    return Err(Error::MergeIncomplete { missing });
                }

                let mut merged = remote.fields.clone();
                for diff in &record.diffs {
                    if choices.get(&diff.field) == Some(&MergeSide::Local) {
                        merged.insert(diff.field.clone(), diff.local_value.clone());
                    }
                }
                let write = requeued_write(record, merged.clone());
                (Some(write), Snapshot { fields: merged, ..remote })
            }
        };

        Ok(Resolution {
            conflict_id: id,
            policy: policy.name(),
            requeue,
            adopted,
        })
    }

    /// Flag a conflict resolved and prune old resolved records.
    pub fn mark_resolved(&mut self, id: ConflictId, policy: &str) -> Result<()> {
        let previous = self.records.clone();
        let record = self
            .records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| Error::ConflictNotFound(id.to_string()))?;
        if record.resolved {
            return Err(Error::ConflictAlreadyResolved(id.to_string()));
        }
        record.resolved = true;
        record.resolution = Some(policy.to_string());
        record.resolved_at = Some(unix_millis_now());

        self.prune();
        if let Err(error) = self.persist() {
            self.records = previous;
            return Err(error);
        }
        Ok(())
    }

    fn prune(&mut self) {
        let mut resolved: Vec<(i64, ConflictId)> = self
            .records
            .iter()
            .filter(|record| record.resolved)
            .map(|record| (record.resolved_at.unwrap_or(record.detected_at), record.id))
            .collect();
        if resolved.len() <= RESOLVED_RETENTION {
            return;
        }
        resolved.sort_by(|a, b| b.0.cmp(&a.0));
        let dropped: HashSet<ConflictId> = resolved
            .into_iter()
            .skip(RESOLVED_RETENTION)
            .map(|(_, id)| id)
            .collect();
        self.records.retain(|record| !dropped.contains(&record.id));
    }
}

fn requeued_write(record: &ConflictRecord, fields: Fields) -> EntityMutation {
    // The entity exists remotely now, so a rejected create goes back as an update.
    let operation = match record.operation {
        RecordAction::Create => RecordAction::Update,
        other => other,
    };
    EntityMutation {
        entity_type: record.entity_type.clone(),
        entity_id: record.entity_id.clone(),
        operation,
        base_updated_at: Some(record.remote_timestamp),
        fields,
    }
}
