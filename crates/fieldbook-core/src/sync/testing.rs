//! Scripted in-memory remote used by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::remote::{PushOutcome, RecentKind, RemoteCollaborator};
use crate::error::RemoteError;
use crate::models::{PendingMutation, Snapshot};

/// Replies to pushes from a script, then acknowledges everything.
#[derive(Default)]
pub struct ScriptedRemote {
    script: Mutex<VecDeque<PushOutcome>>,
    fallback: Mutex<Option<PushOutcome>>,
    pushed: Mutex<Vec<PendingMutation>>,
    snapshots: Mutex<HashMap<String, Snapshot>>,
    recent: Mutex<HashMap<&'static str, Vec<serde_json::Value>>>,
    gate: Option<PushGate>,
}

/// Lets a test park a push mid-flight.
#[derive(Clone, Default)]
pub struct PushGate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every push waits on the returned gate until released.
    pub fn gated() -> (Self, PushGate) {
        let gate = PushGate::default();
        let remote = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (remote, gate)
    }

    /// Queue replies for the next pushes, in order.
    pub fn script(&self, outcomes: impl IntoIterator<Item = PushOutcome>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    /// Reply used once the script is exhausted (default `Ack`).
    pub fn set_fallback(&self, outcome: Option<PushOutcome>) {
        *self.fallback.lock().unwrap() = outcome;
    }

    pub fn set_snapshot(&self, snapshot: Snapshot) {
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.entity_id.clone(), snapshot);
    }

    pub fn set_recent(&self, kind: RecentKind, rows: Vec<serde_json::Value>) {
        self.recent.lock().unwrap().insert(kind.path(), rows);
    }

    /// Every mutation pushed so far, in push order.
    pub fn pushed(&self) -> Vec<PendingMutation> {
        self.pushed.lock().unwrap().clone()
    }

    pub fn push_count(&self) -> usize {
        self.pushed.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteCollaborator for ScriptedRemote {
    async fn push(&self, mutation: &PendingMutation) -> PushOutcome {
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        self.pushed.lock().unwrap().push(mutation.clone());
        let scripted = self.script.lock().unwrap().pop_front();
        scripted
            .or_else(|| self.fallback.lock().unwrap().clone())
            .unwrap_or(PushOutcome::Ack)
    }

    async fn fetch_snapshot(&self, entity_id: &str) -> Result<Snapshot, RemoteError> {
        self.snapshots
            .lock()
            .unwrap()
            .get(entity_id)
            .cloned()
            .ok_or_else(|| RemoteError::Http {
                status: 404,
                message: format!("entity {entity_id} not found"),
            })
    }

    async fn list_recent(
        &self,
        kind: RecentKind,
        _scope_id: &str,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, RemoteError> {
        let rows = self
            .recent
            .lock()
            .unwrap()
            .get(kind.path())
            .cloned()
            .ok_or_else(|| RemoteError::Unavailable("no rows scripted".to_string()))?;
        Ok(rows.into_iter().take(limit).collect())
    }
}
