//! Pending mutation model

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::activity::{ActivityLogEntry, RecordAction};
use super::sync_history::SyncHistoryRecord;

/// Entity field values, ordered by field name.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// A unique identifier for a queued mutation, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationId(Uuid);

impl MutationId {
    /// Create a new unique mutation ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MutationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Point-in-time copy of an entity plus its last-modified timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entity_id: String,
    pub fields: Fields,
    /// Last modification (Unix ms)
    pub updated_at: i64,
}

/// An intended change to one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMutation {
    pub entity_type: String,
    pub entity_id: String,
    pub operation: RecordAction,
    /// Remote `updated_at` this write was based on; `None` for creates
    #[serde(default)]
    pub base_updated_at: Option<i64>,
    pub fields: Fields,
}

impl EntityMutation {
    /// Build a create mutation for a brand new entity.
    pub fn create(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        fields: Fields,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation: RecordAction::Create,
            base_updated_at: None,
            fields,
        }
    }

    /// Build an update mutation based on a known remote timestamp.
    pub fn update(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        base_updated_at: i64,
        fields: Fields,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation: RecordAction::Update,
            base_updated_at: Some(base_updated_at),
            fields,
        }
    }
}

/// What a queued mutation carries to the remote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum MutationPayload {
    Entity(EntityMutation),
    Activity(ActivityLogEntry),
    SyncHistory(SyncHistoryRecord),
}

impl MutationPayload {
    /// Entity targeted by this payload, if it is an entity write.
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            Self::Entity(mutation) => Some(&mutation.entity_id),
            Self::Activity(_) | Self::SyncHistory(_) => None,
        }
    }

    /// Short label used in logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Entity(_) => "entity",
            Self::Activity(_) => "activity",
            Self::SyncHistory(_) => "sync_history",
        }
    }
}

/// A write that has not been acknowledged by the remote yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: MutationId,
    pub payload: MutationPayload,
    /// Enqueue timestamp (Unix ms)
    pub enqueued_at: i64,
}

impl PendingMutation {
    /// Wrap a payload with a fresh id and the current time.
    #[must_use]
    pub fn new(payload: MutationPayload) -> Self {
        Self {
            id: MutationId::new(),
            payload,
            enqueued_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}
