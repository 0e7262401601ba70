//! Activity log model

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of change applied to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordAction {
    Create,
    Update,
    SoftDelete,
    Restore,
    PermanentDelete,
}

impl RecordAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::SoftDelete => "soft_delete",
            Self::Restore => "restore",
            Self::PermanentDelete => "permanent_delete",
        }
    }
}

impl fmt::Display for RecordAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit entry describing who changed what
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub facility_id: String,
    pub user_id: String,
    pub action: RecordAction,
    pub entity_type: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub old_data: Option<serde_json::Value>,
    #[serde(default)]
    pub new_data: Option<serde_json::Value>,
    #[serde(default)]
    pub description: Option<String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
}

impl ActivityLogEntry {
    /// Create an entry stamped with the current time
    #[must_use]
    pub fn new(
        facility_id: impl Into<String>,
        user_id: impl Into<String>,
        action: RecordAction,
        entity_type: impl Into<String>,
    ) -> Self {
        Self {
            facility_id: facility_id.into(),
            user_id: user_id.into(),
            action,
            entity_type: entity_type.into(),
            entity_id: None,
            old_data: None,
            new_data: None,
            description: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[must_use]
    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    #[must_use]
    pub fn with_data(
        mut self,
        old_data: Option<serde_json::Value>,
        new_data: Option<serde_json::Value>,
    ) -> Self {
        self.old_data = old_data;
        self.new_data = new_data;
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}
