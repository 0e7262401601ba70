//! Sync history model

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of one sync cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncHistoryStatus {
    Success,
    Failed,
    Partial,
}

impl SyncHistoryStatus {
    /// Classify a cycle from its delivery counts.
    pub const fn from_counts(synced: usize, failed: usize) -> Self {
        if failed == 0 {
            Self::Success
        } else if synced == 0 {
            Self::Failed
        } else {
            Self::Partial
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Partial => "partial",
        }
    }
}

/// One record per sync cycle attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHistoryRecord {
    pub id: Uuid,
    pub user_id: String,
    #[serde(default)]
    pub facility_id: Option<String>,
    pub status: SyncHistoryStatus,
    pub synced_count: usize,
    pub failed_count: usize,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Cycle start (Unix ms)
    pub started_at: i64,
    /// Cycle end (Unix ms)
    #[serde(default)]
    pub completed_at: Option<i64>,
}
