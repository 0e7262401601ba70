//! Sync state machine and the status surface shown to callers.

use serde::{Deserialize, Serialize};

use crate::models::{RetryState, SyncHistoryRecord};

/// Orchestrator phase
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Syncing,
    Success,
    PartialFailure,
    /// Retries exhausted; only a manual trigger leaves this phase
    Fatal,
}

/// Inputs that move the phase
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    Trigger { manual: bool },
    CycleSucceeded,
    CycleFailed { exhausted: bool },
    /// Terminal outcome has been handled (timer armed or retries reset)
    Settle,
    WentOffline,
}

impl SyncPhase {
    pub const fn next(self, event: SyncEvent) -> Self {
        match (self, event) {
            (Self::Syncing, SyncEvent::Trigger { .. })
            | (Self::Fatal, SyncEvent::Trigger { manual: false } | SyncEvent::WentOffline) => self,
            (_, SyncEvent::Trigger { .. }) => Self::Syncing,
            (Self::Syncing, SyncEvent::CycleSucceeded) => Self::Success,
            (Self::Syncing, SyncEvent::CycleFailed { exhausted: true }) => Self::Fatal,
            (Self::Syncing, SyncEvent::CycleFailed { exhausted: false }) => Self::PartialFailure,
            (Self::Success | Self::PartialFailure, SyncEvent::Settle) | (_, SyncEvent::WentOffline) => {
                Self::Idle
            }
            _ => self,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Success => "success",
            Self::PartialFailure => "partial_failure",
            Self::Fatal => "fatal",
        }
    }
}

/// Coarse indicator for status bars
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Offline,
    Syncing,
    Synced,
    Error,
}

/// Counters kept across cycles
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncStats {
    pub pending: usize,
    pub synced: u64,
    pub failed: u64,
    pub conflicts_open: usize,
    pub spurious_conflicts: u64,
    /// Last fully successful cycle (Unix ms)
    pub last_synced_at: Option<i64>,
}

/// Snapshot of everything a caller may want to show
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub online: bool,
    pub retry: RetryState,
    pub stats: SyncStats,
    pub last_sync: Option<SyncHistoryRecord>,
}

impl SyncStatus {
    pub const fn indicator(&self) -> SyncState {
        if !self.online {
            return SyncState::Offline;
        }
        match self.phase {
            SyncPhase::Syncing => SyncState::Syncing,
            SyncPhase::Fatal | SyncPhase::PartialFailure => SyncState::Error,
            SyncPhase::Idle | SyncPhase::Success if self.retry.retry_count > 0 => SyncState::Error,
            SyncPhase::Idle | SyncPhase::Success => SyncState::Synced,
        }
    }
}
