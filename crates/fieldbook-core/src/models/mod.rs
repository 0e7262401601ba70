//! Data models for Fieldbook

mod activity;
mod mutation;
mod retry_state;
mod sync_conflict;
mod sync_history;

pub use activity::{ActivityLogEntry, RecordAction};
pub use mutation::{EntityMutation, Fields, MutationId, MutationPayload, PendingMutation, Snapshot};
pub use retry_state::RetryState;
pub use sync_conflict::{ConflictId, ConflictRecord, FieldDiff, MergeSide, ResolutionPolicy};
pub use sync_history::{SyncHistoryRecord, SyncHistoryStatus};
