//! Offline-first sync: queue, backoff, conflicts and the orchestrator driving them.

mod backoff;
mod conflict;
mod connectivity;
mod http;
mod orchestrator;
mod queue;
mod remote;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::{compute_delay, ArmedRetry, BackoffConfig, BackoffScheduler};
pub use conflict::{detect, diff_fields, ConflictStore, Detection, Resolution};
pub use connectivity::{connectivity, ConnectivityHandle, ConnectivitySignal};
pub use http::{classify_push, HttpRemote};
pub use orchestrator::{CycleOutcome, SyncOrchestrator};
pub use queue::{
    drain, DrainContext, DrainReport, DrainTarget, MutationRepair, PendingMutationQueue,
    RejectedWrite, Repair,
};
pub use remote::{PushOutcome, RecentKind, RemoteCollaborator};
