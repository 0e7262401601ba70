//! fieldbook-core - Core library for Fieldbook
//!
//! Offline-first sync for field record keeping: a durable queue of pending
//! writes, retry scheduling with backoff, conflict detection and resolution,
//! registration-ID allocation, and bounded activity and sync-history caches.

pub mod activity;
pub mod config;
pub mod db;
pub mod error;
pub mod history;
pub mod models;
pub mod registration;
pub mod state;
pub mod sync;
mod util;

pub use config::{parse_sync_config, RemoteConfig, SyncConfig, SyncScope};
pub use error::{Error, RemoteError, Result};
pub use registration::{IdAllocator, RegistrationId};
pub use state::{SyncPhase, SyncState, SyncStats, SyncStatus};
pub use sync::{CycleOutcome, HttpRemote, RemoteCollaborator, SyncOrchestrator};
