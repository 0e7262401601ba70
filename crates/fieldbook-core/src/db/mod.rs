//! Local durable store for Fieldbook
//!
//! Everything the sync core keeps across restarts (queue, retry state,
//! conflicts, bounded caches) is stored as a JSON blob under a namespaced key.

mod connection;
mod memory;
mod migrations;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub use connection::SqliteStore;
pub use memory::MemoryStore;

/// Namespaced keys used by the sync core
pub mod keys {
    pub const PENDING_MUTATIONS: &str = "pending_mutations";
    pub const RETRY_STATE: &str = "retry_state";
    pub const CONFLICTS: &str = "conflicts";
    pub const SYNC_HISTORY: &str = "sync_history";
    pub const SYNC_STATS: &str = "sync_stats";
    pub const ISSUED_REGISTRATION_IDS: &str = "registration_ids:issued";

    /// Activity cache key for one facility
    pub fn activity_log(facility_id: &str) -> String {
        format!("activity_log:{facility_id}")
    }
}

/// Byte-oriented key/value store that survives process restart
pub trait DurableStore: Send + Sync {
    /// Read the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or replace the value stored under `key`
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove `key`; missing keys are not an error
    fn delete(&self, key: &str) -> Result<()>;
}

/// Read and decode a JSON value.
pub fn load_json<T: DeserializeOwned>(store: &dyn DurableStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value.
pub fn save_json<T: Serialize + ?Sized>(store: &dyn DurableStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.put(key, &bytes)
}
