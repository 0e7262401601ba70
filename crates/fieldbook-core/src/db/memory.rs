//! In-memory store (useful for testing)

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::DurableStore;
use crate::error::{Error, Result};

/// `HashMap`-backed store; writes can be made to fail to simulate a full disk
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put`/`delete` fail until switched back off
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(Error::Storage("store is read-only".to_string()))
        } else {
            Ok(())
        }
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.entries()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        self.entries()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let store = MemoryStore::new();
        store.put("a", b"1").unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"1".to_vec()));
        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn failing_writes_surface_errors() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(matches!(store.put("a", b"1"), Err(Error::Storage(_))));
        assert_eq!(store.get("a").unwrap(), None);
    }
}
