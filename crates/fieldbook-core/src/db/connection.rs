//! `SQLite`-backed durable store

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection};

use super::{migrations, DurableStore};
use crate::error::{Error, Result};

/// Durable store persisted in a local `SQLite` file
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open a store at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory store (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        Self::configure(&conn)?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Configure `SQLite` for a single-writer local cache
    fn configure(conn: &Connection) -> Result<()> {
        // In-memory databases report "memory" instead of switching to WAL
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })
        .ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("sqlite connection lock poisoned".to_string()))
    }

    /// Keys currently stored, sorted (diagnostics only)
    pub fn keys(&self) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT key FROM kv_store ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }
}

impl DurableStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.connection()?;
        let result = conn.query_row(
            "SELECT value FROM kv_store WHERE key = ?",
            params![key],
            |row| row.get::<_, Vec<u8>>(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_in_memory() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn test_put_overwrites() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put("retry_state", b"one").unwrap();
        store.put("retry_state", b"two").unwrap();

        assert_eq!(store.get("retry_state").unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.keys().unwrap(), vec!["retry_state".to_string()]);
    }

    #[test]
    fn test_delete_missing_key_is_ok() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.delete("nope").unwrap();
        assert_eq!(store.get("nope").unwrap(), None);
    }

    #[test]
    fn test_values_survive_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("fieldbook.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.put("pending_mutations", b"[1,2,3]").unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.get("pending_mutations").unwrap(),
            Some(b"[1,2,3]".to_vec())
        );
    }
}
