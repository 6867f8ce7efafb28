//! Content-addressed state storage for QRLedger
//!
//! Entries are written once under the hash of their contents and are never
//! overwritten or deleted, so every historical contract state stays addressable.

use crate::error::ChainError;
use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::Mutex;

pub type StateKey = [u8; 32];

/// Opaque key to bytes store.
pub trait StateStore: Send + Sync {
    /// Stores `value` under `key`. Writing an existing key is a no-op.
    fn put(&self, key: &StateKey, value: &[u8]) -> Result<(), ChainError>;
    fn get(&self, key: &StateKey) -> Result<Option<Vec<u8>>, ChainError>;
    fn contains(&self, key: &StateKey) -> Result<bool, ChainError> {
        Ok(self.get(key)?.is_some())
    }
    fn len(&self) -> Result<usize, ChainError>;
}

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    entries: RwLock<HashMap<StateKey, Vec<u8>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStateStore {
    fn put(&self, key: &StateKey, value: &[u8]) -> Result<(), ChainError> {
        self.entries.write().entry(*key).or_insert_with(|| value.to_vec());
        Ok(())
    }

    fn get(&self, key: &StateKey) -> Result<Option<Vec<u8>>, ChainError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn contains(&self, key: &StateKey) -> Result<bool, ChainError> {
        Ok(self.entries.read().contains_key(key))
    }

    fn len(&self) -> Result<usize, ChainError> {
        Ok(self.entries.read().len())
    }
}

/// SQLite-backed store.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self, ChainError> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, ChainError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, ChainError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS state_entries (
                hash BLOB PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )
        .map_err(|e| {
            ChainError::DatabaseError(format!("Failed to create state_entries table: {}", e))
        })?;

        Ok(Database { conn: Mutex::new(conn) })
    }
}

impl StateStore for Database {
    fn put(&self, key: &StateKey, value: &[u8]) -> Result<(), ChainError> {
        let conn = self.conn.lock().map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))?;
        conn.execute(
            "INSERT OR IGNORE INTO state_entries (hash, value) VALUES (?1, ?2)",
            params![key.to_vec(), value],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save state entry: {}", e)))?;
        Ok(())
    }

    fn get(&self, key: &StateKey) -> Result<Option<Vec<u8>>, ChainError> {
        let conn = self.conn.lock().map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))?;
        conn.query_row(
            "SELECT value FROM state_entries WHERE hash = ?1",
            params![key.to_vec()],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()
        .map_err(|e| ChainError::DatabaseError(format!("Failed to load state entry: {}", e)))
    }

    fn len(&self) -> Result<usize, ChainError> {
        let conn = self.conn.lock().map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM state_entries", [], |row| row.get(0))
            .map_err(|e| ChainError::DatabaseError(format!("Failed to count state entries: {}", e)))?;
        Ok(count as usize)
    }
}
