//! Snapshot persistence.
//!
//! The full exported document log is stored base64-encoded under one fixed
//! key of a key/value store, overwritten after every non-checkout change and
//! read back once at startup.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use linesync_core::{ChangeEvent, DocError, Document, Frontier};
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult};
use std::collections::HashMap;
use std::path::Path;

/// Default key the snapshot is stored under.
pub const DEFAULT_SNAPSHOT_KEY: &str = "store";

/// A string key/value store.
pub trait KeyValueStore {
    /// Read the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns error if the write is rejected.
    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete `key` if present.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be written.
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
}

/// `SQLite`-backed key/value store.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> SqliteResult<()> {
        self.conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            ",
        )?;

        Ok(())
    }

    /// When `key` was last written, as a UNIX timestamp in seconds.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub fn updated_at(&self, key: &str) -> SqliteResult<Option<i64>> {
        self.conn
            .query_row(
                "SELECT updated_at FROM kv_store WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv_store WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        self.conn.execute(
            r"
            INSERT OR REPLACE INTO kv_store (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ",
            (key, value, now),
        )?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM kv_store WHERE key = ?1", [key])?;
        Ok(())
    }
}

/// In-memory key/value store with an optional quota.
///
/// The quota counts key and value bytes across all entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: HashMap<String, String>,
    capacity: Option<usize>,
}

impl MemoryStore {
    /// Create an unbounded store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding at most `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: Some(capacity),
        }
    }

    fn used_without(&self, key: &str) -> usize {
        self.entries
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, v)| k.len() + v.len())
            .sum()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        if let Some(capacity) = self.capacity {
            let needed = self.used_without(key) + key.len() + value.len();
            if needed > capacity {
                return Err(StoreError::CapacityExceeded { needed, capacity });
            }
        }
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Persists the document snapshot (and optionally the version history).
pub struct PersistenceStore {
    store: Box<dyn KeyValueStore + Send>,
    key: String,
    persist_history: bool,
}

impl PersistenceStore {
    /// Create a persistence layer writing under `key`.
    #[must_use]
    pub fn new(store: Box<dyn KeyValueStore + Send>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            persist_history: false,
        }
    }

    /// Also persist the frontier sequence so scrubbing survives restarts.
    #[must_use]
    pub fn with_history(mut self, enabled: bool) -> Self {
        self.persist_history = enabled;
        self
    }

    /// Key the snapshot is stored under.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    fn history_key(&self) -> String {
        format!("{}.history", self.key)
    }

    /// Save the full log after a committed change.
    ///
    /// Checkout events are skipped. Returns the snapshot size in bytes when
    /// one was written.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::StorageWriteFailed`] if the store rejects
    /// the write; the in-memory document is unaffected.
    pub fn on_commit(
        &mut self,
        doc: &Document,
        event: &ChangeEvent,
    ) -> Result<Option<usize>, PersistenceError> {
        if event.from_checkout {
            return Ok(None);
        }
        let bytes = doc.export_all()?;
        let text = STANDARD.encode(&bytes);
        self.store
            .set(&self.key, &text)
            .map_err(PersistenceError::StorageWriteFailed)?;
        tracing::trace!(key = %self.key, size = bytes.len(), "Saved snapshot");
        Ok(Some(bytes.len()))
    }

    /// Read and decode the stored snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::RestoreFailed`] if the value cannot be
    /// read or decoded.
    pub fn load_snapshot(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
        let Some(text) = self
            .store
            .get(&self.key)
            .map_err(|e| PersistenceError::RestoreFailed(e.to_string()))?
        else {
            return Ok(None);
        };
        if text.is_empty() {
            return Ok(None);
        }
        STANDARD
            .decode(text.as_bytes())
            .map(Some)
            .map_err(|e| PersistenceError::RestoreFailed(e.to_string()))
    }

    /// The stored snapshot, or `None` if absent or unreadable.
    ///
    /// Failures are reported and otherwise ignored: the replica then starts
    /// from an empty document.
    #[must_use]
    pub fn load_at_startup(&self) -> Option<Vec<u8>> {
        match self.load_snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(error = %err, key = %self.key, "Ignoring unreadable snapshot");
                None
            }
        }
    }

    /// Save the frontier sequence, if history persistence is enabled.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or the write fails.
    pub fn save_history(&mut self, frontiers: &[Frontier]) -> Result<(), PersistenceError> {
        if !self.persist_history {
            return Ok(());
        }
        let mut bytes = Vec::new();
        ciborium::into_writer(frontiers, &mut bytes)
            .map_err(|e| PersistenceError::Encode(e.to_string()))?;
        self.store
            .set(&self.history_key(), &STANDARD.encode(&bytes))
            .map_err(PersistenceError::StorageWriteFailed)
    }

    /// The stored frontier sequence, if enabled and readable.
    #[must_use]
    pub fn load_history(&self) -> Option<Vec<Frontier>> {
        if !self.persist_history {
            return None;
        }
        let text = match self.store.get(&self.history_key()) {
            Ok(text) => text?,
            Err(err) => {
                tracing::warn!(error = %err, "Ignoring unreadable history");
                return None;
            }
        };
        let bytes = STANDARD.decode(text.as_bytes()).ok()?;
        match ciborium::from_reader(bytes.as_slice()) {
            Ok(frontiers) => Some(frontiers),
            Err(err) => {
                tracing::warn!(error = %err, "Ignoring undecodable history");
                None
            }
        }
    }

    /// Erase the snapshot and history.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be written.
    pub fn clear(&mut self) -> Result<(), PersistenceError> {
        let history_key = self.history_key();
        self.store
            .remove(&self.key)
            .and_then(|()| self.store.remove(&history_key))
            .map_err(PersistenceError::StorageWriteFailed)
    }
}

/// Open the configured backend.
///
/// # Errors
///
/// Returns error if the `SQLite` database cannot be opened.
pub fn open_store(
    store_type: &str,
    db_path: &Path,
) -> Result<Box<dyn KeyValueStore + Send>, StoreError> {
    match store_type {
        "memory" => Ok(Box::new(MemoryStore::new())),
        "sqlite" => Ok(Box::new(SqliteStore::open(db_path)?)),
        other => Err(StoreError::UnknownBackend(other.to_string())),
    }
}

/// Errors raised by key/value backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// `SQLite` failure
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The write would exceed the store quota
    #[error("capacity exceeded: {needed} bytes needed, {capacity} available")]
    CapacityExceeded {
        /// Bytes the store would hold after the write
        needed: usize,
        /// Quota in bytes
        capacity: usize,
    },
    /// Unsupported backend name
    #[error("unknown store type '{0}'")]
    UnknownBackend(String),
}

/// Errors for snapshot persistence.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// The snapshot could not be written
    #[error("storage write failed: {0}")]
    StorageWriteFailed(#[source] StoreError),
    /// The stored snapshot could not be read or decoded
    #[error("restore failed: {0}")]
    RestoreFailed(String),
    /// The document could not be exported
    #[error("export failed: {0}")]
    Export(#[from] DocError),
    /// History could not be encoded
    #[error("encode failed: {0}")]
    Encode(String),
}
