//! Durable replication cursors
//!
//! An agent remembers the sequence number of the last source event it
//! processed. The cursor survives agent restarts and is discarded when the
//! replication is deleted.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Cursor {key} holds an invalid sequence number {value}")]
    Corrupt { key: String, value: i64 },
}

pub type Result<T> = std::result::Result<T, CursorError>;

/// Key-value store of replication cursors
pub trait CursorStore: Send + Sync {
    /// Sequence number stored under `key`, if any
    fn get(&self, key: &str) -> Result<Option<u64>>;

    fn set(&self, key: &str, seq: u64) -> Result<()>;

    /// Forget `key`. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;
}

/// Volatile cursor store
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<HashMap<String, u64>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CursorStore for MemoryCursorStore {
    fn get(&self, key: &str) -> Result<Option<u64>> {
        let cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        Ok(cursors.get(key).copied())
    }

    fn set(&self, key: &str, seq: u64) -> Result<()> {
        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        cursors.insert(key.to_string(), seq);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        cursors.remove(key);
        Ok(())
    }
}

/// Cursor store backed by a SQLite database
pub struct SqliteCursorStore {
    conn: Mutex<Connection>,
}

impl SqliteCursorStore {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        debug!("Opened cursor store at {:?}", path.as_ref());
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cursors (
                key TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CursorStore for SqliteCursorStore {
    fn get(&self, key: &str) -> Result<Option<u64>> {
        let value: Option<i64> = self
            .conn()
            .query_row("SELECT seq FROM cursors WHERE key = ?1", [key], |r| r.get(0))
            .optional()?;
        value
            .map(|v| {
                u64::try_from(v).map_err(|_| CursorError::Corrupt {
                    key: key.to_string(),
                    value: v,
                })
            })
            .transpose()
    }

    fn set(&self, key: &str, seq: u64) -> Result<()> {
        // SQLite integers are signed; clamp rather than wrap
        let seq = i64::try_from(seq).unwrap_or(i64::MAX);
        self.conn().execute(
            "INSERT INTO cursors (key, seq, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET seq=excluded.seq, updated_at=excluded.updated_at",
            params![key, seq, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM cursors WHERE key = ?1", [key])?;
        Ok(())
    }
}
