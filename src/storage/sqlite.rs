//! SQLite-backed key/value storage.

use super::schema::initialize_schema;
use super::{Storage, WriteOp};
use crate::error::{Error, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// SQLite-backed storage.
///
/// Operations are short single-row statements and run inline under a
/// connection mutex. Batches run in one transaction.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage").finish_non_exhaustive()
    }
}

impl SqliteStorage {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::persistence_with_source(
                        format!("Failed to create {}", parent.display()),
                        e,
                    )
                })?;
            }
        }

        let mut conn = Connection::open(path)?;
        initialize_schema(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        initialize_schema(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&conn).map_err(Error::from)
    }

    fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&mut conn).map_err(Error::from)
    }
}

const UPSERT_SQL: &str = "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at";

#[async_trait]
impl Storage for SqliteStorage {
    async fn write(&self, key: &str, blob: &[u8]) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(UPSERT_SQL, params![key, blob])?;
            Ok(())
        })
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()
        })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(rows > 0)
        })
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
            )?;
            let keys = stmt
                .query_map(params![prefix], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        })
    }

    async fn apply(&self, ops: Vec<WriteOp>) -> Result<()> {
        self.with_conn_mut(|conn| {
            // Dropping the transaction without commit rolls it back
            let tx = conn.transaction()?;
            {
                let mut upsert = tx.prepare_cached(UPSERT_SQL)?;
                let mut delete = tx.prepare_cached("DELETE FROM kv WHERE key = ?1")?;
                for op in &ops {
                    match op {
                        WriteOp::Put { key, blob } => upsert.execute(params![key, blob])?,
                        WriteOp::Delete { key } => delete.execute(params![key])?,
                    };
                }
            }
            tx.commit()
        })
    }
}
