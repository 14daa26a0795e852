//! Versioned schema for the SQLite key/value store.
//!
//! The applied version lives in `PRAGMA user_version`. Each migration runs
//! in its own transaction, so a crash never leaves a half-applied step.

use rusqlite::{Connection, Result as SqliteResult};

/// Ordered migrations; index + 1 is the version each one produces.
const MIGRATIONS: &[&str] = &[
    // 1: blobs by key
    "CREATE TABLE IF NOT EXISTS kv (
        key TEXT PRIMARY KEY,
        value BLOB NOT NULL,
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    )",
    // 2: lookups by modification time
    "CREATE INDEX IF NOT EXISTS kv_updated_at ON kv (updated_at)",
];

/// Version after every migration has run.
pub const SCHEMA_VERSION: i32 = MIGRATIONS.len() as i32;

/// Bring `conn` up to [`SCHEMA_VERSION`]. Safe to call on every open.
pub fn initialize_schema(conn: &mut Connection) -> SqliteResult<()> {
    // WAL is a no-op for in-memory databases
    conn.pragma_update(None, "journal_mode", "WAL")?;

    let current = get_schema_version(conn)?;
    for (index, sql) in MIGRATIONS.iter().enumerate() {
        let version = index as i32 + 1;
        if version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

/// Whether the key/value table exists.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'kv'",
        [],
        |_| Ok(()),
    )
    .is_ok()
}
