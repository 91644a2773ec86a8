//! SQLite schema for the relational backend.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::error::{StoreError, StoreResult};

/// Tables shared by both storage modes.
const BASE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS transaction_log (
    tid         INTEGER PRIMARY KEY,
    timestamp   TEXT    NOT NULL,
    username    TEXT    NOT NULL DEFAULT '',
    description TEXT    NOT NULL DEFAULT '',
    extension   BLOB    NOT NULL DEFAULT x''
);

CREATE TABLE IF NOT EXISTS object_state (
    zoid       INTEGER PRIMARY KEY,
    tid        INTEGER NOT NULL,
    prev_tid   INTEGER,
    state      BLOB    NOT NULL,
    state_size INTEGER NOT NULL,
    refs       TEXT    NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS idx_object_state_tid ON object_state (tid);

CREATE TABLE IF NOT EXISTS blob_state (
    zoid      INTEGER NOT NULL,
    tid       INTEGER NOT NULL,
    blob_size INTEGER NOT NULL,
    data      BLOB    NOT NULL,
    PRIMARY KEY (zoid, tid)
);

CREATE TABLE IF NOT EXISTS storage_meta (
    key   TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
";

/// Archive of superseded versions, history-preserving mode only.
const HISTORY_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS object_history (
    zoid       INTEGER NOT NULL,
    tid        INTEGER NOT NULL,
    prev_tid   INTEGER,
    state      BLOB    NOT NULL,
    state_size INTEGER NOT NULL,
    refs       TEXT    NOT NULL DEFAULT '[]',
    PRIMARY KEY (zoid, tid)
);
CREATE INDEX IF NOT EXISTS idx_object_history_tid ON object_history (tid);
";

pub const META_LAST_TID: &str = "last_tid";
pub const META_NEXT_OID: &str = "next_oid";
pub const META_PACKED_BEFORE: &str = "packed_before";
const META_HISTORY_PRESERVING: &str = "history_preserving";

/// Create all tables for the given mode. Safe to call on an existing
/// database.
///
/// A database created in one mode cannot be reopened in the other; that is
/// reported as a configuration mismatch instead of silently losing history.
pub fn install_schema(conn: &Connection, history_preserving: bool) -> StoreResult<()> {
    conn.execute_batch(BASE_SCHEMA)?;
    if history_preserving {
        conn.execute_batch(HISTORY_SCHEMA)?;
    }

    let mode = i64::from(history_preserving);
    let stored = read_meta(conn, META_HISTORY_PRESERVING)?;
    match stored {
        None => {
            write_meta(conn, META_HISTORY_PRESERVING, mode)?;
            info!(history_preserving, "installed storage schema");
        }
        Some(existing) if existing != mode => {
            return Err(StoreError::ModeMismatch {
                stored: existing != 0,
                requested: history_preserving,
            });
        }
        Some(_) => {}
    }
    Ok(())
}

pub fn read_meta(conn: &Connection, key: &str) -> StoreResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT value FROM storage_meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn write_meta(conn: &Connection, key: &str, value: i64) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO storage_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn history_free_has_no_history_table() {
        let conn = Connection::open_in_memory().unwrap();
        install_schema(&conn, false).unwrap();
        assert!(table_exists(&conn, "object_state"));
        assert!(table_exists(&conn, "transaction_log"));
        assert!(!table_exists(&conn, "object_history"));
    }

    #[test]
    fn install_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        install_schema(&conn, true).unwrap();
        install_schema(&conn, true).unwrap();
        assert!(table_exists(&conn, "object_history"));
    }

    #[test]
    fn mode_mismatch_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        install_schema(&conn, true).unwrap();
        assert!(matches!(
            install_schema(&conn, false),
            Err(StoreError::ModeMismatch { stored: true, requested: false })
        ));
    }

    #[test]
    fn meta_upsert() {
        let conn = Connection::open_in_memory().unwrap();
        install_schema(&conn, false).unwrap();
        assert_eq!(read_meta(&conn, META_LAST_TID).unwrap(), None);
        write_meta(&conn, META_LAST_TID, 5).unwrap();
        write_meta(&conn, META_LAST_TID, 7).unwrap();
        assert_eq!(read_meta(&conn, META_LAST_TID).unwrap(), Some(7));
    }
}
