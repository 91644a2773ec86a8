//! SQLite-backed object store.
//!
//! Every mutating operation runs in a `BEGIN IMMEDIATE` transaction on a
//! pooled connection, so the expected-tid check, the history archive copy,
//! and the new row land atomically with respect to concurrent writers.
//! Readers use WAL snapshots and never block writers.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};

use tidal_types::{
    LoadedBefore, ObjectRecord, ObjectWrite, Oid, Tid, TransactionMeta, VersionInfo,
};

use crate::error::{StoreError, StoreResult};
use crate::pool::{ConnectionFactory, Pool, PoolConfig};
use crate::schema::{self, META_LAST_TID, META_NEXT_OID, META_PACKED_BEFORE};
use crate::traits::{ObjectStore, PruneOutcome, SweepOutcome};
use crate::versions::resolve_before;

const RECORD_COLUMNS: &str = "zoid, tid, prev_tid, state, refs";

/// Opens SQLite connections configured for concurrent access.
#[derive(Clone, Debug)]
pub struct SqliteConnector {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
        }
    }
}

impl ConnectionFactory for SqliteConnector {
    type Connection = Connection;

    fn connect(&self) -> StoreResult<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(self.busy_timeout)?;
        debug!(path = %self.path.display(), "opened sqlite connection");
        Ok(conn)
    }
}

/// Object store over a SQLite database file.
pub struct SqliteObjectStore {
    history_preserving: bool,
    pool: Pool<SqliteConnector>,
}

type RawRecord = (i64, i64, Option<i64>, Vec<u8>, String);

fn read_raw(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

// SQLite integers are signed; ids round-trip through a bit-preserving cast.
fn key(value: u64) -> i64 {
    value as i64
}

fn tid_from(value: i64) -> Tid {
    Tid::new(value as u64)
}

fn oid_from(value: i64) -> Oid {
    Oid::new(value as u64)
}

fn encode_refs(refs: &BTreeSet<Oid>) -> StoreResult<String> {
    let ids: Vec<i64> = refs.iter().map(|oid| key(oid.get())).collect();
    Ok(serde_json::to_string(&ids)?)
}

fn oid_list(oids: &[Oid]) -> StoreResult<String> {
    let ids: Vec<i64> = oids.iter().map(|oid| key(oid.get())).collect();
    Ok(serde_json::to_string(&ids)?)
}

fn record_from_raw(raw: RawRecord) -> StoreResult<ObjectRecord> {
    let (zoid, tid, prev_tid, state, refs) = raw;
    let ids: Vec<i64> = serde_json::from_str(&refs)?;
    Ok(ObjectRecord {
        oid: oid_from(zoid),
        tid: tid_from(tid),
        prev_tid: prev_tid.map(tid_from),
        state,
        refs: ids.into_iter().map(oid_from).collect(),
    })
}

fn load_current(conn: &Connection, oid: Oid) -> StoreResult<Option<ObjectRecord>> {
    let raw = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM object_state WHERE zoid = ?1"),
            params![key(oid.get())],
            read_raw,
        )
        .optional()?;
    raw.map(record_from_raw).transpose()
}

fn current_tids_on(conn: &Connection, oids: &[Oid]) -> StoreResult<HashMap<Oid, Tid>> {
    let mut stmt = conn.prepare(
        "SELECT zoid, tid FROM object_state WHERE zoid IN (SELECT value FROM json_each(?1))",
    )?;
    let rows = stmt.query_map(params![oid_list(oids)?], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut tids = HashMap::with_capacity(oids.len());
    for row in rows {
        let (zoid, tid) = row?;
        tids.insert(oid_from(zoid), tid_from(tid));
    }
    Ok(tids)
}

fn last_tid_on(conn: &Connection) -> StoreResult<Option<Tid>> {
    Ok(schema::read_meta(conn, META_LAST_TID)?.map(tid_from))
}

fn parse_timestamp(text: Option<String>, tid: Tid) -> StoreResult<DateTime<Utc>> {
    match text {
        Some(text) => DateTime::parse_from_rfc3339(&text)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| StoreError::Serialization(format!("bad timestamp {text:?}: {e}"))),
        None => tid
            .timestamp()
            .map_err(|e| StoreError::Serialization(e.to_string())),
    }
}

impl SqliteObjectStore {
    /// Open (creating if needed) a database file and install the schema.
    pub fn open(
        path: impl AsRef<Path>,
        history_preserving: bool,
        pool_config: PoolConfig,
    ) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let connector = SqliteConnector::new(path.as_ref(), pool_config.wait_timeout);
        let pool = Pool::new(connector, pool_config)?;
        {
            let conn = pool.get()?;
            schema::install_schema(&conn, history_preserving)?;
        }
        info!(
            path = %path.as_ref().display(),
            history_preserving,
            "opened sqlite object store"
        );
        Ok(Self {
            history_preserving,
            pool,
        })
    }

    fn with_immediate_tx<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> StoreResult<T>,
    {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Run several reads against one WAL snapshot.
    fn with_read_tx<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> StoreResult<T>,
    {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Every stored version of `oid`, oldest first.
    fn all_versions(&self, conn: &Connection, oid: Oid) -> StoreResult<Vec<ObjectRecord>> {
        let mut versions = Vec::new();
        if self.history_preserving {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM object_history WHERE zoid = ?1 ORDER BY tid"
            ))?;
            let rows = stmt.query_map(params![key(oid.get())], read_raw)?;
            for raw in rows {
                versions.push(record_from_raw(raw?)?);
            }
        }
        if let Some(current) = load_current(conn, oid)? {
            versions.retain(|r| r.tid != current.tid);
            versions.push(current);
        }
        versions.sort_by_key(|r| r.tid);
        Ok(versions)
    }

    /// Remove blobs and log rows that no remaining version refers to.
    fn cleanup(&self, tx: &Transaction<'_>) -> StoreResult<(usize, usize)> {
        let (blob_sql, log_sql) = if self.history_preserving {
            (
                "DELETE FROM blob_state
                 WHERE NOT EXISTS (SELECT 1 FROM object_state o
                                   WHERE o.zoid = blob_state.zoid AND o.tid = blob_state.tid)
                   AND NOT EXISTS (SELECT 1 FROM object_history h
                                   WHERE h.zoid = blob_state.zoid AND h.tid = blob_state.tid)",
                "DELETE FROM transaction_log
                 WHERE NOT EXISTS (SELECT 1 FROM object_state o WHERE o.tid = transaction_log.tid)
                   AND NOT EXISTS (SELECT 1 FROM object_history h WHERE h.tid = transaction_log.tid)",
            )
        } else {
            (
                "DELETE FROM blob_state
                 WHERE NOT EXISTS (SELECT 1 FROM object_state o
                                   WHERE o.zoid = blob_state.zoid AND o.tid = blob_state.tid)",
                "DELETE FROM transaction_log
                 WHERE NOT EXISTS (SELECT 1 FROM object_state o WHERE o.tid = transaction_log.tid)",
            )
        };
        let blobs = tx.execute(blob_sql, [])?;
        let transactions = tx.execute(log_sql, [])?;
        Ok((blobs, transactions))
    }
}

impl ObjectStore for SqliteObjectStore {
    fn history_preserving(&self) -> bool {
        self.history_preserving
    }

    fn new_oid(&self) -> StoreResult<Oid> {
        self.with_immediate_tx(|tx| {
            let next = schema::read_meta(tx, META_NEXT_OID)?.unwrap_or(1);
            schema::write_meta(tx, META_NEXT_OID, next + 1)?;
            Ok(oid_from(next))
        })
    }

    fn last_tid(&self) -> StoreResult<Option<Tid>> {
        let conn = self.pool.get()?;
        last_tid_on(&conn)
    }

    fn load(&self, oid: Oid) -> StoreResult<Option<ObjectRecord>> {
        let conn = self.pool.get()?;
        load_current(&conn, oid)
    }

    fn load_many(&self, oids: &[Oid]) -> StoreResult<Vec<Option<ObjectRecord>>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM object_state
             WHERE zoid IN (SELECT value FROM json_each(?1))"
        ))?;
        let rows = stmt.query_map(params![oid_list(oids)?], read_raw)?;
        let mut found = HashMap::with_capacity(oids.len());
        for raw in rows {
            let record = record_from_raw(raw?)?;
            found.insert(record.oid, record);
        }
        Ok(oids.iter().map(|oid| found.get(oid).cloned()).collect())
    }

    fn current_tids(&self, oids: &[Oid]) -> StoreResult<HashMap<Oid, Tid>> {
        let conn = self.pool.get()?;
        current_tids_on(&conn, oids)
    }

    fn load_before(&self, oid: Oid, before: Tid) -> StoreResult<Option<LoadedBefore>> {
        // The archive copy and the overwrite of the current row commit
        // together, so both tables must be read from the same snapshot.
        let mut versions = self.with_read_tx(|tx| self.all_versions(tx, oid))?;
        let tids: Vec<Tid> = versions.iter().map(|r| r.tid).collect();
        Ok(resolve_before(&tids, before).map(|(idx, end_tid)| LoadedBefore {
            record: versions.swap_remove(idx),
            end_tid,
        }))
    }

    fn load_version(&self, oid: Oid, tid: Tid) -> StoreResult<Option<ObjectRecord>> {
        self.with_read_tx(|tx| {
            if let Some(current) = load_current(tx, oid)?.filter(|r| r.tid == tid) {
                return Ok(Some(current));
            }
            if !self.history_preserving {
                return Ok(None);
            }
            let raw = tx
                .query_row(
                    &format!(
                        "SELECT {RECORD_COLUMNS} FROM object_history WHERE zoid = ?1 AND tid = ?2"
                    ),
                    params![key(oid.get()), key(tid.get())],
                    read_raw,
                )
                .optional()?;
            raw.map(record_from_raw).transpose()
        })
    }

    fn load_blob(&self, oid: Oid, tid: Tid) -> StoreResult<Option<Vec<u8>>> {
        let conn = self.pool.get()?;
        Ok(conn
            .query_row(
                "SELECT data FROM blob_state WHERE zoid = ?1 AND tid = ?2",
                params![key(oid.get()), key(tid.get())],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn versions(
        &self,
        oid: Oid,
        before: Option<Tid>,
        limit: usize,
    ) -> StoreResult<Vec<VersionInfo>> {
        let conn = self.pool.get()?;
        let source = if self.history_preserving {
            "SELECT tid, prev_tid, state_size FROM object_state WHERE zoid = ?1
             UNION
             SELECT tid, prev_tid, state_size FROM object_history WHERE zoid = ?1"
        } else {
            "SELECT tid, prev_tid, state_size FROM object_state WHERE zoid = ?1"
        };
        let sql = format!(
            "SELECT v.tid, v.prev_tid, v.state_size, t.timestamp, t.username, t.description
             FROM ({source}) v
             LEFT JOIN transaction_log t ON t.tid = v.tid
             WHERE v.tid < ?2
             ORDER BY v.tid DESC
             LIMIT ?3"
        );
        let upper = before.map_or(i64::MAX, |b| key(b.get()));
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![key(oid.get()), upper, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut listing = Vec::new();
        for row in rows {
            let (tid, prev_tid, size, timestamp, user, description) = row?;
            let tid = tid_from(tid);
            listing.push(VersionInfo {
                tid,
                prev_tid: prev_tid.map(tid_from),
                size: usize::try_from(size).unwrap_or_default(),
                timestamp: parse_timestamp(timestamp, tid)?,
                user: user.unwrap_or_default(),
                description: description.unwrap_or_default(),
            });
        }
        Ok(listing)
    }

    fn oids_in_transaction(&self, tid: Tid) -> StoreResult<Vec<Oid>> {
        let conn = self.pool.get()?;
        let sql = if self.history_preserving {
            "SELECT zoid FROM object_state WHERE tid = ?1
             UNION
             SELECT zoid FROM object_history WHERE tid = ?1"
        } else {
            "SELECT zoid FROM object_state WHERE tid = ?1"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![key(tid.get())], |row| row.get::<_, i64>(0))?;
        let mut oids = Vec::new();
        for zoid in rows {
            oids.push(oid_from(zoid?));
        }
        oids.sort();
        Ok(oids)
    }

    fn packed_before(&self) -> StoreResult<Option<Tid>> {
        let conn = self.pool.get()?;
        Ok(schema::read_meta(&conn, META_PACKED_BEFORE)?.map(tid_from))
    }

    fn commit(&self, meta: &TransactionMeta, writes: &[ObjectWrite]) -> StoreResult<Tid> {
        let mut seen = HashSet::with_capacity(writes.len());
        for write in writes {
            if !seen.insert(write.oid) {
                return Err(StoreError::DuplicateWrite(write.oid));
            }
        }
        let oids: Vec<Oid> = writes.iter().map(|w| w.oid).collect();

        let tid = self.with_immediate_tx(|tx| {
            let current = current_tids_on(tx, &oids)?;
            for write in writes {
                let actual = current.get(&write.oid).copied();
                if actual != write.expected_tid {
                    warn!(oid = %write.oid, ?actual, expected = ?write.expected_tid, "commit conflict");
                    return Err(StoreError::Conflict {
                        oid: write.oid,
                        expected: write.expected_tid,
                        actual,
                    });
                }
            }

            let now = Utc::now();
            let tid = Tid::next_after(last_tid_on(tx)?, now);
            tx.execute(
                "INSERT INTO transaction_log (tid, timestamp, username, description, extension)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    key(tid.get()),
                    tid.timestamp().unwrap_or(now).to_rfc3339(),
                    meta.user,
                    meta.description,
                    meta.extension,
                ],
            )?;

            let mut max_oid = 0u64;
            for write in writes {
                let zoid = key(write.oid.get());
                if self.history_preserving && write.expected_tid.is_some() {
                    tx.execute(
                        "INSERT INTO object_history (zoid, tid, prev_tid, state, state_size, refs)
                         SELECT zoid, tid, prev_tid, state, state_size, refs
                         FROM object_state WHERE zoid = ?1",
                        params![zoid],
                    )?;
                }
                if !self.history_preserving {
                    tx.execute(
                        "DELETE FROM blob_state WHERE zoid = ?1 AND tid < ?2",
                        params![zoid, key(tid.get())],
                    )?;
                }
                tx.execute(
                    "INSERT INTO object_state (zoid, tid, prev_tid, state, state_size, refs)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (zoid) DO UPDATE SET
                        tid = excluded.tid,
                        prev_tid = excluded.prev_tid,
                        state = excluded.state,
                        state_size = excluded.state_size,
                        refs = excluded.refs",
                    params![
                        zoid,
                        key(tid.get()),
                        write.expected_tid.map(|t| key(t.get())),
                        write.state,
                        write.state.len() as i64,
                        encode_refs(&write.refs)?,
                    ],
                )?;
                if let Some(blob) = &write.blob {
                    tx.execute(
                        "INSERT INTO blob_state (zoid, tid, blob_size, data) VALUES (?1, ?2, ?3, ?4)",
                        params![zoid, key(tid.get()), blob.len() as i64, blob],
                    )?;
                }
                max_oid = max_oid.max(write.oid.get());
            }

            schema::write_meta(tx, META_LAST_TID, key(tid.get()))?;
            let next = schema::read_meta(tx, META_NEXT_OID)?.unwrap_or(1);
            let floor = key(max_oid.saturating_add(1));
            if floor > next {
                schema::write_meta(tx, META_NEXT_OID, floor)?;
            }
            Ok(tid)
        })?;

        debug!(%tid, objects = writes.len(), "sqlite commit");
        Ok(tid)
    }

    fn changes_since(&self, since: Tid) -> StoreResult<(Option<Tid>, Vec<Oid>)> {
        self.with_read_tx(|tx| {
            let last = last_tid_on(tx)?;
            let mut stmt = tx.prepare("SELECT zoid FROM object_state WHERE tid > ?1")?;
            let rows = stmt.query_map(params![key(since.get())], |row| row.get::<_, i64>(0))?;
            let mut oids = Vec::new();
            for zoid in rows {
                oids.push(oid_from(zoid?));
            }
            oids.sort();
            Ok((last, oids))
        })
    }

    fn reachable_from(&self, roots: &[Oid]) -> StoreResult<HashSet<Oid>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "WITH RECURSIVE reach(zoid) AS (
                 SELECT value FROM json_each(?1)
                 UNION
                 SELECT CAST(r.value AS INTEGER)
                 FROM reach
                 JOIN object_state o ON o.zoid = reach.zoid,
                      json_each(o.refs) r
             )
             SELECT zoid FROM reach",
        )?;
        let rows = stmt.query_map(params![oid_list(roots)?], |row| row.get::<_, i64>(0))?;
        let mut reachable = HashSet::new();
        for zoid in rows {
            reachable.insert(oid_from(zoid?));
        }
        Ok(reachable)
    }

    fn oids_committed_upto(&self, snapshot: Tid) -> StoreResult<Vec<(Oid, Tid)>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT zoid, tid FROM object_state WHERE tid <= ?1")?;
        let rows = stmt.query_map(params![key(snapshot.get())], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut oids = Vec::new();
        for row in rows {
            let (zoid, tid) = row?;
            oids.push((oid_from(zoid), tid_from(tid)));
        }
        oids.sort();
        Ok(oids)
    }

    fn delete_objects(&self, oids: &[Oid], guard: Tid) -> StoreResult<SweepOutcome> {
        let list = oid_list(oids)?;
        self.with_immediate_tx(|tx| {
            if let Some(last_tid) = last_tid_on(tx)?.filter(|last| *last > guard) {
                return Ok(SweepOutcome::Stale { last_tid });
            }
            let objects = tx.execute(
                "DELETE FROM object_state WHERE zoid IN (SELECT value FROM json_each(?1))",
                params![list],
            )?;
            let history = if self.history_preserving {
                tx.execute(
                    "DELETE FROM object_history WHERE zoid IN (SELECT value FROM json_each(?1))",
                    params![list],
                )?
            } else {
                0
            };
            let blobs = tx.execute(
                "DELETE FROM blob_state WHERE zoid IN (SELECT value FROM json_each(?1))",
                params![list],
            )?;
            Ok(SweepOutcome::Deleted {
                objects,
                history,
                blobs,
            })
        })
    }

    fn prune_history(&self, boundary: Tid) -> StoreResult<PruneOutcome> {
        self.with_immediate_tx(|tx| {
            let mut history = 0;
            if self.history_preserving {
                history = tx.execute(
                    "DELETE FROM object_history
                     WHERE tid < ?1
                       AND (EXISTS (SELECT 1 FROM object_history newer
                                    WHERE newer.zoid = object_history.zoid
                                      AND newer.tid > object_history.tid
                                      AND newer.tid < ?1)
                            OR EXISTS (SELECT 1 FROM object_state cur
                                       WHERE cur.zoid = object_history.zoid
                                         AND cur.tid < ?1))",
                    params![key(boundary.get())],
                )?;
                let previous = schema::read_meta(tx, META_PACKED_BEFORE)?.map(tid_from);
                if previous.map_or(true, |p| p < boundary) {
                    schema::write_meta(tx, META_PACKED_BEFORE, key(boundary.get()))?;
                }
            }
            let (blobs, transactions) = self.cleanup(tx)?;
            Ok(PruneOutcome {
                history,
                blobs,
                transactions,
            })
        })
    }

    fn drop_history(&self) -> StoreResult<PruneOutcome> {
        self.with_immediate_tx(|tx| {
            let mut history = 0;
            if self.history_preserving {
                history = tx.execute("DELETE FROM object_history", [])?;
                // Every surviving version now links to a dropped predecessor.
                if let Some(last) = last_tid_on(tx)? {
                    let boundary = key(last.get().saturating_add(1));
                    let previous = schema::read_meta(tx, META_PACKED_BEFORE)?;
                    if previous.map_or(true, |p| p < boundary) {
                        schema::write_meta(tx, META_PACKED_BEFORE, boundary)?;
                    }
                }
            }
            let (blobs, transactions) = self.cleanup(tx)?;
            Ok(PruneOutcome {
                history,
                blobs,
                transactions,
            })
        })
    }
}

impl std::fmt::Debug for SqliteObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteObjectStore")
            .field("history_preserving", &self.history_preserving)
            .field("open_connections", &self.pool.open_connections())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use tempfile::TempDir;

    use super::*;

    fn open(history_preserving: bool) -> (TempDir, SqliteObjectStore) {
        let dir = TempDir::new().unwrap();
        let config = PoolConfig {
            min_size: 1,
            max_size: 4,
            wait_timeout: Duration::from_secs(5),
        };
        let store =
            SqliteObjectStore::open(dir.path().join("tidal.db"), history_preserving, config)
                .unwrap();
        (dir, store)
    }

    fn write(oid: u64, expected: Option<Tid>, state: &[u8], refs: &[u64]) -> ObjectWrite {
        ObjectWrite::new(
            Oid::new(oid),
            expected,
            state.to_vec(),
            refs.iter().copied().map(Oid::new),
        )
    }

    fn commit(store: &SqliteObjectStore, writes: Vec<ObjectWrite>) -> Tid {
        store.commit(&TransactionMeta::default(), &writes).unwrap()
    }

    // -----------------------------------------------------------------------
    // Core CRUD
    // -----------------------------------------------------------------------

    #[test]
    fn commit_and_load_round_trips_columns() {
        let (_dir, store) = open(false);
        let tid = commit(&store, vec![write(1, None, b"one", &[2, 3])]);
        let record = store.load(Oid::new(1)).unwrap().unwrap();
        assert_eq!(record.tid, tid);
        assert_eq!(record.state, b"one");
        assert_eq!(
            record.refs.into_iter().collect::<Vec<_>>(),
            vec![Oid::new(2), Oid::new(3)]
        );
        assert_eq!(store.last_tid().unwrap(), Some(tid));
    }

    #[test]
    fn load_many_aligns_with_input() {
        let (_dir, store) = open(false);
        commit(&store, vec![write(1, None, b"a", &[]), write(2, None, b"b", &[])]);
        let loaded = store
            .load_many(&[Oid::new(2), Oid::new(7), Oid::new(1)])
            .unwrap();
        assert_eq!(loaded[0].as_ref().unwrap().state, b"b");
        assert!(loaded[1].is_none());
        assert_eq!(loaded[2].as_ref().unwrap().state, b"a");
    }

    #[test]
    fn reopen_preserves_data_and_counters() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tidal.db");
        let tid = {
            let store = SqliteObjectStore::open(&path, true, PoolConfig::default()).unwrap();
            commit(&store, vec![write(5, None, b"persisted", &[])])
        };
        let store = SqliteObjectStore::open(&path, true, PoolConfig::default()).unwrap();
        assert_eq!(store.last_tid().unwrap(), Some(tid));
        assert_eq!(store.load(Oid::new(5)).unwrap().unwrap().state, b"persisted");
        assert_eq!(store.new_oid().unwrap(), Oid::new(6));
        assert!(SqliteObjectStore::open(&path, false, PoolConfig::default()).is_err());
    }

    // -----------------------------------------------------------------------
    // Optimistic concurrency
    // -----------------------------------------------------------------------

    #[test]
    fn stale_write_conflicts_and_rolls_back() {
        let (_dir, store) = open(true);
        let t1 = commit(&store, vec![write(1, None, b"a", &[])]);
        let t2 = commit(&store, vec![write(1, Some(t1), b"b", &[])]);

        let err = store
            .commit(
                &TransactionMeta::default(),
                &[write(2, None, b"new", &[]), write(1, Some(t1), b"c", &[])],
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert!(store.load(Oid::new(2)).unwrap().is_none());
        assert_eq!(store.last_tid().unwrap(), Some(t2));
    }

    #[test]
    fn racing_writers_produce_one_winner() {
        let (_dir, store) = open(false);
        let store = Arc::new(store);
        let base = commit(&store, vec![write(1, None, b"base", &[])]);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store.commit(
                        &TransactionMeta::default(),
                        &[write(1, Some(base), format!("w{i}").as_bytes(), &[])],
                    )
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    #[test]
    fn history_versions_and_load_before() {
        let (_dir, store) = open(true);
        let t1 = store
            .commit(&TransactionMeta::new("alice", "v1"), &[write(1, None, b"v1", &[])])
            .unwrap();
        let t2 = commit(&store, vec![write(1, Some(t1), b"v2", &[])]);
        let t3 = commit(&store, vec![write(1, Some(t2), b"v3", &[])]);

        let listing = store.versions(Oid::new(1), None, 10).unwrap();
        let tids: Vec<Tid> = listing.iter().map(|v| v.tid).collect();
        assert_eq!(tids, vec![t3, t2, t1]);
        assert_eq!(listing[2].user, "alice");
        assert_eq!(listing[0].prev_tid, Some(t2));

        let at = store.load_before(Oid::new(1), t3).unwrap().unwrap();
        assert_eq!(at.record.state, b"v2");
        assert_eq!(at.end_tid, Some(t3));
        assert_eq!(store.load_version(Oid::new(1), t1).unwrap().unwrap().state, b"v1");
        assert_eq!(store.oids_in_transaction(t1).unwrap(), vec![Oid::new(1)]);
    }

    #[test]
    fn load_before_is_consistent_with_concurrent_writer() {
        let (_dir, store) = open(true);
        let store = Arc::new(store);
        let first = commit(&store, vec![write(1, None, b"v0", &[])]);

        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut expected = first;
                for i in 1..400 {
                    let state = format!("v{i}");
                    expected = commit(&store, vec![write(1, Some(expected), state.as_bytes(), &[])]);
                }
            })
        };

        let oid = Oid::new(1);
        let mut checked = 0;
        while !writer.is_finished() || checked == 0 {
            let current = store.load(oid).unwrap().unwrap().tid;
            let loaded = store
                .load_before(oid, Tid::new(current.get() + 1))
                .unwrap()
                .expect("object exists at every snapshot");
            assert!(
                loaded.record.tid >= current,
                "read {} after current {}",
                loaded.record.tid,
                current
            );
            if let Some(end) = loaded.end_tid {
                assert!(end > loaded.record.tid);
            }
            checked += 1;
        }
        writer.join().unwrap();

        let last = store.last_tid().unwrap().unwrap();
        let at = store.load_before(oid, Tid::new(last.get() + 1)).unwrap().unwrap();
        assert_eq!(at.record.tid, last);
        assert_eq!(at.end_tid, None);
    }

    #[test]
    fn blobs_follow_mode() {
        let (_dir, store) = open(false);
        let t1 = commit(&store, vec![write(1, None, b"a", &[]).with_blob(vec![1])]);
        let t2 = commit(&store, vec![write(1, Some(t1), b"b", &[]).with_blob(vec![2])]);
        assert!(store.load_blob(Oid::new(1), t1).unwrap().is_none());
        assert_eq!(store.load_blob(Oid::new(1), t2).unwrap(), Some(vec![2]));
    }

    // -----------------------------------------------------------------------
    // Pack support
    // -----------------------------------------------------------------------

    #[test]
    fn recursive_reachability_handles_cycles() {
        let (_dir, store) = open(false);
        commit(
            &store,
            vec![
                write(0, None, b"root", &[1]),
                write(1, None, b"a", &[2]),
                write(2, None, b"b", &[1, 0]),
                write(3, None, b"orphan", &[1]),
            ],
        );
        let reachable = store.reachable_from(&[Oid::ROOT]).unwrap();
        let mut found: Vec<_> = reachable.into_iter().collect();
        found.sort();
        assert_eq!(found, vec![Oid::new(0), Oid::new(1), Oid::new(2)]);
    }

    #[test]
    fn guarded_delete_and_prune() {
        let (_dir, store) = open(true);
        let t1 = commit(&store, vec![write(1, None, b"v1", &[]), write(9, None, b"x", &[])]);
        let t2 = commit(&store, vec![write(1, Some(t1), b"v2", &[])]);
        let t3 = commit(&store, vec![write(1, Some(t2), b"v3", &[])]);

        assert_eq!(
            store.delete_objects(&[Oid::new(9)], t2).unwrap(),
            SweepOutcome::Stale { last_tid: t3 }
        );
        assert!(matches!(
            store.delete_objects(&[Oid::new(9)], t3).unwrap(),
            SweepOutcome::Deleted { objects: 1, .. }
        ));

        let outcome = store.prune_history(t3).unwrap();
        assert_eq!(outcome.history, 1);
        assert_eq!(outcome.transactions, 1);
        assert!(store.load_version(Oid::new(1), t1).unwrap().is_none());
        assert_eq!(store.packed_before().unwrap(), Some(t3));
        assert_eq!(
            store.changes_since(t2).unwrap(),
            (Some(t3), vec![Oid::new(1)])
        );
    }

    #[test]
    fn drop_history_empties_archive() {
        let (_dir, store) = open(true);
        let t1 = commit(&store, vec![write(1, None, b"v1", &[])]);
        commit(&store, vec![write(1, Some(t1), b"v2", &[])]);
        assert_eq!(store.drop_history().unwrap().history, 1);
        assert_eq!(store.versions(Oid::new(1), None, 10).unwrap().len(), 1);
    }
}
