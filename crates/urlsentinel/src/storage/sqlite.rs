//! SQLite back-end for the local list mirror.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::debug;

use super::Storage;
use crate::error::Result;
use crate::types::{
    AddChunkRow, AddEntry, FullHashRow, MacKeys, PrefixError, SubChunkRow, SubEntry, UpdateCursor,
    FULL_HASH_TTL_SECS,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS add_chunks (
    chunk_num INTEGER NOT NULL,
    host_key BLOB NOT NULL,
    prefix BLOB NOT NULL,
    list TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_add_chunks_host ON add_chunks (host_key);
CREATE INDEX IF NOT EXISTS idx_add_chunks_list ON add_chunks (list, chunk_num);
CREATE TABLE IF NOT EXISTS sub_chunks (
    chunk_num INTEGER NOT NULL,
    add_chunk_num INTEGER NOT NULL,
    host_key BLOB NOT NULL,
    prefix BLOB NOT NULL,
    list TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sub_chunks_host ON sub_chunks (host_key);
CREATE INDEX IF NOT EXISTS idx_sub_chunks_list ON sub_chunks (list, chunk_num);
CREATE TABLE IF NOT EXISTS full_hashes (
    chunk_num INTEGER NOT NULL,
    hash BLOB NOT NULL,
    list TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    UNIQUE (chunk_num, hash, list)
);
CREATE TABLE IF NOT EXISTS full_hash_errors (
    prefix BLOB NOT NULL UNIQUE,
    errors INTEGER NOT NULL,
    timestamp INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS list_updates (
    list TEXT PRIMARY KEY,
    last_update INTEGER NOT NULL,
    next_wait INTEGER NOT NULL,
    errors INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS mac_keys (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    client_key BLOB NOT NULL,
    wrapped_key TEXT NOT NULL
);
";

/// SQLite-backed [`Storage`]. Writes are serialized behind a mutex; hash and
/// key bytes live in BLOB columns.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "opened list mirror");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("storage lock poisoned")
    }
}

impl Storage for SqliteStorage {
    fn add_chunks_for_host(&self, host_key: &[u8]) -> Result<Vec<AddChunkRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT chunk_num, host_key, prefix, list FROM add_chunks
             WHERE host_key = ?1 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map(params![host_key], |row| {
                Ok(AddChunkRow {
                    chunk_num: row.get(0)?,
                    host_key: row.get(1)?,
                    prefix: row.get(2)?,
                    list: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn sub_chunks_for_host(&self, host_key: &[u8]) -> Result<Vec<SubChunkRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT chunk_num, add_chunk_num, host_key, prefix, list FROM sub_chunks
             WHERE host_key = ?1 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map(params![host_key], |row| {
                Ok(SubChunkRow {
                    chunk_num: row.get(0)?,
                    add_chunk_num: row.get(1)?,
                    host_key: row.get(2)?,
                    prefix: row.get(3)?,
                    list: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn add_chunk_nums(&self, list: &str) -> Result<Vec<i32>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT chunk_num FROM add_chunks WHERE list = ?1 ORDER BY chunk_num",
        )?;
        let nums = stmt
            .query_map(params![list], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nums)
    }

    fn sub_chunk_nums(&self, list: &str) -> Result<Vec<i32>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT chunk_num FROM sub_chunks WHERE list = ?1 ORDER BY chunk_num",
        )?;
        let nums = stmt
            .query_map(params![list], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nums)
    }

    fn insert_add_chunk(&self, list: &str, chunk_num: i32, entries: &[AddEntry]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO add_chunks (chunk_num, host_key, prefix, list)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for entry in entries {
                stmt.execute(params![chunk_num, entry.host_key, entry.prefix, list])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_sub_chunk(&self, list: &str, chunk_num: i32, entries: &[SubEntry]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO sub_chunks (chunk_num, add_chunk_num, host_key, prefix, list)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for entry in entries {
                stmt.execute(params![
                    chunk_num,
                    entry.add_chunk_num,
                    entry.host_key,
                    entry.prefix,
                    list
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_add_chunks(&self, list: &str, nums: &[i32]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare_cached("DELETE FROM add_chunks WHERE list = ?1 AND chunk_num = ?2")?;
            for num in nums {
                stmt.execute(params![list, num])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_sub_chunks(&self, list: &str, nums: &[i32]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare_cached("DELETE FROM sub_chunks WHERE list = ?1 AND chunk_num = ?2")?;
            for num in nums {
                stmt.execute(params![list, num])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn full_hashes(&self, list: &str, chunk_num: i32, min_timestamp: i64) -> Result<Vec<Vec<u8>>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT hash FROM full_hashes
             WHERE list = ?1 AND chunk_num = ?2 AND timestamp >= ?3",
        )?;
        let hashes = stmt
            .query_map(params![list, chunk_num, min_timestamp], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(hashes)
    }

    fn insert_full_hashes(&self, rows: &[FullHashRow], timestamp: i64) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO full_hashes (chunk_num, hash, list, timestamp)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (chunk_num, hash, list) DO UPDATE SET
                    timestamp = excluded.timestamp",
            )?;
            for row in rows {
                stmt.execute(params![row.chunk_num, row.hash, row.list, timestamp])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_full_hashes(&self, list: &str, nums: &[i32]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare_cached("DELETE FROM full_hashes WHERE list = ?1 AND chunk_num = ?2")?;
            for num in nums {
                stmt.execute(params![list, num])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn cursor(&self, list: &str) -> Result<UpdateCursor> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT last_update, next_wait, errors FROM list_updates WHERE list = ?1",
        )?;
        let cursor = stmt.query_row(params![list], |row| {
            Ok(UpdateCursor {
                last_update: row.get(0)?,
                next_wait: row.get(1)?,
                errors: row.get(2)?,
            })
        });
        match cursor {
            Ok(cursor) => Ok(cursor),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(UpdateCursor::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn record_update(&self, list: &str, time: i64, wait: i64) -> Result<()> {
        self.lock().execute(
            "INSERT INTO list_updates (list, last_update, next_wait, errors)
             VALUES (?1, ?2, ?3, 0)
             ON CONFLICT (list) DO UPDATE SET
                last_update = excluded.last_update,
                next_wait = excluded.next_wait,
                errors = 0",
            params![list, time, wait],
        )?;
        Ok(())
    }

    fn record_update_error(&self, list: &str, time: i64, wait: i64, errors: u32) -> Result<()> {
        self.lock().execute(
            "INSERT INTO list_updates (list, last_update, next_wait, errors)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (list) DO UPDATE SET
                last_update = excluded.last_update,
                next_wait = excluded.next_wait,
                errors = excluded.errors",
            params![list, time, wait, errors],
        )?;
        Ok(())
    }

    fn full_hash_error(&self, prefix: &[u8]) -> Result<Option<PrefixError>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare_cached("SELECT timestamp, errors FROM full_hash_errors WHERE prefix = ?1")?;
        let row = stmt.query_row(params![prefix], |row| {
            Ok(PrefixError {
                timestamp: row.get(0)?,
                errors: row.get(1)?,
            })
        });
        match row {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn record_full_hash_error(&self, prefix: &[u8], timestamp: i64) -> Result<()> {
        self.lock().execute(
            "INSERT INTO full_hash_errors (prefix, errors, timestamp)
             VALUES (?1, 1, ?2)
             ON CONFLICT (prefix) DO UPDATE SET
                errors = errors + 1,
                timestamp = excluded.timestamp",
            params![prefix, timestamp],
        )?;
        Ok(())
    }

    fn clear_full_hash_error(&self, prefix: &[u8]) -> Result<()> {
        self.lock().execute(
            "DELETE FROM full_hash_errors WHERE prefix = ?1",
            params![prefix],
        )?;
        Ok(())
    }

    fn mac_keys(&self) -> Result<Option<MacKeys>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare_cached("SELECT client_key, wrapped_key FROM mac_keys WHERE id = 0")?;
        let row = stmt.query_row([], |row| {
            Ok(MacKeys {
                client_key: row.get(0)?,
                wrapped_key: row.get(1)?,
            })
        });
        match row {
            Ok(keys) => Ok(Some(keys)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_mac_keys(&self, keys: &MacKeys) -> Result<()> {
        self.lock().execute(
            "INSERT INTO mac_keys (id, client_key, wrapped_key) VALUES (0, ?1, ?2)
             ON CONFLICT (id) DO UPDATE SET
                client_key = excluded.client_key,
                wrapped_key = excluded.wrapped_key",
            params![keys.client_key, keys.wrapped_key],
        )?;
        Ok(())
    }

    fn clear_mac_keys(&self) -> Result<()> {
        self.lock().execute("DELETE FROM mac_keys", [])?;
        Ok(())
    }

    fn reset_list(&self, list: &str) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM add_chunks WHERE list = ?1", params![list])?;
        tx.execute("DELETE FROM sub_chunks WHERE list = ?1", params![list])?;
        tx.execute("DELETE FROM full_hashes WHERE list = ?1", params![list])?;
        tx.commit()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let cutoff = Utc::now().timestamp() - FULL_HASH_TTL_SECS;
        let evicted = self.lock().execute(
            "DELETE FROM full_hashes WHERE timestamp < ?1",
            params![cutoff],
        )?;
        if evicted > 0 {
            debug!(evicted, "evicted stale full hashes");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(host_key: &[u8], prefix: &[u8]) -> AddEntry {
        AddEntry {
            host_key: host_key.to_vec(),
            prefix: prefix.to_vec(),
        }
    }

    #[test]
    fn test_chunk_round_trip() {
        let store = SqliteStorage::open_in_memory().unwrap();
        store
            .insert_add_chunk(
                "l",
                1,
                &[entry(&[1, 2, 3, 4], &[9, 9, 9, 9]), entry(&[1, 2, 3, 4], b"")],
            )
            .unwrap();

        let rows = store.add_chunks_for_host(&[1, 2, 3, 4]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].prefix, vec![9, 9, 9, 9]);
        assert!(rows[1].prefix.is_empty());
        assert!(store.add_chunks_for_host(&[5, 5, 5, 5]).unwrap().is_empty());
    }

    #[test]
    fn test_empty_chunk_still_reports_its_number() {
        let store = SqliteStorage::open_in_memory().unwrap();
        store.insert_add_chunk("l", 42, &[entry(b"", b"")]).unwrap();
        assert_eq!(store.add_chunk_nums("l").unwrap(), vec![42]);
    }

    #[test]
    fn test_chunk_nums_distinct_and_sorted() {
        let store = SqliteStorage::open_in_memory().unwrap();
        for num in [5, 1, 3] {
            store
                .insert_add_chunk(
                    "l",
                    num,
                    &[entry(&[1, 1, 1, 1], &[0; 4]), entry(&[2, 2, 2, 2], &[1; 4])],
                )
                .unwrap();
        }
        assert_eq!(store.add_chunk_nums("l").unwrap(), vec![1, 3, 5]);
        assert!(store.add_chunk_nums("other").unwrap().is_empty());
    }

    #[test]
    fn test_delete_add_chunks() {
        let store = SqliteStorage::open_in_memory().unwrap();
        for num in [1, 2, 3] {
            store
                .insert_add_chunk("l", num, &[entry(&[1, 2, 3, 4], &[0; 4])])
                .unwrap();
        }
        store.delete_add_chunks("l", &[1, 3]).unwrap();
        assert_eq!(store.add_chunk_nums("l").unwrap(), vec![2]);
    }

    #[test]
    fn test_full_hash_freshness_and_upsert() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let row = FullHashRow {
            chunk_num: 7,
            hash: vec![0xAB; 32],
            list: "l".to_string(),
        };
        store.insert_full_hashes(&[row.clone()], 1000).unwrap();
        assert_eq!(store.full_hashes("l", 7, 500).unwrap().len(), 1);
        assert!(store.full_hashes("l", 7, 2000).unwrap().is_empty());

        // Upsert refreshes the timestamp instead of duplicating.
        store.insert_full_hashes(&[row], 3000).unwrap();
        assert_eq!(store.full_hashes("l", 7, 2000).unwrap().len(), 1);
    }

    #[test]
    fn test_close_evicts_stale_hashes() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let now = Utc::now().timestamp();
        let fresh = FullHashRow {
            chunk_num: 1,
            hash: vec![1; 32],
            list: "l".to_string(),
        };
        let stale = FullHashRow {
            chunk_num: 2,
            hash: vec![2; 32],
            list: "l".to_string(),
        };
        store.insert_full_hashes(&[fresh], now).unwrap();
        store
            .insert_full_hashes(&[stale], now - FULL_HASH_TTL_SECS - 10)
            .unwrap();
        store.close().unwrap();
        assert_eq!(store.full_hashes("l", 1, 0).unwrap().len(), 1);
        assert!(store.full_hashes("l", 2, 0).unwrap().is_empty());
    }

    #[test]
    fn test_cursor_defaults_then_records() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let cursor = store.cursor("l").unwrap();
        assert_eq!(cursor, UpdateCursor::default());

        store.record_update_error("l", 100, 60, 1).unwrap();
        let cursor = store.cursor("l").unwrap();
        assert_eq!((cursor.last_update, cursor.next_wait, cursor.errors), (100, 60, 1));

        // A success resets the error counter; the other list is untouched.
        store.record_update_error("other", 100, 60, 3).unwrap();
        store.record_update("l", 200, 1800).unwrap();
        assert_eq!(store.cursor("l").unwrap().errors, 0);
        assert_eq!(store.cursor("other").unwrap().errors, 3);
    }

    #[test]
    fn test_full_hash_error_counting() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let prefix = [1u8, 2, 3, 4];
        assert!(store.full_hash_error(&prefix).unwrap().is_none());

        store.record_full_hash_error(&prefix, 100).unwrap();
        store.record_full_hash_error(&prefix, 200).unwrap();
        let err = store.full_hash_error(&prefix).unwrap().unwrap();
        assert_eq!((err.errors, err.timestamp), (2, 200));

        store.clear_full_hash_error(&prefix).unwrap();
        assert!(store.full_hash_error(&prefix).unwrap().is_none());
    }

    #[test]
    fn test_mac_key_lifecycle() {
        let store = SqliteStorage::open_in_memory().unwrap();
        assert!(store.mac_keys().unwrap().is_none());

        let keys = MacKeys {
            client_key: vec![1, 2, 3],
            wrapped_key: "wrapped".to_string(),
        };
        store.set_mac_keys(&keys).unwrap();
        assert_eq!(store.mac_keys().unwrap().unwrap(), keys);

        let rotated = MacKeys {
            client_key: vec![4, 5, 6],
            wrapped_key: "wrapped2".to_string(),
        };
        store.set_mac_keys(&rotated).unwrap();
        assert_eq!(store.mac_keys().unwrap().unwrap(), rotated);

        store.clear_mac_keys().unwrap();
        assert!(store.mac_keys().unwrap().is_none());
    }

    #[test]
    fn test_reset_list_scoped() {
        let store = SqliteStorage::open_in_memory().unwrap();
        store
            .insert_add_chunk("l1", 1, &[entry(&[1, 2, 3, 4], &[0; 4])])
            .unwrap();
        store
            .insert_add_chunk("l2", 2, &[entry(&[1, 2, 3, 4], &[0; 4])])
            .unwrap();
        store.reset_list("l1").unwrap();
        assert!(store.add_chunk_nums("l1").unwrap().is_empty());
        assert_eq!(store.add_chunk_nums("l2").unwrap(), vec![2]);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mirror.db");
        {
            let store = SqliteStorage::open(&path).unwrap();
            store
                .insert_add_chunk("l", 9, &[entry(&[7, 7, 7, 7], &[8; 4])])
                .unwrap();
        }
        let store = SqliteStorage::open(&path).unwrap();
        assert_eq!(store.add_chunk_nums("l").unwrap(), vec![9]);
    }
}
