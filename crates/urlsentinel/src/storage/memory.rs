//! In-memory back-end: no persistence, mainly for tests and short-lived
//! processes that rebuild their mirror on start.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;

use super::Storage;
use crate::error::Result;
use crate::types::{
    AddChunkRow, AddEntry, FullHashRow, MacKeys, PrefixError, SubChunkRow, SubEntry, UpdateCursor,
    FULL_HASH_TTL_SECS,
};

#[derive(Default)]
struct Inner {
    add_chunks: Vec<AddChunkRow>,
    sub_chunks: Vec<SubChunkRow>,
    full_hashes: Vec<StoredHash>,
    prefix_errors: HashMap<Vec<u8>, PrefixError>,
    cursors: HashMap<String, UpdateCursor>,
    mac_keys: Option<MacKeys>,
}

struct StoredHash {
    row: FullHashRow,
    timestamp: i64,
}

/// Memory-backed [`Storage`], rows held in insertion order.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("storage lock poisoned")
    }
}

impl Storage for MemoryStorage {
    fn add_chunks_for_host(&self, host_key: &[u8]) -> Result<Vec<AddChunkRow>> {
        Ok(self
            .lock()
            .add_chunks
            .iter()
            .filter(|row| row.host_key == host_key)
            .cloned()
            .collect())
    }

    fn sub_chunks_for_host(&self, host_key: &[u8]) -> Result<Vec<SubChunkRow>> {
        Ok(self
            .lock()
            .sub_chunks
            .iter()
            .filter(|row| row.host_key == host_key)
            .cloned()
            .collect())
    }

    fn add_chunk_nums(&self, list: &str) -> Result<Vec<i32>> {
        let inner = self.lock();
        let mut nums: Vec<i32> = inner
            .add_chunks
            .iter()
            .filter(|row| row.list == list)
            .map(|row| row.chunk_num)
            .collect();
        nums.sort_unstable();
        nums.dedup();
        Ok(nums)
    }

    fn sub_chunk_nums(&self, list: &str) -> Result<Vec<i32>> {
        let inner = self.lock();
        let mut nums: Vec<i32> = inner
            .sub_chunks
            .iter()
            .filter(|row| row.list == list)
            .map(|row| row.chunk_num)
            .collect();
        nums.sort_unstable();
        nums.dedup();
        Ok(nums)
    }

    fn insert_add_chunk(&self, list: &str, chunk_num: i32, entries: &[AddEntry]) -> Result<()> {
        let mut inner = self.lock();
        for entry in entries {
            inner.add_chunks.push(AddChunkRow {
                chunk_num,
                host_key: entry.host_key.clone(),
                prefix: entry.prefix.clone(),
                list: list.to_string(),
            });
        }
        Ok(())
    }

    fn insert_sub_chunk(&self, list: &str, chunk_num: i32, entries: &[SubEntry]) -> Result<()> {
        let mut inner = self.lock();
        for entry in entries {
            inner.sub_chunks.push(SubChunkRow {
                chunk_num,
                add_chunk_num: entry.add_chunk_num,
                host_key: entry.host_key.clone(),
                prefix: entry.prefix.clone(),
                list: list.to_string(),
            });
        }
        Ok(())
    }

    fn delete_add_chunks(&self, list: &str, nums: &[i32]) -> Result<()> {
        self.lock()
            .add_chunks
            .retain(|row| row.list != list || !nums.contains(&row.chunk_num));
        Ok(())
    }

    fn delete_sub_chunks(&self, list: &str, nums: &[i32]) -> Result<()> {
        self.lock()
            .sub_chunks
            .retain(|row| row.list != list || !nums.contains(&row.chunk_num));
        Ok(())
    }

    fn full_hashes(&self, list: &str, chunk_num: i32, min_timestamp: i64) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .lock()
            .full_hashes
            .iter()
            .filter(|stored| {
                stored.row.list == list
                    && stored.row.chunk_num == chunk_num
                    && stored.timestamp >= min_timestamp
            })
            .map(|stored| stored.row.hash.clone())
            .collect())
    }

    fn insert_full_hashes(&self, rows: &[FullHashRow], timestamp: i64) -> Result<()> {
        let mut inner = self.lock();
        for row in rows {
            if let Some(existing) = inner.full_hashes.iter_mut().find(|stored| {
                stored.row.chunk_num == row.chunk_num
                    && stored.row.hash == row.hash
                    && stored.row.list == row.list
            }) {
                existing.timestamp = timestamp;
            } else {
                inner.full_hashes.push(StoredHash {
                    row: row.clone(),
                    timestamp,
                });
            }
        }
        Ok(())
    }

    fn delete_full_hashes(&self, list: &str, nums: &[i32]) -> Result<()> {
        self.lock()
            .full_hashes
            .retain(|stored| stored.row.list != list || !nums.contains(&stored.row.chunk_num));
        Ok(())
    }

    fn cursor(&self, list: &str) -> Result<UpdateCursor> {
        Ok(self.lock().cursors.get(list).copied().unwrap_or_default())
    }

    fn record_update(&self, list: &str, time: i64, wait: i64) -> Result<()> {
        self.lock().cursors.insert(
            list.to_string(),
            UpdateCursor {
                last_update: time,
                next_wait: wait,
                errors: 0,
            },
        );
        Ok(())
    }

    fn record_update_error(&self, list: &str, time: i64, wait: i64, errors: u32) -> Result<()> {
        self.lock().cursors.insert(
            list.to_string(),
            UpdateCursor {
                last_update: time,
                next_wait: wait,
                errors,
            },
        );
        Ok(())
    }

    fn full_hash_error(&self, prefix: &[u8]) -> Result<Option<PrefixError>> {
        Ok(self.lock().prefix_errors.get(prefix).copied())
    }

    fn record_full_hash_error(&self, prefix: &[u8], timestamp: i64) -> Result<()> {
        let mut inner = self.lock();
        let entry = inner
            .prefix_errors
            .entry(prefix.to_vec())
            .or_insert(PrefixError {
                timestamp,
                errors: 0,
            });
        entry.errors += 1;
        entry.timestamp = timestamp;
        Ok(())
    }

    fn clear_full_hash_error(&self, prefix: &[u8]) -> Result<()> {
        self.lock().prefix_errors.remove(prefix);
        Ok(())
    }

    fn mac_keys(&self) -> Result<Option<MacKeys>> {
        Ok(self.lock().mac_keys.clone())
    }

    fn set_mac_keys(&self, keys: &MacKeys) -> Result<()> {
        self.lock().mac_keys = Some(keys.clone());
        Ok(())
    }

    fn clear_mac_keys(&self) -> Result<()> {
        self.lock().mac_keys = None;
        Ok(())
    }

    fn reset_list(&self, list: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.add_chunks.retain(|row| row.list != list);
        inner.sub_chunks.retain(|row| row.list != list);
        inner.full_hashes.retain(|stored| stored.row.list != list);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let cutoff = Utc::now().timestamp() - FULL_HASH_TTL_SECS;
        self.lock()
            .full_hashes
            .retain(|stored| stored.timestamp >= cutoff);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_preserved() {
        let store = MemoryStorage::new();
        for (num, prefix) in [(3, [3u8; 4]), (1, [1u8; 4]), (2, [2u8; 4])] {
            store
                .insert_add_chunk(
                    "l",
                    num,
                    &[AddEntry {
                        host_key: vec![9, 9, 9, 9],
                        prefix: prefix.to_vec(),
                    }],
                )
                .unwrap();
        }
        let rows = store.add_chunks_for_host(&[9, 9, 9, 9]).unwrap();
        let nums: Vec<i32> = rows.iter().map(|r| r.chunk_num).collect();
        assert_eq!(nums, vec![3, 1, 2]);
        assert_eq!(store.add_chunk_nums("l").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_full_hash_upsert_refreshes_timestamp() {
        let store = MemoryStorage::new();
        let row = FullHashRow {
            chunk_num: 1,
            hash: vec![0xAA; 32],
            list: "l".to_string(),
        };
        store.insert_full_hashes(&[row.clone()], 100).unwrap();
        store.insert_full_hashes(&[row], 900).unwrap();
        assert_eq!(store.full_hashes("l", 1, 500).unwrap().len(), 1);
    }

    #[test]
    fn test_prefix_error_counting() {
        let store = MemoryStorage::new();
        store.record_full_hash_error(&[1, 2, 3, 4], 10).unwrap();
        store.record_full_hash_error(&[1, 2, 3, 4], 20).unwrap();
        let err = store.full_hash_error(&[1, 2, 3, 4]).unwrap().unwrap();
        assert_eq!((err.errors, err.timestamp), (2, 20));
        store.clear_full_hash_error(&[1, 2, 3, 4]).unwrap();
        assert!(store.full_hash_error(&[1, 2, 3, 4]).unwrap().is_none());
    }
}
