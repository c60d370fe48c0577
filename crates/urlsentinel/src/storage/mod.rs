//! Persistence contract and back-ends for the local list mirror.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::error::Result;
use crate::types::{
    AddChunkRow, AddEntry, FullHashRow, MacKeys, PrefixError, SubChunkRow, SubEntry, UpdateCursor,
};

/// Storage contract for chunk data, full hashes, cursors and key material.
///
/// Implementations must serialize writes internally: the engine runs a
/// single-threaded update cycle but serves lookups from many workers against
/// the same handle.
pub trait Storage: Send + Sync {
    /// Add-chunk rows whose host key equals `host_key`, in insertion order.
    fn add_chunks_for_host(&self, host_key: &[u8]) -> Result<Vec<AddChunkRow>>;

    /// Sub-chunk rows whose host key equals `host_key`, in insertion order.
    fn sub_chunks_for_host(&self, host_key: &[u8]) -> Result<Vec<SubChunkRow>>;

    /// Distinct add-chunk numbers stored for `list`, ascending. Includes
    /// chunks persisted with no entries beyond the placeholder.
    fn add_chunk_nums(&self, list: &str) -> Result<Vec<i32>>;

    /// Distinct sub-chunk numbers stored for `list`, ascending.
    fn sub_chunk_nums(&self, list: &str) -> Result<Vec<i32>>;

    /// Persist every entry of one add chunk atomically.
    fn insert_add_chunk(&self, list: &str, chunk_num: i32, entries: &[AddEntry]) -> Result<()>;

    /// Persist every entry of one sub chunk atomically.
    fn insert_sub_chunk(&self, list: &str, chunk_num: i32, entries: &[SubEntry]) -> Result<()>;

    fn delete_add_chunks(&self, list: &str, nums: &[i32]) -> Result<()>;

    fn delete_sub_chunks(&self, list: &str, nums: &[i32]) -> Result<()>;

    /// Full hashes for `(list, chunk_num)` confirmed at or after
    /// `min_timestamp`.
    fn full_hashes(&self, list: &str, chunk_num: i32, min_timestamp: i64) -> Result<Vec<Vec<u8>>>;

    /// Upsert on `(chunk_num, hash, list)`, stamping each row `timestamp`.
    fn insert_full_hashes(&self, rows: &[FullHashRow], timestamp: i64) -> Result<()>;

    fn delete_full_hashes(&self, list: &str, nums: &[i32]) -> Result<()>;

    /// Cursor for `list`; the never-updated default when absent.
    fn cursor(&self, list: &str) -> Result<UpdateCursor>;

    /// Record a successful exchange: `last = time`, `wait`, errors reset.
    fn record_update(&self, list: &str, time: i64, wait: i64) -> Result<()>;

    /// Record a failed exchange for this list only.
    fn record_update_error(&self, list: &str, time: i64, wait: i64, errors: u32) -> Result<()>;

    /// Error state for a prefix, if any fetch for it has failed.
    fn full_hash_error(&self, prefix: &[u8]) -> Result<Option<PrefixError>>;

    /// Count one more failed fetch for `prefix` at `timestamp`.
    fn record_full_hash_error(&self, prefix: &[u8], timestamp: i64) -> Result<()>;

    /// Drop the error row for `prefix` after a successful fetch.
    fn clear_full_hash_error(&self, prefix: &[u8]) -> Result<()>;

    fn mac_keys(&self) -> Result<Option<MacKeys>>;

    fn set_mac_keys(&self, keys: &MacKeys) -> Result<()>;

    fn clear_mac_keys(&self) -> Result<()>;

    /// Drop all chunks and full hashes for `list`.
    fn reset_list(&self, list: &str) -> Result<()>;

    /// Evict stale full hashes before the handle is released.
    fn close(&self) -> Result<()>;
}
