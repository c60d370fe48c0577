//! Protocol data model: chunk rows, cursors, key material, constants.

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// The malware blocklist distributed by the service.
pub const MALWARE_LIST: &str = "goog-malware-shavar";

/// The phishing blocklist distributed by the service.
pub const PHISHING_LIST: &str = "googpub-phish-shavar";

/// Full hashes older than this are stale and never match (45 minutes).
pub const FULL_HASH_TTL_SECS: i64 = 45 * 60;

/// Poll interval used when the server does not send an `n:` directive.
pub const DEFAULT_WAIT_SECS: i64 = 1800;

/// Length of the hash prefixes matched during lookup.
pub const PREFIX_LEN: usize = 4;

/// Length of the host-key probes indexing chunk data.
pub const HOST_KEY_LEN: usize = 4;

// ---------------------------------------------------------------------------
// Chunk entries (decoded wire form)
// ---------------------------------------------------------------------------

/// One decoded entry of an add chunk.
///
/// An empty `prefix` means the whole host matches. An entry with empty
/// `host_key` AND empty `prefix` is the placeholder a bodyless chunk leaves
/// behind so its chunk number stays on the books.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddEntry {
    pub host_key: Vec<u8>,
    pub prefix: Vec<u8>,
}

/// One decoded entry of a sub chunk, cancelling data added by
/// `add_chunk_num`. An empty `prefix` cancels that chunk's entire entry for
/// this host key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubEntry {
    pub host_key: Vec<u8>,
    pub add_chunk_num: i32,
    pub prefix: Vec<u8>,
}

/// A chunk decoded from a redirect body, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Add { chunk_num: i32, entries: Vec<AddEntry> },
    Sub { chunk_num: i32, entries: Vec<SubEntry> },
}

impl Chunk {
    pub fn chunk_num(&self) -> i32 {
        match self {
            Chunk::Add { chunk_num, .. } | Chunk::Sub { chunk_num, .. } => *chunk_num,
        }
    }
}

// ---------------------------------------------------------------------------
// Stored rows
// ---------------------------------------------------------------------------

/// A stored add-chunk row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddChunkRow {
    pub chunk_num: i32,
    pub host_key: Vec<u8>,
    pub prefix: Vec<u8>,
    pub list: String,
}

/// A stored sub-chunk row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubChunkRow {
    pub chunk_num: i32,
    pub add_chunk_num: i32,
    pub host_key: Vec<u8>,
    pub prefix: Vec<u8>,
    pub list: String,
}

/// A confirmed 32-byte full hash tied to the chunk that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullHashRow {
    pub chunk_num: i32,
    pub hash: Vec<u8>,
    pub list: String,
}

/// Per-list update cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateCursor {
    /// Unix seconds of the last completed exchange, 0 if never.
    pub last_update: i64,
    /// Seconds to wait before the next exchange.
    pub next_wait: i64,
    /// Consecutive failed exchanges.
    pub errors: u32,
}

impl Default for UpdateCursor {
    fn default() -> Self {
        Self {
            last_update: 0,
            next_wait: DEFAULT_WAIT_SECS,
            errors: 0,
        }
    }
}

/// Error state for one 4-byte prefix whose full-hash fetch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixError {
    pub timestamp: i64,
    pub errors: u32,
}

/// Negotiated request-authentication keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacKeys {
    /// Decoded client key used to verify HMACs locally.
    pub client_key: Vec<u8>,
    /// Opaque wrapped key echoed back to the server as `wrkey`.
    pub wrapped_key: String,
}
