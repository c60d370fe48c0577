//! Client for a hash-prefix URL reputation service.
//!
//! This crate provides:
//! - The incremental update engine: command-stream parsing, redirected
//!   binary chunk files, add/sub delta application, poll-interval and
//!   backoff bookkeeping
//! - URL canonicalization into the host-suffix x path-prefix permutations
//!   the service hashes
//! - The lookup pipeline: host-key probe, prefix filter, sub-chunk
//!   cancellation, cached and on-demand full-hash confirmation
//! - Optional HMAC-SHA1 authentication of server responses with
//!   rekey-on-expiry
//! - A storage contract with SQLite and in-memory back-ends

pub mod backoff;
pub mod canonical;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod lookup;
pub mod mac;
pub mod storage;
pub mod types;
pub mod update;

// Re-export key types at crate root for convenience.
pub use client::{SentinelClient, UpdateStatus};
pub use config::SentinelConfig;
pub use error::SentinelError;
pub use storage::{MemoryStorage, SqliteStorage, Storage};
pub use types::{MALWARE_LIST, PHISHING_LIST};
