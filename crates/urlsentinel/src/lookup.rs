//! Local match pipeline stages and the full-hash exchange formats.
//!
//! The stages are pure functions over storage rows so the pipeline is
//! testable without a server; [`crate::client`] wires them to storage and
//! the gethash endpoint.

use crate::error::{Result, SentinelError};
use crate::types::{AddChunkRow, FullHashRow, SubChunkRow, PREFIX_LEN};

/// Keep add rows that can still match the candidate prefixes. A row with an
/// empty prefix matches on the host alone and always survives.
pub fn filter_by_prefix<'a>(
    rows: &'a [AddChunkRow],
    prefixes: &[Vec<u8>],
) -> Vec<&'a AddChunkRow> {
    rows.iter()
        .filter(|row| row.prefix.is_empty() || prefixes.iter().any(|p| *p == row.prefix))
        .collect()
}

/// Drop add rows cancelled by a sub row in the same list naming their chunk,
/// either wholesale (empty sub prefix) or for the matching prefix.
pub fn apply_sub_cancellation<'a>(
    adds: Vec<&'a AddChunkRow>,
    subs: &[SubChunkRow],
) -> Vec<&'a AddChunkRow> {
    adds.into_iter()
        .filter(|add| {
            !subs.iter().any(|sub| {
                sub.list == add.list
                    && sub.add_chunk_num == add.chunk_num
                    && (sub.prefix.is_empty() || sub.prefix == add.prefix)
            })
        })
        .collect()
}

/// Body for the full-hash endpoint: `SIZE:TOTAL_BYTES\n` then the raw
/// prefixes back to back.
pub fn build_full_hash_request(prefixes: &[Vec<u8>]) -> Vec<u8> {
    let mut body = format!("{}:{}\n", PREFIX_LEN, PREFIX_LEN * prefixes.len()).into_bytes();
    for prefix in prefixes {
        body.extend_from_slice(prefix);
    }
    body
}

/// Parse repeated `LIST:CHUNKNUM:LEN\nHASH_BYTES{LEN}` blocks, splitting
/// each block into its 32-byte hashes.
pub fn parse_full_hash_response(body: &[u8]) -> Result<Vec<FullHashRow>> {
    let mut rows = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        let nl = rest.iter().position(|&b| b == b'\n').ok_or_else(|| {
            SentinelError::Internal("full-hash header missing newline".to_string())
        })?;
        let header = std::str::from_utf8(&rest[..nl])
            .map_err(|_| SentinelError::Internal("full-hash header is not ASCII".to_string()))?;
        let bad = || SentinelError::Internal(format!("bad full-hash header {header:?}"));
        let mut parts = header.split(':');
        let list = parts.next().filter(|s| !s.is_empty()).ok_or_else(bad)?;
        let chunk_num: i32 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        let len: usize = parts
            .next()
            .and_then(|p| p.parse().ok())
            .filter(|n| *n > 0 && *n % 32 == 0)
            .ok_or_else(bad)?;
        if parts.next().is_some() {
            return Err(bad());
        }
        rest = &rest[nl + 1..];
        if rest.len() < len {
            return Err(SentinelError::Internal(format!(
                "full-hash block for {list} truncated"
            )));
        }
        for hash in rest[..len].chunks(32) {
            rows.push(FullHashRow {
                chunk_num,
                hash: hash.to_vec(),
                list: list.to_string(),
            });
        }
        rest = &rest[len..];
    }
    Ok(rows)
}
