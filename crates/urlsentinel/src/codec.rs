//! Wire codecs: binary chunk bodies, chunk-file framing, and the
//! chunk-number range notation used in update requests.

use crate::error::{Result, SentinelError};
use crate::types::{AddEntry, Chunk, SubEntry, HOST_KEY_LEN};

// ---------------------------------------------------------------------------
// Chunk file framing
// ---------------------------------------------------------------------------

/// Parse a full redirect body into chunks, preserving arrival order.
///
/// Each chunk is framed as `a:CHUNKNUM:HASHLEN:CHUNKLEN\n` (or `s:`)
/// followed by `CHUNKLEN` raw body bytes.
pub fn decode_chunk_stream(body: &[u8]) -> Result<Vec<Chunk>> {
    let mut chunks = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        let nl = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| SentinelError::Internal("chunk header missing newline".to_string()))?;
        let header = std::str::from_utf8(&rest[..nl])
            .map_err(|_| SentinelError::Internal("chunk header is not ASCII".to_string()))?;
        let (kind, chunk_num, hash_len, body_len) = parse_chunk_header(header)?;
        rest = &rest[nl + 1..];
        if rest.len() < body_len {
            return Err(SentinelError::Internal(format!(
                "chunk {chunk_num} truncated: need {body_len} bytes, have {}",
                rest.len()
            )));
        }
        let (chunk_body, tail) = rest.split_at(body_len);
        chunks.push(match kind {
            ChunkKind::Add => Chunk::Add {
                chunk_num,
                entries: decode_add_body(chunk_body, hash_len)?,
            },
            ChunkKind::Sub => Chunk::Sub {
                chunk_num,
                entries: decode_sub_body(chunk_body, hash_len)?,
            },
        });
        rest = tail;
    }
    Ok(chunks)
}

enum ChunkKind {
    Add,
    Sub,
}

fn parse_chunk_header(header: &str) -> Result<(ChunkKind, i32, usize, usize)> {
    let bad = || SentinelError::Internal(format!("bad chunk header {header:?}"));
    let mut parts = header.split(':');
    let kind = match parts.next() {
        Some("a") => ChunkKind::Add,
        Some("s") => ChunkKind::Sub,
        _ => return Err(bad()),
    };
    let chunk_num: i32 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .filter(|n| *n >= 1)
        .ok_or_else(bad)?;
    let hash_len: usize = parts
        .next()
        .and_then(|p| p.parse().ok())
        .filter(|n| (1..=32).contains(n))
        .ok_or_else(bad)?;
    let body_len: usize = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
    if parts.next().is_some() {
        return Err(bad());
    }
    Ok((kind, chunk_num, hash_len, body_len))
}

// ---------------------------------------------------------------------------
// Chunk bodies
// ---------------------------------------------------------------------------

/// Decode an a-chunk body: repeated `HOSTKEY[4] COUNT (PREFIX){COUNT}`.
///
/// COUNT == 0 yields one host-only entry. An empty body yields the
/// placeholder entry that keeps the chunk number on the books.
pub fn decode_add_body(body: &[u8], hash_len: usize) -> Result<Vec<AddEntry>> {
    if body.is_empty() {
        return Ok(vec![AddEntry {
            host_key: Vec::new(),
            prefix: Vec::new(),
        }]);
    }
    let mut entries = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        if rest.len() < HOST_KEY_LEN + 1 {
            return Err(SentinelError::Internal("truncated add entry".to_string()));
        }
        let host_key = rest[..HOST_KEY_LEN].to_vec();
        let count = rest[HOST_KEY_LEN] as usize;
        rest = &rest[HOST_KEY_LEN + 1..];
        if count == 0 {
            entries.push(AddEntry {
                host_key,
                prefix: Vec::new(),
            });
            continue;
        }
        if rest.len() < count * hash_len {
            return Err(SentinelError::Internal(
                "truncated add prefixes".to_string(),
            ));
        }
        for _ in 0..count {
            entries.push(AddEntry {
                host_key: host_key.clone(),
                prefix: rest[..hash_len].to_vec(),
            });
            rest = &rest[hash_len..];
        }
    }
    Ok(entries)
}

/// Decode an s-chunk body: repeated
/// `HOSTKEY[4] COUNT (ADDCHUNKNUM_be32 PREFIX){COUNT}`.
///
/// COUNT == 0 means one bare `ADDCHUNKNUM` follows and the whole referenced
/// entry is cancelled.
pub fn decode_sub_body(body: &[u8], hash_len: usize) -> Result<Vec<SubEntry>> {
    if body.is_empty() {
        return Ok(vec![SubEntry {
            host_key: Vec::new(),
            add_chunk_num: 0,
            prefix: Vec::new(),
        }]);
    }
    let mut entries = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        if rest.len() < HOST_KEY_LEN + 1 {
            return Err(SentinelError::Internal("truncated sub entry".to_string()));
        }
        let host_key = rest[..HOST_KEY_LEN].to_vec();
        let count = rest[HOST_KEY_LEN] as usize;
        rest = &rest[HOST_KEY_LEN + 1..];
        if count == 0 {
            entries.push(SubEntry {
                host_key,
                add_chunk_num: read_be_chunk_num(rest)?,
                prefix: Vec::new(),
            });
            rest = &rest[4..];
            continue;
        }
        for _ in 0..count {
            let add_chunk_num = read_be_chunk_num(rest)?;
            if rest.len() < 4 + hash_len {
                return Err(SentinelError::Internal(
                    "truncated sub prefixes".to_string(),
                ));
            }
            entries.push(SubEntry {
                host_key: host_key.clone(),
                add_chunk_num,
                prefix: rest[4..4 + hash_len].to_vec(),
            });
            rest = &rest[4 + hash_len..];
        }
    }
    Ok(entries)
}

fn read_be_chunk_num(bytes: &[u8]) -> Result<i32> {
    if bytes.len() < 4 {
        return Err(SentinelError::Internal(
            "truncated add chunk number".to_string(),
        ));
    }
    Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

// ---------------------------------------------------------------------------
// Range codec
// ---------------------------------------------------------------------------

/// Encode a sorted, distinct chunk-number sequence as `1-3,5,7-9`.
pub fn encode_ranges(nums: &[i32]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < nums.len() {
        let start = nums[i];
        let mut end = start;
        while i + 1 < nums.len() && nums[i + 1] == end + 1 {
            end = nums[i + 1];
            i += 1;
        }
        if !out.is_empty() {
            out.push(',');
        }
        if start == end {
            out.push_str(&start.to_string());
        } else {
            out.push_str(&format!("{start}-{end}"));
        }
        i += 1;
    }
    out
}

/// Parse `1-3,5,7-9` back into the full number list.
pub fn parse_ranges(text: &str) -> Result<Vec<i32>> {
    let mut out = Vec::new();
    for token in text.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let bad = || SentinelError::Internal(format!("bad range token {token:?}"));
        match token.split_once('-') {
            Some((a, b)) => {
                let start: i32 = a.parse().map_err(|_| bad())?;
                let end: i32 = b.parse().map_err(|_| bad())?;
                if end < start {
                    return Err(bad());
                }
                out.extend(start..=end);
            }
            None => out.push(token.parse().map_err(|_| bad())?),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_round_trip() {
        let nums = vec![1, 2, 3, 5, 7, 8, 9];
        assert_eq!(encode_ranges(&nums), "1-3,5,7-9");
        assert_eq!(parse_ranges("1-3,5,7-9").unwrap(), nums);
    }

    #[test]
    fn test_range_singletons_and_empty() {
        assert_eq!(encode_ranges(&[4]), "4");
        assert_eq!(encode_ranges(&[]), "");
        assert_eq!(parse_ranges("").unwrap(), Vec::<i32>::new());
        assert_eq!(parse_ranges("42").unwrap(), vec![42]);
    }

    #[test]
    fn test_range_rejects_garbage() {
        assert!(parse_ranges("5-3").is_err());
        assert!(parse_ranges("a-b").is_err());
    }

    #[test]
    fn test_add_body_with_prefixes() {
        let mut body = vec![0xAA, 0xBB, 0xCC, 0xDD, 2];
        body.extend_from_slice(&[1, 2, 3, 4]);
        body.extend_from_slice(&[5, 6, 7, 8]);
        let entries = decode_add_body(&body, 4).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].host_key, vec![0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(entries[0].prefix, vec![1, 2, 3, 4]);
        assert_eq!(entries[1].prefix, vec![5, 6, 7, 8]);
    }

    #[test]
    fn test_add_body_host_only() {
        let entries = decode_add_body(&[0xAA, 0xBB, 0xCC, 0xDD, 0], 4).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].host_key, vec![0xAA, 0xBB, 0xCC, 0xDD]);
        assert!(entries[0].prefix.is_empty());
    }

    #[test]
    fn test_add_body_empty_keeps_placeholder() {
        let entries = decode_add_body(&[], 4).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].host_key.is_empty());
        assert!(entries[0].prefix.is_empty());
    }

    #[test]
    fn test_sub_body_whole_chunk() {
        let mut body = vec![0x01, 0x02, 0x03, 0x04, 0];
        body.extend_from_slice(&100i32.to_be_bytes());
        let entries = decode_sub_body(&body, 4).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].add_chunk_num, 100);
        assert!(entries[0].prefix.is_empty());
    }

    #[test]
    fn test_sub_body_with_prefixes() {
        let mut body = vec![0x01, 0x02, 0x03, 0x04, 1];
        body.extend_from_slice(&7i32.to_be_bytes());
        body.extend_from_slice(&[9, 9, 9, 9]);
        let entries = decode_sub_body(&body, 4).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].add_chunk_num, 7);
        assert_eq!(entries[0].prefix, vec![9, 9, 9, 9]);
    }

    #[test]
    fn test_stream_framing() {
        let mut stream = Vec::new();
        stream.extend_from_slice(b"a:42:4:5\n");
        stream.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD, 0]);
        stream.extend_from_slice(b"s:7:4:13\n");
        stream.extend_from_slice(&[0x01, 0x02, 0x03, 0x04, 1]);
        stream.extend_from_slice(&100i32.to_be_bytes());
        stream.extend_from_slice(&[9, 9, 9, 9]);

        let chunks = decode_chunk_stream(&stream).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_num(), 42);
        match &chunks[1] {
            Chunk::Sub { entries, .. } => assert_eq!(entries[0].add_chunk_num, 100),
            other => panic!("expected sub chunk, got {other:?}"),
        }
    }

    #[test]
    fn test_stream_rejects_truncation() {
        assert!(decode_chunk_stream(b"a:1:4:10\n\x00\x00").is_err());
        assert!(decode_chunk_stream(b"x:1:4:0\n").is_err());
        assert!(decode_chunk_stream(b"a:0:4:0\n").is_err());
    }

    #[test]
    fn test_empty_add_chunk_via_stream() {
        let chunks = decode_chunk_stream(b"a:42:4:0\n").unwrap();
        assert_eq!(chunks.len(), 1);
        match &chunks[0] {
            Chunk::Add { chunk_num, entries } => {
                assert_eq!(*chunk_num, 42);
                assert_eq!(entries.len(), 1);
                assert!(entries[0].host_key.is_empty());
            }
            other => panic!("expected add chunk, got {other:?}"),
        }
    }
}
