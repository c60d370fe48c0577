//! Downloads-request building and command-stream parsing.
//!
//! The update endpoint answers with a whitespace-separated directive stream.
//! Parsing is kept pure here; [`crate::client`] executes the parsed commands
//! in arrival order, fetching redirects as it goes.

use crate::codec;
use crate::error::{Result, SentinelError};

/// One parsed directive from the update command stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `n:SECONDS` — next poll interval.
    NextWait(i64),
    /// `i:LIST` — subsequent directives apply to this list.
    ListContext(String),
    /// `u:URL[,MAC]` — fetch a binary chunk file.
    Redirect { url: String, mac: Option<String> },
    /// `ad:RANGE` — delete these add chunks and their full hashes.
    DeleteAdd(Vec<i32>),
    /// `sd:RANGE` — delete these sub chunks.
    DeleteSub(Vec<i32>),
    /// `m:DIGEST` — response digest; only valid as the leading line.
    MacDigest(String),
    /// `e:pleaserekey` — discard keys and rerun the update.
    Rekey,
    /// `r:pleasereset` — drop all local data for the selected lists.
    Reset,
}

/// Parse a downloads response body into directives.
pub fn parse_command_stream(body: &str) -> Result<Vec<Command>> {
    let mut commands = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (tag, value) = line
            .split_once(':')
            .ok_or_else(|| SentinelError::Internal(format!("malformed directive {line:?}")))?;
        let command = match tag {
            "n" => Command::NextWait(value.parse().map_err(|_| {
                SentinelError::Internal(format!("bad poll interval {value:?}"))
            })?),
            "i" => Command::ListContext(value.to_string()),
            "u" => match value.split_once(',') {
                Some((url, mac)) => Command::Redirect {
                    url: url.to_string(),
                    mac: Some(mac.to_string()),
                },
                None => Command::Redirect {
                    url: value.to_string(),
                    mac: None,
                },
            },
            "ad" => Command::DeleteAdd(codec::parse_ranges(value)?),
            "sd" => Command::DeleteSub(codec::parse_ranges(value)?),
            "m" => Command::MacDigest(value.to_string()),
            "e" if value == "pleaserekey" => Command::Rekey,
            "r" if value == "pleasereset" => Command::Reset,
            _ => {
                return Err(SentinelError::Internal(format!(
                    "unknown directive {line:?}"
                )))
            }
        };
        commands.push(command);
    }
    Ok(commands)
}

/// Build one request line: `list;a:RANGE:s:RANGE[:mac]`, with empty range
/// sections omitted.
pub fn build_list_line(list: &str, add_nums: &[i32], sub_nums: &[i32], mac: bool) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !add_nums.is_empty() {
        parts.push(format!("a:{}", codec::encode_ranges(add_nums)));
    }
    if !sub_nums.is_empty() {
        parts.push(format!("s:{}", codec::encode_ranges(sub_nums)));
    }
    if mac {
        parts.push("mac".to_string());
    }
    format!("{list};{}\n", parts.join(":"))
}
