//! The client engine: periodic update cycle and URL lookup.

use chrono::Utc;
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::backoff;
use crate::canonical;
use crate::codec;
use crate::config::SentinelConfig;
use crate::error::{Result, SentinelError};
use crate::lookup;
use crate::mac;
use crate::storage::Storage;
use crate::types::{AddChunkRow, Chunk, MacKeys, DEFAULT_WAIT_SECS, FULL_HASH_TTL_SECS};
use crate::update::{self, Command};

/// Outcome of one update cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    /// Every configured list is still inside its wait window.
    NoUpdate,
    /// The exchange succeeded but the server had nothing new.
    NoData,
    /// At least one chunk or delete directive was applied.
    Updated,
}

enum CycleOutcome {
    Done(UpdateStatus),
    Rekey,
}

struct CycleResult {
    wait: i64,
    applied: bool,
}

/// The reputation-list client engine.
///
/// Owns its [`Storage`] handle exclusively. `update` is meant to run from a
/// single timer task; `lookup` may be called concurrently.
pub struct SentinelClient<S: Storage> {
    config: SentinelConfig,
    http: Client,
    storage: S,
}

impl<S: Storage> SentinelClient<S> {
    pub fn new(config: SentinelConfig, storage: S) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("urlsentinel/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            config,
            http,
            storage,
        })
    }

    /// Access the underlying storage (maintenance and tests).
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Evict stale full hashes and release the engine.
    pub fn close(self) -> Result<()> {
        self.storage.close()
    }

    // -----------------------------------------------------------------------
    // Update
    // -----------------------------------------------------------------------

    /// Run one update cycle, honoring per-list wait windows.
    pub async fn update(&self) -> Result<UpdateStatus> {
        self.update_with(false).await
    }

    /// Run one update cycle; `force` ignores the wait windows.
    pub async fn update_with(&self, force: bool) -> Result<UpdateStatus> {
        match self.update_cycle(force).await? {
            CycleOutcome::Done(status) => Ok(status),
            CycleOutcome::Rekey => {
                // The server rejected our keys: discard, reacquire, rerun once.
                info!("server requested rekey, rerunning update");
                self.storage.clear_mac_keys()?;
                match self.update_cycle(force).await? {
                    CycleOutcome::Done(status) => Ok(status),
                    CycleOutcome::Rekey => Err(SentinelError::MacKey(
                        "server demanded rekey twice in a row".to_string(),
                    )),
                }
            }
        }
    }

    async fn update_cycle(&self, force: bool) -> Result<CycleOutcome> {
        let now = Utc::now().timestamp();

        let mut lists: Vec<String> = Vec::new();
        for list in &self.config.lists {
            let cursor = self.storage.cursor(list)?;
            if force || now >= cursor.last_update + cursor.next_wait {
                lists.push(list.clone());
            } else {
                debug!(list = %list, wait = cursor.next_wait, "list inside wait window");
            }
        }
        if lists.is_empty() {
            return Ok(CycleOutcome::Done(UpdateStatus::NoUpdate));
        }

        let keys = if self.config.enable_mac {
            Some(self.obtain_mac_keys().await?)
        } else {
            None
        };

        let mut body = String::new();
        for list in &lists {
            let add_nums = self.storage.add_chunk_nums(list)?;
            let sub_nums = self.storage.sub_chunk_nums(list)?;
            body.push_str(&update::build_list_line(
                list,
                &add_nums,
                &sub_nums,
                keys.is_some(),
            ));
        }

        let mut url = format!(
            "{}?client=api&apikey={}&appver={}&pver={}",
            self.config.update_url,
            self.config.api_key,
            self.config.app_version,
            self.config.protocol_version
        );
        if let Some(ref keys) = keys {
            url.push_str("&wrkey=");
            url.push_str(&keys.wrapped_key);
        }

        debug!(lists = lists.len(), "requesting update");
        let text = match self.exchange_update(&url, body).await {
            Ok(text) => text,
            Err(e) => {
                self.record_error_backoff(&lists, now)?;
                return Err(e);
            }
        };

        // A MACed response leads with `m:DIGEST`; the digest covers
        // everything after that line.
        let payload = match keys {
            Some(ref keys) => match self.strip_and_check_mac(&text, keys) {
                Ok(payload) => payload,
                Err(e) => {
                    self.record_error_backoff(&lists, now)?;
                    return Err(e);
                }
            },
            None => text.as_str(),
        };

        let commands = match update::parse_command_stream(payload) {
            Ok(commands) => commands,
            Err(e) => {
                self.record_error_backoff(&lists, now)?;
                return Err(e);
            }
        };

        match self.execute_commands(&lists, commands, keys.as_ref()).await {
            Ok(None) => Ok(CycleOutcome::Rekey),
            Ok(Some(result)) => {
                for list in &lists {
                    self.storage.record_update(list, now, result.wait)?;
                }
                let status = if result.applied {
                    UpdateStatus::Updated
                } else {
                    UpdateStatus::NoData
                };
                info!(lists = lists.len(), applied = result.applied, "update complete");
                Ok(CycleOutcome::Done(status))
            }
            Err(e) => {
                self.record_error_backoff(&lists, now)?;
                Err(e)
            }
        }
    }

    async fn exchange_update(&self, url: &str, body: String) -> Result<String> {
        let response = self.http.post(url).body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "update request failed");
            return Err(SentinelError::Server(status.as_u16()));
        }
        Ok(response.text().await?)
    }

    fn strip_and_check_mac<'a>(&self, text: &'a str, keys: &MacKeys) -> Result<&'a str> {
        let (first, rest) = text
            .split_once('\n')
            .ok_or_else(|| SentinelError::Internal("empty MACed response".to_string()))?;
        let digest = first.strip_prefix("m:").ok_or(SentinelError::Mac)?;
        if !mac::validate_digest(rest.as_bytes(), &keys.client_key, digest) {
            warn!("update response MAC mismatch");
            return Err(SentinelError::Mac);
        }
        Ok(rest)
    }

    /// Execute parsed directives in arrival order. Returns `None` when the
    /// server asked for a rekey, otherwise the cycle result.
    async fn execute_commands(
        &self,
        lists: &[String],
        commands: Vec<Command>,
        keys: Option<&MacKeys>,
    ) -> Result<Option<CycleResult>> {
        let mut wait = DEFAULT_WAIT_SECS;
        let mut applied = false;
        let mut current: Option<String> = None;

        for command in commands {
            match command {
                Command::NextWait(secs) => wait = secs,
                Command::ListContext(list) => current = Some(list),
                Command::MacDigest(_) => {
                    return Err(SentinelError::Internal(
                        "unexpected mid-stream m: directive".to_string(),
                    ))
                }
                Command::Rekey => return Ok(None),
                Command::Reset => {
                    warn!("server requested a reset, dropping local chunk data");
                    for list in lists {
                        self.storage.reset_list(list)?;
                    }
                    applied = true;
                }
                Command::DeleteAdd(nums) => {
                    let list = required_list(&current)?;
                    debug!(list = %list, count = nums.len(), "deleting add chunks");
                    self.storage.delete_add_chunks(list, &nums)?;
                    self.storage.delete_full_hashes(list, &nums)?;
                    applied = true;
                }
                Command::DeleteSub(nums) => {
                    let list = required_list(&current)?;
                    debug!(list = %list, count = nums.len(), "deleting sub chunks");
                    self.storage.delete_sub_chunks(list, &nums)?;
                    applied = true;
                }
                Command::Redirect { url, mac: digest } => {
                    let list = required_list(&current)?.to_string();
                    let count = self
                        .ingest_redirect(&list, &url, digest.as_deref(), keys)
                        .await?;
                    applied = applied || count > 0;
                }
            }
        }
        Ok(Some(CycleResult { wait, applied }))
    }

    async fn ingest_redirect(
        &self,
        list: &str,
        url: &str,
        digest: Option<&str>,
        keys: Option<&MacKeys>,
    ) -> Result<usize> {
        let full_url = if url.contains("://") {
            url.to_string()
        } else {
            format!("http://{url}")
        };
        debug!(url = %full_url, "fetching redirect");
        let response = self.http.get(&full_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SentinelError::Server(status.as_u16()));
        }
        let body = response.bytes().await?;

        if let Some(keys) = keys {
            let digest = digest.ok_or(SentinelError::Mac)?;
            if !mac::validate_digest(&body, &keys.client_key, digest) {
                warn!(url = %full_url, "redirect body MAC mismatch");
                return Err(SentinelError::Mac);
            }
        }

        let chunks = codec::decode_chunk_stream(&body)?;
        let count = chunks.len();
        for chunk in chunks {
            match chunk {
                Chunk::Add { chunk_num, entries } => {
                    self.storage.insert_add_chunk(list, chunk_num, &entries)?
                }
                Chunk::Sub { chunk_num, entries } => {
                    self.storage.insert_sub_chunk(list, chunk_num, &entries)?
                }
            }
        }
        info!(list = %list, chunks = count, "applied chunk file");
        Ok(count)
    }

    fn record_error_backoff(&self, lists: &[String], now: i64) -> Result<()> {
        for list in lists {
            let errors = self.storage.cursor(list)?.errors + 1;
            let wait = backoff::update_backoff_secs(errors);
            warn!(list = %list, errors, wait, "update failed, backing off");
            self.storage.record_update_error(list, now, wait, errors)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // MAC keys
    // -----------------------------------------------------------------------

    async fn obtain_mac_keys(&self) -> Result<MacKeys> {
        if let Some(keys) = self.storage.mac_keys()? {
            return Ok(keys);
        }
        self.request_mac_keys().await
    }

    async fn request_mac_keys(&self) -> Result<MacKeys> {
        let url = format!(
            "{}?client=api&apikey={}&appver={}&pver={}",
            self.config.key_url,
            self.config.api_key,
            self.config.app_version,
            self.config.protocol_version
        );
        debug!("requesting MAC keys");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SentinelError::MacKey(format!("key request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SentinelError::MacKey(format!(
                "key endpoint returned HTTP {}",
                status.as_u16()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| SentinelError::MacKey(format!("key response unreadable: {e}")))?;
        let keys = mac::parse_key_response(&body)?;
        self.storage.set_mac_keys(&keys)?;
        info!("MAC keys acquired");
        Ok(keys)
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Check a URL against every configured list. Returns the first matching
    /// list name, or `None`.
    pub async fn lookup(&self, url: &str) -> Result<Option<String>> {
        self.lookup_in(url, &self.config.lists).await
    }

    /// Check a URL against a caller-chosen subset of lists.
    pub async fn lookup_in(&self, url: &str, lists: &[String]) -> Result<Option<String>> {
        let canon = canonical::canonicalize(url)?;
        let prefixes = canonical::hash_prefixes(&canon);
        let hashes = canonical::full_hashes(&canon);

        let mut requested = false;
        for host_key in canonical::host_keys(&canon) {
            let rows = self.storage.add_chunks_for_host(&host_key)?;
            if rows.is_empty() {
                continue;
            }
            let subs = self.storage.sub_chunks_for_host(&host_key)?;
            let surviving: Vec<&AddChunkRow> =
                lookup::apply_sub_cancellation(lookup::filter_by_prefix(&rows, &prefixes), &subs)
                    .into_iter()
                    .filter(|row| lists.contains(&row.list))
                    .collect();
            if surviving.is_empty() {
                continue;
            }

            let now = Utc::now().timestamp();
            if let Some(list) = self.match_cached(&surviving, &hashes, now)? {
                return Ok(Some(list));
            }

            // The prefix set is the same for every probe; one fetch is enough.
            if !requested {
                requested = true;
                let fetched = match self.request_full_hashes(&prefixes, now).await {
                    Ok(fetched) => fetched,
                    Err(e @ SentinelError::Storage(_)) => return Err(e),
                    Err(e) => {
                        warn!(error = %e, "full-hash fetch failed, treating as no match");
                        false
                    }
                };
                if fetched {
                    if let Some(list) = self.match_cached(&surviving, &hashes, now)? {
                        return Ok(Some(list));
                    }
                }
            }
        }
        Ok(None)
    }

    fn match_cached(
        &self,
        surviving: &[&AddChunkRow],
        hashes: &[Vec<u8>],
        now: i64,
    ) -> Result<Option<String>> {
        let min_timestamp = now - FULL_HASH_TTL_SECS;
        for row in surviving {
            for cached in self
                .storage
                .full_hashes(&row.list, row.chunk_num, min_timestamp)?
            {
                if hashes.iter().any(|h| *h == cached) {
                    debug!(list = %row.list, chunk = row.chunk_num, "full-hash match");
                    return Ok(Some(row.list.clone()));
                }
            }
        }
        Ok(None)
    }

    /// Fetch full hashes for the candidate prefixes, honoring per-prefix
    /// throttling. Returns whether anything new was stored.
    async fn request_full_hashes(&self, prefixes: &[Vec<u8>], now: i64) -> Result<bool> {
        let mut wanted: Vec<Vec<u8>> = Vec::new();
        for prefix in prefixes {
            match self.storage.full_hash_error(prefix)? {
                Some(err) if !backoff::full_hash_allowed(err.errors, err.timestamp, now) => {
                    debug!(errors = err.errors, "prefix throttled, skipping");
                }
                _ => wanted.push(prefix.clone()),
            }
        }
        if wanted.is_empty() {
            return Ok(false);
        }

        let keys = if self.config.enable_mac {
            self.storage.mac_keys()?
        } else {
            None
        };
        let mut url = format!(
            "{}?client=api&apikey={}&appver={}&pver={}",
            self.config.gethash_url,
            self.config.api_key,
            self.config.app_version,
            self.config.protocol_version
        );
        if let Some(ref keys) = keys {
            url.push_str("&wrkey=");
            url.push_str(&keys.wrapped_key);
        }

        let body = lookup::build_full_hash_request(&wanted);
        debug!(prefixes = wanted.len(), "requesting full hashes");
        let outcome = self.exchange_full_hashes(&url, body, keys.as_ref(), now).await;
        match outcome {
            Ok(stored) => {
                for prefix in &wanted {
                    self.storage.clear_full_hash_error(prefix)?;
                }
                Ok(stored)
            }
            Err(e) => {
                for prefix in &wanted {
                    self.storage.record_full_hash_error(prefix, now)?;
                }
                Err(e)
            }
        }
    }

    async fn exchange_full_hashes(
        &self,
        url: &str,
        body: Vec<u8>,
        keys: Option<&MacKeys>,
        now: i64,
    ) -> Result<bool> {
        let response = self.http.post(url).body(body).send().await?;
        let status = response.status();
        if status.as_u16() == 204 {
            // No full hashes for these prefixes; a drought is not an error.
            return Ok(false);
        }
        if !status.is_success() {
            warn!(status = status.as_u16(), "full-hash request failed");
            return Err(SentinelError::Server(status.as_u16()));
        }
        let bytes = response.bytes().await?;

        let payload: &[u8] = match keys {
            Some(keys) => {
                let nl = bytes
                    .iter()
                    .position(|&b| b == b'\n')
                    .ok_or(SentinelError::Mac)?;
                let digest =
                    std::str::from_utf8(&bytes[..nl]).map_err(|_| SentinelError::Mac)?;
                let rest = &bytes[nl + 1..];
                if !mac::validate_digest(rest, &keys.client_key, digest) {
                    warn!("full-hash response MAC mismatch");
                    return Err(SentinelError::Mac);
                }
                rest
            }
            None => &bytes[..],
        };

        let rows = lookup::parse_full_hash_response(payload)?;
        let stored = !rows.is_empty();
        self.storage.insert_full_hashes(&rows, now)?;
        debug!(hashes = rows.len(), "stored full hashes");
        Ok(stored)
    }
}

fn required_list(current: &Option<String>) -> Result<&str> {
    current
        .as_deref()
        .ok_or_else(|| SentinelError::Internal("list directive before i:".to_string()))
}
