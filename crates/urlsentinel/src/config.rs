//! Client configuration.

use serde::{Deserialize, Serialize};

use crate::types::{MALWARE_LIST, PHISHING_LIST};

/// Configuration for [`SentinelClient`](crate::SentinelClient).
///
/// Endpoint URLs are plain fields so tests can point them at a local mock
/// server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConfig {
    /// API key issued for the service.
    pub api_key: String,
    /// Client application version reported in every request.
    #[serde(default = "default_app_version")]
    pub app_version: String,
    /// Protocol version spoken.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Lists to mirror and match against.
    #[serde(default = "default_lists")]
    pub lists: Vec<String>,
    /// Downloads (update) endpoint.
    #[serde(default = "default_update_url")]
    pub update_url: String,
    /// Full-hash endpoint.
    #[serde(default = "default_gethash_url")]
    pub gethash_url: String,
    /// Key-exchange endpoint for MACed sessions.
    #[serde(default = "default_key_url")]
    pub key_url: String,
    /// Require HMAC authentication of server responses.
    #[serde(default)]
    pub enable_mac: bool,
    /// Per-request deadline in seconds.
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl SentinelConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            app_version: default_app_version(),
            protocol_version: default_protocol_version(),
            lists: default_lists(),
            update_url: default_update_url(),
            gethash_url: default_gethash_url(),
            key_url: default_key_url(),
            enable_mac: false,
            request_timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_protocol_version() -> String {
    "2.2".to_string()
}

fn default_lists() -> Vec<String> {
    vec![MALWARE_LIST.to_string(), PHISHING_LIST.to_string()]
}

fn default_update_url() -> String {
    "http://safebrowsing.clients.google.com/safebrowsing/downloads".to_string()
}

fn default_gethash_url() -> String {
    "http://safebrowsing.clients.google.com/safebrowsing/gethash".to_string()
}

fn default_key_url() -> String {
    // Key material only travels over TLS.
    "https://sb-ssl.google.com/safebrowsing/newkey".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SentinelConfig::new("key123");
        assert_eq!(config.api_key, "key123");
        assert_eq!(config.protocol_version, "2.2");
        assert_eq!(config.lists, vec![MALWARE_LIST, PHISHING_LIST]);
        assert!(!config.enable_mac);
        assert_eq!(config.request_timeout_secs, 60);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: SentinelConfig =
            serde_json::from_str(r#"{"api_key":"k","enable_mac":true}"#).unwrap();
        assert_eq!(config.api_key, "k");
        assert!(config.enable_mac);
        assert_eq!(config.lists.len(), 2);
        assert!(config.update_url.ends_with("/downloads"));
    }
}
