//! Request-authentication support: key acquisition parsing and HMAC-SHA1
//! validation of server responses.

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::{Result, SentinelError};
use crate::types::MacKeys;

type HmacSha1 = Hmac<Sha1>;

/// Parse the two-line key-exchange response:
///
/// ```text
/// clientkey:LEN:KEY_BASE64
/// wrappedkey:LEN:OPAQUE
/// ```
pub fn parse_key_response(body: &str) -> Result<MacKeys> {
    let mut client_key = None;
    let mut wrapped_key = None;
    for line in body.lines() {
        let mut parts = line.splitn(3, ':');
        let (Some(name), Some(len), Some(value)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let expected: usize = len.parse().map_err(|_| {
            SentinelError::MacKey(format!("bad length in key line {line:?}"))
        })?;
        if value.len() != expected {
            return Err(SentinelError::MacKey(format!(
                "key line length mismatch: {line:?}"
            )));
        }
        match name {
            "clientkey" => {
                let decoded = STANDARD.decode(value).map_err(|e| {
                    SentinelError::MacKey(format!("client key is not base64: {e}"))
                })?;
                client_key = Some(decoded);
            }
            "wrappedkey" => wrapped_key = Some(value.to_string()),
            _ => {}
        }
    }
    match (client_key, wrapped_key) {
        (Some(client_key), Some(wrapped_key)) => Ok(MacKeys {
            client_key,
            wrapped_key,
        }),
        _ => Err(SentinelError::MacKey(
            "key response missing clientkey or wrappedkey".to_string(),
        )),
    }
}

/// The service's digest form for a body: URL-safe base64 of the HMAC-SHA1,
/// padded (a 20-byte digest always ends in a single `=`).
pub fn compute_digest(body: &[u8], client_key: &[u8]) -> String {
    let mut mac = HmacSha1::new_from_slice(client_key).expect("HMAC accepts any key length");
    mac.update(body);
    URL_SAFE.encode(mac.finalize().into_bytes())
}

/// Constant-time validation of a response body against its claimed digest.
pub fn validate_digest(body: &[u8], client_key: &[u8], digest: &str) -> bool {
    let Ok(claimed) = URL_SAFE.decode(digest.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha1::new_from_slice(client_key) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&claimed).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_response() {
        let body = "clientkey:28:VGhpcyBpcyBhIHRlc3Qga2V5Lg==\nwrappedkey:10:opaque-123\n";
        let keys = parse_key_response(body).unwrap();
        assert_eq!(keys.client_key, b"This is a test key.");
        assert_eq!(keys.wrapped_key, "opaque-123");
    }

    #[test]
    fn test_parse_key_response_rejects_length_mismatch() {
        let body = "clientkey:5:VGhpcyBpcyBhIHRlc3Qga2V5Lg==\nwrappedkey:10:opaque-123\n";
        assert!(parse_key_response(body).is_err());
    }

    #[test]
    fn test_parse_key_response_requires_both_keys() {
        assert!(parse_key_response("clientkey:4:AAAA\n").is_err());
    }

    #[test]
    fn test_digest_round_trip() {
        let key = b"secret key";
        let body = b"n:1800\ni:goog-malware-shavar\n";
        let digest = compute_digest(body, key);
        assert!(digest.ends_with('='));
        assert!(validate_digest(body, key, &digest));
        assert!(!validate_digest(b"tampered", key, &digest));
        assert!(!validate_digest(body, b"wrong key", &digest));
        assert!(!validate_digest(body, key, "not base64!!"));
    }

    #[test]
    fn test_digest_matches_formula() {
        // BASE64URL(HMAC-SHA1(body, key)) + "=" per the protocol.
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let key = b"k";
        let body = b"payload";
        let mut mac = HmacSha1::new_from_slice(key).unwrap();
        mac.update(body);
        let expected = format!("{}=", URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()));
        assert_eq!(compute_digest(body, key), expected);
        assert!(validate_digest(body, key, &expected));
    }
}
