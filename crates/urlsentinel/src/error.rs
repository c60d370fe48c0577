//! Error types for the reputation-list client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SentinelError {
    /// The service answered with a non-success HTTP status.
    #[error("service returned HTTP {0}")]
    Server(u16),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Malformed command stream, chunk header, or chunk body.
    #[error("malformed response: {0}")]
    Internal(String),

    /// A response failed HMAC validation.
    #[error("response MAC validation failed")]
    Mac,

    /// MAC was requested but keys could not be obtained.
    #[error("MAC keys unavailable: {0}")]
    MacKey(String),

    #[error("unsupported url: {0}")]
    BadUrl(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SentinelError>;
