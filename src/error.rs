//! Error types for the giftcache library.

use thiserror::Error;

/// Errors that can occur while managing the offline cache.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error during cache storage operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error (connection refused, timeout, ...).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The network is unreachable.
    #[error("network unavailable")]
    Offline,

    /// A precache entry came back with a non-success status.
    #[error("precache of {url} failed with status {status}")]
    Precache {
        /// URL that failed.
        url: String,
        /// HTTP status returned by the origin.
        status: u16,
    },

    /// A URL could not be parsed or resolved against the origin.
    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl {
        /// The offending input.
        url: String,
        /// Parser message.
        reason: String,
    },

    /// Cache version string is malformed.
    #[error("invalid cache version {0:?}")]
    InvalidVersion(String),

    /// Cache name cannot be used as a storage key.
    #[error("invalid cache name {0:?}")]
    InvalidCacheName(String),

    /// A bypass pattern failed to compile.
    #[error("invalid bypass pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Configuration file could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration could not be serialized.
    #[error("config write error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A control message was not understood.
    #[error("unsupported control message: {0}")]
    Message(String),

    /// No worker is installed to handle the operation.
    #[error("no installed worker")]
    NotInstalled,

    /// Stored data is inconsistent.
    #[error("storage error: {0}")]
    Storage(String),

    /// A spawned event handler panicked or was cancelled.
    #[error("worker task failed: {0}")]
    Worker(String),
}

/// A specialized `Result` type for giftcache operations.
pub type Result<T> = std::result::Result<T, Error>;
