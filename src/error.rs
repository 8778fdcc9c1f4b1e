//! Error types shared across the tunnel core
//!
//! Library code returns these; the binary wraps them with `anyhow`.

use std::io;

use thiserror::Error;

/// Failure to decode one wire-encoded server entry.
#[derive(Debug, Error)]
pub enum ServerEntryError {
    #[error("server entry is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("server entry is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("server entry JSON is invalid: {0}")]
    Json(#[from] serde_json::Error),
}

/// Secure channel failures. Each one counts against the current server;
/// rejected credentials are reported by `authenticate` returning `false`.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("server host key does not match the pinned key")]
    HostKeyMismatch,

    #[error("helper protocol error: {0}")]
    Protocol(String),

    #[error("channel closed")]
    Closed,
}

/// Control-channel request failure; wraps the underlying cause.
#[derive(Debug, Error)]
pub enum ServerInterfaceError {
    #[error("no current server entry")]
    NoServer,

    #[error("invalid request URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("request I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("request timed out")]
    Timeout,

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("HTTPS request failed with status {0}")]
    Status(u16),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),
}

impl From<hyper::Error> for ServerInterfaceError {
    fn from(e: hyper::Error) -> Self {
        Self::Http(e.to_string())
    }
}

/// Configuration loading failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("cannot read embedded server list {path}: {source}")]
    EmbeddedList {
        path: String,
        #[source]
        source: io::Error,
    },
}
