//! Shared types and constants for the relay tunnel core

use serde::{Deserialize, Serialize};

// ==================== CONSTANTS ====================

/// Persisted server list file name (inside the data directory)
pub const SERVER_ENTRY_FILENAME: &str = "server_entries.json";

/// Key of the persisted server list array
pub const SERVER_ENTRIES_KEY: &str = "serverEntries";

/// Client session id length before hex encoding
pub const CLIENT_SESSION_ID_SIZE_IN_BYTES: usize = 16;

/// Local SOCKS port
pub const SOCKS_PORT: u16 = 1080;

/// Local HTTP proxy port
pub const HTTP_PROXY_PORT: u16 = 8080;

/// Timeout for establishing the secure channel (ms)
pub const SESSION_ESTABLISHMENT_TIMEOUT_MS: u64 = 20_000;

/// Timeout for one control-channel HTTPS request (ms)
pub const HTTPS_REQUEST_TIMEOUT_MS: u64 = 20_000;

/// Relay protocol reported to the server
pub const RELAY_PROTOCOL: &str = "OSSH";

/// Prefix of the handshake response line carrying the JSON config
pub const HANDSHAKE_CONFIG_PREFIX: &str = "Config: ";

/// Bucket used when no canonicalization pattern matches
pub const OTHER_BUCKET: &str = "(OTHER)";

/// Default stats upload interval (ms)
pub const DEFAULT_STATS_SEND_INTERVAL_MS: u64 = 3 * 60 * 1000;

/// Default number of stat buckets that forces an upload
pub const DEFAULT_SEND_MAX_ENTRIES: usize = 1000;

// ==================== TUNNEL ENUMS ====================

/// Tunnel state as seen by collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelState {
    /// No session
    Disconnected,
    /// Session attempt in progress
    Connecting,
    /// Local proxies are up
    Connected,
}

impl Default for TunnelState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Disconnected => "disconnected",
            TunnelState::Connecting => "connecting",
            TunnelState::Connected => "connected",
        }
    }
}

/// Signals consumed by the session loop, one per iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelSignal {
    /// Explicit stop request
    Stop,
    /// Channel or proxy went away
    UnexpectedDisconnect,
}

/// Result of one `run_tunnel_once` attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Clean shutdown, do not run again
    Stopped,
    /// Run again after the retry delay
    Retry,
}

/// Severity of a human-readable status message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageClass {
    Good,
    Bad,
    Info,
}
