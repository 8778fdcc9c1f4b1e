//! Relay Tunnel - circumvention tunnel core
//!
//! Server registry, reachability ranking, tunnel session state machine and a
//! certificate-pinned control channel.

// ── Core ────────────────────────────────────────────────────────────────────
pub mod types;
pub mod error;
pub mod config;
pub mod engine;
pub mod events;

// ── Server Registry ──────────────────────────────────────────────────────────
pub mod server_entry;
pub mod server_list;
pub mod prober;

// ── Tunnel ───────────────────────────────────────────────────────────────────
pub mod secure_channel;
pub mod helper_transport;
pub mod socks_relay;
pub mod traffic_inspector;
pub mod proxy_supervisor;
pub mod session;

// ── Control Channel ──────────────────────────────────────────────────────────
pub mod pinned_tls;
pub mod server_interface;
pub mod stats;

// ── Re-exports ────────────────────────────────────────────────────────────────

/// Shared types for use across all modules
pub use types::{AttemptOutcome, MessageClass, TunnelSignal, TunnelState};

// Core engine
pub use config::ClientConfig;
pub use engine::TunnelEngine;
pub use error::{ConfigError, ServerEntryError, ServerInterfaceError, TransportError};
pub use events::{EventHub, StatusMessage, TunnelEvent};

// Registry
pub use server_entry::ServerEntry;
pub use server_list::ServerList;
pub use prober::ReachabilityProber;

// Tunnel and control channel
pub use secure_channel::{HostKeyVerifier, PortForwarder, SecureConnection, SecureTransport};
pub use session::TunnelSession;
pub use server_interface::ServerInterface;
pub use stats::Stats;
