//! Secure channel boundary
//!
//! The session only talks to these traits. The encrypted transport itself
//! lives behind them.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::warn;

use crate::{error::TransportError, server_entry::ServerEntry};

/// Called once when an established channel goes away.
pub type DisconnectMonitor = Arc<dyn Fn() + Send + Sync>;

/// Exact match against the host key pinned in the server entry
#[derive(Debug, Clone)]
pub struct HostKeyVerifier {
    /// Base64 host key
    expected: String,
}

impl HostKeyVerifier {
    pub fn new(expected: impl Into<String>) -> Self {
        Self {
            expected: expected.into(),
        }
    }

    pub fn for_entry(entry: &ServerEntry) -> Self {
        Self::new(entry.ssh_host_key.clone())
    }

    /// Check raw key bytes as presented by the server.
    pub fn verify(&self, presented: &[u8]) -> Result<(), TransportError> {
        self.verify_encoded(&STANDARD.encode(presented))
    }

    /// Check a base64 key as presented by the server.
    pub fn verify_encoded(&self, presented: &str) -> Result<(), TransportError> {
        if presented == self.expected {
            Ok(())
        } else {
            warn!("🚨 Server host key mismatch");
            Err(TransportError::HostKeyMismatch)
        }
    }
}

/// Opens secure channels
#[async_trait]
pub trait SecureTransport: Send + Sync {
    async fn connect(
        &self,
        entry: &ServerEntry,
        verifier: HostKeyVerifier,
        connect_timeout: Duration,
    ) -> Result<Box<dyn SecureConnection>, TransportError>;
}

/// One established channel, owned by a single session attempt
#[async_trait]
pub trait SecureConnection: Send {
    /// `Ok(false)` when the server rejects the credentials.
    async fn authenticate(&mut self, username: &str, password: &str)
        -> Result<bool, TransportError>;

    /// Expose a local SOCKS forwarder over the channel.
    async fn create_local_port_forward(
        &mut self,
        local_port: u16,
    ) -> Result<Box<dyn PortForwarder>, TransportError>;

    fn add_disconnect_monitor(&mut self, monitor: DisconnectMonitor);

    async fn close(&mut self);
}

/// Local forwarder bound to a channel
#[async_trait]
pub trait PortForwarder: Send {
    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server_entry::tests::sample_entry;

    #[test]
    fn test_host_key_exact_match() {
        let verifier = HostKeyVerifier::for_entry(&sample_entry("1.2.3.4"));
        assert!(verifier.verify(b"hostkey").is_ok());
        assert!(verifier.verify_encoded("aG9zdGtleQ==").is_ok());
    }

    #[test]
    fn test_host_key_mismatch_is_hard_failure() {
        let verifier = HostKeyVerifier::new("aG9zdGtleQ==");
        assert!(matches!(
            verifier.verify(b"hostkey2"),
            Err(TransportError::HostKeyMismatch)
        ));
        // no normalisation of the encoded form
        assert!(verifier.verify_encoded("aG9zdGtleQ").is_err());
    }
}
