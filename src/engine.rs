//! Tunnel engine - wires the store, prober, control channel and session

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::{
    config::ClientConfig,
    error::ConfigError,
    events::{EventHub, TunnelEvent},
    helper_transport::HelperTransport,
    pinned_tls::PinnedHttpsTransport,
    prober::{ProberConfig, ReachabilityProber},
    proxy_supervisor::{LocalProxySupervisor, ProxyProcess},
    secure_channel::SecureTransport,
    server_interface::{RequestTransport, ServerInterface},
    server_list::ServerList,
    session::{SessionSettings, TunnelSession},
    stats::Stats,
    types::{MessageClass, TunnelState},
};

/// Core tunnel engine
pub struct TunnelEngine {
    /// Configuration
    config: ClientConfig,
    /// Server entry store
    servers: Arc<ServerList>,
    /// Traffic statistics
    stats: Arc<Stats>,
    /// Events and status history
    events: Arc<EventHub>,
    /// Control channel
    interface: Arc<ServerInterface>,
    /// Reachability prober
    prober: ReachabilityProber,
    /// Session state machine
    session: TunnelSession,
}

impl TunnelEngine {
    /// Create an engine with the helper-process channel, the pinned HTTPS
    /// control channel and the configured HTTP proxy.
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        let stats = Arc::new(Stats::new());
        let secure: Arc<dyn SecureTransport> =
            Arc::new(HelperTransport::new(config.helper.clone(), stats.clone()));
        let requests: Arc<dyn RequestTransport> =
            Arc::new(PinnedHttpsTransport::new(config.stats.request_timeout()));
        let proxy: Box<dyn ProxyProcess> = Box::new(LocalProxySupervisor::new(
            config.http_proxy.clone(),
            config.tunnel.socks_port,
            config.tunnel.http_proxy_port,
        ));

        Self::with_transports(config, stats, secure, requests, proxy)
    }

    /// Create an engine over caller-provided transports.
    pub fn with_transports(
        config: ClientConfig,
        stats: Arc<Stats>,
        secure: Arc<dyn SecureTransport>,
        requests: Arc<dyn RequestTransport>,
        proxy: Box<dyn ProxyProcess>,
    ) -> Result<Self, ConfigError> {
        let servers = Arc::new(ServerList::new(config.server_list_path()));
        servers.load(&config.embedded_server_list()?);

        let events = Arc::new(EventHub::new());
        let interface = Arc::new(ServerInterface::new(
            servers.clone(),
            stats.clone(),
            events.clone(),
            config.client.clone(),
            &config.stats,
            requests,
        ));
        let prober = ReachabilityProber::new(servers.clone(), ProberConfig::from(&config.prober));
        let session = TunnelSession::new(
            servers.clone(),
            interface.clone(),
            events.clone(),
            secure,
            proxy,
            SessionSettings::from(&config.tunnel),
        );

        Ok(Self {
            config,
            servers,
            stats,
            events,
            interface,
            prober,
            session,
        })
    }

    /// Rank servers by reachability, then start the session.
    pub async fn start(&self) {
        info!("🚀 Starting relay tunnel ({} servers)", self.servers.len());

        if self.config.prober.enabled && !self.servers.is_empty() {
            self.events
                .status(MessageClass::Info, "Checking server reachability");
            self.prober.start().await;
            self.prober.wait().await;
        }

        self.session.start_tunnel().await;
    }

    /// Stop probing and the session, waiting for teardown.
    pub async fn stop(&self) {
        self.prober.stop().await;
        self.session.stop_tunnel().await;
        self.servers.save_server_entries();
    }

    pub fn state(&self) -> TunnelState {
        self.session.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TunnelState> {
        self.session.subscribe_state()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn servers(&self) -> &Arc<ServerList> {
        &self.servers
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn interface(&self) -> &Arc<ServerInterface> {
        &self.interface
    }

    pub fn prober(&self) -> &ReachabilityProber {
        &self.prober
    }
}
