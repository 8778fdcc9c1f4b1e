//! Control-channel client
//!
//! Application requests to the current server's web endpoint. Every request
//! carries the client identity parameters; trust comes only from the pinned
//! certificate in the server entry.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use indexmap::IndexMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::{ClientSection, StatsSection},
    error::ServerInterfaceError,
    events::{EventHub, TunnelEvent},
    server_entry::ServerEntry,
    server_list::ServerList,
    stats::{RegexReplace, Stats},
    types::{CLIENT_SESSION_ID_SIZE_IN_BYTES, HANDSHAKE_CONFIG_PREFIX, RELAY_PROTOCOL},
};

// ==================== REQUEST TRANSPORT ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    Post,
}

/// One control request, addressed to the current server
#[derive(Debug, Clone)]
pub struct ControlRequest {
    pub method: RequestMethod,
    pub url: Url,
    pub body: Vec<u8>,
    pub content_type: Option<&'static str>,
}

/// Sends control requests; returns the body of a 200 response.
#[async_trait]
pub trait RequestTransport: Send + Sync {
    async fn request(
        &self,
        entry: &ServerEntry,
        request: ControlRequest,
    ) -> Result<Vec<u8>, ServerInterfaceError>;
}

// ==================== WIRE TYPES ====================

/// JSON carried on the handshake's `Config: ` line
#[derive(Debug, Deserialize)]
struct HandshakeConfig {
    homepages: Vec<String>,
    upgrade_client_version: String,
    page_view_regexes: Vec<RegexReplace>,
    https_request_regexes: Vec<RegexReplace>,
    speed_test_url: String,
    encoded_server_list: Vec<String>,
    ssh_session_id: String,
}

#[derive(Debug, Serialize)]
struct PageViewCount<'a> {
    page: &'a str,
    count: u64,
}

#[derive(Debug, Serialize)]
struct DomainCount<'a> {
    domain: &'a str,
    count: u64,
}

#[derive(Debug, Serialize)]
struct StatusPayload<'a> {
    bytes_transferred: u64,
    page_views: Vec<PageViewCount<'a>>,
    https_requests: Vec<DomainCount<'a>>,
}

// ==================== CLIENT ====================

#[derive(Debug, Default)]
struct SessionInfo {
    client_session_id: Option<String>,
    server_session_id: String,
    upgrade_client_version: String,
    speed_test_url: String,
}

/// Status upload thresholds, with additive backoff
#[derive(Debug)]
struct PeriodicState {
    last_send: Option<Instant>,
    send_interval: Duration,
    send_max_entries: usize,
}

pub struct ServerInterface {
    servers: Arc<ServerList>,
    stats: Arc<Stats>,
    events: Arc<EventHub>,
    client: ClientSection,
    transport: Arc<dyn RequestTransport>,
    session: Mutex<SessionInfo>,
    periodic: tokio::sync::Mutex<PeriodicState>,
    default_send_interval: Duration,
    default_send_max_entries: usize,
}

impl ServerInterface {
    pub fn new(
        servers: Arc<ServerList>,
        stats: Arc<Stats>,
        events: Arc<EventHub>,
        client: ClientSection,
        stats_config: &StatsSection,
        transport: Arc<dyn RequestTransport>,
    ) -> Self {
        let default_send_interval = stats_config.send_interval();
        let default_send_max_entries = stats_config.send_max_entries;
        Self {
            servers,
            stats,
            events,
            client,
            transport,
            session: Mutex::new(SessionInfo::default()),
            periodic: tokio::sync::Mutex::new(PeriodicState {
                last_send: None,
                send_interval: default_send_interval,
                send_max_entries: default_send_max_entries,
            }),
            default_send_interval,
            default_send_max_entries,
        }
    }

    fn session(&self) -> MutexGuard<'_, SessionInfo> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hex session id, generated on first use.
    pub fn client_session_id(&self) -> String {
        self.session()
            .client_session_id
            .get_or_insert_with(|| {
                let mut bytes = [0u8; CLIENT_SESSION_ID_SIZE_IN_BYTES];
                rand::thread_rng().fill_bytes(&mut bytes);
                hex::encode(bytes)
            })
            .clone()
    }

    pub fn reset_client_session_id(&self) {
        self.session().client_session_id = None;
    }

    pub fn server_session_id(&self) -> String {
        self.session().server_session_id.clone()
    }

    pub fn speed_test_url(&self) -> String {
        self.session().speed_test_url.clone()
    }

    pub fn is_upgrade_available(&self) -> bool {
        !self.session().upgrade_client_version.is_empty()
    }

    pub async fn stats_send_interval(&self) -> Duration {
        self.periodic.lock().await.send_interval
    }

    pub async fn send_max_entries(&self) -> usize {
        self.periodic.lock().await.send_max_entries
    }

    /// `https://<ip>:<port>/<path>?<common params>&<extras>`
    fn request_url(
        &self,
        entry: &ServerEntry,
        path: &str,
        extras: &[(&str, &str)],
    ) -> Result<Url, ServerInterfaceError> {
        let host = if entry.ip_address.contains(':') {
            format!("[{}]", entry.ip_address)
        } else {
            entry.ip_address.clone()
        };
        let mut url = Url::parse(&format!(
            "https://{}:{}/{}",
            host, entry.web_server_port, path
        ))?;

        let client_session_id = self.client_session_id();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_session_id", &client_session_id)
                .append_pair("server_secret", &entry.web_server_secret)
                .append_pair("propagation_channel_id", &self.client.propagation_channel_id)
                .append_pair("sponsor_id", &self.client.sponsor_id)
                .append_pair("client_version", &self.client.client_version)
                .append_pair("relay_protocol", RELAY_PROTOCOL)
                .append_pair("client_platform", &self.client.client_platform);
            for (key, value) in extras {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    async fn make_request(
        &self,
        path: &str,
        extras: &[(&str, &str)],
        method: RequestMethod,
        body: Vec<u8>,
        content_type: Option<&'static str>,
    ) -> Result<Vec<u8>, ServerInterfaceError> {
        let entry = self
            .servers
            .current_server_entry()
            .ok_or(ServerInterfaceError::NoServer)?;
        let url = self.request_url(&entry, path, extras)?;
        debug!("control request /{} to {}", path, entry.ip_address);

        let request = ControlRequest {
            method,
            url,
            body,
            content_type,
        };
        self.transport.request(&entry, request).await
    }

    async fn get(&self, path: &str, extras: &[(&str, &str)]) -> Result<Vec<u8>, ServerInterfaceError> {
        self.make_request(path, extras, RequestMethod::Get, Vec::new(), None)
            .await
    }

    /// Fetch session configuration and adopt it.
    pub async fn do_handshake_request(&self) -> Result<(), ServerInterfaceError> {
        let known_servers = self.servers.known_ips();
        let extras: Vec<(&str, &str)> = known_servers
            .iter()
            .map(|ip| ("known_server", ip.as_str()))
            .collect();

        let response = self.get("handshake", &extras).await?;
        let body = String::from_utf8_lossy(&response);

        let Some(config_line) = body
            .lines()
            .filter_map(|line| line.strip_prefix(HANDSHAKE_CONFIG_PREFIX))
            .last()
        else {
            warn!("⚠️ Handshake response carried no configuration");
            return Ok(());
        };

        let config: HandshakeConfig = serde_json::from_str(config_line).map_err(|e| {
            warn!("⚠️ Failed to parse handshake: {}", e);
            ServerInterfaceError::Json(e)
        })?;
        self.apply_handshake(config)
    }

    fn apply_handshake(&self, config: HandshakeConfig) -> Result<(), ServerInterfaceError> {
        self.stats
            .set_regexes(&config.page_view_regexes, &config.https_request_regexes)?;

        self.events.add_home_pages(config.homepages);

        for encoded in &config.encoded_server_list {
            // malformed entries are logged by the store and skipped
            let _ = self.servers.add_server_entry(encoded, false);
        }

        {
            let mut session = self.session();
            session.upgrade_client_version = config.upgrade_client_version;
            session.speed_test_url = config.speed_test_url;
            session.server_session_id = config.ssh_session_id;
        }

        info!(
            "🤝 Handshake complete, {} discovered servers",
            config.encoded_server_list.len()
        );
        self.events.emit(TunnelEvent::HandshakeSucceeded);
        Ok(())
    }

    pub async fn do_connected_request(&self) -> Result<(), ServerInterfaceError> {
        let session_id = self.server_session_id();
        self.get("connected", &[("session_id", session_id.as_str())]).await?;
        Ok(())
    }

    pub async fn do_status_request(
        &self,
        connected: bool,
        page_views: &IndexMap<String, u64>,
        https_requests: &IndexMap<String, u64>,
        bytes_transferred: u64,
    ) -> Result<(), ServerInterfaceError> {
        let payload = StatusPayload {
            bytes_transferred,
            page_views: page_views
                .iter()
                .map(|(page, count)| PageViewCount { page, count: *count })
                .collect(),
            https_requests: https_requests
                .iter()
                .map(|(domain, count)| DomainCount { domain, count: *count })
                .collect(),
        };
        let body = serde_json::to_vec(&payload)?;

        let session_id = self.server_session_id();
        let connected = if connected { "1" } else { "0" };
        self.make_request(
            "status",
            &[("session_id", session_id.as_str()), ("connected", connected)],
            RequestMethod::Post,
            body,
            Some("application/json"),
        )
        .await?;
        Ok(())
    }

    pub async fn do_speed_request(
        &self,
        operation: &str,
        info: &str,
        milliseconds: u64,
        size: u64,
    ) -> Result<(), ServerInterfaceError> {
        let session_id = self.server_session_id();
        let milliseconds = milliseconds.to_string();
        let size = size.to_string();
        self.get(
            "speed",
            &[
                ("session_id", session_id.as_str()),
                ("operation", operation),
                ("info", info),
                ("milliseconds", milliseconds.as_str()),
                ("size", size.as_str()),
            ],
        )
        .await?;
        Ok(())
    }

    /// Download the upgrade package offered by the handshake.
    pub async fn do_upgrade_download_request(&self) -> Result<Vec<u8>, ServerInterfaceError> {
        self.get("download", &[]).await
    }

    pub async fn do_failed_request(&self, error_code: &str) -> Result<(), ServerInterfaceError> {
        self.get("failed", &[("error_code", error_code)]).await?;
        Ok(())
    }

    /// Upload stats when due. The first call only arms the timer.
    ///
    /// Due when `final_call`, when the send interval has passed, or when the
    /// number of buckets reaches the cap. A failed upload widens both
    /// thresholds by their defaults; a successful one resets them and clears
    /// the stats. Returns whether an upload succeeded.
    pub async fn do_periodic_work(&self, final_call: bool) -> bool {
        let mut state = self.periodic.lock().await;

        let now = Instant::now();
        let last_send = *state.last_send.get_or_insert(now);

        let due = final_call
            || now.duration_since(last_send) > state.send_interval
            || self.stats.count() >= state.send_max_entries;
        if !due {
            return false;
        }

        debug!("sending stats{}", if final_call { " (final)" } else { "" });
        let snapshot = self.stats.snapshot();
        let result = self
            .do_status_request(
                !final_call,
                &snapshot.page_views,
                &snapshot.https_requests,
                snapshot.bytes_transferred,
            )
            .await;

        match result {
            Ok(()) => {
                state.last_send = Some(now);
                state.send_interval = self.default_send_interval;
                state.send_max_entries = self.default_send_max_entries;
                self.stats.clear();
                true
            }
            Err(e) => {
                state.send_interval += self.default_send_interval;
                state.send_max_entries += self.default_send_max_entries;
                debug!(
                    "sending stats failed{}: {} (next interval {:?})",
                    if final_call { " (final)" } else { "" },
                    e,
                    state.send_interval
                );
                false
            }
        }
    }
}
