//! Configuration Management
//!
//! Layered: built-in defaults, then an optional TOML file, then
//! `RELAY_TUNNEL__SECTION__KEY` environment variables.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::ConfigError,
    types::{
        DEFAULT_SEND_MAX_ENTRIES, DEFAULT_STATS_SEND_INTERVAL_MS, HTTPS_REQUEST_TIMEOUT_MS,
        HTTP_PROXY_PORT, SERVER_ENTRY_FILENAME, SESSION_ESTABLISHMENT_TIMEOUT_MS, SOCKS_PORT,
    },
};

/// Environment prefix
const ENV_PREFIX: &str = "RELAY_TUNNEL";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub client: ClientSection,
    pub tunnel: TunnelSection,
    pub prober: ProberSection,
    pub stats: StatsSection,
    pub helper: HelperSection,
    pub http_proxy: HttpProxySection,
}

/// Client identity reported to servers, plus storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub propagation_channel_id: String,
    pub sponsor_id: String,
    pub client_version: String,
    pub client_platform: String,
    /// Directory holding the persisted server list
    pub data_dir: PathBuf,
    /// Newline-separated encoded entries shipped with the build
    pub embedded_server_list: String,
    /// Same, read from a file; appended after `embedded_server_list`
    pub embedded_server_list_file: Option<PathBuf>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            propagation_channel_id: "0".to_string(),
            sponsor_id: "0".to_string(),
            client_version: "1".to_string(),
            client_platform: std::env::consts::OS.to_string(),
            data_dir: PathBuf::from("."),
            embedded_server_list: String::new(),
            embedded_server_list_file: None,
        }
    }
}

/// Session loop timing and local ports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSection {
    pub socks_port: u16,
    pub http_proxy_port: u16,
    pub connect_timeout_ms: u64,
    pub signal_poll_ms: u64,
    pub retry_delay_min_ms: u64,
    pub retry_delay_max_ms: u64,
    pub stop_timeout_ms: u64,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            socks_port: SOCKS_PORT,
            http_proxy_port: HTTP_PROXY_PORT,
            connect_timeout_ms: SESSION_ESTABLISHMENT_TIMEOUT_MS,
            signal_poll_ms: 10_000,
            retry_delay_min_ms: 1_000,
            retry_delay_max_ms: 2_000,
            stop_timeout_ms: 10_000,
        }
    }
}

/// Reachability prober
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProberSection {
    /// Probe and reorder before the first connection attempt
    pub enabled: bool,
    pub concurrency: usize,
    pub max_work_time_ms: u64,
    pub poll_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub threshold_factor: u32,
}

impl Default for ProberSection {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: 10,
            max_work_time_ms: 5_000,
            poll_interval_ms: 100,
            shutdown_timeout_ms: 1_000,
            threshold_factor: 2,
        }
    }
}

/// Status upload policy and control-channel timeout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSection {
    pub send_interval_ms: u64,
    pub send_max_entries: usize,
    pub request_timeout_ms: u64,
}

impl Default for StatsSection {
    fn default() -> Self {
        Self {
            send_interval_ms: DEFAULT_STATS_SEND_INTERVAL_MS,
            send_max_entries: DEFAULT_SEND_MAX_ENTRIES,
            request_timeout_ms: HTTPS_REQUEST_TIMEOUT_MS,
        }
    }
}

/// External secure-channel helper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperSection {
    pub program: String,
    pub args: Vec<String>,
    /// Loopback port the helper listens on for SOCKS
    pub forward_port: u16,
}

impl Default for HelperSection {
    fn default() -> Self {
        Self {
            program: "relay-channel-helper".to_string(),
            args: Vec::new(),
            forward_port: 1081,
        }
    }
}

/// Chained local HTTP proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpProxySection {
    pub program: String,
    /// `{socks_port}` and `{http_port}` are substituted
    pub args: Vec<String>,
    pub stop_timeout_ms: u64,
}

impl Default for HttpProxySection {
    fn default() -> Self {
        Self {
            program: "polipo".to_string(),
            args: vec![
                "proxyPort={http_port}".to_string(),
                "socksParentProxy=127.0.0.1:{socks_port}".to_string(),
                "diskCacheRoot=".to_string(),
                "disableLocalInterface=true".to_string(),
                "logLevel=1".to_string(),
            ],
            stop_timeout_ms: 2_000,
        }
    }
}

impl ClientConfig {
    /// Build from defaults, an optional TOML file, and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        // Missing keys fall back to the `Default` impls via `#[serde(default)]`.
        let mut builder = Config::builder();

        if let Some(path) = path {
            debug!("reading config from {}", path.display());
            builder = builder.add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Embedded entries: inline list followed by the list file, if any.
    pub fn embedded_server_list(&self) -> Result<String, ConfigError> {
        let mut list = self.client.embedded_server_list.clone();

        if let Some(path) = &self.client.embedded_server_list_file {
            let content =
                std::fs::read_to_string(path).map_err(|source| ConfigError::EmbeddedList {
                    path: path.display().to_string(),
                    source,
                })?;
            if !list.is_empty() && !list.ends_with('\n') {
                list.push('\n');
            }
            list.push_str(&content);
        }

        Ok(list)
    }

    pub fn server_list_path(&self) -> PathBuf {
        self.client.data_dir.join(SERVER_ENTRY_FILENAME)
    }
}

impl TunnelSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn signal_poll(&self) -> Duration {
        Duration::from_millis(self.signal_poll_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl StatsSection {
    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = ClientConfig::load(None).unwrap();
        assert_eq!(config.tunnel.socks_port, SOCKS_PORT);
        assert_eq!(config.prober.concurrency, 10);
        assert_eq!(config.stats.send_max_entries, DEFAULT_SEND_MAX_ENTRIES);
    }

    #[test]
    fn test_missing_file_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.tunnel.http_proxy_port, HTTP_PROXY_PORT);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(
            &path,
            r#"
[client]
sponsor_id = "ABCD"

[tunnel]
socks_port = 2080

[prober]
enabled = false
"#,
        )
        .unwrap();

        let config = ClientConfig::load(Some(&path)).unwrap();
        assert_eq!(config.client.sponsor_id, "ABCD");
        assert_eq!(config.tunnel.socks_port, 2080);
        assert!(!config.prober.enabled);
        // untouched keys keep their defaults
        assert_eq!(config.tunnel.signal_poll_ms, 10_000);
    }

    #[test]
    fn test_embedded_list_from_inline_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embedded.txt");
        std::fs::write(&path, "bbbb\n").unwrap();

        let mut config = ClientConfig::default();
        config.client.embedded_server_list = "aaaa".to_string();
        config.client.embedded_server_list_file = Some(path);

        assert_eq!(config.embedded_server_list().unwrap(), "aaaa\nbbbb\n");
    }

    #[test]
    fn test_embedded_list_file_missing() {
        let mut config = ClientConfig::default();
        config.client.embedded_server_list_file = Some(PathBuf::from("/nonexistent/list"));
        assert!(matches!(
            config.embedded_server_list(),
            Err(ConfigError::EmbeddedList { .. })
        ));
    }
}
