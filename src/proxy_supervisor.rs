//! Local HTTP proxy chained behind the SOCKS forwarder

use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{config::HttpProxySection, error::TransportError};

/// Lifecycle of the chained proxy
#[async_trait]
pub trait ProxyProcess: Send {
    /// Start the proxy, stopping a running instance first.
    async fn start(&mut self) -> Result<(), TransportError>;

    /// Terminate and wait.
    async fn stop(&mut self);

    /// Non-blocking liveness check.
    fn is_running(&mut self) -> bool;
}

/// Runs the configured proxy program as a child process.
///
/// An empty program disables the HTTP proxy; it then always reports running.
pub struct LocalProxySupervisor {
    config: HttpProxySection,
    socks_port: u16,
    http_port: u16,
    child: Option<Child>,
}

impl LocalProxySupervisor {
    pub fn new(config: HttpProxySection, socks_port: u16, http_port: u16) -> Self {
        Self {
            config,
            socks_port,
            http_port,
            child: None,
        }
    }

    fn disabled(&self) -> bool {
        self.config.program.trim().is_empty()
    }

    fn expand_args(&self) -> Vec<String> {
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{socks_port}", &self.socks_port.to_string())
                    .replace("{http_port}", &self.http_port.to_string())
            })
            .collect()
    }
}

#[async_trait]
impl ProxyProcess for LocalProxySupervisor {
    async fn start(&mut self) -> Result<(), TransportError> {
        self.stop().await;
        if self.disabled() {
            debug!("HTTP proxy disabled");
            return Ok(());
        }

        let mut child = Command::new(&self.config.program)
            .args(self.expand_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr);
        }

        info!(
            "🌐 HTTP proxy on 127.0.0.1:{} (parent SOCKS 127.0.0.1:{})",
            self.http_port, self.socks_port
        );
        self.child = Some(child);
        Ok(())
    }

    async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Err(e) = child.start_kill() {
            debug!("HTTP proxy kill: {}", e);
        }
        let wait = Duration::from_millis(self.config.stop_timeout_ms);
        match timeout(wait, child.wait()).await {
            Ok(Ok(status)) => debug!("HTTP proxy exited: {}", status),
            Ok(Err(e)) => warn!("⚠️ HTTP proxy wait failed: {}", e),
            Err(_) => warn!("⚠️ HTTP proxy did not exit within {:?}", wait),
        }
    }

    fn is_running(&mut self) -> bool {
        if self.disabled() {
            return true;
        }
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

/// Log child output line by line.
fn forward_output<R>(stream: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("http proxy: {}", line);
        }
    });
}
