//! Secure channel delegated to an external helper process
//!
//! Line protocol over the helper's stdin/stdout:
//!
//! ```text
//! helper → HOSTKEY <base64>       host key presented by the server
//! client → AUTH <user> <password>
//! helper → OK | DENIED
//! client → FORWARD <port>          open a SOCKS listener on 127.0.0.1:<port>
//! helper → OK | ERR <reason>
//! helper → LOG <text>              any time; logged, never a reply
//! ```
//!
//! The helper exiting closes the channel.

use std::{
    net::{Ipv4Addr, SocketAddr},
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::mpsc,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::HelperSection,
    error::TransportError,
    secure_channel::{
        DisconnectMonitor, HostKeyVerifier, PortForwarder, SecureConnection, SecureTransport,
    },
    server_entry::ServerEntry,
    socks_relay::CountingRelay,
    stats::Stats,
};

/// Spawns one helper per connection
pub struct HelperTransport {
    config: HelperSection,
    stats: Arc<Stats>,
}

impl HelperTransport {
    pub fn new(config: HelperSection, stats: Arc<Stats>) -> Self {
        Self { config, stats }
    }
}

#[async_trait]
impl SecureTransport for HelperTransport {
    async fn connect(
        &self,
        entry: &ServerEntry,
        verifier: HostKeyVerifier,
        connect_timeout: Duration,
    ) -> Result<Box<dyn SecureConnection>, TransportError> {
        info!(
            "🔐 Connecting to {}:{} via {}",
            entry.ip_address, entry.ssh_obfuscated_port, self.config.program
        );

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .env("RELAY_SERVER_ADDRESS", &entry.ip_address)
            .env("RELAY_SERVER_PORT", entry.ssh_obfuscated_port.to_string())
            .env("RELAY_OBFUSCATION_KEY", &entry.ssh_obfuscated_key)
            .env("RELAY_HOST_KEY", &entry.ssh_host_key)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Protocol("helper stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Protocol("helper stdout unavailable".into()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("helper: {}", line);
                }
            });
        }

        let closing = Arc::new(AtomicBool::new(false));
        let exited = Arc::new(AtomicBool::new(false));
        let monitors: Arc<Mutex<Vec<DisconnectMonitor>>> = Arc::new(Mutex::new(Vec::new()));
        let (reply_tx, replies) = mpsc::unbounded_channel();

        {
            let closing = closing.clone();
            let exited = exited.clone();
            let monitors = monitors.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match line.strip_prefix("LOG ") {
                        Some(text) => debug!("helper: {}", text),
                        None => {
                            let _ = reply_tx.send(line);
                        }
                    }
                }

                // set under the lock so a monitor added later sees it
                let monitors = {
                    let guard = monitors
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    exited.store(true, Ordering::SeqCst);
                    guard.clone()
                };

                if !closing.load(Ordering::SeqCst) {
                    warn!("⚠️ Secure channel helper exited");
                    for monitor in monitors {
                        monitor();
                    }
                }
            });
        }

        let mut connection = HelperConnection {
            child,
            stdin,
            replies,
            reply_timeout: connect_timeout,
            closing,
            exited,
            monitors,
            forward_port: self.config.forward_port,
            stats: self.stats.clone(),
        };

        let host_key = match connection.read_reply("host key").await {
            Ok(line) => line,
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        };
        let presented = host_key
            .strip_prefix("HOSTKEY ")
            .map(str::trim)
            .ok_or_else(|| TransportError::Protocol(format!("expected HOSTKEY, got {:?}", host_key)));

        if let Err(e) = presented.and_then(|key| verifier.verify_encoded(key)) {
            connection.close().await;
            return Err(e);
        }

        debug!("helper channel to {} established", entry.ip_address);
        Ok(Box::new(connection))
    }
}

/// One running helper
pub struct HelperConnection {
    child: Child,
    stdin: ChildStdin,
    replies: mpsc::UnboundedReceiver<String>,
    reply_timeout: Duration,
    closing: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    monitors: Arc<Mutex<Vec<DisconnectMonitor>>>,
    forward_port: u16,
    stats: Arc<Stats>,
}

impl HelperConnection {
    async fn send(&mut self, command: &str) -> Result<(), TransportError> {
        self.stdin.write_all(command.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn read_reply(&mut self, what: &'static str) -> Result<String, TransportError> {
        match timeout(self.reply_timeout, self.replies.recv()).await {
            Ok(Some(line)) => Ok(line.trim().to_string()),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout(what)),
        }
    }
}

#[async_trait]
impl SecureConnection for HelperConnection {
    async fn authenticate(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<bool, TransportError> {
        self.send(&format!("AUTH {} {}", username, password)).await?;
        match self.read_reply("authentication").await?.as_str() {
            "OK" => Ok(true),
            "DENIED" => Ok(false),
            other => Err(TransportError::Protocol(format!(
                "unexpected AUTH reply {:?}",
                other
            ))),
        }
    }

    async fn create_local_port_forward(
        &mut self,
        local_port: u16,
    ) -> Result<Box<dyn PortForwarder>, TransportError> {
        let helper_port = self.forward_port;
        self.send(&format!("FORWARD {}", helper_port)).await?;
        let reply = self.read_reply("port forward").await?;
        if reply != "OK" {
            return Err(TransportError::Protocol(format!(
                "port forward refused: {}",
                reply
            )));
        }

        let upstream = SocketAddr::from((Ipv4Addr::LOCALHOST, helper_port));
        let relay = CountingRelay::start(local_port, upstream, self.stats.clone()).await?;
        Ok(Box::new(relay))
    }

    /// Fires at once when the helper is already gone.
    fn add_disconnect_monitor(&mut self, monitor: DisconnectMonitor) {
        {
            let mut monitors = self
                .monitors
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !self.exited.load(Ordering::SeqCst) {
                monitors.push(monitor);
                return;
            }
        }

        if !self.closing.load(Ordering::SeqCst) {
            monitor();
        }
    }

    async fn close(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Err(e) = self.child.kill().await {
            debug!("helper kill: {}", e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::server_entry::tests::sample_entry;
    use std::sync::atomic::AtomicUsize;

    fn transport(script: &str) -> HelperTransport {
        let config = HelperSection {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            forward_port: 0,
        };
        HelperTransport::new(config, Arc::new(Stats::new()))
    }

    const GOOD_HELPER: &str = r#"
echo "LOG starting for $RELAY_SERVER_ADDRESS"
echo "HOSTKEY $RELAY_HOST_KEY"
read cmd
if [ "$cmd" = "AUTH user pass" ]; then echo OK; else echo DENIED; fi
sleep 30
"#;

    #[tokio::test]
    async fn test_connect_and_authenticate() {
        let entry = sample_entry("1.2.3.4");
        let mut conn = transport(GOOD_HELPER)
            .connect(&entry, HostKeyVerifier::for_entry(&entry), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(conn.authenticate("user", "pass").await.unwrap());
        conn.close().await;
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let entry = sample_entry("1.2.3.4");
        let mut conn = transport(GOOD_HELPER)
            .connect(&entry, HostKeyVerifier::for_entry(&entry), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!conn.authenticate("user", "wrong").await.unwrap());
        conn.close().await;
    }

    #[tokio::test]
    async fn test_host_key_mismatch() {
        let entry = sample_entry("1.2.3.4");
        let result = transport("echo 'HOSTKEY b3RoZXI='; sleep 30")
            .connect(&entry, HostKeyVerifier::for_entry(&entry), Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(TransportError::HostKeyMismatch)));
    }

    #[tokio::test]
    async fn test_helper_exit_fires_monitor() {
        let entry = sample_entry("1.2.3.4");
        let script = r#"echo "HOSTKEY $RELAY_HOST_KEY"; read cmd; echo OK"#;
        let mut conn = transport(script)
            .connect(&entry, HostKeyVerifier::for_entry(&entry), Duration::from_secs(5))
            .await
            .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        conn.add_disconnect_monitor(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(conn.authenticate("user", "pass").await.unwrap());
        for _ in 0..100 {
            if fired.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_monitor_added_after_exit_fires() {
        let entry = sample_entry("1.2.3.4");
        // closes its output right after the host key
        let script = r#"echo "HOSTKEY $RELAY_HOST_KEY"; exec >&-; sleep 30"#;
        let mut conn = transport(script)
            .connect(&entry, HostKeyVerifier::for_entry(&entry), Duration::from_secs(5))
            .await
            .unwrap();

        // the reply stream ends only after the reader has seen the exit
        let result = conn.authenticate("user", "pass").await;
        assert!(matches!(result, Err(TransportError::Closed)));

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        conn.add_disconnect_monitor(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        conn.close().await;
    }
}
