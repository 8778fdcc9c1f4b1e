//! Tunnel session state machine
//!
//! One session at a time: connect the secure channel, authenticate, expose
//! the local SOCKS forwarder and HTTP proxy, then operate until stopped or
//! disconnected. Each attempt tears everything down before the next one.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use rand::Rng;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    config::TunnelSection,
    error::TransportError,
    events::{EventHub, TunnelEvent},
    proxy_supervisor::ProxyProcess,
    secure_channel::{
        DisconnectMonitor, HostKeyVerifier, PortForwarder, SecureConnection, SecureTransport,
    },
    server_entry::ServerEntry,
    server_interface::ServerInterface,
    server_list::ServerList,
    types::{AttemptOutcome, MessageClass, TunnelSignal, TunnelState},
};

/// Session timing and the local SOCKS port
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub socks_port: u16,
    pub connect_timeout: Duration,
    pub signal_poll: Duration,
    pub retry_delay_min: Duration,
    pub retry_delay_max: Duration,
    pub stop_timeout: Duration,
    /// Budget for the stats upload made while stopping
    pub final_upload_timeout: Duration,
}

impl From<&TunnelSection> for SessionSettings {
    fn from(section: &TunnelSection) -> Self {
        Self {
            socks_port: section.socks_port,
            connect_timeout: section.connect_timeout(),
            signal_poll: section.signal_poll(),
            retry_delay_min: Duration::from_millis(section.retry_delay_min_ms),
            retry_delay_max: Duration::from_millis(section.retry_delay_max_ms),
            stop_timeout: section.stop_timeout(),
            // leaves the rest of the stop budget for teardown
            final_upload_timeout: section.stop_timeout() / 2,
        }
    }
}

impl SessionSettings {
    fn retry_delay(&self) -> Duration {
        if self.retry_delay_max <= self.retry_delay_min {
            return self.retry_delay_min;
        }
        rand::thread_rng().gen_range(self.retry_delay_min..=self.retry_delay_max)
    }
}

/// How an established episode ended
enum EpisodeEnd {
    Stopped,
    Disconnected,
    AuthRejected,
}

/// Everything an episode brings up, held where an aborted task can't take it
/// along
struct Attachments {
    proxy: Box<dyn ProxyProcess>,
    channel: Option<Box<dyn SecureConnection>>,
    forwarder: Option<Box<dyn PortForwarder>>,
}

impl Attachments {
    async fn tear_down(&mut self) {
        self.proxy.stop().await;
        if let Some(mut forwarder) = self.forwarder.take() {
            forwarder.close().await;
        }
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
    }
}

/// State shared with the session task
struct SessionContext {
    servers: Arc<ServerList>,
    interface: Arc<ServerInterface>,
    events: Arc<EventHub>,
    transport: Arc<dyn SecureTransport>,
    attachments: tokio::sync::Mutex<Attachments>,
    state: watch::Sender<TunnelState>,
    settings: SessionSettings,
}

impl SessionContext {
    fn set_state(&self, state: TunnelState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!("tunnel state: {}", state.as_str());
            self.events.emit(TunnelEvent::StateChanged(state));
        }
    }
}

struct RunningSession {
    signals: mpsc::UnboundedSender<TunnelSignal>,
    handle: JoinHandle<()>,
}

pub struct TunnelSession {
    ctx: Arc<SessionContext>,
    running: Mutex<Option<RunningSession>>,
}

impl TunnelSession {
    pub fn new(
        servers: Arc<ServerList>,
        interface: Arc<ServerInterface>,
        events: Arc<EventHub>,
        transport: Arc<dyn SecureTransport>,
        proxy: Box<dyn ProxyProcess>,
        settings: SessionSettings,
    ) -> Self {
        let (state, _) = watch::channel(TunnelState::Disconnected);
        Self {
            ctx: Arc::new(SessionContext {
                servers,
                interface,
                events,
                transport,
                attachments: tokio::sync::Mutex::new(Attachments {
                    proxy,
                    channel: None,
                    forwarder: None,
                }),
                state,
                settings,
            }),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<RunningSession>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> TunnelState {
        *self.ctx.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TunnelState> {
        self.ctx.state.subscribe()
    }

    /// Start a fresh session, stopping the current one first.
    pub async fn start_tunnel(&self) {
        self.stop_tunnel().await;

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        self.ctx.set_state(TunnelState::Connecting);

        let ctx = self.ctx.clone();
        let loop_tx = signals_tx.clone();
        let handle = tokio::spawn(run_tunnel(ctx, loop_tx, signals_rx));

        *self.running() = Some(RunningSession {
            signals: signals_tx,
            handle,
        });
        info!("🚀 Tunnel session started");
    }

    /// Ask the running session to stop without waiting for it.
    pub fn request_stop(&self) {
        if let Some(running) = self.running().as_ref() {
            // the loop may already have exited
            let _ = running.signals.send(TunnelSignal::Stop);
        }
    }

    /// Stop the session and wait for teardown, aborting on overrun.
    pub async fn stop_tunnel(&self) {
        let Some(running) = self.running().take() else {
            return;
        };
        let _ = running.signals.send(TunnelSignal::Stop);

        let mut handle = running.handle;
        let stop_timeout = self.ctx.settings.stop_timeout;
        match timeout(stop_timeout, &mut handle).await {
            Ok(Ok(())) => info!("🛑 Tunnel session stopped"),
            Ok(Err(e)) => warn!("⚠️ Tunnel session task failed: {}", e),
            Err(_) => {
                warn!("⚠️ Tunnel session did not stop within {:?}, aborting", stop_timeout);
                handle.abort();
                let _ = handle.await;
                // the aborted task never reached its teardown
                self.ctx.attachments.lock().await.tear_down().await;
                self.ctx.events.status(MessageClass::Info, "Tunnel stopped");
            }
        }
        self.ctx.set_state(TunnelState::Disconnected);
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        if let Some(running) = self.running().take() {
            running.handle.abort();
        }
    }
}

/// Repeat attempts until stopped, with a jittered delay in between.
async fn run_tunnel(
    ctx: Arc<SessionContext>,
    signals_tx: mpsc::UnboundedSender<TunnelSignal>,
    mut signals: mpsc::UnboundedReceiver<TunnelSignal>,
) {
    loop {
        match run_tunnel_once(&ctx, &signals_tx, &mut signals).await {
            AttemptOutcome::Stopped => break,
            AttemptOutcome::Retry => {}
        }

        let delay = ctx.settings.retry_delay();
        debug!("retrying in {:?}", delay);
        if !wait_retry_delay(delay, &mut signals).await {
            break;
        }
    }
    debug!("session loop exited");
}

/// `false` when a stop arrived during the delay.
async fn wait_retry_delay(
    delay: Duration,
    signals: &mut mpsc::UnboundedReceiver<TunnelSignal>,
) -> bool {
    let delay = sleep(delay);
    tokio::pin!(delay);
    loop {
        tokio::select! {
            _ = &mut delay => return true,
            signal = signals.recv() => match signal {
                Some(TunnelSignal::Stop) | None => return false,
                // stale, from a channel already torn down
                Some(TunnelSignal::UnexpectedDisconnect) => {}
            },
        }
    }
}

/// One connect, operate and teardown cycle.
async fn run_tunnel_once(
    ctx: &SessionContext,
    signals_tx: &mpsc::UnboundedSender<TunnelSignal>,
    signals: &mut mpsc::UnboundedReceiver<TunnelSignal>,
) -> AttemptOutcome {
    while let Ok(signal) = signals.try_recv() {
        if signal == TunnelSignal::Stop {
            return AttemptOutcome::Stopped;
        }
    }

    let Some(entry) = ctx.servers.current_server_entry() else {
        ctx.events.status(MessageClass::Bad, "No server entries available");
        return AttemptOutcome::Retry;
    };

    ctx.set_state(TunnelState::Connecting);
    ctx.events.status(
        MessageClass::Info,
        format!("Connecting to {}", entry.ip_address),
    );

    let mut attachments = ctx.attachments.lock().await;
    let result = establish_and_operate(ctx, &entry, signals_tx, signals, &mut attachments).await;

    attachments.tear_down().await;
    drop(attachments);
    ctx.set_state(TunnelState::Disconnected);

    match result {
        Ok(EpisodeEnd::Stopped) => {
            ctx.events.status(MessageClass::Info, "Tunnel stopped");
            AttemptOutcome::Stopped
        }
        Ok(EpisodeEnd::Disconnected) => {
            ctx.events.status(MessageClass::Bad, "Tunnel disconnected unexpectedly");
            ctx.events.emit(TunnelEvent::UnexpectedDisconnect);
            AttemptOutcome::Retry
        }
        Ok(EpisodeEnd::AuthRejected) => AttemptOutcome::Retry,
        Err(e) => {
            ctx.events.status(
                MessageClass::Bad,
                format!("Connection to {} failed: {}", entry.ip_address, e),
            );
            ctx.servers.mark_current_server_failed();
            ctx.events.emit(TunnelEvent::UnexpectedDisconnect);
            AttemptOutcome::Retry
        }
    }
}

async fn establish_and_operate(
    ctx: &SessionContext,
    entry: &ServerEntry,
    signals_tx: &mpsc::UnboundedSender<TunnelSignal>,
    signals: &mut mpsc::UnboundedReceiver<TunnelSignal>,
    attachments: &mut Attachments,
) -> Result<EpisodeEnd, TransportError> {
    let Attachments {
        proxy,
        channel,
        forwarder,
    } = attachments;

    let mut connection = ctx
        .transport
        .connect(
            entry,
            HostKeyVerifier::for_entry(entry),
            ctx.settings.connect_timeout,
        )
        .await?;

    let monitor_tx = signals_tx.clone();
    let monitor: DisconnectMonitor = Arc::new(move || {
        let _ = monitor_tx.send(TunnelSignal::UnexpectedDisconnect);
    });
    connection.add_disconnect_monitor(monitor);
    let connection = channel.insert(connection);

    if !connection
        .authenticate(&entry.ssh_username, &entry.ssh_password)
        .await?
    {
        ctx.events.status(
            MessageClass::Bad,
            format!("Authentication rejected by {}", entry.ip_address),
        );
        return Ok(EpisodeEnd::AuthRejected);
    }

    *forwarder = Some(
        connection
            .create_local_port_forward(ctx.settings.socks_port)
            .await?,
    );
    proxy.start().await?;

    ctx.set_state(TunnelState::Connected);
    ctx.events.status(
        MessageClass::Good,
        format!("Tunnel connected via {}", entry.ip_address),
    );

    if let Err(e) = ctx.interface.do_handshake_request().await {
        warn!("⚠️ Handshake failed, continuing: {}", e);
    }
    if let Err(e) = ctx.interface.do_connected_request().await {
        warn!("⚠️ Connected request failed, continuing: {}", e);
    }

    loop {
        let signal = match timeout(ctx.settings.signal_poll, signals.recv()).await {
            Ok(Some(signal)) => Some(signal),
            Ok(None) => Some(TunnelSignal::Stop),
            Err(_) => None,
        };

        match signal {
            Some(TunnelSignal::Stop) => {
                let budget = ctx.settings.final_upload_timeout;
                if timeout(budget, ctx.interface.do_periodic_work(true)).await.is_err() {
                    warn!("⚠️ Final stats upload exceeded {:?}, skipping", budget);
                }
                return Ok(EpisodeEnd::Stopped);
            }
            Some(TunnelSignal::UnexpectedDisconnect) => return Ok(EpisodeEnd::Disconnected),
            None => {}
        }

        if !proxy.is_running() {
            warn!("⚠️ HTTP proxy exited");
            return Ok(EpisodeEnd::Disconnected);
        }

        ctx.interface.do_periodic_work(false).await;
    }
}
