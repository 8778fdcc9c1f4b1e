//! Byte-counting relay in front of the channel's SOCKS listener
//!
//! Local applications connect to the public SOCKS port; every connection is
//! spliced to the helper's loopback listener. Bytes are added to the shared
//! statistics as each chunk moves, and the traffic inspector sees the same
//! chunks.

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use async_trait::async_trait;
use tokio::{
    io::{copy_bidirectional, AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{secure_channel::PortForwarder, stats::Stats, traffic_inspector::TrafficInspector};

/// Accept loop plus its listening address
pub struct CountingRelay {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl CountingRelay {
    /// Bind `127.0.0.1:listen_port` and relay to `upstream`.
    pub async fn start(
        listen_port: u16,
        upstream: SocketAddr,
        stats: Arc<Stats>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", listen_port)).await?;
        let local_addr = listener.local_addr()?;
        info!("🧦 SOCKS relay on {} → {}", local_addr, upstream);

        let accept_task = tokio::spawn(async move {
            loop {
                let (client, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("⚠️ SOCKS relay accept failed: {}", e);
                        continue;
                    }
                };

                let stats = stats.clone();
                tokio::spawn(async move {
                    if let Err(e) = relay_one(client, upstream, stats).await {
                        debug!("relay for {} ended: {}", peer, e);
                    }
                });
            }
        });

        Ok(Self {
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Connections already relayed run to completion.
    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for CountingRelay {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait]
impl PortForwarder for CountingRelay {
    async fn close(&mut self) {
        self.shutdown();
        debug!("SOCKS relay on {} closed", self.local_addr);
    }
}

async fn relay_one(client: TcpStream, upstream: SocketAddr, stats: Arc<Stats>) -> io::Result<()> {
    let mut server = TcpStream::connect(upstream).await?;
    let mut client = CountedClient::new(client, stats);
    copy_bidirectional(&mut client, &mut server).await?;
    Ok(())
}

/// Local end of a relayed connection. Reads are bytes heading into the
/// tunnel, writes are bytes coming back out of it.
struct CountedClient {
    inner: TcpStream,
    stats: Arc<Stats>,
    inspector: TrafficInspector,
}

impl CountedClient {
    fn new(inner: TcpStream, stats: Arc<Stats>) -> Self {
        Self {
            inner,
            inspector: TrafficInspector::new(stats.clone()),
            stats,
        }
    }
}

impl AsyncRead for CountedClient {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        let chunk = &buf.filled()[before..];
        if !chunk.is_empty() {
            this.stats.add_bytes_sent(chunk.len() as u64);
            this.inspector.client_bytes(chunk);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for CountedClient {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let written = ready!(Pin::new(&mut this.inner).poll_write(cx, data))?;

        this.stats.add_bytes_received(written as u64);
        this.inspector.server_bytes(&data[..written]);
        Poll::Ready(Ok(written))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
