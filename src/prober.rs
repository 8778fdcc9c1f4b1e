//! Reachability prober
//!
//! Times a plain TCP connect to every candidate within a fixed budget and
//! moves the fastest responders to the front of the server list.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use rand::seq::SliceRandom;
use tokio::{
    net::TcpStream,
    sync::{OwnedSemaphorePermit, Semaphore},
    task::{JoinHandle, JoinSet},
    time::{timeout, timeout_at, Instant},
};
use tracing::{debug, info, warn};

use crate::{config::ProberSection, server_entry::ServerEntry, server_list::ServerList};

/// Prober settings
#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// Concurrent probes
    pub concurrency: usize,
    /// Budget for a whole round
    pub max_work_time: Duration,
    /// Granularity of stop/deadline checks
    pub poll_interval: Duration,
    /// Join budget when stopping
    pub shutdown_timeout: Duration,
    /// Responders within `fastest × factor` are promoted
    pub threshold_factor: u32,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            max_work_time: Duration::from_millis(5000),
            poll_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_millis(1000),
            threshold_factor: 2,
        }
    }
}

impl From<&ProberSection> for ProberConfig {
    fn from(section: &ProberSection) -> Self {
        Self {
            concurrency: section.concurrency.max(1),
            max_work_time: Duration::from_millis(section.max_work_time_ms),
            poll_interval: Duration::from_millis(section.poll_interval_ms.max(1)),
            shutdown_timeout: Duration::from_millis(section.shutdown_timeout_ms),
            threshold_factor: section.threshold_factor,
        }
    }
}

/// Outcome of one probe
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub entry: ServerEntry,
    pub responded: bool,
    pub elapsed: Duration,
}

struct Round {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Runs at most one background probe round at a time
pub struct ReachabilityProber {
    servers: Arc<ServerList>,
    config: ProberConfig,
    round: Mutex<Option<Round>>,
}

impl ReachabilityProber {
    pub fn new(servers: Arc<ServerList>, config: ProberConfig) -> Self {
        Self {
            servers,
            config,
            round: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ProberConfig {
        &self.config
    }

    fn take_round(&self) -> Option<Round> {
        self.round
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Start a background round, stopping any round still in flight.
    pub async fn start(&self) {
        self.stop().await;

        let stop = Arc::new(AtomicBool::new(false));
        let servers = self.servers.clone();
        let config = self.config.clone();
        let flag = stop.clone();

        let handle = tokio::spawn(async move {
            probe_and_reorder(&servers, &config, flag).await;
        });

        *self
            .round
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Round { stop, handle });
    }

    /// Ask the current round to finish and join it; abort on overrun.
    pub async fn stop(&self) {
        let Some(Round { stop, mut handle }) = self.take_round() else {
            return;
        };

        stop.store(true, Ordering::SeqCst);
        if timeout(self.config.shutdown_timeout, &mut handle).await.is_err() {
            warn!("⚠️ Probe round did not stop in time, aborting");
            handle.abort();
        }
    }

    /// Wait for the current round to complete on its own.
    pub async fn wait(&self) {
        if let Some(Round { handle, .. }) = self.take_round() {
            if let Err(e) = handle.await {
                debug!("probe round ended abnormally: {}", e);
            }
        }
    }

    /// Run one round inline and return the raw results.
    pub async fn run_round(&self) -> Vec<ProbeResult> {
        probe_and_reorder(&self.servers, &self.config, Arc::new(AtomicBool::new(false))).await
    }
}

async fn probe_and_reorder(
    servers: &ServerList,
    config: &ProberConfig,
    stop: Arc<AtomicBool>,
) -> Vec<ProbeResult> {
    let results = probe_round(servers.snapshot(), config, &stop).await;

    let mut selected = select_responders(&results, config.threshold_factor);
    let responded = results.iter().filter(|r| r.responded).count();
    info!(
        "📡 Probe round: {}/{} responded, {} promoted",
        responded,
        results.len(),
        selected.len()
    );

    // a stopped round still promotes whoever answered before the stop
    if !selected.is_empty() {
        if stop.load(Ordering::SeqCst) {
            debug!("round stopped early, promoting partial results");
        }
        selected.shuffle(&mut rand::thread_rng());
        servers.move_entries_to_front(&selected);
    }
    results
}

/// Probe every entry with a reachability port. The head of the list is
/// probed first; the tail past `concurrency` is sampled in random order.
async fn probe_round(
    mut entries: Vec<ServerEntry>,
    config: &ProberConfig,
    stop: &Arc<AtomicBool>,
) -> Vec<ProbeResult> {
    if entries.len() > config.concurrency {
        entries[config.concurrency..].shuffle(&mut rand::thread_rng());
    }

    let deadline = Instant::now() + config.max_work_time;
    let semaphore = Arc::new(Semaphore::new(config.concurrency));
    let mut tasks = JoinSet::new();

    for entry in entries {
        let Some(port) = entry.preferred_reachability_test_port() else {
            debug!("{} has no reachability port, skipping", entry.ip_address);
            continue;
        };

        let Some(permit) = acquire_slot(&semaphore, config, deadline, stop).await else {
            break;
        };

        let poll_interval = config.poll_interval;
        let stop = stop.clone();
        tasks.spawn(async move {
            let _permit = permit;
            probe_one(entry, port, deadline, poll_interval, &stop).await
        });
    }

    let mut results = Vec::new();
    let hard_stop = deadline + config.shutdown_timeout;
    loop {
        match timeout_at(hard_stop, tasks.join_next()).await {
            Ok(Some(Ok(result))) => results.push(result),
            Ok(Some(Err(e))) => debug!("probe task failed: {}", e),
            Ok(None) => break,
            Err(_) => {
                warn!("⚠️ {} probes still running, aborting", tasks.len());
                tasks.abort_all();
                break;
            }
        }
    }
    results
}

/// Wait for a free probe slot, giving up at the deadline or on stop.
async fn acquire_slot(
    semaphore: &Arc<Semaphore>,
    config: &ProberConfig,
    deadline: Instant,
    stop: &AtomicBool,
) -> Option<OwnedSemaphorePermit> {
    let acquire = semaphore.clone().acquire_owned();
    tokio::pin!(acquire);

    loop {
        if stop.load(Ordering::SeqCst) || Instant::now() >= deadline {
            return None;
        }
        match timeout(config.poll_interval, &mut acquire).await {
            Ok(permit) => return permit.ok(),
            Err(_) => continue,
        }
    }
}

async fn probe_one(
    entry: ServerEntry,
    port: u16,
    deadline: Instant,
    poll_interval: Duration,
    stop: &AtomicBool,
) -> ProbeResult {
    let start = Instant::now();
    let address = entry.ip_address.clone();
    let connect = TcpStream::connect((address.as_str(), port));
    tokio::pin!(connect);

    let responded = loop {
        let now = Instant::now();
        if now >= deadline || stop.load(Ordering::SeqCst) {
            break false;
        }
        let slice = poll_interval.min(deadline - now);
        match timeout(slice, &mut connect).await {
            Ok(Ok(_stream)) => break true,
            Ok(Err(e)) => {
                debug!("probe {}:{} failed: {}", entry.ip_address, port, e);
                break false;
            }
            Err(_) => continue,
        }
    };

    ProbeResult {
        elapsed: start.elapsed(),
        entry,
        responded,
    }
}

/// Responders whose time is within `fastest × factor`, in result order.
pub fn select_responders(results: &[ProbeResult], threshold_factor: u32) -> Vec<ServerEntry> {
    let Some(fastest) = results
        .iter()
        .filter(|r| r.responded)
        .map(|r| r.elapsed)
        .min()
    else {
        return Vec::new();
    };

    let threshold = fastest * threshold_factor;
    results
        .iter()
        .filter(|r| r.responded && r.elapsed <= threshold)
        .map(|r| r.entry.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server_entry::tests::sample_entry;
    use tokio::net::TcpListener;

    fn result(ip: &str, responded: bool, millis: u64) -> ProbeResult {
        ProbeResult {
            entry: sample_entry(ip),
            responded,
            elapsed: Duration::from_millis(millis),
        }
    }

    fn entry_on_port(ip: &str, port: u16) -> ServerEntry {
        let mut entry = sample_entry(ip);
        entry.ssh_obfuscated_port = port;
        entry.encoded_entry = entry.encode();
        entry
    }

    #[test]
    fn test_select_within_threshold() {
        let results = vec![
            result("1.0.0.1", true, 200),
            result("1.0.0.2", true, 50),
            result("1.0.0.3", false, 10),
            result("1.0.0.4", true, 400),
            result("1.0.0.5", true, 60),
        ];
        let selected: Vec<String> = select_responders(&results, 2)
            .into_iter()
            .map(|e| e.ip_address)
            .collect();
        assert_eq!(selected, vec!["1.0.0.2", "1.0.0.5"]);
    }

    #[test]
    fn test_select_without_responders() {
        let results = vec![result("1.0.0.1", false, 5), result("1.0.0.2", false, 7)];
        assert!(select_responders(&results, 2).is_empty());
    }

    #[tokio::test]
    async fn test_round_promotes_reachable_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((_socket, _)) = listener.accept().await {}
        });

        let dir = tempfile::tempdir().unwrap();
        let servers = Arc::new(ServerList::new(dir.path().join("servers.json")));
        // nothing listens on 127.0.0.2
        servers
            .add_server_entry(&entry_on_port("127.0.0.2", port).encoded_entry, false)
            .unwrap();
        servers
            .add_server_entry(&entry_on_port("127.0.0.1", port).encoded_entry, false)
            .unwrap();

        let prober = ReachabilityProber::new(servers.clone(), ProberConfig::default());
        let results = prober.run_round().await;

        assert_eq!(results.len(), 2);
        assert_eq!(servers.known_ips(), vec!["127.0.0.1", "127.0.0.2"]);
    }

    #[tokio::test]
    async fn test_round_without_responders_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let servers = Arc::new(ServerList::new(dir.path().join("servers.json")));

        let mut no_port = sample_entry("127.0.0.3");
        no_port.ssh_obfuscated_port = 0;
        no_port.ssh_port = 0;
        no_port.web_server_port = 0;
        no_port.encoded_entry = no_port.encode();

        servers.add_server_entry(&no_port.encoded_entry, false).unwrap();
        servers
            .add_server_entry(&entry_on_port("127.0.0.2", 9).encoded_entry, false)
            .unwrap();
        let before = servers.known_ips();

        let config = ProberConfig {
            max_work_time: Duration::from_millis(300),
            ..ProberConfig::default()
        };
        let prober = ReachabilityProber::new(servers.clone(), config);
        let results = prober.run_round().await;

        assert!(results.iter().all(|r| !r.responded));
        assert_eq!(results.len(), 1);
        assert_eq!(servers.known_ips(), before);
    }

    #[tokio::test]
    async fn test_stop_joins_within_budget() {
        let dir = tempfile::tempdir().unwrap();
        let servers = Arc::new(ServerList::new(dir.path().join("servers.json")));
        servers
            .add_server_entry(&entry_on_port("10.255.255.1", 81).encoded_entry, false)
            .unwrap();

        let config = ProberConfig {
            max_work_time: Duration::from_secs(30),
            ..ProberConfig::default()
        };
        let prober = ReachabilityProber::new(servers, config);
        prober.start().await;

        let started = std::time::Instant::now();
        prober.stop().await;
        assert!(started.elapsed() < Duration::from_secs(2));

        // stopping twice is a no-op
        prober.stop().await;
    }

    #[tokio::test]
    async fn test_stopped_round_still_promotes_responders() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((_socket, _)) = listener.accept().await {}
        });

        let dir = tempfile::tempdir().unwrap();
        let servers = Arc::new(ServerList::new(dir.path().join("servers.json")));
        servers
            .add_server_entry(&entry_on_port("10.255.255.1", 81).encoded_entry, false)
            .unwrap();
        servers
            .add_server_entry(&entry_on_port("127.0.0.1", port).encoded_entry, false)
            .unwrap();

        let config = ProberConfig {
            max_work_time: Duration::from_secs(30),
            ..ProberConfig::default()
        };
        let prober = ReachabilityProber::new(servers.clone(), config);
        prober.start().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        prober.stop().await;

        assert_eq!(servers.known_ips()[0], "127.0.0.1");
    }
}
