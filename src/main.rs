//! Relay Tunnel - circumvention tunnel client
//!
//! Keeps a ranked list of relay servers, connects through the first one that
//! works and exposes local SOCKS and HTTP proxies over the secure channel.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use relay_tunnel::{
    prober::{ProberConfig, ReachabilityProber},
    ClientConfig, ServerList, TunnelEngine, TunnelEvent,
};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "relay-tunnel",
    version,
    about = "🛰️ Relay Tunnel - circumvention tunnel client"
)]
struct Cli {
    /// Configuration file (optional)
    #[arg(short, long, default_value = "relay-tunnel.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Run the tunnel until Ctrl+C
    Run,
    /// Probe all servers once and reorder the stored list
    Probe,
    /// List stored servers in connection order
    Servers,
    /// Import encoded server entries, one per line
    Import {
        file: PathBuf,
    },
    /// Print the effective configuration as TOML
    Config,
}

// ── Entry Point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    let config = ClientConfig::load(Some(cli.config.as_path()))
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command.clone().unwrap_or(Commands::Run) {
        Commands::Run => run_tunnel(config).await?,
        Commands::Probe => run_probe(config).await?,
        Commands::Servers => print_servers(&load_servers(&config)?),
        Commands::Import { file } => run_import(config, &file)?,
        Commands::Config => print_config(&config)?,
    }

    Ok(())
}

// ── Command Handlers ─────────────────────────────────────────────────────────

async fn run_tunnel(config: ClientConfig) -> Result<()> {
    info!("🛰️ Relay Tunnel v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "   SOCKS 127.0.0.1:{} | HTTP 127.0.0.1:{}",
        config.tunnel.socks_port, config.tunnel.http_proxy_port
    );

    let engine = TunnelEngine::new(config).context("building tunnel engine")?;

    let mut events = engine.subscribe();
    let home_pages = engine.events().clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let TunnelEvent::HandshakeSucceeded = event {
                for page in home_pages.home_pages() {
                    info!("🏠 Home page: {}", page);
                }
            }
        }
    });

    engine.start().await;

    info!("✅ Tunnel running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    engine.stop().await;

    let stats = engine.stats().snapshot();
    info!(
        "🔌 Relay Tunnel stopped ({} bytes unsent in stats)",
        stats.bytes_transferred
    );
    Ok(())
}

async fn run_probe(config: ClientConfig) -> Result<()> {
    let servers = Arc::new(load_servers(&config)?);
    if servers.is_empty() {
        println!("{}", "No servers to probe.".yellow());
        return Ok(());
    }

    let prober = ReachabilityProber::new(servers.clone(), ProberConfig::from(&config.prober));
    let mut results = prober.run_round().await;
    results.sort_by_key(|r| (!r.responded, r.elapsed));

    println!("{}", "═".repeat(60).cyan());
    println!("{}", "  🔍 Server Reachability".cyan().bold());
    println!("{}", "═".repeat(60).cyan());
    for result in &results {
        let port = result
            .entry
            .preferred_reachability_test_port()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let status = if result.responded {
            format!("{}ms", result.elapsed.as_millis()).green().to_string()
        } else {
            "no response".red().to_string()
        };
        println!(
            "  {:<40} {:>6}  {}",
            result.entry.ip_address.cyan(),
            port,
            status
        );
    }
    println!("{}", "═".repeat(60).cyan());

    print_servers(&servers);
    Ok(())
}

fn run_import(config: ClientConfig, file: &Path) -> Result<()> {
    let servers = load_servers(&config)?;
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;

    let mut imported = 0;
    let mut rejected = 0;
    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match servers.add_server_entry(line, false) {
            Ok(()) => imported += 1,
            Err(_) => rejected += 1,
        }
    }

    println!("  ├── imported: {}", imported.to_string().green());
    println!("  └── rejected: {}", rejected.to_string().red());
    println!("  {} servers stored at {}", servers.len(), servers.path().display());
    Ok(())
}

fn print_servers(servers: &ServerList) {
    println!("\n{}", "  📋 Servers (connection order)".cyan().bold());
    for (i, entry) in servers.snapshot().iter().enumerate() {
        println!(
            "  [{:>3}] {:<40} web {:<5} ssh {:<5} ossh {}",
            i + 1,
            entry.ip_address.cyan(),
            entry.web_server_port,
            entry.ssh_port,
            entry.ssh_obfuscated_port
        );
    }
    println!();
}

fn print_config(config: &ClientConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("rendering configuration")?;
    println!("{}", rendered);
    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn setup_logging(level: &str) {
    let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).with_target(false).init();
}

fn load_servers(config: &ClientConfig) -> Result<ServerList> {
    let servers = ServerList::new(config.server_list_path());
    servers.load(&config.embedded_server_list()?);
    Ok(servers)
}
