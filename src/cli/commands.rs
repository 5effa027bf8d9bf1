//! CLI commands for the node
//!
//! Implements the command handlers behind the `peerlink` binary.

use crate::config::{NodeConfig, ProtocolKind, ServerConfig};
use crate::indexing::{IndexDispatch, LogIndexer};
use crate::network::{AddressBook, Controls, ProtocolSet, Registry};
use crate::storage::FileMarkerStore;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Marker file of the indexing queue, inside the data directory
const INDEX_MARKER_FILE: &str = "last_index";

/// Command-line settings that take precedence over the config file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub data_dir: Option<PathBuf>,
    pub client: bool,
    pub listen: Option<bool>,
    pub threads: Option<usize>,
    pub connect: Vec<SocketAddr>,
    pub allow_local: bool,
}

/// Read the config file and apply command-line overrides
pub fn load_config(path: &Path, overrides: &Overrides) -> CliResult<NodeConfig> {
    let mut config = NodeConfig::load(path)?;

    if let Some(dir) = &overrides.data_dir {
        config.node.data_dir = dir.clone();
    }
    if overrides.client {
        config.node.client = true;
    }
    if overrides.allow_local {
        config.node.allow_local_peers = true;
    }
    config.node.connect.extend(overrides.connect.iter().copied());

    for kind in ProtocolKind::ALL {
        let section = config.section_mut(kind);
        if let Some(listen) = overrides.listen {
            section.listen = Some(listen);
        }
        if let Some(threads) = overrides.threads {
            section.threads = Some(threads);
        }
    }

    config.validate()?;
    Ok(config)
}

/// Show which servers the configuration would start
pub fn cmd_check_config(config: &NodeConfig) -> CliResult<()> {
    println!("📋 Configuration");
    println!("   Data dir: {}", config.node.data_dir.display());
    println!("   Bind:     {}", config.node.bind);
    println!(
        "   TLS:      {}",
        if config.tls.is_configured() { "configured" } else { "not configured" }
    );
    println!();

    for kind in ProtocolKind::ALL {
        match ServerConfig::for_kind(kind, config) {
            Ok(cfg) => {
                let listen = if !cfg.listen {
                    "not listening".to_string()
                } else if cfg.ssl_required {
                    format!("tls port {}", cfg.ssl_port)
                } else if cfg.ssl {
                    format!("port {} + tls port {}", cfg.port, cfg.ssl_port)
                } else {
                    format!("port {}", cfg.port)
                };
                println!(
                    "✅ {:<7} {} | {}/{} connections | {} threads | ddos {} | manager {}",
                    kind.name(),
                    listen,
                    cfg.max_incoming,
                    cfg.max_connections,
                    cfg.threads,
                    if cfg.ddos { "on" } else { "off" },
                    if cfg.manager { "on" } else { "off" },
                );
            }
            Err(reason) => println!("⛔ {:<7} disabled: {}", kind.name(), reason),
        }
    }

    Ok(())
}

/// List known peer addresses
pub async fn cmd_peers(config: &NodeConfig, count: usize) -> CliResult<()> {
    let book = AddressBook::open(&config.node.data_dir, config.node.allow_local_peers)?;
    let mut addrs = book.get(|_| true).await;

    if addrs.is_empty() {
        println!("No known peers in {}", config.node.data_dir.display());
        return Ok(());
    }

    addrs.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
    println!("📇 {} known peers", addrs.len());
    for addr in addrs.iter().take(count) {
        let seen = chrono::DateTime::from_timestamp(addr.last_seen as i64, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("   {:<45} services {:#06x}  seen {}", addr.canonical(), addr.services.bits(), seen);
    }

    Ok(())
}

/// What the signal loop was woken by
enum Signal {
    Shutdown,
    CloseListening,
    OpenListening,
}

/// Signal streams, registered once so nothing arrives unobserved
#[cfg(unix)]
struct Signals {
    terminate: tokio::signal::unix::Signal,
    close: tokio::signal::unix::Signal,
    open: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            close: signal(SignalKind::user_defined1())?,
            open: signal(SignalKind::user_defined2())?,
        })
    }

    async fn next(&mut self) -> std::io::Result<Signal> {
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|_| Signal::Shutdown),
            _ = self.terminate.recv() => Ok(Signal::Shutdown),
            _ = self.close.recv() => Ok(Signal::CloseListening),
            _ = self.open.recv() => Ok(Signal::OpenListening),
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> std::io::Result<Signal> {
        tokio::signal::ctrl_c().await.map(|_| Signal::Shutdown)
    }
}

/// Run the node until interrupted.
///
/// On unix, SIGUSR1 closes every listener and suspends the node, SIGUSR2
/// reopens them.
pub async fn cmd_run(config: NodeConfig) -> CliResult<()> {
    let controls = Controls::new();
    let mut signals = Signals::new()?;
    let book = AddressBook::open(&config.node.data_dir, config.node.allow_local_peers)?;

    println!("🌐 Starting node in {}", config.node.data_dir.display());
    let registry = Registry::with_book(&config, ProtocolSet::uniform(), controls.clone(), book).await?;

    let running = registry.running();
    if running.is_empty() {
        println!("⚠️  No server could be started");
    } else {
        for kind in &running {
            if let Some(server) = registry.server(*kind) {
                println!("   {} on port {}", kind, server.port());
            }
        }
    }

    let dispatch = if config.node.indexes {
        let markers = Arc::new(FileMarkerStore::new(config.node.data_dir.join(INDEX_MARKER_FILE)));
        let dispatch = Arc::new(IndexDispatch::start(Arc::new(LogIndexer), markers, controls.clone())?);
        registry.attach_index(&dispatch);
        Some(dispatch)
    } else {
        None
    };

    loop {
        match signals.next().await? {
            Signal::Shutdown => break,
            Signal::CloseListening => registry.close_listening().await,
            Signal::OpenListening => registry.open_listening().await,
        }
    }

    println!("\n📴 Shutting down node...");
    registry.shutdown().await;
    if let Some(dispatch) = dispatch {
        dispatch.join().await;
    }

    Ok(())
}
