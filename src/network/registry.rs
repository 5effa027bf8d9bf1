//! Process-wide set of protocol servers
//!
//! The [`Registry`] is built once at startup from the node configuration
//! and passed to whatever needs cross-protocol access. It owns one
//! [`Server`] per enabled protocol plus the resources they share: the TLS
//! context and the process controls. Address books are not shared: each
//! server dials and answers peer requests from its own protocol's book.

use crate::config::{NodeConfig, ProtocolKind, ServerConfig};
use crate::indexing::IndexDispatch;
use crate::network::connection::Connection;
use crate::network::controls::Controls;
use crate::network::discovery::{AddressBook, BookError};
use crate::network::protocol::{BasicProtocol, Protocol};
use crate::network::server::{Server, ServerError};
use crate::network::tls::TlsContext;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Order in which listeners are closed
const CLOSE_ORDER: [ProtocolKind; 7] = [
    ProtocolKind::Lookup,
    ProtocolKind::Data,
    ProtocolKind::Time,
    ProtocolKind::Api,
    ProtocolKind::Rpc,
    ProtocolKind::Mining,
    ProtocolKind::File,
];

/// Order in which listeners are reopened
const OPEN_ORDER: [ProtocolKind; 7] = [
    ProtocolKind::Api,
    ProtocolKind::Lookup,
    ProtocolKind::Data,
    ProtocolKind::Time,
    ProtocolKind::Rpc,
    ProtocolKind::Mining,
    ProtocolKind::File,
];

/// Order in which servers are stopped
const SHUTDOWN_ORDER: [ProtocolKind; 7] = [
    ProtocolKind::Time,
    ProtocolKind::Mining,
    ProtocolKind::Api,
    ProtocolKind::Rpc,
    ProtocolKind::Data,
    ProtocolKind::Lookup,
    ProtocolKind::File,
];

/// Registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Address book error: {0}")]
    Book(#[from] BookError),
    #[error("{0} server is not running")]
    NotRunning(ProtocolKind),
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Protocol handler for each kind of server
#[derive(Default, Clone)]
pub struct ProtocolSet {
    protocols: HashMap<ProtocolKind, Arc<dyn Protocol>>,
}

impl ProtocolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: ProtocolKind, protocol: Arc<dyn Protocol>) -> Self {
        self.protocols.insert(kind, protocol);
        self
    }

    /// [`BasicProtocol`] for every kind
    pub fn uniform() -> Self {
        ProtocolKind::ALL.iter().fold(Self::new(), |set, kind| {
            set.with(*kind, Arc::new(BasicProtocol::new(kind.name())))
        })
    }

    pub fn get(&self, kind: ProtocolKind) -> Option<Arc<dyn Protocol>> {
        self.protocols.get(&kind).cloned()
    }
}

/// One server per enabled protocol
pub struct Registry {
    controls: Controls,
    book: AddressBook,
    books: BTreeMap<ProtocolKind, AddressBook>,
    tls: Mutex<Option<TlsContext>>,
    servers: BTreeMap<ProtocolKind, Server>,
}

impl Registry {
    /// Start a server for every protocol the configuration enables.
    ///
    /// A server that fails to start is logged and left out; the others run.
    pub async fn initialize(
        config: &NodeConfig,
        protocols: ProtocolSet,
        controls: Controls,
    ) -> Result<Self, RegistryError> {
        let book = AddressBook::open(&config.node.data_dir, config.node.allow_local_peers)?;
        Self::with_book(config, protocols, controls, book).await
    }

    /// [`Registry::initialize`] with an already opened address book.
    ///
    /// `book` serves the data protocol; every other protocol gets its own
    /// book next to it.
    pub async fn with_book(
        config: &NodeConfig,
        protocols: ProtocolSet,
        controls: Controls,
        book: AddressBook,
    ) -> Result<Self, RegistryError> {
        let tls = load_tls(config);
        let mut servers = BTreeMap::new();
        let mut books = BTreeMap::new();

        for kind in ProtocolKind::ALL {
            let cfg = match ServerConfig::for_kind(kind, config) {
                Ok(cfg) => cfg,
                Err(reason) => {
                    match kind {
                        ProtocolKind::Api => log::warn!("API SERVER DISABLED: {}", reason),
                        ProtocolKind::Rpc => log::warn!("RPC SERVER DISABLED: {}", reason),
                        _ => log::info!("{} server disabled: {}", kind, reason),
                    }
                    continue;
                }
            };

            let protocol = match protocols.get(kind) {
                Some(p) => p,
                None => {
                    log::info!("{} server has no protocol handler", kind);
                    continue;
                }
            };

            if kind == ProtocolKind::File {
                let root = config.node.file_root.as_deref().unwrap_or_else(|| std::path::Path::new("."));
                log::info!(
                    "HTTP SERVER ENABLED on port {}{} serving {}",
                    cfg.port,
                    if cfg.ssl { format!(" and {}", cfg.ssl_port) } else { String::new() },
                    root.display()
                );
            }

            log_policies(kind, &cfg);

            let server_book = match kind {
                ProtocolKind::Data => book.clone(),
                _ => book.for_protocol(kind.name())?,
            };

            let server_tls = if cfg.wants_tls() { tls.clone() } else { None };
            match Server::start(cfg, protocol, controls.clone(), server_book.clone(), server_tls).await {
                Ok(server) => {
                    servers.insert(kind, server);
                    books.insert(kind, server_book);
                }
                Err(e) => log::warn!("{} server failed to start: {}", kind, e),
            }
        }

        Ok(Self {
            controls,
            book,
            books,
            tls: Mutex::new(tls),
            servers,
        })
    }

    pub fn controls(&self) -> &Controls {
        &self.controls
    }

    /// The data protocol's address book
    pub fn book(&self) -> &AddressBook {
        &self.book
    }

    /// Address book a running server dials from
    pub fn book_for(&self, kind: ProtocolKind) -> Option<&AddressBook> {
        self.books.get(&kind)
    }

    pub fn server(&self, kind: ProtocolKind) -> Option<&Server> {
        self.servers.get(&kind)
    }

    /// Protocols with a running server
    pub fn running(&self) -> Vec<ProtocolKind> {
        self.servers.keys().copied().collect()
    }

    /// A live connection of `kind`, e.g. to sync from
    pub fn find_connection(&self, kind: ProtocolKind) -> Option<Arc<Connection>> {
        self.server(kind)?.any_connection()
    }

    /// Dial `addr` on the `kind` server
    pub async fn connect(&self, kind: ProtocolKind, addr: SocketAddr) -> Result<Arc<Connection>, RegistryError> {
        let server = self.server(kind).ok_or(RegistryError::NotRunning(kind))?;
        Ok(server.connect(addr).await?)
    }

    /// Let every server's protocol push received transaction hashes to `dispatch`
    pub fn attach_index(&self, dispatch: &Arc<IndexDispatch>) {
        for server in self.servers.values() {
            server.attach_index(Arc::clone(dispatch));
        }
    }

    /// Wake every task waiting for work
    pub fn release(&self) {
        self.controls.release();
        for server in self.servers.values() {
            server.release();
        }
    }

    /// Suspend the node and close every listener. Live connections stay.
    pub async fn close_listening(&self) {
        self.release();
        self.controls.suspend();

        for kind in CLOSE_ORDER {
            if let Some(server) = self.servers.get(&kind) {
                server.close_listening().await;
            }
        }
        log::info!("Listening closed, node suspended");
    }

    /// Reopen listeners, resume and have the data server redial
    pub async fn open_listening(&self) {
        if self.controls.is_shutdown() {
            return;
        }

        for kind in OPEN_ORDER {
            if let Some(server) = self.servers.get(&kind) {
                if let Err(e) = server.open_listening().await {
                    log::warn!("{} server could not reopen: {}", kind, e);
                }
            }
        }

        self.controls.resume();
        if let Some(data) = self.servers.get(&ProtocolKind::Data) {
            data.trigger_dial();
        }
        log::info!("Listening reopened, node resumed");
    }

    /// Stop every server, then release shared resources
    pub async fn shutdown(&self) {
        self.controls.request_shutdown();

        for kind in SHUTDOWN_ORDER {
            if let Some(server) = self.servers.get(&kind) {
                server.shutdown().await;
            }
        }

        let books = std::iter::once(&self.book).chain(
            self.books
                .iter()
                .filter(|(kind, _)| **kind != ProtocolKind::Data)
                .map(|(_, book)| book),
        );
        for book in books {
            if let Some(path) = book.path() {
                if let Err(e) = book.save().await {
                    log::warn!("Could not save address book {}: {}", path.display(), e);
                }
            }
        }

        if self.tls.lock().take().is_some() {
            log::info!("Releasing network resources");
        }
        log::info!("All servers stopped");
    }
}

fn load_tls(config: &NodeConfig) -> Option<TlsContext> {
    let (cert, key) = match (&config.tls.cert, &config.tls.key) {
        (Some(cert), Some(key)) => (cert, key),
        _ => return None,
    };

    match TlsContext::load(cert, key, config.tls.ca.as_deref()) {
        Ok(ctx) => {
            log::info!("TLS context loaded from {}", cert.display());
            Some(ctx)
        }
        Err(e) => {
            log::warn!("TLS unavailable: {}", e);
            None
        }
    }
}

fn log_policies(kind: ProtocolKind, cfg: &ServerConfig) {
    if cfg.ddos {
        let d = &cfg.ddos_settings;
        log::info!(
            "{} DDOS filter on: cscore {} rscore {} window {:?}",
            kind,
            d.connection_threshold,
            d.request_threshold,
            d.window
        );
    } else {
        log::info!("{} DDOS filter off", kind);
    }

    if !cfg.manager {
        log::info!("{} connection manager disabled", kind);
    }
}
