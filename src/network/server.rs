//! Connection manager for one protocol
//!
//! A [`Server`] owns its listeners, a fixed pool of worker tasks, the live
//! connection table and, when enabled, the outbound-dial manager. Accepted
//! and dialed connections are registered in the live table and handed to a
//! worker round-robin.
//!
//! Lifecycle: `start` → Listening → `close_listening` → Suspended →
//! `open_listening` → Listening, and `shutdown` → Stopped from anywhere.

use crate::config::ServerConfig;
use crate::indexing::IndexDispatch;
use crate::network::address::canonical;
use crate::network::connection::{Connection, ConnectionId, DisconnectReason, Origin};
use crate::network::controls::Controls;
use crate::network::ddos::DdosFilter;
use crate::network::discovery::AddressBook;
use crate::network::protocol::Protocol;
use crate::network::socket::{Socket, SocketError};
use crate::network::tls::{TlsContext, TlsError};
use crate::network::{manager, worker};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Listen backlog
const BACKLOG: u32 = 1024;

/// Pause after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Bind failed on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("TLS enabled but no TLS context is configured")]
    TlsUnavailable,
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
    #[error("Server {0} is stopped")]
    Stopped(String),
    #[error("Connection limit reached")]
    Full,
    #[error("Address {0} is banned")]
    Banned(IpAddr),
    #[error("Already connected to {0}")]
    AlreadyConnected(SocketAddr),
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),
}

/// Where a server is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Listening,
    Suspended,
    Stopped,
}

/// Server counters
#[derive(Debug, Default)]
pub struct ServerStats {
    pub accepted: AtomicU64,
    pub refused: AtomicU64,
    pub requests: AtomicU64,
    pub dial_attempts: AtomicU64,
    pub dial_failures: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub refused: u64,
    pub requests: u64,
    pub dial_attempts: u64,
    pub dial_failures: u64,
}

impl ServerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            dial_attempts: self.dial_attempts.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
        }
    }
}

/// Running listener tasks
#[derive(Default)]
struct Listeners {
    stop: Option<CancellationToken>,
    handles: Vec<JoinHandle<()>>,
}

/// State shared by the server's tasks
pub(crate) struct Inner {
    pub(crate) config: ServerConfig,
    pub(crate) protocol: Arc<dyn Protocol>,
    pub(crate) controls: Controls,
    pub(crate) cancel: CancellationToken,
    pub(crate) tls: Option<TlsContext>,
    pub(crate) book: AddressBook,
    pub(crate) ddos: Option<DdosFilter>,
    pub(crate) stats: ServerStats,
    /// Wakes workers and the manager so they re-check flags
    pub(crate) wake: Notify,
    /// Asks the manager for an immediate dial pass
    pub(crate) dial_now: Notify,
    /// Queue for transaction hashes the protocol receives
    pub(crate) index: OnceCell<Arc<IndexDispatch>>,
    live: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    /// Slots held by handshakes and dials that are not registered yet
    pending_inbound: AtomicU32,
    pending_outbound: AtomicU32,
    /// Held while limits are checked and a slot is taken or filled
    admission: Mutex<()>,
    workers: Vec<mpsc::UnboundedSender<Arc<Connection>>>,
    next_worker: AtomicUsize,
    state: Mutex<ServerState>,
    listeners: Mutex<Listeners>,
    /// Bound ports, kept so reopened listeners use the same ones
    ports: Mutex<(u16, u16)>,
}

/// A connection slot held until the connection is registered or given up
struct Reservation {
    inner: Arc<Inner>,
    origin: Origin,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let pending = match self.origin {
            Origin::Inbound => &self.inner.pending_inbound,
            Origin::Outbound => &self.inner.pending_outbound,
        };
        pending.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Inner {
    /// (inbound, total) connections, counting slots still being set up
    pub(crate) fn counts(&self) -> (u32, u32) {
        let live = self.live.read();
        let inbound = live
            .values()
            .filter(|c| c.origin() == Origin::Inbound)
            .count() as u32;
        let pending_in = self.pending_inbound.load(Ordering::Acquire);
        let pending_out = self.pending_outbound.load(Ordering::Acquire);
        (inbound + pending_in, live.len() as u32 + pending_in + pending_out)
    }

    /// Take a slot if the connection limits allow one more `origin` connection
    fn reserve(self: &Arc<Self>, origin: Origin) -> Option<Reservation> {
        let _admission = self.admission.lock();
        let (inbound, total) = self.counts();
        if total >= self.config.max_connections {
            return None;
        }
        match origin {
            Origin::Inbound if inbound >= self.config.max_incoming => return None,
            Origin::Inbound => self.pending_inbound.fetch_add(1, Ordering::AcqRel),
            Origin::Outbound => self.pending_outbound.fetch_add(1, Ordering::AcqRel),
        };
        Some(Reservation {
            inner: Arc::clone(self),
            origin,
        })
    }

    pub(crate) fn connection_to(&self, addr: &SocketAddr) -> Option<Arc<Connection>> {
        let target = canonical(*addr);
        self.live
            .read()
            .values()
            .find(|c| c.is_connected() && canonical(c.peer_addr()) == target)
            .cloned()
    }

    pub(crate) fn connected_endpoints(&self) -> Vec<SocketAddr> {
        self.live
            .read()
            .values()
            .map(|c| canonical(c.peer_addr()))
            .collect()
    }

    pub(crate) fn is_banned(&self, ip: &IpAddr) -> bool {
        self.ddos.as_ref().map_or(false, |f| f.is_banned(ip))
    }

    fn is_stopped(&self) -> bool {
        *self.state.lock() == ServerState::Stopped
    }

    /// Fill the reserved slot in the live table and hand to a worker
    fn register(&self, socket: Socket, reservation: Reservation) -> Arc<Connection> {
        let origin = reservation.origin;
        let conn = Arc::new(Connection::new(socket, origin));
        {
            let _admission = self.admission.lock();
            self.live.write().insert(conn.id(), Arc::clone(&conn));
            drop(reservation);
        }

        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        if self.workers[index].send(Arc::clone(&conn)).is_err() {
            self.live.write().remove(&conn.id());
            conn.disconnect(DisconnectReason::Shutdown);
        } else {
            log::debug!(
                "{} {:?} connection {} from {} on worker {}",
                self.config.name,
                origin,
                conn.id(),
                conn.peer_addr(),
                index
            );
        }
        conn
    }

    /// Drop a connection from the table and tell the protocol
    pub(crate) fn remove(&self, conn: &Arc<Connection>, reason: DisconnectReason) {
        conn.disconnect(reason);
        if self.live.write().remove(&conn.id()).is_some() {
            let reason = conn.reason().unwrap_or(reason);
            self.protocol.on_disconnect(conn, reason);
        }
    }

    fn refuse(&self, peer: SocketAddr, why: &str) {
        self.stats.refused.fetch_add(1, Ordering::Relaxed);
        log::debug!("{} refused {}: {}", self.config.name, peer, why);
    }

    /// Admission checks for an accepted stream
    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, secure: bool) {
        if self.controls.is_suspended() || self.is_stopped() {
            return self.refuse(peer, "not accepting");
        }

        let ip = canonical(peer).ip();
        if !self.config.remote && !ip.is_loopback() {
            return self.refuse(peer, "remote connections disabled");
        }

        if let Some(filter) = &self.ddos {
            if filter.is_banned(&ip) {
                return self.refuse(peer, "banned");
            }
        }

        // Handshaking connections hold their slot until registered
        let reservation = match self.reserve(Origin::Inbound) {
            Some(reservation) => reservation,
            None => return self.refuse(peer, "connection limit"),
        };

        // Scored after admission so crossing the threshold bans later attempts
        if let Some(filter) = &self.ddos {
            filter.score_connection(ip);
        }
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);

        if !secure {
            match Socket::from_stream(stream, None, self.config.max_send) {
                Ok(socket) => {
                    self.register(socket, reservation);
                }
                Err(e) => log::debug!("{} dropped {}: {}", self.config.name, peer, e),
            }
            return;
        }

        // TLS handshakes run off the accept loop
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = async {
                let session = match &inner.tls {
                    Some(ctx) => ctx.accept()?,
                    None => return Err(ServerError::TlsUnavailable),
                };
                let socket = Socket::from_stream(stream, Some(session), inner.config.max_send)?;
                let deadline = tokio::time::Instant::now() + inner.config.connect_timeout;
                socket.handshake(deadline, &inner.cancel).await?;
                Ok(socket)
            }
            .await;

            match result {
                Ok(socket) => {
                    inner.register(socket, reservation);
                }
                Err(e) => log::debug!("{} TLS accept from {} failed: {}", inner.config.name, peer, e),
            }
        });
    }

    /// Dial `addr` and register the connection
    pub(crate) async fn dial(self: &Arc<Self>, addr: SocketAddr) -> Result<Arc<Connection>, ServerError> {
        if self.is_stopped() || self.cancel.is_cancelled() {
            return Err(ServerError::Stopped(self.config.name.clone()));
        }
        if self.is_banned(&canonical(addr).ip()) {
            return Err(ServerError::Banned(addr.ip()));
        }
        if self.connection_to(&addr).is_some() {
            return Err(ServerError::AlreadyConnected(addr));
        }
        let tls = if self.config.ssl_required {
            Some(self.tls.as_ref().ok_or(ServerError::TlsUnavailable)?)
        } else {
            None
        };
        let reservation = self.reserve(Origin::Outbound).ok_or(ServerError::Full)?;

        self.stats.dial_attempts.fetch_add(1, Ordering::Relaxed);
        self.book.attempt(&addr).await;

        match Socket::attempt(addr, self.config.connect_timeout, tls, self.config.max_send, &self.cancel).await {
            Ok(socket) => {
                self.book.good(&addr).await;
                Ok(self.register(socket, reservation))
            }
            Err(e) => {
                self.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
                log::debug!("{} dial {} failed: {}", self.config.name, addr, e);
                Err(e.into())
            }
        }
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(BACKLOG)
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener, secure: bool, stop: CancellationToken) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => inner.admit(stream, peer, secure),
                Err(e) => {
                    log::debug!("{} accept failed: {}", inner.config.name, e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

/// One protocol's connection manager
pub struct Server {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Spawn workers, manager and maintenance, then open the listeners
    pub async fn start(
        config: ServerConfig,
        protocol: Arc<dyn Protocol>,
        controls: Controls,
        book: AddressBook,
        tls: Option<TlsContext>,
    ) -> Result<Self, ServerError> {
        if config.wants_tls() && tls.is_none() {
            return Err(ServerError::TlsUnavailable);
        }

        let threads = config.threads.max(1);
        let mut senders = Vec::with_capacity(threads);
        let mut receivers = Vec::with_capacity(threads);
        for _ in 0..threads {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            receivers.push(rx);
        }

        let ddos = config.ddos.then(|| DdosFilter::new(config.ddos_settings.clone()));
        let ports = (config.port, config.ssl_port);

        let inner = Arc::new(Inner {
            cancel: controls.child_token(),
            controls,
            protocol,
            tls,
            book,
            ddos,
            stats: ServerStats::default(),
            wake: Notify::new(),
            dial_now: Notify::new(),
            index: OnceCell::new(),
            live: RwLock::new(HashMap::new()),
            pending_inbound: AtomicU32::new(0),
            pending_outbound: AtomicU32::new(0),
            admission: Mutex::new(()),
            workers: senders,
            next_worker: AtomicUsize::new(0),
            state: Mutex::new(ServerState::Listening),
            listeners: Mutex::new(Listeners::default()),
            ports: Mutex::new(ports),
            config,
        });

        let mut tasks = Vec::new();
        for (index, rx) in receivers.into_iter().enumerate() {
            tasks.push(tokio::spawn(worker::run(Arc::clone(&inner), index, rx)));
        }
        if inner.config.manager {
            tasks.push(tokio::spawn(manager::run(Arc::clone(&inner))));
        }
        tasks.push(tokio::spawn(manager::maintain(Arc::clone(&inner))));

        let server = Self {
            inner,
            tasks: Mutex::new(tasks),
        };

        if server.inner.config.listen {
            if let Err(e) = server.bind_all() {
                server.shutdown().await;
                return Err(e);
            }
        }

        log::info!(
            "{} server started: {} workers, listening {}",
            server.inner.protocol.name(),
            threads,
            server.describe_listeners()
        );
        Ok(server)
    }

    fn describe_listeners(&self) -> String {
        let cfg = &self.inner.config;
        if !cfg.listen {
            return "disabled".to_string();
        }
        let (port, ssl_port) = *self.inner.ports.lock();
        match (cfg.ssl_required, ssl_port) {
            (true, p) => format!("tls:{}", p),
            (false, 0) => format!("{}", port),
            (false, p) => format!("{} tls:{}", port, p),
        }
    }

    /// Bind every configured listener and spawn its accept loop
    fn bind_all(&self) -> Result<(), ServerError> {
        let cfg = &self.inner.config;
        let (port, ssl_port) = *self.inner.ports.lock();

        let mut plan = Vec::new();
        if !cfg.ssl_required {
            plan.push((SocketAddr::new(cfg.bind, port), false));
        }
        if cfg.wants_tls() {
            plan.push((SocketAddr::new(cfg.bind, ssl_port), true));
        }

        let mut bound = Vec::new();
        for (addr, secure) in plan {
            let listener = bind_listener(addr).map_err(|source| ServerError::Bind { addr, source })?;
            bound.push((listener, secure));
        }

        let stop = self.inner.cancel.child_token();
        let mut handles = Vec::new();
        let mut ports = self.inner.ports.lock();
        for (listener, secure) in bound {
            if let Ok(local) = listener.local_addr() {
                if secure {
                    ports.1 = local.port();
                } else {
                    ports.0 = local.port();
                }
            }
            handles.push(tokio::spawn(accept_loop(
                Arc::clone(&self.inner),
                listener,
                secure,
                stop.clone(),
            )));
        }

        *self.inner.listeners.lock() = Listeners {
            stop: Some(stop),
            handles,
        };
        Ok(())
    }

    /// Stop accepting. Live connections, workers and the manager keep running.
    pub async fn close_listening(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state != ServerState::Listening {
                return;
            }
            *state = ServerState::Suspended;
        }

        let listeners = std::mem::take(&mut *self.inner.listeners.lock());
        if let Some(stop) = listeners.stop {
            stop.cancel();
        }
        for handle in listeners.handles {
            let _ = handle.await;
        }
        log::debug!("{} listeners closed", self.inner.config.name);
    }

    /// Reopen listeners on the ports they had before
    pub async fn open_listening(&self) -> Result<(), ServerError> {
        // Held throughout so a concurrent shutdown lands before or after
        let mut state = self.inner.state.lock();
        match *state {
            ServerState::Stopped => return Err(ServerError::Stopped(self.inner.config.name.clone())),
            ServerState::Listening => return Ok(()),
            ServerState::Suspended => {}
        }

        if self.inner.config.listen {
            self.bind_all()?;
        }
        *state = ServerState::Listening;
        drop(state);
        log::debug!("{} listeners open", self.inner.config.name);
        Ok(())
    }

    /// Wake every task waiting for work so it re-checks flags
    pub fn release(&self) {
        self.inner.wake.notify_waiters();
    }

    /// Hand received transaction hashes to `dispatch`. Only the first call takes effect.
    pub fn attach_index(&self, dispatch: Arc<IndexDispatch>) -> bool {
        self.inner.index.set(dispatch).is_ok()
    }

    /// Ask the manager for a dial pass now
    pub fn trigger_dial(&self) {
        self.inner.dial_now.notify_one();
    }

    /// Stop everything and close all connections
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == ServerState::Stopped {
                return;
            }
            *state = ServerState::Stopped;
        }

        self.inner.cancel.cancel();
        self.inner.wake.notify_waiters();

        let listeners = std::mem::take(&mut *self.inner.listeners.lock());
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for handle in listeners.handles.into_iter().chain(tasks) {
            if let Err(e) = handle.await {
                log::warn!("{} task ended abnormally: {}", self.inner.config.name, e);
            }
        }

        // Registered but never picked up by a worker
        let leftover: Vec<_> = self.inner.live.read().values().cloned().collect();
        for conn in leftover {
            self.inner.remove(&conn, DisconnectReason::Shutdown);
        }

        log::info!("{} server stopped", self.inner.protocol.name());
    }

    /// Dial a peer now
    pub async fn connect(&self, addr: SocketAddr) -> Result<Arc<Connection>, ServerError> {
        self.inner.dial(addr).await
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ServerState {
        *self.inner.state.lock()
    }

    /// Plain listener port (resolved if configured as 0)
    pub fn port(&self) -> u16 {
        self.inner.ports.lock().0
    }

    pub fn ssl_port(&self) -> u16 {
        self.inner.ports.lock().1
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn ddos(&self) -> Option<&DdosFilter> {
        self.inner.ddos.as_ref()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.live.read().len()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.live.read().values().cloned().collect()
    }

    /// Live connection to `addr`, if any
    pub fn connection_to(&self, addr: &SocketAddr) -> Option<Arc<Connection>> {
        self.inner.connection_to(addr)
    }

    /// Any connected connection
    pub fn any_connection(&self) -> Option<Arc<Connection>> {
        self.inner
            .live
            .read()
            .values()
            .find(|c| c.is_connected())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexing::LogIndexer;
    use crate::network::ddos::DdosSettings;
    use crate::network::protocol::{BasicMessage, BasicProtocol, PacketCodec};
    use crate::network::socket::MTU;
    use crate::storage::{FileMarkerStore, MarkerStore};
    use bytes::{Bytes, BytesMut};
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::codec::Encoder;

    fn local_config(name: &str) -> ServerConfig {
        let mut cfg = ServerConfig::new(name, 0);
        cfg.bind = IpAddr::V4(Ipv4Addr::LOCALHOST);
        cfg.threads = 2;
        cfg
    }

    async fn start(cfg: ServerConfig, controls: &Controls) -> Server {
        start_with_tls(cfg, controls, None).await
    }

    async fn start_with_tls(cfg: ServerConfig, controls: &Controls, tls: Option<TlsContext>) -> Server {
        let protocol = Arc::new(BasicProtocol::new(cfg.name.clone()));
        Server::start(cfg, protocol, controls.clone(), AddressBook::new(true), tls)
            .await
            .unwrap()
    }

    fn tls_only_config(name: &str) -> ServerConfig {
        let mut cfg = local_config(name);
        cfg.ssl = true;
        cfg.ssl_required = true;
        cfg.ssl_port = 0;
        cfg
    }

    async fn read_len(socket: &Socket, len: usize) -> Vec<u8> {
        let mut received = Vec::with_capacity(len);
        let mut buf = vec![0u8; 4096];
        while received.len() < len {
            let n = socket.read(&mut buf).unwrap();
            if n == 0 {
                let _ = tokio::time::timeout(Duration::from_millis(50), socket.readable()).await;
            }
            received.extend_from_slice(&buf[..n]);
        }
        received
    }

    fn local(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    fn frame(msg: &BasicMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        PacketCodec::default().encode(msg.to_bytes(), &mut buf).unwrap();
        buf
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let controls = Controls::new();
        let server = start(local_config("data"), &controls).await;

        let mut client = TcpStream::connect(local(server.port())).await.unwrap();
        client.write_all(&frame(&BasicMessage::Ping(42))).await.unwrap();

        let expected = frame(&BasicMessage::Pong(42));
        let mut reply = vec![0u8; expected.len()];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Bytes::from(reply), expected.freeze());

        assert!(wait_for(|| server.stats().requests == 1).await);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_ddos_connection_limits() {
        let controls = Controls::new();
        let mut cfg = local_config("data");
        cfg.max_connections = 2;
        cfg.max_incoming = 1;
        cfg.ddos = true;
        cfg.ddos_settings = DdosSettings {
            connection_threshold: 1,
            window: Duration::from_secs(10),
            ..Default::default()
        };
        let server = start(cfg, &controls).await;

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(local(server.port())).await.unwrap());
        }

        assert!(wait_for(|| {
            let s = server.stats();
            s.accepted + s.refused == 3
        })
        .await);

        let stats = server.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.refused, 2);
        assert_eq!(server.connection_count(), 1);
        assert!(server.ddos().unwrap().is_banned(&IpAddr::V4(Ipv4Addr::LOCALHOST)));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_connects_respect_max_incoming() {
        let controls = Controls::new();
        let mut cfg = local_config("data");
        cfg.max_incoming = 1;
        cfg.max_connections = 4;
        let server = start(cfg, &controls).await;

        let connects = (0..5).map(|_| TcpStream::connect(local(server.port())));
        let clients = futures::future::join_all(connects).await;
        assert!(clients.iter().all(|c| c.is_ok()));

        assert!(wait_for(|| {
            let s = server.stats();
            s.accepted + s.refused == 5
        })
        .await);

        let stats = server.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.refused, 4);
        assert_eq!(server.connection_count(), 1);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_tls_ping_pong() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ctx = crate::network::tls::self_signed(temp_dir.path());
        let controls = Controls::new();
        let server = start_with_tls(tls_only_config("data"), &controls, Some(ctx.clone())).await;
        assert_eq!(server.port(), 0);
        assert_ne!(server.ssl_port(), 0);

        let cancel = CancellationToken::new();
        let client = Socket::attempt(local(server.ssl_port()), Duration::from_secs(2), Some(&ctx), MTU, &cancel)
            .await
            .unwrap();
        client.write(&frame(&BasicMessage::Ping(5))).unwrap();

        let expected = frame(&BasicMessage::Pong(5));
        let reply = tokio::time::timeout(Duration::from_secs(2), read_len(&client, expected.len()))
            .await
            .unwrap();
        assert_eq!(Bytes::from(reply), expected.freeze());
        assert!(server.connections().iter().all(|c| c.socket().is_tls()));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_tls_handshakes_respect_max_incoming() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ctx = crate::network::tls::self_signed(temp_dir.path());
        let controls = Controls::new();
        let mut cfg = tls_only_config("data");
        cfg.max_incoming = 1;
        cfg.max_connections = 4;
        let server = start_with_tls(cfg, &controls, Some(ctx.clone())).await;

        let addr = local(server.ssl_port());
        let cancel = CancellationToken::new();
        let timeout = Duration::from_secs(2);
        let (a, b, c) = tokio::join!(
            Socket::attempt(addr, timeout, Some(&ctx), MTU, &cancel),
            Socket::attempt(addr, timeout, Some(&ctx), MTU, &cancel),
            Socket::attempt(addr, timeout, Some(&ctx), MTU, &cancel),
        );
        let established = [&a, &b, &c].iter().filter(|r| r.is_ok()).count();

        assert!(wait_for(|| {
            let s = server.stats();
            s.accepted + s.refused == 3
        })
        .await);
        assert!(wait_for(|| server.connection_count() == 1).await);

        let stats = server.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.refused, 2);
        assert_eq!(established, 1);
        assert!(server.connection_count() <= 1);

        server.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_wins_over_concurrent_reopen() {
        for _ in 0..20 {
            let server = Arc::new(start(local_config("data"), &Controls::new()).await);
            server.close_listening().await;

            let reopen = {
                let server = Arc::clone(&server);
                tokio::spawn(async move { server.open_listening().await })
            };
            server.shutdown().await;
            let _ = reopen.await.unwrap();

            assert_eq!(server.state(), ServerState::Stopped);
            assert!(matches!(
                server.open_listening().await,
                Err(ServerError::Stopped(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_transactions_reach_index_queue() {
        let temp_dir = tempfile::tempdir().unwrap();
        let controls = Controls::new();
        let server = start(local_config("data"), &controls).await;

        let markers = Arc::new(FileMarkerStore::new(temp_dir.path().join("last_index")));
        let dispatch = Arc::new(IndexDispatch::start(Arc::new(LogIndexer), markers.clone(), controls.clone()).unwrap());
        assert!(server.attach_index(Arc::clone(&dispatch)));
        assert!(!server.attach_index(Arc::clone(&dispatch)));

        let mut client = TcpStream::connect(local(server.port())).await.unwrap();
        client.write_all(&frame(&BasicMessage::Tx([7u8; 32]))).await.unwrap();

        assert!(wait_for(|| dispatch.processed() == 1).await);
        assert_eq!(markers.read_last().unwrap(), Some(vec![7u8; 32]));

        server.shutdown().await;
        controls.request_shutdown();
        dispatch.join().await;
    }

    #[tokio::test]
    async fn test_close_and_reopen_keeps_connections() {
        let controls = Controls::new();
        let server = start(local_config("data"), &controls).await;
        let port = server.port();

        let mut client = TcpStream::connect(local(port)).await.unwrap();
        assert!(wait_for(|| server.connection_count() == 1).await);

        server.close_listening().await;
        assert_eq!(server.state(), ServerState::Suspended);
        assert!(TcpStream::connect(local(port)).await.is_err());
        assert_eq!(server.connection_count(), 1);

        server.open_listening().await.unwrap();
        assert_eq!(server.state(), ServerState::Listening);
        assert_eq!(server.port(), port);

        // The old connection still works
        client.write_all(&frame(&BasicMessage::Ping(7))).await.unwrap();
        let expected = frame(&BasicMessage::Pong(7));
        let mut reply = vec![0u8; expected.len()];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server.connection_count(), 1);

        // And new ones are accepted again
        let _second = TcpStream::connect(local(port)).await.unwrap();
        assert!(wait_for(|| server.connection_count() == 2).await);

        server.shutdown().await;
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.connection_count(), 0);
        assert!(matches!(
            server.open_listening().await,
            Err(ServerError::Stopped(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_policy_allows_loopback() {
        let controls = Controls::new();
        let mut cfg = local_config("api");
        cfg.remote = false;
        let server = start(cfg, &controls).await;

        let _client = TcpStream::connect(local(server.port())).await.unwrap();
        assert!(wait_for(|| server.stats().accepted == 1).await);
        assert_eq!(server.stats().refused, 0);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_connections_time_out() {
        let controls = Controls::new();
        let mut cfg = local_config("data");
        cfg.socket_timeout = Duration::from_millis(300);
        let server = start(cfg, &controls).await;

        let mut client = TcpStream::connect(local(server.port())).await.unwrap();
        assert!(wait_for(|| server.connection_count() == 1).await);

        let mut buf = [0u8; 1];
        let closed = tokio::time::timeout(Duration::from_secs(3), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(closed, Ok(0) | Err(_)));
        assert!(wait_for(|| server.connection_count() == 0).await);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_dial_and_duplicate() {
        let controls = Controls::new();
        let target = start(local_config("target"), &controls).await;

        let mut cfg = local_config("dialer");
        cfg.listen = false;
        let dialer = start(cfg, &controls).await;

        let addr = local(target.port());
        let conn = dialer.connect(addr).await.unwrap();
        assert!(conn.is_outbound());
        assert!(dialer.connection_to(&addr).is_some());
        assert!(matches!(
            dialer.connect(addr).await,
            Err(ServerError::AlreadyConnected(_))
        ));
        assert_eq!(dialer.stats().dial_attempts, 1);

        dialer.shutdown().await;
        target.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_fails_construction() {
        let controls = Controls::new();
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let mut cfg = local_config("data");
        cfg.port = port;
        let book = AddressBook::new(true);
        let protocol = Arc::new(BasicProtocol::new("data"));
        let result = Server::start(cfg, protocol, controls, book, None).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_tls_without_context_fails() {
        let mut cfg = local_config("api");
        cfg.ssl = true;
        cfg.ssl_port = 0;
        cfg.ssl_required = true;
        let book = AddressBook::new(true);
        let protocol = Arc::new(BasicProtocol::new("api"));
        let result = Server::start(cfg, protocol, Controls::new(), book, None).await;
        assert!(matches!(result, Err(ServerError::TlsUnavailable)));
    }
}
