//! Live connections
//!
//! A [`Connection`] owns one [`Socket`] and is shared between the live table,
//! its worker and protocol handlers. It is either connected or closed; once
//! closed it is never reused.

use crate::network::socket::{Socket, SocketError, SocketInfo};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Random per-process session identifier
pub static SESSION_ID: Lazy<u64> = Lazy::new(rand::random);

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Unique connection identifier: process session plus a monotonic sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    pub session: u64,
    pub seq: u64,
}

impl ConnectionId {
    pub fn next() -> Self {
        Self {
            session: *SESSION_ID,
            seq: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{}", self.session, self.seq)
    }
}

/// Who opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Inbound,
    Outbound,
}

/// Why a connection went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Idle past the socket timeout
    Timeout,
    /// Remote closed the stream
    PeerClosed,
    /// Socket fault
    Errors,
    /// Protocol handler gave up on it
    Protocol,
    /// DDOS score crossed the threshold
    Ddos,
    /// Server shutting down
    Shutdown,
    /// Closed by a handler or operator
    Forced,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::PeerClosed => "peer closed",
            DisconnectReason::Errors => "errors",
            DisconnectReason::Protocol => "protocol",
            DisconnectReason::Ddos => "ddos",
            DisconnectReason::Shutdown => "shutdown",
            DisconnectReason::Forced => "forced",
        };
        f.write_str(s)
    }
}

/// One live peer connection
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    origin: Origin,
    socket: Socket,
    closed: AtomicBool,
    reason: Mutex<Option<DisconnectReason>>,
    connected_at: Instant,
    packets: AtomicU64,
}

impl Connection {
    pub fn new(socket: Socket, origin: Origin) -> Self {
        Self {
            id: ConnectionId::next(),
            origin,
            socket,
            closed: AtomicBool::new(false),
            reason: Mutex::new(None),
            connected_at: Instant::now(),
            packets: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn is_outbound(&self) -> bool {
        self.origin == Origin::Outbound
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.socket.peer_addr()
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn info(&self) -> SocketInfo {
        self.socket.info()
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Queue bytes for the remote end
    pub fn send(&self, data: &[u8]) -> Result<(), SocketError> {
        if !self.is_connected() {
            return Err(SocketError::Closed);
        }
        self.socket.write(data)?;
        Ok(())
    }

    /// Close the connection. The first reason given sticks.
    pub fn disconnect(&self, reason: DisconnectReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        *self.reason.lock() = Some(reason);
        self.socket.close();
        log::debug!("Connection {} to {} closed ({})", self.id, self.peer_addr(), reason);
    }

    /// Reason recorded by [`Connection::disconnect`]
    pub fn reason(&self) -> Option<DisconnectReason> {
        *self.reason.lock()
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }

    pub(crate) fn count_packet(&self) {
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::socket::MTU;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    async fn connection() -> (Connection, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let (dialed, accepted) = tokio::join!(
            Socket::attempt(addr, Duration::from_secs(2), None, MTU, &cancel),
            listener.accept()
        );
        (
            Connection::new(dialed.unwrap(), Origin::Outbound),
            accepted.unwrap().0,
        )
    }

    #[test]
    fn test_ids_are_monotonic() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_eq!(a.session, b.session);
        assert!(b.seq > a.seq);
        assert_ne!(a.to_string(), b.to_string());
    }

    #[tokio::test]
    async fn test_disconnect_once() {
        let (conn, _peer) = connection().await;
        assert!(conn.is_connected());
        assert!(conn.is_outbound());

        conn.disconnect(DisconnectReason::Timeout);
        conn.disconnect(DisconnectReason::Ddos);

        assert!(!conn.is_connected());
        assert_eq!(conn.reason(), Some(DisconnectReason::Timeout));
        assert!(conn.socket().is_closed());
        assert!(matches!(conn.send(b"late"), Err(SocketError::Closed)));
    }
}
