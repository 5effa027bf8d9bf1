//! P2P networking core
//!
//! # Features
//! - Non-blocking TCP sockets with optional TLS and a FIFO overflow buffer
//! - Per-protocol servers with worker pools, listeners and a dial manager
//! - Sliding-window DDOS admission control
//! - Persistent address book for peer discovery
//! - Registry of every protocol server in the process

pub mod address;
pub mod addrman;
pub mod connection;
pub mod controls;
pub mod ddos;
pub mod discovery;
mod manager;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod socket;
pub mod tls;
mod worker;

pub use address::{Address, AddressError, ServiceFlags};
pub use addrman::{AddrEntry, AddrManager, SelectOptions};
pub use connection::{Connection, ConnectionId, DisconnectReason, Origin, SESSION_ID};
pub use controls::Controls;
pub use ddos::{DdosFilter, DdosSettings, ScoreKind};
pub use discovery::{AddressBook, BookError, PEERS_FILE};
pub use manager::MAINTENANCE_INTERVAL;
pub use protocol::{
    BasicMessage, BasicProtocol, Framer, HandlerContext, PacketCodec, Protocol, ProtocolError,
};
pub use registry::{ProtocolSet, Registry, RegistryError};
pub use server::{Server, ServerError, ServerState, StatsSnapshot};
pub use socket::{Direction, Socket, SocketError, SocketInfo, MTU};
pub use tls::{TlsContext, TlsError};
