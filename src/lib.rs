//! peerlink: protocol-agnostic peer-to-peer networking core
//!
//! This crate provides:
//! - Non-blocking, optionally TLS-wrapped sockets with overflow buffering
//! - One connection server per protocol (data, lookup, time, file, API, RPC, mining)
//! - DDOS scoring and banning per remote address
//! - A persisted address book used to choose outbound peers
//! - Suspend/resume and cooperative shutdown of the whole node
//! - An indexing queue that resumes from its last-processed marker
//!
//! # Example
//!
//! ```no_run
//! use peerlink::config::NodeConfig;
//! use peerlink::network::{AddressBook, Controls, ProtocolSet, Registry};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NodeConfig::default();
//! let book = AddressBook::open(&config.node.data_dir, false)?;
//!
//! let registry = Registry::with_book(&config, ProtocolSet::uniform(), Controls::new(), book).await?;
//! println!("Running: {:?}", registry.running());
//!
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod indexing;
pub mod network;
pub mod storage;

// Re-export commonly used types
pub use config::{ConfigError, NodeConfig, ProtocolKind, ServerConfig};
pub use indexing::{IndexDispatch, Indexer};
pub use network::{
    Address, AddressBook, Connection, Controls, DdosFilter, Protocol, Registry, Server, Socket,
};
pub use storage::{FileMarkerStore, MarkerStore, StorageError};
