//! Per-protocol address books
//!
//! Wraps [`AddrManager`] behind an async lock, feeds it the addresses that
//! protocol handlers discover, and persists it so the peer set survives
//! restarts. Each dialing protocol keeps its own book: the data protocol's
//! lives in `peers.json`, the others in `peers_<protocol>.json` beside it.

use crate::network::address::{unix_now, Address};
use crate::network::addrman::{AddrEntry, AddrManager, SelectOptions, DEFAULT_MAX_AGE_SECS};
use crate::storage::{load_json, save_json, StorageError};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// File name of the persisted book inside the data directory
pub const PEERS_FILE: &str = "peers.json";

/// Address book errors
#[derive(Error, Debug)]
pub enum BookError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Address book has no backing file")]
    NotPersistent,
}

/// Persisted, concurrently shared address book
#[derive(Debug, Clone)]
pub struct AddressBook {
    inner: Arc<RwLock<AddrManager>>,
    path: Option<PathBuf>,
    allow_local: bool,
}

impl AddressBook {
    /// In-memory book
    pub fn new(allow_local: bool) -> Self {
        Self {
            inner: Arc::new(RwLock::new(AddrManager::new().allow_local(allow_local))),
            path: None,
            allow_local,
        }
    }

    /// Open the book stored under `data_dir`, starting empty if there is none
    pub fn open(data_dir: &Path, allow_local: bool) -> Result<Self, BookError> {
        Self::open_file(data_dir.join(PEERS_FILE), allow_local)
    }

    /// Open the book stored at `path`, starting empty if there is none
    pub fn open_file(path: PathBuf, allow_local: bool) -> Result<Self, BookError> {
        let entries: Vec<AddrEntry> = load_json(&path)?.unwrap_or_default();
        let mgr = AddrManager::from_entries(entries, allow_local);

        log::info!("Loaded {} peer addresses from {}", mgr.size(), path.display());

        Ok(Self {
            inner: Arc::new(RwLock::new(mgr)),
            path: Some(path),
            allow_local,
        })
    }

    /// Separate book for the `protocol` servers, stored beside this one
    pub fn for_protocol(&self, protocol: &str) -> Result<Self, BookError> {
        match self.path.as_deref().and_then(Path::parent) {
            Some(dir) => Self::open_file(dir.join(format!("peers_{}.json", protocol)), self.allow_local),
            None => Ok(Self::new(self.allow_local)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn allows_local(&self) -> bool {
        self.allow_local
    }

    /// Write the book to disk
    pub async fn save(&self) -> Result<(), BookError> {
        let path = self.path.as_ref().ok_or(BookError::NotPersistent)?;
        let entries = self.inner.read().await.entries();
        save_json(path, &entries)?;
        log::debug!("Saved {} peer addresses", entries.len());
        Ok(())
    }

    /// Insert or refresh one address
    pub async fn add(&self, addr: Address) -> bool {
        self.inner.write().await.add(addr, None)
    }

    /// Addresses discovered through a peer. Invalid records are dropped.
    pub async fn add_discovered(&self, addrs: Vec<Address>, source: SocketAddr) -> usize {
        if addrs.is_empty() {
            return 0;
        }

        let added = self
            .inner
            .write()
            .await
            .add_many(addrs, Some(source.to_string()));
        log::debug!("Added {} addresses from {}", added, source);
        added
    }

    /// Read-only query
    pub async fn get<F>(&self, filter: F) -> Vec<Address>
    where
        F: Fn(&AddrEntry) -> bool,
    {
        self.inner.read().await.get(filter)
    }

    /// Pick a dial candidate outside `exclude`
    pub async fn select(&self, exclude: &HashSet<SocketAddr>, opts: &SelectOptions) -> Option<Address> {
        self.inner.read().await.select(exclude, opts)
    }

    /// Sample to answer a peer-list request
    pub async fn get_addr(&self, count: usize) -> Vec<Address> {
        self.inner.read().await.get_addr(count)
    }

    pub async fn attempt(&self, endpoint: &SocketAddr) {
        self.inner.write().await.attempt(endpoint);
    }

    pub async fn good(&self, endpoint: &SocketAddr) {
        self.inner.write().await.good(endpoint);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.size()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Age-based eviction, the only way entries leave the book
    pub async fn evict_stale(&self, max_age_secs: Option<i64>) -> usize {
        let max_age = max_age_secs.unwrap_or(DEFAULT_MAX_AGE_SECS);
        let evicted = self.inner.write().await.evict_stale(max_age, unix_now());
        if evicted > 0 {
            log::info!("Evicted {} stale peer addresses", evicted);
        }
        evicted
    }
}

impl Default for AddressBook {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::new(s.parse().unwrap())
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let temp_dir = tempfile::tempdir().unwrap();

        let book = AddressBook::open(temp_dir.path(), false).unwrap();
        assert!(book.is_empty().await);

        book.add(addr("8.8.8.8:9888")).await;
        book.add(addr("1.1.1.1:9888")).await;
        book.attempt(&"8.8.8.8:9888".parse().unwrap()).await;
        book.save().await.unwrap();

        let reloaded = AddressBook::open(temp_dir.path(), false).unwrap();
        assert_eq!(reloaded.len().await, 2);

        // Attempt times live in memory only
        let all = reloaded.get(|e| e.addr.last_try == 0).await;
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_book_cannot_save() {
        let book = AddressBook::new(true);
        book.add(addr("127.0.0.1:9888")).await;
        assert!(matches!(book.save().await, Err(BookError::NotPersistent)));
    }

    #[tokio::test]
    async fn test_discovered_addresses_are_validated() {
        let book = AddressBook::new(false);
        let source: SocketAddr = "8.8.4.4:9888".parse().unwrap();

        let added = book
            .add_discovered(
                vec![
                    addr("8.8.8.8:9888"),
                    addr("10.0.0.1:9888"),
                    addr("0.0.0.0:9888"),
                ],
                source,
            )
            .await;

        assert_eq!(added, 1);
        let from_source = book
            .get(|e| e.source.as_deref() == Some("8.8.4.4:9888"))
            .await;
        assert_eq!(from_source, vec![addr("8.8.8.8:9888")]);
    }

    #[tokio::test]
    async fn test_protocol_books_are_separate() {
        let temp_dir = tempfile::tempdir().unwrap();
        let data = AddressBook::open(temp_dir.path(), false).unwrap();
        data.add(addr("8.8.8.8:9888")).await;

        let time = data.for_protocol("time").unwrap();
        assert!(time.is_empty().await);
        assert_eq!(time.path(), Some(temp_dir.path().join("peers_time.json").as_path()));

        time.add(addr("1.1.1.1:9890")).await;
        time.save().await.unwrap();
        data.save().await.unwrap();

        let reloaded = AddressBook::open(temp_dir.path(), false).unwrap();
        assert_eq!(reloaded.get(|_| true).await, vec![addr("8.8.8.8:9888")]);
        let reloaded = reloaded.for_protocol("time").unwrap();
        assert_eq!(reloaded.get(|_| true).await, vec![addr("1.1.1.1:9890")]);

        // In-memory books stay in memory
        assert!(AddressBook::new(true).for_protocol("time").unwrap().path().is_none());
    }

    #[tokio::test]
    async fn test_evict_stale_only() {
        let book = AddressBook::new(false);
        let mut old = addr("1.1.1.1:9888");
        old.last_seen = 1000;
        book.add(old).await;
        book.add(addr("8.8.8.8:9888")).await;

        assert_eq!(book.evict_stale(Some(3600)).await, 1);
        assert_eq!(book.len().await, 1);
    }
}
