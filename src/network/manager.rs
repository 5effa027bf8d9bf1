//! Background tasks of a server: the outbound dial manager and the
//! periodic maintenance pass (meters, DDOS table eviction, address book
//! upkeep).

use crate::network::address::canonical;
use crate::network::addrman::SelectOptions;
use crate::network::discovery::AddressBook;
use crate::network::server::Inner;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Most dials started in one manager pass
const DIALS_PER_PASS: usize = 8;

/// Meter and eviction period
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

/// Maintenance passes between address book saves
const BOOK_SAVE_PASSES: u32 = 6;

/// Keep the server at its outbound target.
///
/// Configured nodes are dialed first, then candidates from the address
/// book. Sleeps `manager_sleep` between passes; a dial trigger or shutdown
/// ends the sleep early.
pub(crate) async fn run(inner: Arc<Inner>) {
    log::debug!(
        "{} manager running every {:?}",
        inner.config.name,
        inner.config.manager_sleep
    );

    loop {
        if inner.cancel.is_cancelled() {
            break;
        }

        if !inner.controls.is_suspended() {
            dial_pass(&inner).await;
        }

        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(inner.config.manager_sleep) => {}
            _ = inner.dial_now.notified() => {}
            _ = inner.wake.notified() => {}
        }
    }

    log::debug!("{} manager stopped", inner.config.name);
}

fn has_room(inner: &Inner) -> bool {
    inner.counts().1 < inner.config.max_connections
}

fn should_stop(inner: &Inner) -> bool {
    inner.cancel.is_cancelled() || inner.controls.is_suspended()
}

async fn dial_pass(inner: &Arc<Inner>) {
    let mut budget = DIALS_PER_PASS;
    let mut exclude: HashSet<SocketAddr> = inner.connected_endpoints().into_iter().collect();

    for addr in &inner.config.connect {
        if budget == 0 || !has_room(inner) || should_stop(inner) {
            return;
        }
        let endpoint = canonical(*addr);
        if !exclude.insert(endpoint) {
            continue;
        }
        budget -= 1;
        if let Err(e) = inner.dial(*addr).await {
            log::debug!("{} could not reach configured node {}: {}", inner.config.name, addr, e);
        }
    }

    let opts = SelectOptions::default();
    while budget > 0 && has_room(inner) && !should_stop(inner) {
        let candidate = match inner.book.select(&exclude, &opts).await {
            Some(addr) => addr.canonical(),
            None => break,
        };
        exclude.insert(candidate);

        if inner.is_banned(&candidate.ip()) {
            continue;
        }
        budget -= 1;
        if let Err(e) = inner.dial(candidate).await {
            log::trace!("{} dial {} failed: {}", inner.config.name, candidate, e);
        }
    }
}

/// Drop stale addresses and write the book if it has a file
pub(crate) async fn book_upkeep(book: &AddressBook, name: &str) {
    book.evict_stale(None).await;
    if book.path().is_some() {
        if let Err(e) = book.save().await {
            log::warn!("{} could not save address book: {}", name, e);
        }
    }
}

/// Meters, DDOS table and address book upkeep
pub(crate) async fn maintain(inner: Arc<Inner>) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    interval.tick().await;

    let mut last = inner.stats.snapshot();
    let mut last_at = Instant::now();
    let mut passes = 0u32;

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        if inner.config.meters {
            let now = inner.stats.snapshot();
            let secs = last_at.elapsed().as_secs_f64().max(f64::EPSILON);
            let (inbound, total) = inner.counts();
            log::info!(
                "{} meters: {:.2} conn/s, {:.2} req/s, {} live ({} inbound), {} refused",
                inner.config.name,
                now.accepted.saturating_sub(last.accepted) as f64 / secs,
                now.requests.saturating_sub(last.requests) as f64 / secs,
                total,
                inbound,
                now.refused.saturating_sub(last.refused)
            );
            last = now;
            last_at = Instant::now();
        }

        if let Some(filter) = &inner.ddos {
            let evicted = filter.evict_expired(Instant::now());
            if evicted > 0 {
                log::debug!("{} DDOS table: {} entries expired", inner.config.name, evicted);
            }
        }

        passes += 1;
        if passes % BOOK_SAVE_PASSES == 0 {
            book_upkeep(&inner.book, &inner.config.name).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::book_upkeep;
    use crate::config::ServerConfig;
    use crate::network::address::Address;
    use crate::network::controls::Controls;
    use crate::network::discovery::AddressBook;
    use crate::network::protocol::BasicProtocol;
    use crate::network::server::Server;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn config(name: &str) -> ServerConfig {
        let mut cfg = ServerConfig::new(name, 0);
        cfg.bind = IpAddr::V4(Ipv4Addr::LOCALHOST);
        cfg.threads = 1;
        cfg
    }

    async fn start(cfg: ServerConfig, book: AddressBook) -> Server {
        let protocol = Arc::new(BasicProtocol::new(cfg.name.clone()));
        Server::start(cfg, protocol, Controls::new(), book, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_manager_sleep() {
        let mut cfg = config("data");
        cfg.listen = false;
        cfg.manager = true;
        cfg.manager_sleep = Duration::from_secs(60);
        let server = start(cfg, AddressBook::new(true)).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        server.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_manager_dials_book_candidates() {
        let target = start(config("target"), AddressBook::new(true)).await;
        let target_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), target.port());

        let book = AddressBook::new(true);
        assert!(book.add(Address::new(target_addr)).await);

        let mut cfg = config("dialer");
        cfg.listen = false;
        cfg.manager = true;
        cfg.manager_sleep = Duration::from_millis(50);
        let dialer = start(cfg, book).await;

        let mut connected = false;
        for _ in 0..100 {
            if dialer.connection_to(&target_addr).is_some() {
                connected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(connected);
        assert!(dialer.stats().dial_attempts >= 1);

        dialer.shutdown().await;
        target.shutdown().await;
    }

    #[tokio::test]
    async fn test_manager_dials_configured_nodes() {
        let target = start(config("target"), AddressBook::new(true)).await;
        let target_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), target.port());

        let mut cfg = config("dialer");
        cfg.listen = false;
        cfg.manager = true;
        cfg.connect = vec![target_addr];
        let dialer = start(cfg, AddressBook::new(true)).await;

        let mut connected = false;
        for _ in 0..100 {
            if dialer.connection_to(&target_addr).is_some() {
                connected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(connected);

        dialer.shutdown().await;
        target.shutdown().await;
    }

    #[tokio::test]
    async fn test_book_upkeep_evicts_and_saves() {
        let temp_dir = tempfile::tempdir().unwrap();
        let book = AddressBook::open(temp_dir.path(), false).unwrap();

        let mut old = Address::new("1.1.1.1:9888".parse().unwrap());
        old.last_seen = 1000;
        book.add(old).await;
        book.add(Address::new("8.8.8.8:9888".parse().unwrap())).await;

        book_upkeep(&book, "data").await;
        assert_eq!(book.len().await, 1);

        // Written without waiting for shutdown
        let reloaded = AddressBook::open(temp_dir.path(), false).unwrap();
        let all = reloaded.get(|_| true).await;
        assert_eq!(all, vec![Address::new("8.8.8.8:9888".parse().unwrap())]);

        // Nothing to write for an in-memory book
        book_upkeep(&AddressBook::new(false), "time").await;
    }
}
