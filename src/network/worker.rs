//! Connection worker tasks
//!
//! Each server runs a fixed number of workers. A worker owns the
//! connections assigned to it and services them in rounds: flush queued
//! output, read and frame input, hand packets to the protocol, then check
//! idle time and error counts. Between rounds it parks until one of its
//! sockets is ready, a new connection arrives or the poll quantum passes.

use crate::network::address::canonical;
use crate::network::connection::{Connection, DisconnectReason};
use crate::network::protocol::{Framer, HandlerContext};
use crate::network::server::Inner;
use crate::network::socket::{Direction, SocketError};
use bytes::BytesMut;
use futures::future::{select_all, BoxFuture};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::Interest;
use tokio::sync::mpsc::UnboundedReceiver;

/// Longest a worker parks between rounds
const POLL_QUANTUM: Duration = Duration::from_millis(100);

/// Bytes read per socket call
const READ_CHUNK: usize = 16 * 1024;

/// Bytes read from one connection per round
const READ_BUDGET: usize = 256 * 1024;

/// Consecutive send failures before a connection is dropped
const MAX_CONSECUTIVE_ERRORS: u32 = 8;

/// One assigned connection
struct Slot {
    conn: Arc<Connection>,
    framer: Box<dyn Framer>,
    inbox: BytesMut,
}

enum Event {
    Stop,
    Assigned(Arc<Connection>),
    Poll,
}

/// Resolves when any wait does; never when there is nothing to wait on
async fn any_ready(waits: Vec<BoxFuture<'_, ()>>) {
    if waits.is_empty() {
        std::future::pending::<()>().await;
    } else {
        select_all(waits).await;
    }
}

pub(crate) async fn run(inner: Arc<Inner>, index: usize, mut rx: UnboundedReceiver<Arc<Connection>>) {
    let mut slots: Vec<Slot> = Vec::new();
    let mut scratch = vec![0u8; READ_CHUNK];

    loop {
        if inner.cancel.is_cancelled() {
            break;
        }

        let suspended = inner.controls.is_suspended();

        let mut i = 0;
        while i < slots.len() {
            match service(&inner, &mut slots[i], &mut scratch, suspended).await {
                Ok(()) => i += 1,
                Err(reason) => {
                    let slot = slots.swap_remove(i);
                    inner.remove(&slot.conn, reason);
                }
            }
        }

        let event = {
            let waits: Vec<BoxFuture<'_, ()>> = slots
                .iter()
                .filter_map(|slot| {
                    let pending = slot.conn.socket().has_pending();
                    let interest = match (suspended, pending) {
                        (true, false) => return None,
                        (true, true) => Interest::WRITABLE,
                        (false, false) => Interest::READABLE,
                        (false, true) => Interest::READABLE | Interest::WRITABLE,
                    };
                    let conn = &slot.conn;
                    Some(Box::pin(async move {
                        let _ = conn.socket().ready(interest).await;
                    }) as BoxFuture<'_, ()>)
                })
                .collect();

            tokio::select! {
                _ = inner.cancel.cancelled() => Event::Stop,
                assigned = rx.recv() => match assigned {
                    Some(conn) => Event::Assigned(conn),
                    None => Event::Stop,
                },
                _ = any_ready(waits) => Event::Poll,
                _ = tokio::time::sleep(POLL_QUANTUM) => Event::Poll,
                _ = inner.wake.notified() => Event::Poll,
                _ = inner.controls.changed() => Event::Poll,
            }
        };

        match event {
            Event::Stop => break,
            Event::Poll => {}
            Event::Assigned(conn) => {
                if let Some(slot) = open(&inner, conn).await {
                    slots.push(slot);
                }
            }
        }
    }

    rx.close();
    while let Ok(conn) = rx.try_recv() {
        inner.remove(&conn, DisconnectReason::Shutdown);
    }
    for slot in slots {
        inner.remove(&slot.conn, DisconnectReason::Shutdown);
    }
    log::debug!("{} worker {} stopped", inner.config.name, index);
}

/// Run the protocol's connect hook and build the slot
async fn open(inner: &Inner, conn: Arc<Connection>) -> Option<Slot> {
    if !conn.is_connected() {
        inner.remove(&conn, DisconnectReason::Forced);
        return None;
    }

    let mut cx = HandlerContext::new(&conn, &inner.book, inner.index.get().map(|d| &**d));
    let result = inner.protocol.on_connect(&mut cx);
    let found = cx.take_discovered();
    if !found.is_empty() {
        inner.book.add_discovered(found, conn.peer_addr()).await;
    }

    if let Err(e) = result {
        if !inner.protocol.on_error(&conn, &e) {
            inner.remove(&conn, DisconnectReason::Protocol);
            return None;
        }
    }

    Some(Slot {
        framer: inner.protocol.framer(),
        inbox: BytesMut::new(),
        conn,
    })
}

/// One round for one connection. `Err` carries the reason to drop it.
async fn service(
    inner: &Inner,
    slot: &mut Slot,
    scratch: &mut [u8],
    suspended: bool,
) -> Result<(), DisconnectReason> {
    let conn = Arc::clone(&slot.conn);
    if !conn.is_connected() {
        return Err(conn.reason().unwrap_or(DisconnectReason::Forced));
    }
    let socket = conn.socket();

    // Output keeps draining while suspended
    if let Err(SocketError::Closed) = socket.flush() {
        return Err(DisconnectReason::PeerClosed);
    }

    if !suspended {
        let mut eof = false;
        let mut budget = READ_BUDGET;
        while budget > 0 {
            match socket.read(scratch) {
                Ok(0) => break,
                Ok(n) => {
                    slot.inbox.extend_from_slice(&scratch[..n]);
                    budget = budget.saturating_sub(n);
                }
                Err(SocketError::Closed) => {
                    eof = true;
                    break;
                }
                Err(e) => {
                    log::debug!("{} read from {} failed: {}", inner.config.name, conn.peer_addr(), e);
                    return Err(DisconnectReason::Errors);
                }
            }
        }

        dispatch(inner, slot, &conn).await?;

        if eof {
            return Err(DisconnectReason::PeerClosed);
        }

        let timeout = inner.config.socket_timeout;
        if !timeout.is_zero() && socket.timeout(timeout, Direction::BOTH) {
            return Err(DisconnectReason::Timeout);
        }
    }

    if socket.consecutive_errors() >= MAX_CONSECUTIVE_ERRORS {
        return Err(DisconnectReason::Errors);
    }

    Ok(())
}

/// Frame everything buffered and hand each packet to the protocol
async fn dispatch(inner: &Inner, slot: &mut Slot, conn: &Arc<Connection>) -> Result<(), DisconnectReason> {
    let ip = canonical(conn.peer_addr()).ip();

    loop {
        let packet = match slot.framer.frame(&mut slot.inbox) {
            Ok(Some(packet)) => packet,
            Ok(None) => return Ok(()),
            Err(e) => {
                if inner.protocol.on_error(conn, &e) {
                    // The stream position is lost after a framing error
                    slot.inbox.clear();
                    return Ok(());
                }
                return Err(DisconnectReason::Protocol);
            }
        };

        inner.stats.requests.fetch_add(1, Ordering::Relaxed);
        conn.count_packet();

        if let Some(filter) = &inner.ddos {
            if filter.score_request(ip) {
                return Err(DisconnectReason::Ddos);
            }
        }

        let mut cx = HandlerContext::new(conn, &inner.book, inner.index.get().map(|d| &**d));
        let result = inner.protocol.handle(&mut cx, packet);
        let found = cx.take_discovered();
        if !found.is_empty() {
            let added = inner.book.add_discovered(found, conn.peer_addr()).await;
            log::trace!("{} learned {} addresses from {}", inner.config.name, added, conn.peer_addr());
        }

        if let Err(e) = result {
            if !inner.protocol.on_error(conn, &e) {
                return Err(DisconnectReason::Protocol);
            }
        }

        if !conn.is_connected() {
            return Err(conn.reason().unwrap_or(DisconnectReason::Forced));
        }
    }
}
