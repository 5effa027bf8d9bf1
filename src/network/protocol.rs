//! Protocol strategy plugged into a server
//!
//! A server knows nothing about message formats. It hands raw bytes to the
//! protocol's [`Framer`], passes every complete packet to
//! [`Protocol::handle`], and reports lifecycle events. Addresses a handler
//! learns about are collected in the [`HandlerContext`] and forwarded to the
//! server's address book by the worker. Transaction hashes go to the
//! server's index queue, if one is attached.

use crate::indexing::{IndexDispatch, IndexError, TxHash};
use crate::network::address::{Address, AddressError, WIRE_SIZE};
use crate::network::connection::{Connection, DisconnectReason};
use crate::network::discovery::AddressBook;
use crate::network::socket::SocketError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Default frame magic
pub const MAGIC: [u8; 4] = *b"PLNK";

/// Frame header: magic (4) + length (4)
pub const HEADER_LEN: usize = 8;

/// Default largest accepted payload
pub const MAX_PACKET_SIZE: usize = 8 * 1024 * 1024;

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid magic bytes")]
    InvalidMagic,
    #[error("Packet too large: {0} bytes")]
    TooLarge(usize),
    #[error("Malformed packet: {0}")]
    Malformed(String),
    #[error("Unknown message type: {0:#04x}")]
    UnknownType(u8),
    #[error("Address error: {0}")]
    Address(#[from] AddressError),
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),
    #[error("Index error: {0}")]
    Index(#[from] IndexError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Splits a byte stream into packets
pub trait Framer: Send {
    /// Next complete packet, consuming it from `buf`; `None` if more bytes are needed
    fn frame(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError>;
}

impl<D> Framer for D
where
    D: Decoder<Item = Bytes, Error = ProtocolError> + Send,
{
    fn frame(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        self.decode(buf)
    }
}

/// Per-call handler state
pub struct HandlerContext<'a> {
    conn: &'a Arc<Connection>,
    book: &'a AddressBook,
    index: Option<&'a IndexDispatch>,
    discovered: Vec<Address>,
}

impl<'a> HandlerContext<'a> {
    pub fn new(conn: &'a Arc<Connection>, book: &'a AddressBook, index: Option<&'a IndexDispatch>) -> Self {
        Self {
            conn,
            book,
            index,
            discovered: Vec::new(),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        self.conn
    }

    /// Address book of the server the connection belongs to
    pub fn book(&self) -> &AddressBook {
        self.book
    }

    /// Queue a received transaction hash for indexing.
    ///
    /// Returns `false` when the server has no index queue attached.
    pub fn index_transaction(&self, hash: TxHash) -> Result<bool, ProtocolError> {
        match self.index {
            Some(dispatch) => {
                dispatch.push(hash)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Queue bytes to the remote end
    pub fn reply(&self, data: &[u8]) -> Result<(), ProtocolError> {
        self.conn.send(data)?;
        Ok(())
    }

    /// Hand peer addresses learned from the remote to the address book
    pub fn discovered(&mut self, addrs: impl IntoIterator<Item = Address>) {
        self.discovered.extend(addrs);
    }

    pub fn disconnect(&self, reason: DisconnectReason) {
        self.conn.disconnect(reason);
    }

    /// Addresses collected during this call
    pub fn take_discovered(&mut self) -> Vec<Address> {
        std::mem::take(&mut self.discovered)
    }
}

/// Message handling strategy for one kind of server
pub trait Protocol: Send + Sync + 'static {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Fresh framer for a new connection
    fn framer(&self) -> Box<dyn Framer>;

    /// Called once a connection is registered
    fn on_connect(&self, _cx: &mut HandlerContext<'_>) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Handle one complete packet
    fn handle(&self, cx: &mut HandlerContext<'_>, packet: Bytes) -> Result<(), ProtocolError>;

    /// Decide what a handler or framing error means. `true` keeps the connection.
    fn on_error(&self, conn: &Connection, err: &ProtocolError) -> bool {
        log::debug!("{} {}: {}", self.name(), conn.id(), err);
        false
    }

    /// Called once after the connection is gone
    fn on_disconnect(&self, _conn: &Connection, _reason: DisconnectReason) {}
}

// =============================================================================
// Packet codec
// =============================================================================

/// Length-prefixed framing: magic (4) + big-endian length (4) + payload
#[derive(Debug, Clone)]
pub struct PacketCodec {
    magic: [u8; 4],
    max_len: usize,
}

impl PacketCodec {
    pub fn new(magic: [u8; 4], max_len: usize) -> Self {
        Self { magic, max_len }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(MAGIC, MAX_PACKET_SIZE)
    }
}

impl Encoder<Bytes> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_len {
            return Err(ProtocolError::TooLarge(item.len()));
        }

        dst.reserve(HEADER_LEN + item.len());
        dst.put_slice(&self.magic);
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);

        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least header
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        if src[..4] != self.magic {
            return Err(ProtocolError::InvalidMagic);
        }

        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > self.max_len {
            return Err(ProtocolError::TooLarge(len));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}

// =============================================================================
// Basic protocol
// =============================================================================

/// Message types understood by [`BasicProtocol`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BasicMessage {
    Ping(u64),
    Pong(u64),
    GetPeers,
    Peers(Vec<Address>),
    /// Announcement of a transaction by hash
    Tx(TxHash),
}

impl BasicMessage {
    const PING: u8 = 0x01;
    const PONG: u8 = 0x02;
    const GET_PEERS: u8 = 0x03;
    const PEERS: u8 = 0x04;
    const TX: u8 = 0x05;

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            BasicMessage::Ping(nonce) => {
                buf.put_u8(Self::PING);
                buf.put_u64(*nonce);
            }
            BasicMessage::Pong(nonce) => {
                buf.put_u8(Self::PONG);
                buf.put_u64(*nonce);
            }
            BasicMessage::GetPeers => buf.put_u8(Self::GET_PEERS),
            BasicMessage::Peers(addrs) => {
                buf.put_u8(Self::PEERS);
                buf.put_u16(addrs.len().min(u16::MAX as usize) as u16);
                for addr in addrs.iter().take(u16::MAX as usize) {
                    addr.encode(&mut buf);
                }
            }
            BasicMessage::Tx(hash) => {
                buf.put_u8(Self::TX);
                buf.put_slice(hash);
            }
        }
        buf.freeze()
    }

    pub fn from_bytes(mut data: Bytes) -> Result<Self, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::Malformed("empty packet".into()));
        }

        match data.get_u8() {
            Self::PING | Self::PONG if data.remaining() < 8 => {
                Err(ProtocolError::Malformed("short nonce".into()))
            }
            Self::PING => Ok(BasicMessage::Ping(data.get_u64())),
            Self::PONG => Ok(BasicMessage::Pong(data.get_u64())),
            Self::GET_PEERS => Ok(BasicMessage::GetPeers),
            Self::PEERS => {
                if data.remaining() < 2 {
                    return Err(ProtocolError::Malformed("missing count".into()));
                }
                let count = data.get_u16() as usize;
                if data.remaining() < count * WIRE_SIZE {
                    return Err(ProtocolError::Malformed(format!(
                        "{} addresses in {} bytes",
                        count,
                        data.remaining()
                    )));
                }
                let addrs = (0..count)
                    .map(|_| Address::decode(&mut data))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(BasicMessage::Peers(addrs))
            }
            Self::TX => {
                if data.remaining() < 32 {
                    return Err(ProtocolError::Malformed("short transaction hash".into()));
                }
                let mut hash = [0u8; 32];
                data.copy_to_slice(&mut hash);
                Ok(BasicMessage::Tx(hash))
            }
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

/// Keep-alive, peer exchange and transaction announcements over
/// [`PacketCodec`] frames
#[derive(Debug, Clone)]
pub struct BasicProtocol {
    name: String,
    peers_per_reply: usize,
}

impl BasicProtocol {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            peers_per_reply: 100,
        }
    }

    /// Frame and queue one message
    pub fn send(conn: &Connection, msg: &BasicMessage) -> Result<(), ProtocolError> {
        let mut frame = BytesMut::new();
        PacketCodec::default().encode(msg.to_bytes(), &mut frame)?;
        conn.send(&frame)?;
        Ok(())
    }
}

impl Protocol for BasicProtocol {
    fn name(&self) -> &str {
        &self.name
    }

    fn framer(&self) -> Box<dyn Framer> {
        Box::new(PacketCodec::default())
    }

    fn on_connect(&self, cx: &mut HandlerContext<'_>) -> Result<(), ProtocolError> {
        // Outbound peers get asked for their address list right away
        if cx.connection().is_outbound() {
            Self::send(cx.connection(), &BasicMessage::GetPeers)?;
        }
        Ok(())
    }

    fn handle(&self, cx: &mut HandlerContext<'_>, packet: Bytes) -> Result<(), ProtocolError> {
        match BasicMessage::from_bytes(packet)? {
            BasicMessage::Ping(nonce) => Self::send(cx.connection(), &BasicMessage::Pong(nonce)),
            BasicMessage::Pong(_) => Ok(()),
            BasicMessage::GetPeers => {
                let conn = Arc::clone(cx.connection());
                let book = cx.book().clone();
                let count = self.peers_per_reply;
                tokio::spawn(async move {
                    let addrs = book.get_addr(count).await;
                    if let Err(e) = Self::send(&conn, &BasicMessage::Peers(addrs)) {
                        log::debug!("Peer list to {} failed: {}", conn.id(), e);
                    }
                });
                Ok(())
            }
            BasicMessage::Peers(addrs) => {
                cx.discovered(addrs);
                Ok(())
            }
            BasicMessage::Tx(hash) => {
                if !cx.index_transaction(hash)? {
                    log::trace!("{} ignored transaction {}: no index queue", self.name, hex::encode(hash));
                }
                Ok(())
            }
        }
    }

    fn on_error(&self, conn: &Connection, err: &ProtocolError) -> bool {
        log::debug!("{} {}: {}", self.name, conn.id(), err);
        // Unknown messages are tolerated; broken framing is not
        matches!(err, ProtocolError::UnknownType(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_codec() {
        let mut codec = PacketCodec::default();

        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"hello"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"world"), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "hello");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "world");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_packet_waits() {
        let mut codec = PacketCodec::default();
        let mut full = BytesMut::new();
        codec.encode(Bytes::from_static(b"abcdef"), &mut full).unwrap();

        let mut buf = BytesMut::from(&full[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 10);

        buf.extend_from_slice(&full[10..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "abcdef");
    }

    #[test]
    fn test_bad_magic_and_oversize() {
        let mut codec = PacketCodec::new(MAGIC, 16);

        let mut buf = BytesMut::from(&b"XXXX\x00\x00\x00\x01a"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(ProtocolError::InvalidMagic)));

        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32(17);
        assert!(matches!(codec.decode(&mut buf), Err(ProtocolError::TooLarge(17))));
    }

    #[test]
    fn test_basic_messages() {
        let addrs = vec![Address::new("8.8.8.8:9888".parse().unwrap())];
        let peers = BasicMessage::from_bytes(BasicMessage::Peers(addrs.clone()).to_bytes()).unwrap();
        assert_eq!(peers, BasicMessage::Peers(addrs));

        let ping = BasicMessage::from_bytes(BasicMessage::Ping(7).to_bytes()).unwrap();
        assert_eq!(ping, BasicMessage::Ping(7));

        let tx = BasicMessage::from_bytes(BasicMessage::Tx([3u8; 32]).to_bytes()).unwrap();
        assert_eq!(tx, BasicMessage::Tx([3u8; 32]));
        assert!(matches!(
            BasicMessage::from_bytes(Bytes::from_static(&[0x05, 0x01])),
            Err(ProtocolError::Malformed(_))
        ));

        assert!(matches!(
            BasicMessage::from_bytes(Bytes::from_static(&[0x7f])),
            Err(ProtocolError::UnknownType(0x7f))
        ));
        assert!(matches!(
            BasicMessage::from_bytes(Bytes::from_static(&[0x04, 0x00, 0x02])),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
