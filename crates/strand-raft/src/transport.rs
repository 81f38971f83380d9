//! Message transports between Raft peers.
//!
//! [`Transport`] abstracts delivery so the node never touches sockets.
//! [`TcpTransport`] is the production implementation; it deliberately does
//! not bind a listener: the service shares one TCP port between Raft and
//! client RPC, so accepted Raft connections are handed in through
//! [`TcpTransport::handle_inbound`] after the stream layer has consumed the
//! connection tag. Outbound dials write the tag before the first frame.
//!
//! [`MemoryTransport`] wires nodes together through channels for tests,
//! with one-way partition injection.
//!
//! Delivery is best-effort: a message to a peer that is not connected yet
//! is dropped while a dial starts in the background. Raft's retries make
//! this safe.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, warn};

use crate::rpc::{NodeId, RaftMessage};

/// Errors produced by transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No address is known for the target node.
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    /// The connection to the target failed or its queue is full.
    #[error("connection to node {node_id} failed: {reason}")]
    ConnectionFailed {
        /// The target node.
        node_id: NodeId,
        /// Why.
        reason: String,
    },

    /// A frame failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(String),

    /// The transport is closed.
    #[error("transport closed")]
    Closed,

    /// The underlying socket failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// A message received from a peer.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// The sender.
    pub from: NodeId,
    /// The message.
    pub message: RaftMessage,
}

/// Abstract peer-to-peer message delivery.
pub trait Transport: Send + Sync {
    /// Queues a message to a peer. Best-effort; may drop while a
    /// connection is (re)established.
    fn send(&self, to: NodeId, message: RaftMessage) -> TransportResult<()>;

    /// Awaits the next incoming message; `None` once closed.
    fn recv(&self) -> Pin<Box<dyn Future<Output = Option<IncomingMessage>> + Send + '_>>;

    /// Non-blocking receive.
    fn try_recv(&self) -> Option<IncomingMessage>;

    /// This node's id.
    fn local_id(&self) -> NodeId;

    /// Registers a peer's address.
    fn add_peer(&self, peer: NodeId, addr: SocketAddr) -> TransportResult<()>;

    /// Drops a peer and its connection.
    fn remove_peer(&self, peer: NodeId) -> TransportResult<()>;

    /// Shuts the transport down.
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// True once closed.
    fn is_closed(&self) -> bool;
}

/// Wire framing for Raft messages.
///
/// ```text
/// +----------+----------+----------+------------------+
/// | Magic(4) | From(8)  | Len(4)   | Payload(Len)     |
/// +----------+----------+----------+------------------+
/// ```
pub mod frame {
    use bytes::{Buf, BufMut, Bytes, BytesMut};

    use super::{TransportError, TransportResult};
    use crate::rpc::{NodeId, RaftMessage};

    /// Magic number for Raft frames ("RFT1").
    pub const FRAME_MAGIC: u32 = 0x52465431;

    /// Maximum payload size (16 MB).
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

    /// Header size: magic + sender id + length.
    pub const HEADER_SIZE: usize = 4 + 8 + 4;

    /// Encodes one message into a frame.
    pub fn encode(from: NodeId, message: &RaftMessage) -> TransportResult<Bytes> {
        let payload =
            bincode::serialize(message).map_err(|e| TransportError::Codec(e.to_string()))?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::Codec(format!(
                "message too large: {} bytes",
                payload.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_u32(FRAME_MAGIC);
        buf.put_u64(from);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// Decodes a complete frame into `(from, message)`.
    pub fn decode(mut data: Bytes) -> TransportResult<(NodeId, RaftMessage)> {
        if data.len() < HEADER_SIZE {
            return Err(TransportError::Codec("frame too short".to_string()));
        }

        let magic = data.get_u32();
        if magic != FRAME_MAGIC {
            return Err(TransportError::Codec(format!(
                "invalid magic: {magic:08x}"
            )));
        }

        let from = data.get_u64();
        let len = data.get_u32() as usize;
        if len > MAX_MESSAGE_SIZE || data.len() < len {
            return Err(TransportError::Codec("bad frame length".to_string()));
        }

        let message = bincode::deserialize(&data.slice(..len))
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        Ok((from, message))
    }

    /// Total size of the first frame in `data`, when complete.
    pub fn frame_size(data: &[u8]) -> Option<usize> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        let len = u32::from_be_bytes([data[12], data[13], data[14], data[15]]) as usize;
        let total = HEADER_SIZE + len;
        (data.len() >= total).then_some(total)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::rpc::{RequestVote, VoteResponse};

        #[test]
        fn test_roundtrip() {
            let message = RaftMessage::RequestVote(RequestVote {
                term: 5,
                candidate_id: 1,
                last_log_index: 100,
                last_log_term: 4,
            });

            let encoded = encode(1, &message).unwrap();
            let (from, decoded) = decode(encoded).unwrap();
            assert_eq!(from, 1);
            assert_eq!(decoded, message);
        }

        #[test]
        fn test_frame_size() {
            let encoded =
                encode(2, &RaftMessage::VoteResponse(VoteResponse::grant(5))).unwrap();

            assert_eq!(frame_size(&encoded), Some(encoded.len()));
            assert_eq!(frame_size(&encoded[..10]), None);
            assert_eq!(frame_size(&encoded[..encoded.len() - 1]), None);
        }

        #[test]
        fn test_rejects_bad_magic() {
            let mut buf = BytesMut::new();
            buf.put_u32(0xBAD0BAD0);
            buf.put_u64(1);
            buf.put_u32(0);
            assert!(decode(buf.freeze()).is_err());
        }
    }
}

struct PeerConnection {
    outbox: mpsc::Sender<RaftMessage>,
}

/// TCP transport with injected inbound connections.
pub struct TcpTransport {
    node_id: NodeId,
    /// Byte written before the first frame of an outbound dial, so the
    /// remote stream layer routes the connection to Raft.
    dial_tag: Option<u8>,
    peers: DashMap<NodeId, PeerConnection>,
    peer_addrs: RwLock<HashMap<NodeId, SocketAddr>>,
    /// Guards against dial storms while a connection is in progress.
    connecting: DashMap<NodeId, ()>,
    inbox_tx: mpsc::Sender<IncomingMessage>,
    inbox_rx: TokioMutex<mpsc::Receiver<IncomingMessage>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("node_id", &self.node_id)
            .field("peers", &self.peers.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl TcpTransport {
    /// Creates a transport for `node_id`. Outbound dials are prefixed with
    /// `dial_tag` when set.
    pub fn new(node_id: NodeId, dial_tag: Option<u8>) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(1024);

        Arc::new(Self {
            node_id,
            dial_tag,
            peers: DashMap::new(),
            peer_addrs: RwLock::new(HashMap::new()),
            connecting: DashMap::new(),
            inbox_tx,
            inbox_rx: TokioMutex::new(inbox_rx),
            closed: AtomicBool::new(false),
        })
    }

    /// Takes over an accepted connection whose tag byte has already been
    /// consumed by the stream layer.
    pub fn handle_inbound(this: &Arc<Self>, stream: TcpStream) {
        let transport = Arc::clone(this);
        tokio::spawn(async move {
            if let Err(e) = transport.pump_frames(stream).await {
                debug!("inbound raft connection ended: {e}");
            }
        });
    }

    async fn pump_frames(&self, mut stream: TcpStream) -> TransportResult<()> {
        let mut buf = BytesMut::with_capacity(4096);

        loop {
            while let Some(size) = frame::frame_size(&buf) {
                let (from, message) = frame::decode(buf.split_to(size).freeze())?;
                if self
                    .inbox_tx
                    .send(IncomingMessage { from, message })
                    .await
                    .is_err()
                {
                    return Err(TransportError::Closed);
                }
            }

            if stream.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }
        }
    }

    fn spawn_connect(this: &Arc<Self>, peer: NodeId, addr: SocketAddr) {
        if this.connecting.insert(peer, ()).is_some() {
            return;
        }

        let transport = Arc::clone(this);
        tokio::spawn(async move {
            let result = Self::connect(&transport, peer, addr).await;
            transport.connecting.remove(&peer);
            if let Err(e) = result {
                debug!(peer, "raft dial failed: {e}");
            }
        });
    }

    async fn connect(this: &Arc<Self>, peer: NodeId, addr: SocketAddr) -> TransportResult<()> {
        if this.peers.contains_key(&peer) || this.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut stream = TcpStream::connect(addr).await?;
        if let Some(tag) = this.dial_tag {
            stream.write_all(&[tag]).await?;
        }

        let (read_half, mut write_half) = stream.into_split();
        let (outbox_tx, mut outbox_rx) = mpsc::channel::<RaftMessage>(256);

        this.peers.insert(peer, PeerConnection { outbox: outbox_tx });
        debug!(peer, %addr, "raft connection established");

        let node_id = this.node_id;
        let writer_transport = Arc::clone(this);
        tokio::spawn(async move {
            while let Some(message) = outbox_rx.recv().await {
                match frame::encode(node_id, &message) {
                    Ok(data) => {
                        if let Err(e) = write_half.write_all(&data).await {
                            debug!(peer, "raft write failed: {e}");
                            break;
                        }
                    }
                    Err(e) => warn!("raft encode failed: {e}"),
                }
            }
            writer_transport.peers.remove(&peer);
        });

        let reader_transport = Arc::clone(this);
        tokio::spawn(async move {
            let mut read_half = read_half;
            let mut buf = BytesMut::with_capacity(4096);

            loop {
                while let Some(size) = frame::frame_size(&buf) {
                    match frame::decode(buf.split_to(size).freeze()) {
                        Ok((from, message)) => {
                            if reader_transport
                                .inbox_tx
                                .send(IncomingMessage { from, message })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(peer, "raft decode failed: {e}");
                            reader_transport.peers.remove(&peer);
                            return;
                        }
                    }
                }

                match read_half.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => {
                        reader_transport.peers.remove(&peer);
                        return;
                    }
                    Ok(_) => {}
                }
            }
        });

        Ok(())
    }
}

/// `Arc` receiver so the send path can trigger background dials.
impl Transport for Arc<TcpTransport> {
    fn send(&self, to: NodeId, message: RaftMessage) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        if let Some(peer) = self.peers.get(&to) {
            return peer.outbox.try_send(message).map_err(|_| {
                TransportError::ConnectionFailed {
                    node_id: to,
                    reason: "outbox full or closed".to_string(),
                }
            });
        }

        // Not connected: kick off a dial and drop this message; the node
        // retries on its next heartbeat.
        let addr = self.peer_addrs.read().get(&to).copied();
        match addr {
            Some(addr) => {
                TcpTransport::spawn_connect(self, to, addr);
                Ok(())
            }
            None => Err(TransportError::UnknownNode(to)),
        }
    }

    fn recv(&self) -> Pin<Box<dyn Future<Output = Option<IncomingMessage>> + Send + '_>> {
        Box::pin(async move {
            if self.is_closed() {
                return None;
            }
            self.inbox_rx.lock().await.recv().await
        })
    }

    fn try_recv(&self) -> Option<IncomingMessage> {
        if self.is_closed() {
            return None;
        }
        match self.inbox_rx.try_lock() {
            Ok(mut inbox) => inbox.try_recv().ok(),
            Err(_) => None,
        }
    }

    fn local_id(&self) -> NodeId {
        self.node_id
    }

    fn add_peer(&self, peer: NodeId, addr: SocketAddr) -> TransportResult<()> {
        self.peer_addrs.write().insert(peer, addr);
        Ok(())
    }

    fn remove_peer(&self, peer: NodeId) -> TransportResult<()> {
        self.peers.remove(&peer);
        self.peer_addrs.write().remove(&peer);
        Ok(())
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            self.peers.clear();
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A shared in-process network for [`MemoryTransport`]s.
#[derive(Debug, Default)]
pub struct MemoryNetwork {
    nodes: DashMap<NodeId, mpsc::Sender<IncomingMessage>>,
    /// `(from, to)` pairs whose messages are silently dropped.
    partitions: RwLock<Vec<(NodeId, NodeId)>>,
}

impl MemoryNetwork {
    /// Creates an empty shared network.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a transport attached to this network.
    pub fn create_transport(self: &Arc<Self>, node_id: NodeId) -> MemoryTransport {
        let (tx, rx) = mpsc::channel(1024);
        self.nodes.insert(node_id, tx);

        MemoryTransport {
            node_id,
            network: Arc::clone(self),
            inbox: TokioMutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }

    /// Drops all messages from `from` to `to` until healed.
    pub fn partition(&self, from: NodeId, to: NodeId) {
        self.partitions.write().push((from, to));
    }

    /// Removes every partition involving `node`.
    pub fn heal(&self, node: NodeId) {
        self.partitions
            .write()
            .retain(|&(f, t)| f != node && t != node);
    }

    fn deliver(&self, from: NodeId, to: NodeId, message: RaftMessage) -> TransportResult<()> {
        if self
            .partitions
            .read()
            .iter()
            .any(|&(f, t)| f == from && t == to)
        {
            return Ok(());
        }

        let sender = self
            .nodes
            .get(&to)
            .ok_or(TransportError::UnknownNode(to))?;
        sender
            .try_send(IncomingMessage { from, message })
            .map_err(|_| TransportError::ConnectionFailed {
                node_id: to,
                reason: "inbox full or closed".to_string(),
            })
    }
}

/// Channel-backed transport for tests.
pub struct MemoryTransport {
    node_id: NodeId,
    network: Arc<MemoryNetwork>,
    inbox: TokioMutex<mpsc::Receiver<IncomingMessage>>,
    closed: AtomicBool,
}

impl Transport for MemoryTransport {
    fn send(&self, to: NodeId, message: RaftMessage) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.network.deliver(self.node_id, to, message)
    }

    fn recv(&self) -> Pin<Box<dyn Future<Output = Option<IncomingMessage>> + Send + '_>> {
        Box::pin(async move {
            if self.is_closed() {
                return None;
            }
            self.inbox.lock().await.recv().await
        })
    }

    fn try_recv(&self) -> Option<IncomingMessage> {
        if self.is_closed() {
            return None;
        }
        match self.inbox.try_lock() {
            Ok(mut inbox) => inbox.try_recv().ok(),
            Err(_) => None,
        }
    }

    fn local_id(&self) -> NodeId {
        self.node_id
    }

    fn add_peer(&self, _peer: NodeId, _addr: SocketAddr) -> TransportResult<()> {
        Ok(())
    }

    fn remove_peer(&self, _peer: NodeId) -> TransportResult<()> {
        Ok(())
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            self.network.nodes.remove(&self.node_id);
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
