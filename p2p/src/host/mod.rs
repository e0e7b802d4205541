//! # Host Abstraction
//!
//! The routers never touch a transport directly. They consume a [`Host`]:
//! something that owns connections and a transport-level peerstore, accepts
//! and opens per-protocol streams, and exposes pub/sub ([`PubSub`]) and DHT
//! discovery ([`Discovery`]) companions.
//!
//! ```text
//! memory.rs     in-process network (tests, local simulations)
//! swarm.rs      libp2p swarm over TCP + Noise + Yamux
//! peerstore.rs  transport address book with TTLs and public keys
//! ```
//!
//! The helpers at the bottom of this file implement the stream discipline
//! shared by every router: open → write → close on the way out, and
//! "always reset after reading" on the way in.

pub mod memory;
pub mod peerstore;
pub mod swarm;

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::config::PEER_ADDRESS_TTL;
use crate::crypto::PublicKey;
use crate::peer::{Peer, PeerError};

pub use memory::{MemoryHost, MemoryNetwork, StreamProbe, StreamState};
pub use peerstore::HostPeerstore;
pub use swarm::{SwarmHost, SwarmHostConfig};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Transport-level failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    /// No address is known for the peer, so it cannot be dialed.
    #[error("no known addresses for peer {0}")]
    NoAddresses(PeerId),

    /// Dialing failed.
    #[error("dial to {peer} failed: {reason}")]
    DialFailed {
        /// Target peer.
        peer: PeerId,
        /// Transport's explanation.
        reason: String,
    },

    /// The remote has no handler for the protocol.
    #[error("peer {peer} does not support protocol {protocol}")]
    ProtocolNotSupported {
        /// Target peer.
        peer: PeerId,
        /// Requested protocol ID.
        protocol: String,
    },

    /// Protocol ID is not a valid stream protocol.
    #[error("invalid protocol id {0:?}")]
    InvalidProtocol(String),

    /// The stream was reset by either side.
    #[error("stream reset")]
    StreamReset,

    /// Write attempted after close.
    #[error("stream closed for writing")]
    StreamClosed,

    /// Read deadline passed before EOF.
    #[error("read deadline exceeded")]
    ReadTimeout,

    /// Remote sent more than the read limit.
    #[error("stream exceeded read limit of {0} bytes")]
    ReadLimitExceeded(usize),

    /// I/O error on an open stream.
    #[error("stream i/o error: {0}")]
    Io(String),

    /// Pub/sub failure (join, publish).
    #[error("pubsub error: {0}")]
    PubSub(String),

    /// DHT failure (bootstrap, provide, lookup).
    #[error("dht error: {0}")]
    Dht(String),

    /// Transport construction or listen failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The host has been closed.
    #[error("host is closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// One logical, bidirectional byte stream to a remote peer.
#[async_trait]
pub trait Stream: Send {
    /// Protocol ID the stream was negotiated for.
    fn protocol(&self) -> &str;

    /// Transport identity of the remote.
    fn remote_peer(&self) -> PeerId;

    /// Address of the underlying connection, if known.
    fn remote_multiaddr(&self) -> Option<Multiaddr>;

    /// Sets an absolute deadline for subsequent reads.
    fn set_read_deadline(&mut self, deadline: Instant);

    /// Reads until EOF. Fails if more than `limit` bytes arrive.
    async fn read_to_end(&mut self, limit: usize) -> Result<Vec<u8>, HostError>;

    /// Writes all of `data`.
    async fn write_all(&mut self, data: &[u8]) -> Result<(), HostError>;

    /// Gracefully closes the write side.
    async fn close(&mut self) -> Result<(), HostError>;

    /// Abruptly terminates both directions.
    fn reset(&mut self);
}

/// Called by the host for each accepted stream. Must not block.
pub type StreamHandler = Arc<dyn Fn(Box<dyn Stream>) + Send + Sync>;

/// Peer ID plus dialable addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    /// Transport identity.
    pub peer_id: PeerId,
    /// Known addresses.
    pub addrs: Vec<Multiaddr>,
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// Transport capability consumed by the routers.
#[async_trait]
pub trait Host: Send + Sync {
    /// Local transport identity.
    fn id(&self) -> PeerId;

    /// Addresses the host is listening on.
    fn listen_addrs(&self) -> Vec<Multiaddr>;

    /// Transport address book.
    fn peerstore(&self) -> &HostPeerstore;

    /// Registers (or replaces) the handler for inbound streams of `protocol`.
    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) -> Result<(), HostError>;

    /// Stops accepting streams for `protocol`.
    fn remove_stream_handler(&self, protocol: &str);

    /// Opens a stream, dialing the peer from the peerstore if needed.
    async fn new_stream(&self, peer: PeerId, protocol: &str) -> Result<Box<dyn Stream>, HostError>;

    /// Connects to a peer at the given addresses.
    async fn connect(&self, info: AddrInfo) -> Result<(), HostError>;

    /// Closes every connection to `peer`.
    async fn disconnect(&self, peer: PeerId) -> Result<(), HostError>;

    /// Currently connected peers.
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Pub/sub companion.
    fn pubsub(&self) -> &dyn PubSub;

    /// DHT companion.
    fn discovery(&self) -> &dyn Discovery;

    /// Shuts the host down. Further calls fail with [`HostError::Closed`].
    async fn close(&self) -> Result<(), HostError>;
}

// ---------------------------------------------------------------------------
// Pub/Sub
// ---------------------------------------------------------------------------

/// Decides whether an inbound pub/sub message is accepted. Rejected messages
/// are dropped and not forwarded; the sender's gossip score suffers.
pub type TopicValidator = Arc<dyn Fn(&PeerId, &[u8]) -> bool + Send + Sync>;

/// A message received on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Peer that forwarded the message to us.
    pub propagation_source: PeerId,
    /// Original publisher, when signed.
    pub source: Option<PeerId>,
    /// Payload.
    pub data: Vec<u8>,
}

/// Stream of validated messages on one topic. Dropping it cancels delivery.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    receiver: mpsc::Receiver<PubSubMessage>,
}

impl Subscription {
    /// Wraps a receiver fed by the host.
    pub fn new(topic: impl Into<String>, receiver: mpsc::Receiver<PubSubMessage>) -> Self {
        Self {
            topic: topic.into(),
            receiver,
        }
    }

    /// Topic name.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, or `None` once the subscription is cancelled.
    pub async fn next(&mut self) -> Option<PubSubMessage> {
        self.receiver.recv().await
    }

    /// Stops delivery; buffered messages are discarded.
    pub fn cancel(&mut self) {
        self.receiver.close();
    }
}

/// Gossip pub/sub capability.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Joins `topic`, installing `validator` for inbound messages.
    async fn join(&self, topic: &str, validator: TopicValidator) -> Result<Subscription, HostError>;

    /// Publishes to `topic`.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), HostError>;

    /// Leaves `topic`.
    async fn leave(&self, topic: &str) -> Result<(), HostError>;
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Kademlia mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhtMode {
    /// Serve DHT queries once reachable.
    AutoServer,
    /// Query only.
    Client,
}

/// DHT-backed peer discovery.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Switches server/client mode.
    async fn set_mode(&self, mode: DhtMode) -> Result<(), HostError>;

    /// Populates the routing table from connected peers.
    async fn bootstrap(&self) -> Result<(), HostError>;

    /// Announces this node under `namespace`.
    async fn advertise(&self, namespace: &str) -> Result<(), HostError>;

    /// Finds other nodes advertised under `namespace`.
    async fn find_peers(&self, namespace: &str) -> Result<Vec<AddrInfo>, HostError>;
}

// ---------------------------------------------------------------------------
// Stream discipline helpers
// ---------------------------------------------------------------------------

/// Registers a peer's address and key with the host peerstore.
///
/// There is no inverse. Both routers share the host, so a peer leaving one
/// router's peerstore keeps its key and connections, and its addresses
/// expire after [`PEER_ADDRESS_TTL`] unless a router re-adds them.
pub fn add_peer_to_host(host: &dyn Host, peer: &Peer) {
    let peer_id = peer.peer_id();
    host.peerstore()
        .add_addrs(&peer_id, std::slice::from_ref(peer.multiaddr()), PEER_ADDRESS_TTL);
    host.peerstore().add_pub_key(&peer_id, *peer.public_key());
}

/// Opens a stream to `peer_id`, writes `data`, and closes it.
///
/// A failed write resets the stream. Nothing is retried.
pub async fn send_to_peer(
    host: &dyn Host,
    peer_id: PeerId,
    protocol: &str,
    data: &[u8],
) -> Result<(), HostError> {
    let mut stream = host.new_stream(peer_id, protocol).await.map_err(|e| {
        debug!(peer_id = %peer_id, protocol, error = %e, "opening stream failed");
        e
    })?;

    if let Err(e) = stream.write_all(data).await {
        debug!(peer_id = %peer_id, protocol, error = %e, "writing stream failed");
        stream.reset();
        return Err(e);
    }

    stream.close().await.map_err(|e| {
        debug!(peer_id = %peer_id, protocol, error = %e, "closing stream failed");
        stream.reset();
        e
    })
}

/// Builds a [`Peer`] describing the remote end of an inbound stream.
///
/// The address comes from the connection, falling back to the host
/// peerstore when the transport does not expose it.
pub fn peer_from_stream(host: &dyn Host, stream: &dyn Stream) -> Result<Peer, PeerError> {
    let peer_id = stream.remote_peer();
    let public_key = match host.peerstore().pub_key(&peer_id) {
        Some(key) => key,
        None => PublicKey::from_peer_id(&peer_id)?,
    };
    let multiaddr = stream
        .remote_multiaddr()
        .or_else(|| host.peerstore().addrs(&peer_id).into_iter().next())
        .ok_or(crate::peer::UrlError::UnsupportedTransport(Multiaddr::empty()))?;
    Peer::from_multiaddr(public_key, multiaddr)
}
