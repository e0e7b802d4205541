//! # In-Process Network
//!
//! A [`MemoryNetwork`] wires any number of [`MemoryHost`]s together without
//! sockets. Streams are `tokio::io::duplex` pipes, pub/sub fans out to every
//! joined host (running the receiver's validator), and the DHT is emulated by
//! a provider table searched over the connection graph.
//!
//! Semantics follow the real transport where the routers can observe them:
//!
//! - `new_stream` dials from the host peerstore; an unknown peer fails with
//!   [`HostError::NoAddresses`].
//! - `bootstrap` and `advertise` fail until at least one connection exists.
//! - `find_peers` only returns providers reachable through connections.
//!
//! Every inbound stream is recorded as a [`StreamProbe`] so tests can check
//! how handlers left it.

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{
    AddrInfo, DhtMode, Discovery, Host, HostError, HostPeerstore, PubSub, PubSubMessage, Stream,
    StreamHandler, Subscription, TopicValidator,
};
use crate::config::{PEER_ADDRESS_TTL, SUBSCRIPTION_CAPACITY};
use crate::crypto::PrivateKey;

/// Buffer of each in-memory pipe direction.
const PIPE_CAPACITY: usize = 64 * 1024;

/// First synthetic TCP port handed out.
const FIRST_PORT: u16 = 20_000;

// ---------------------------------------------------------------------------
// Stream state probes
// ---------------------------------------------------------------------------

/// How a stream ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Still usable.
    Open,
    /// Write side closed gracefully.
    Closed,
    /// Torn down.
    Reset,
}

/// Observation handle on the inbound end of a stream.
#[derive(Debug, Clone)]
pub struct StreamProbe {
    /// Protocol the stream was opened for.
    pub protocol: String,
    /// Host that accepted the stream.
    pub local: PeerId,
    /// Host that opened it.
    pub remote: PeerId,
    state: Arc<Mutex<StreamState>>,
}

impl StreamProbe {
    /// Current state of the inbound end.
    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

struct TopicMember {
    peer: PeerId,
    validator: TopicValidator,
    sender: mpsc::Sender<PubSubMessage>,
}

#[derive(Default)]
struct NetworkInner {
    hosts: RwLock<HashMap<PeerId, Weak<MemoryHost>>>,
    topics: RwLock<HashMap<String, Vec<TopicMember>>>,
    providers: RwLock<HashMap<String, BTreeSet<PeerId>>>,
    probes: Mutex<Vec<StreamProbe>>,
    next_port: AtomicU16,
    rejected: AtomicU64,
}

/// Shared medium for [`MemoryHost`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a host for `key`, listening on a fresh synthetic address.
    pub fn add_host(&self, key: &PrivateKey) -> Arc<MemoryHost> {
        let port = FIRST_PORT + self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        let listen_addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/{port}")
            .parse()
            .unwrap_or_else(|_| Multiaddr::empty());
        let host = Arc::new(MemoryHost {
            id: key.peer_id(),
            listen_addr,
            network: self.clone(),
            peerstore: HostPeerstore::new(),
            handlers: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashSet::new()),
            dht_mode: RwLock::new(DhtMode::AutoServer),
            closed: AtomicBool::new(false),
        });
        self.inner
            .hosts
            .write()
            .insert(host.id, Arc::downgrade(&host));
        host
    }

    /// Every inbound stream accepted so far.
    pub fn inbound_streams(&self) -> Vec<StreamProbe> {
        self.inner.probes.lock().clone()
    }

    /// Pub/sub messages dropped by a receiver's validator.
    pub fn rejected_messages(&self) -> u64 {
        self.inner.rejected.load(Ordering::Relaxed)
    }

    fn host(&self, id: &PeerId) -> Option<Arc<MemoryHost>> {
        self.inner.hosts.read().get(id).and_then(Weak::upgrade)
    }

    /// Peers reachable from `start` over live connections, `start` excluded.
    fn reachable_from(&self, start: PeerId) -> HashSet<PeerId> {
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            let Some(host) = self.host(&current) else {
                continue;
            };
            for next in host.connected_peers() {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen.remove(&start);
        seen
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// One node on a [`MemoryNetwork`].
pub struct MemoryHost {
    id: PeerId,
    listen_addr: Multiaddr,
    network: MemoryNetwork,
    peerstore: HostPeerstore,
    handlers: RwLock<HashMap<String, StreamHandler>>,
    connections: RwLock<HashSet<PeerId>>,
    dht_mode: RwLock<DhtMode>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MemoryHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHost")
            .field("id", &self.id)
            .field("listen_addr", &self.listen_addr)
            .finish()
    }
}

impl MemoryHost {
    /// The single synthetic listen address.
    pub fn listen_addr(&self) -> &Multiaddr {
        &self.listen_addr
    }

    /// Current DHT mode.
    pub fn dht_mode(&self) -> DhtMode {
        *self.dht_mode.read()
    }

    fn ensure_open(&self) -> Result<(), HostError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HostError::Closed);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Records a connection on both ends and lets the remote learn our
    /// address, as identify would.
    fn link(&self, remote: &MemoryHost) {
        self.connections.write().insert(remote.id);
        remote.connections.write().insert(self.id);
        remote.peerstore.add_addrs(
            &self.id,
            std::slice::from_ref(&self.listen_addr),
            PEER_ADDRESS_TTL,
        );
    }

    fn unlink(&self, remote: &MemoryHost) {
        self.connections.write().remove(&remote.id);
        remote.connections.write().remove(&self.id);
    }

    fn dial(&self, peer: PeerId) -> Result<Arc<MemoryHost>, HostError> {
        if peer == self.id {
            return Err(HostError::DialFailed {
                peer,
                reason: "dial to self attempted".into(),
            });
        }
        let remote = self
            .network
            .host(&peer)
            .filter(|h| !h.is_closed())
            .ok_or_else(|| HostError::DialFailed {
                peer,
                reason: "peer unreachable".into(),
            })?;
        if self.connections.read().contains(&peer) {
            return Ok(remote);
        }

        let known = self.peerstore.addrs(&peer);
        if known.is_empty() {
            return Err(HostError::NoAddresses(peer));
        }
        if !known.contains(&remote.listen_addr) {
            return Err(HostError::DialFailed {
                peer,
                reason: "no known address is reachable".into(),
            });
        }
        self.link(&remote);
        Ok(remote)
    }
}

#[async_trait]
impl Host for MemoryHost {
    fn id(&self) -> PeerId {
        self.id
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        vec![self.listen_addr.clone()]
    }

    fn peerstore(&self) -> &HostPeerstore {
        &self.peerstore
    }

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) -> Result<(), HostError> {
        self.ensure_open()?;
        if !protocol.starts_with('/') {
            return Err(HostError::InvalidProtocol(protocol.to_string()));
        }
        self.handlers.write().insert(protocol.to_string(), handler);
        Ok(())
    }

    fn remove_stream_handler(&self, protocol: &str) {
        self.handlers.write().remove(protocol);
    }

    async fn new_stream(&self, peer: PeerId, protocol: &str) -> Result<Box<dyn Stream>, HostError> {
        self.ensure_open()?;
        let remote = self.dial(peer)?;
        let handler = remote.handlers.read().get(protocol).cloned().ok_or_else(|| {
            HostError::ProtocolNotSupported {
                peer,
                protocol: protocol.to_string(),
            }
        })?;

        let (local_io, remote_io) = tokio::io::duplex(PIPE_CAPACITY);
        let outbound = MemoryStream::new(local_io, protocol, peer, remote.listen_addr.clone());
        let inbound = MemoryStream::new(remote_io, protocol, self.id, self.listen_addr.clone());

        self.network.inner.probes.lock().push(StreamProbe {
            protocol: protocol.to_string(),
            local: peer,
            remote: self.id,
            state: Arc::clone(&inbound.state),
        });

        trace!(from = %self.id, to = %peer, protocol, "memory stream opened");
        handler(Box::new(inbound));
        Ok(Box::new(outbound))
    }

    async fn connect(&self, info: AddrInfo) -> Result<(), HostError> {
        self.ensure_open()?;
        self.peerstore
            .add_addrs(&info.peer_id, &info.addrs, PEER_ADDRESS_TTL);
        self.dial(info.peer_id).map(|_| ())
    }

    async fn disconnect(&self, peer: PeerId) -> Result<(), HostError> {
        if let Some(remote) = self.network.host(&peer) {
            self.unlink(&remote);
        } else {
            self.connections.write().remove(&peer);
        }
        Ok(())
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.connections.read().iter().copied().collect()
    }

    fn pubsub(&self) -> &dyn PubSub {
        self
    }

    fn discovery(&self) -> &dyn Discovery {
        self
    }

    async fn close(&self) -> Result<(), HostError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.handlers.write().clear();
        for members in self.network.inner.topics.write().values_mut() {
            members.retain(|m| m.peer != self.id);
        }
        for providers in self.network.inner.providers.write().values_mut() {
            providers.remove(&self.id);
        }
        for peer in self.connected_peers() {
            self.disconnect(peer).await?;
        }
        debug!(peer_id = %self.id, "memory host closed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pub/Sub
// ---------------------------------------------------------------------------

#[async_trait]
impl PubSub for MemoryHost {
    async fn join(&self, topic: &str, validator: TopicValidator) -> Result<Subscription, HostError> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let mut topics = self.network.inner.topics.write();
        let members = topics.entry(topic.to_string()).or_default();
        members.retain(|m| m.peer != self.id);
        members.push(TopicMember {
            peer: self.id,
            validator,
            sender,
        });
        Ok(Subscription::new(topic, receiver))
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), HostError> {
        self.ensure_open()?;
        let topics = self.network.inner.topics.read();
        let Some(members) = topics.get(topic) else {
            return Ok(());
        };
        for member in members.iter().filter(|m| m.peer != self.id) {
            if member.sender.is_closed() {
                continue;
            }
            if !(member.validator)(&self.id, &data) {
                self.network.inner.rejected.fetch_add(1, Ordering::Relaxed);
                trace!(topic, to = %member.peer, "pubsub message rejected by validator");
                continue;
            }
            let message = PubSubMessage {
                topic: topic.to_string(),
                propagation_source: self.id,
                source: Some(self.id),
                data: data.clone(),
            };
            if member.sender.try_send(message).is_err() {
                debug!(topic, to = %member.peer, "subscription buffer full, message dropped");
            }
        }
        Ok(())
    }

    async fn leave(&self, topic: &str) -> Result<(), HostError> {
        if let Some(members) = self.network.inner.topics.write().get_mut(topic) {
            members.retain(|m| m.peer != self.id);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[async_trait]
impl Discovery for MemoryHost {
    async fn set_mode(&self, mode: DhtMode) -> Result<(), HostError> {
        *self.dht_mode.write() = mode;
        Ok(())
    }

    async fn bootstrap(&self) -> Result<(), HostError> {
        self.ensure_open()?;
        if self.connections.read().is_empty() {
            return Err(HostError::Dht("no peers in routing table".into()));
        }
        Ok(())
    }

    async fn advertise(&self, namespace: &str) -> Result<(), HostError> {
        self.bootstrap().await?;
        self.network
            .inner
            .providers
            .write()
            .entry(namespace.to_string())
            .or_default()
            .insert(self.id);
        Ok(())
    }

    async fn find_peers(&self, namespace: &str) -> Result<Vec<AddrInfo>, HostError> {
        self.ensure_open()?;
        let reachable = self.network.reachable_from(self.id);
        let providers: Vec<PeerId> = self
            .network
            .inner
            .providers
            .read()
            .get(namespace)
            .map(|set| set.iter().copied().filter(|p| reachable.contains(p)).collect())
            .unwrap_or_default();

        Ok(providers
            .into_iter()
            .filter_map(|peer_id| {
                let host = self.network.host(&peer_id)?;
                Some(AddrInfo {
                    peer_id,
                    addrs: vec![host.listen_addr.clone()],
                })
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

struct MemoryStream {
    io: Option<DuplexStream>,
    protocol: String,
    remote: PeerId,
    remote_addr: Multiaddr,
    read_deadline: Option<Instant>,
    state: Arc<Mutex<StreamState>>,
}

impl MemoryStream {
    fn new(io: DuplexStream, protocol: &str, remote: PeerId, remote_addr: Multiaddr) -> Self {
        Self {
            io: Some(io),
            protocol: protocol.to_string(),
            remote,
            remote_addr,
            read_deadline: None,
            state: Arc::new(Mutex::new(StreamState::Open)),
        }
    }

    fn state(&self) -> StreamState {
        *self.state.lock()
    }
}

#[async_trait]
impl Stream for MemoryStream {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn remote_peer(&self) -> PeerId {
        self.remote
    }

    fn remote_multiaddr(&self) -> Option<Multiaddr> {
        Some(self.remote_addr.clone())
    }

    fn set_read_deadline(&mut self, deadline: Instant) {
        self.read_deadline = Some(deadline);
    }

    async fn read_to_end(&mut self, limit: usize) -> Result<Vec<u8>, HostError> {
        if self.state() == StreamState::Reset {
            return Err(HostError::StreamReset);
        }
        let deadline = self.read_deadline;
        let io = self.io.as_mut().ok_or(HostError::StreamReset)?;

        let mut buf = Vec::new();
        let read = async {
            let mut limited = io.take(limit as u64 + 1);
            limited.read_to_end(&mut buf).await
        };
        let result = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, read)
                .await
                .map_err(|_| HostError::ReadTimeout)?,
            None => read.await,
        };
        result.map_err(|e| HostError::Io(e.to_string()))?;

        if buf.len() > limit {
            return Err(HostError::ReadLimitExceeded(limit));
        }
        Ok(buf)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), HostError> {
        match self.state() {
            StreamState::Open => {}
            StreamState::Closed => return Err(HostError::StreamClosed),
            StreamState::Reset => return Err(HostError::StreamReset),
        }
        let io = self.io.as_mut().ok_or(HostError::StreamReset)?;
        io.write_all(data)
            .await
            .map_err(|e| HostError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), HostError> {
        if self.state() != StreamState::Open {
            return Ok(());
        }
        let io = self.io.as_mut().ok_or(HostError::StreamReset)?;
        io.shutdown()
            .await
            .map_err(|e| HostError::Io(e.to_string()))?;
        *self.state.lock() = StreamState::Closed;
        Ok(())
    }

    fn reset(&mut self) {
        *self.state.lock() = StreamState::Reset;
        self.io = None;
    }
}
