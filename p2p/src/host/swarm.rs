//! # libp2p Swarm Host
//!
//! Production [`Host`] over a libp2p swarm:
//!
//! ```text
//! TCP (nodelay) → Noise XX → Yamux
//! Behaviours: gossipsub · kademlia · identify · raw streams (libp2p-stream)
//! ```
//!
//! The swarm lives in its own task. Callers talk to it over a command
//! channel and get answers back on oneshots; the event loop multiplexes
//! commands and swarm events with `tokio::select!`.
//!
//! Raw protocol streams bypass the loop entirely: `libp2p_stream::Control`
//! is cloneable, so `new_stream` and the per-protocol accept tasks drive
//! streams directly.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{AsyncReadExt, AsyncWriteExt, StreamExt};
use libp2p::gossipsub::{self, IdentTopic, MessageAcceptance, MessageAuthenticity, ValidationMode};
use libp2p::identity::Keypair;
use libp2p::kad::{self, store::MemoryStore, store::RecordStore, QueryId, RecordKey};
use libp2p::swarm::{dial_opts::DialOpts, NetworkBehaviour, SwarmEvent};
use libp2p::{identify, noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::error::Error as StdError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::{
    AddrInfo, DhtMode, Discovery, Host, HostError, HostPeerstore, PubSub, PubSubMessage, Stream,
    StreamHandler, Subscription, TopicValidator,
};
use crate::config::{P2pConfig, AGENT_VERSION, IDLE_CONNECTION_TIMEOUT, SUBSCRIPTION_CAPACITY};
use crate::crypto::PrivateKey;

/// Identify protocol version string.
const IDENTIFY_PROTOCOL: &str = "/pokt/id/1.0.0";

/// Capacity of the command channel into the swarm task.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// How long addresses learned through identify stay in the host peerstore.
const OBSERVED_ADDRESS_TTL: Duration = Duration::from_secs(30 * 60);

/// How long `SwarmHost::new` waits for the first listen address.
const LISTEN_READY_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Transport settings for [`SwarmHost`].
#[derive(Debug, Clone)]
pub struct SwarmHostConfig {
    /// Addresses to listen on. Empty means outbound only.
    pub listen_addrs: Vec<Multiaddr>,
    /// Initial Kademlia mode.
    pub dht_mode: DhtMode,
}

impl SwarmHostConfig {
    /// Derives transport settings from the module configuration.
    pub fn from_p2p_config(config: &P2pConfig) -> Self {
        Self {
            listen_addrs: config.listen_addrs.clone(),
            dht_mode: if config.client_debug_mode {
                DhtMode::Client
            } else {
                DhtMode::AutoServer
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Behaviour
// ---------------------------------------------------------------------------

#[derive(NetworkBehaviour)]
struct PocketBehaviour {
    gossipsub: gossipsub::Behaviour,
    kademlia: kad::Behaviour<MemoryStore>,
    identify: identify::Behaviour,
    stream: libp2p_stream::Behaviour,
}

fn build_behaviour(keypair: &Keypair) -> Result<PocketBehaviour, Box<dyn StdError + Send + Sync>> {
    let peer_id = keypair.public().to_peer_id();

    let gossipsub_config = gossipsub::ConfigBuilder::default()
        .validation_mode(ValidationMode::Strict)
        .validate_messages()
        .message_id_fn(|message: &gossipsub::Message| {
            gossipsub::MessageId::from(blake3::hash(&message.data).as_bytes().to_vec())
        })
        .build()
        .map_err(|e| e.to_string())?;
    let gossipsub = gossipsub::Behaviour::new(
        MessageAuthenticity::Signed(keypair.clone()),
        gossipsub_config,
    )
    .map_err(|e| e.to_string())?;

    let kademlia = kad::Behaviour::new(peer_id, MemoryStore::new(peer_id));

    let identify = identify::Behaviour::new(
        identify::Config::new(IDENTIFY_PROTOCOL.into(), keypair.public())
            .with_agent_version(AGENT_VERSION.into()),
    );

    Ok(PocketBehaviour {
        gossipsub,
        kademlia,
        identify,
        stream: libp2p_stream::Behaviour::new(),
    })
}

fn kad_mode(mode: DhtMode) -> Option<kad::Mode> {
    match mode {
        DhtMode::Client => Some(kad::Mode::Client),
        // `None` lets kademlia switch to server once an external address is
        // confirmed.
        DhtMode::AutoServer => None,
    }
}

fn stream_protocol(protocol: &str) -> Result<StreamProtocol, HostError> {
    StreamProtocol::try_from_owned(protocol.to_string())
        .map_err(|_| HostError::InvalidProtocol(protocol.to_string()))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<Result<T, HostError>>;

enum Command {
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: Reply<()>,
    },
    Disconnect {
        peer: PeerId,
    },
    Subscribe {
        topic: String,
        validator: TopicValidator,
        sender: mpsc::Sender<PubSubMessage>,
        reply: Reply<()>,
    },
    Unsubscribe {
        topic: String,
        reply: Reply<()>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: Reply<()>,
    },
    SetMode {
        mode: DhtMode,
    },
    Bootstrap {
        reply: Reply<()>,
    },
    StartProviding {
        key: RecordKey,
        reply: Reply<()>,
    },
    GetProviders {
        key: RecordKey,
        reply: Reply<Vec<AddrInfo>>,
    },
    Shutdown,
}

/// State shared between the host handle and the swarm task.
struct Shared {
    peerstore: HostPeerstore,
    listen_addrs: RwLock<Vec<Multiaddr>>,
    /// Connected peers and the best known address for each.
    connected: DashMap<PeerId, Multiaddr>,
}

// ---------------------------------------------------------------------------
// SwarmHost
// ---------------------------------------------------------------------------

/// [`Host`] backed by a libp2p swarm.
pub struct SwarmHost {
    id: PeerId,
    commands: mpsc::Sender<Command>,
    control: libp2p_stream::Control,
    shared: Arc<Shared>,
    handlers: Arc<RwLock<HashMap<String, StreamHandler>>>,
    accepting: Mutex<HashSet<String>>,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SwarmHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmHost").field("id", &self.id).finish()
    }
}

impl SwarmHost {
    /// Builds the swarm, starts listening, and spawns the event loop.
    ///
    /// Returns once the first listen address is bound (or immediately when
    /// there is nothing to listen on).
    pub async fn new(key: &PrivateKey, config: SwarmHostConfig) -> Result<Arc<Self>, HostError> {
        let keypair = key
            .to_libp2p_keypair()
            .map_err(|e| HostError::Transport(e.to_string()))?;
        let id = keypair.public().to_peer_id();

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| HostError::Transport(e.to_string()))?
            .with_dns()
            .map_err(|e| HostError::Transport(e.to_string()))?
            .with_behaviour(build_behaviour)
            .map_err(|e| HostError::Transport(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
            .build();

        swarm
            .behaviour_mut()
            .kademlia
            .set_mode(kad_mode(config.dht_mode));

        for addr in &config.listen_addrs {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| HostError::Transport(format!("listen on {addr}: {e}")))?;
        }

        let control = swarm.behaviour().stream.new_control();
        let shared = Arc::new(Shared {
            peerstore: HostPeerstore::new(),
            listen_addrs: RwLock::new(Vec::new()),
            connected: DashMap::new(),
        });

        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let ready_tx = (!config.listen_addrs.is_empty()).then_some(ready_tx);
        let task = tokio::spawn(run_swarm(swarm, command_rx, Arc::clone(&shared), ready_tx));

        if !config.listen_addrs.is_empty()
            && tokio::time::timeout(LISTEN_READY_TIMEOUT, ready_rx).await.is_err()
        {
            warn!(peer_id = %id, "no listen address bound within {:?}", LISTEN_READY_TIMEOUT);
        }

        info!(peer_id = %id, addrs = ?shared.listen_addrs.read(), "libp2p host started");

        Ok(Arc::new(Self {
            id,
            commands,
            control,
            shared,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            accepting: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        }))
    }

    /// Sends a command and waits for its reply.
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, HostError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HostError::Closed);
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| HostError::Closed)?;
        rx.await.map_err(|_| HostError::Closed)?
    }

    async fn notify(&self, command: Command) -> Result<(), HostError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HostError::Closed)
    }

    fn spawn_acceptor(&self, protocol: &str) -> Result<(), HostError> {
        let mut accepting = self.accepting.lock();
        if accepting.contains(protocol) {
            return Ok(());
        }
        let mut incoming = self
            .control
            .clone()
            .accept(stream_protocol(protocol)?)
            .map_err(|e| HostError::Transport(e.to_string()))?;
        accepting.insert(protocol.to_string());

        let protocol = protocol.to_string();
        let handlers = Arc::clone(&self.handlers);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while let Some((peer, stream)) = incoming.next().await {
                let handler = handlers.read().get(&protocol).cloned();
                match handler {
                    Some(handler) => {
                        let remote_addr = shared.connected.get(&peer).map(|a| a.value().clone());
                        handler(Box::new(SwarmStream::new(stream, &protocol, peer, remote_addr)));
                    }
                    // Handler was removed; dropping resets the stream.
                    None => trace!(%peer, protocol, "no handler, dropping inbound stream"),
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Host for SwarmHost {
    fn id(&self) -> PeerId {
        self.id
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.shared.listen_addrs.read().clone()
    }

    fn peerstore(&self) -> &HostPeerstore {
        &self.shared.peerstore
    }

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) -> Result<(), HostError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HostError::Closed);
        }
        stream_protocol(protocol)?;
        self.handlers.write().insert(protocol.to_string(), handler);
        self.spawn_acceptor(protocol)
    }

    fn remove_stream_handler(&self, protocol: &str) {
        self.handlers.write().remove(protocol);
    }

    async fn new_stream(&self, peer: PeerId, protocol: &str) -> Result<Box<dyn Stream>, HostError> {
        let stream_protocol = stream_protocol(protocol)?;
        if !self.shared.connected.contains_key(&peer) {
            let addrs = self.shared.peerstore.addrs(&peer);
            if addrs.is_empty() {
                return Err(HostError::NoAddresses(peer));
            }
            self.request(|reply| Command::Dial { peer, addrs, reply })
                .await?;
        }

        let stream = self
            .control
            .clone()
            .open_stream(peer, stream_protocol)
            .await
            .map_err(|e| match e {
                libp2p_stream::OpenStreamError::UnsupportedProtocol(_) => {
                    HostError::ProtocolNotSupported {
                        peer,
                        protocol: protocol.to_string(),
                    }
                }
                other => HostError::Io(other.to_string()),
            })?;
        let remote_addr = self.shared.connected.get(&peer).map(|a| a.value().clone());
        Ok(Box::new(SwarmStream::new(stream, protocol, peer, remote_addr)))
    }

    async fn connect(&self, info: AddrInfo) -> Result<(), HostError> {
        if info.peer_id == self.id {
            return Err(HostError::DialFailed {
                peer: info.peer_id,
                reason: "dial to self attempted".into(),
            });
        }
        self.shared
            .peerstore
            .add_addrs(&info.peer_id, &info.addrs, OBSERVED_ADDRESS_TTL);
        if self.shared.connected.contains_key(&info.peer_id) {
            return Ok(());
        }
        let AddrInfo { peer_id, addrs } = info;
        self.request(|reply| Command::Dial {
            peer: peer_id,
            addrs,
            reply,
        })
        .await
    }

    async fn disconnect(&self, peer: PeerId) -> Result<(), HostError> {
        self.notify(Command::Disconnect { peer }).await
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.shared.connected.iter().map(|e| *e.key()).collect()
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
        let _ = self.commands.send(Command::Shutdown).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!(peer_id = %self.id, "libp2p host stopped");
        Ok(())
    }
}

#[async_trait]
impl PubSub for SwarmHost {
    async fn join(&self, topic: &str, validator: TopicValidator) -> Result<Subscription, HostError> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let topic_name = topic.to_string();
        self.request(|reply| Command::Subscribe {
            topic: topic_name,
            validator,
            sender,
            reply,
        })
        .await?;
        Ok(Subscription::new(topic, receiver))
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), HostError> {
        let topic = topic.to_string();
        self.request(|reply| Command::Publish { topic, data, reply })
            .await
    }

    async fn leave(&self, topic: &str) -> Result<(), HostError> {
        let topic = topic.to_string();
        self.request(|reply| Command::Unsubscribe { topic, reply })
            .await
    }
}

#[async_trait]
impl Discovery for SwarmHost {
    async fn set_mode(&self, mode: DhtMode) -> Result<(), HostError> {
        self.notify(Command::SetMode { mode }).await
    }

    async fn bootstrap(&self) -> Result<(), HostError> {
        self.request(|reply| Command::Bootstrap { reply }).await
    }

    async fn advertise(&self, namespace: &str) -> Result<(), HostError> {
        let key = RecordKey::new(&namespace);
        self.request(|reply| Command::StartProviding { key, reply })
            .await
    }

    async fn find_peers(&self, namespace: &str) -> Result<Vec<AddrInfo>, HostError> {
        let key = RecordKey::new(&namespace);
        self.request(|reply| Command::GetProviders { key, reply })
            .await
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

struct Topic {
    validator: TopicValidator,
    sender: mpsc::Sender<PubSubMessage>,
}

struct ProviderQuery {
    key: RecordKey,
    found: HashSet<PeerId>,
    reply: Reply<Vec<AddrInfo>>,
}

/// Listen addresses kept per peer; the oldest is dropped first.
const MAX_KNOWN_ADDRS: usize = 16;

#[derive(Default)]
struct LoopState {
    pending_dials: HashMap<PeerId, Vec<Reply<()>>>,
    pending_providers: HashMap<QueryId, ProviderQuery>,
    topics: HashMap<gossipsub::TopicHash, Topic>,
    /// Listen addresses peers reported through identify or kademlia.
    /// Dropped when the last connection closes or the routing table evicts
    /// the peer.
    known_addrs: HashMap<PeerId, Vec<Multiaddr>>,
    /// Peers whose stored address is an ephemeral inbound one.
    inbound_only: HashSet<PeerId>,
}

impl LoopState {
    fn remember_addrs<'a>(&mut self, peer: PeerId, addrs: impl Iterator<Item = &'a Multiaddr>) {
        let known = self.known_addrs.entry(peer).or_default();
        for addr in addrs {
            if !known.contains(addr) {
                if known.len() == MAX_KNOWN_ADDRS {
                    known.remove(0);
                }
                known.push(addr.clone());
            }
        }
    }

    fn forget_peer(&mut self, peer: &PeerId) {
        self.known_addrs.remove(peer);
        self.inbound_only.remove(peer);
    }
}

async fn run_swarm(
    mut swarm: Swarm<PocketBehaviour>,
    mut commands: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
    mut ready: Option<oneshot::Sender<()>>,
) {
    let local_id = *swarm.local_peer_id();
    let mut state = LoopState::default();

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => handle_command(&mut swarm, &mut state, command),
                }
            }
            event = swarm.select_next_some() => {
                match event {
                    SwarmEvent::NewListenAddr { address, .. } => {
                        info!(%address, "listening");
                        {
                            let mut addrs = shared.listen_addrs.write();
                            if !addrs.contains(&address) {
                                addrs.push(address);
                            }
                        }
                        if let Some(ready) = ready.take() {
                            let _ = ready.send(());
                        }
                    }
                    SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                        debug!(%peer_id, address = %endpoint.get_remote_address(), "connection established");
                        if endpoint.is_dialer() {
                            shared.connected.insert(peer_id, endpoint.get_remote_address().clone());
                            state.inbound_only.remove(&peer_id);
                        } else if !shared.connected.contains_key(&peer_id) {
                            shared.connected.insert(peer_id, endpoint.get_remote_address().clone());
                            state.inbound_only.insert(peer_id);
                        }
                        for reply in state.pending_dials.remove(&peer_id).unwrap_or_default() {
                            let _ = reply.send(Ok(()));
                        }
                    }
                    SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                        if num_established == 0 {
                            debug!(%peer_id, "disconnected");
                            shared.connected.remove(&peer_id);
                            state.forget_peer(&peer_id);
                        }
                    }
                    SwarmEvent::OutgoingConnectionError { peer_id: Some(peer_id), error, .. } => {
                        debug!(%peer_id, error = %error, "outgoing connection failed");
                        if !shared.connected.contains_key(&peer_id) {
                            for reply in state.pending_dials.remove(&peer_id).unwrap_or_default() {
                                let _ = reply.send(Err(HostError::DialFailed {
                                    peer: peer_id,
                                    reason: error.to_string(),
                                }));
                            }
                        }
                    }
                    SwarmEvent::Behaviour(PocketBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                        propagation_source,
                        message_id,
                        message,
                    })) => {
                        let (acceptance, deliver) = match state.topics.get(&message.topic) {
                            Some(topic) if (topic.validator)(&propagation_source, &message.data) => {
                                (MessageAcceptance::Accept, Some(topic.sender.clone()))
                            }
                            Some(_) => (MessageAcceptance::Reject, None),
                            None => (MessageAcceptance::Ignore, None),
                        };
                        let _ = swarm.behaviour_mut().gossipsub.report_message_validation_result(
                            &message_id,
                            &propagation_source,
                            acceptance,
                        );
                        if let Some(sender) = deliver {
                            let delivered = PubSubMessage {
                                topic: message.topic.to_string(),
                                propagation_source,
                                source: message.source,
                                data: message.data,
                            };
                            if sender.try_send(delivered).is_err() {
                                debug!(%propagation_source, "subscription buffer full, message dropped");
                            }
                        }
                    }
                    SwarmEvent::Behaviour(PocketBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. })) => {
                        trace!(%peer_id, agent = %info.agent_version, "identified");
                        for addr in &info.listen_addrs {
                            swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
                        }
                        shared.peerstore.add_addrs(&peer_id, &info.listen_addrs, OBSERVED_ADDRESS_TTL);
                        if state.inbound_only.remove(&peer_id) {
                            if let Some(addr) = info.listen_addrs.first() {
                                shared.connected.insert(peer_id, addr.clone());
                            }
                        }
                        state.remember_addrs(peer_id, info.listen_addrs.iter());
                    }
                    SwarmEvent::Behaviour(PocketBehaviourEvent::Kademlia(event)) => {
                        handle_kademlia_event(&mut swarm, &mut state, &shared, local_id, event);
                    }
                    _ => {}
                }
            }
        }
    }

    for (_, replies) in state.pending_dials.drain() {
        for reply in replies {
            let _ = reply.send(Err(HostError::Closed));
        }
    }
    for (_, query) in state.pending_providers.drain() {
        let _ = query.reply.send(Err(HostError::Closed));
    }
    debug!(peer_id = %local_id, "swarm task exited");
}

fn handle_command(swarm: &mut Swarm<PocketBehaviour>, state: &mut LoopState, command: Command) {
    match command {
        Command::Dial { peer, addrs, reply } => {
            if swarm.is_connected(&peer) {
                let _ = reply.send(Ok(()));
                return;
            }
            for addr in &addrs {
                swarm.behaviour_mut().kademlia.add_address(&peer, addr.clone());
            }
            let opts = DialOpts::peer_id(peer).addresses(addrs).build();
            match swarm.dial(opts) {
                Ok(()) => state.pending_dials.entry(peer).or_default().push(reply),
                Err(e) => {
                    let _ = reply.send(Err(HostError::DialFailed {
                        peer,
                        reason: e.to_string(),
                    }));
                }
            }
        }
        Command::Disconnect { peer } => {
            let _ = swarm.disconnect_peer_id(peer);
        }
        Command::Subscribe {
            topic,
            validator,
            sender,
            reply,
        } => {
            let ident = IdentTopic::new(topic);
            let result = swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&ident)
                .map(|_| ())
                .map_err(|e| HostError::PubSub(e.to_string()));
            if result.is_ok() {
                state
                    .topics
                    .insert(ident.hash(), Topic { validator, sender });
            }
            let _ = reply.send(result);
        }
        Command::Unsubscribe { topic, reply } => {
            let ident = IdentTopic::new(topic);
            state.topics.remove(&ident.hash());
            let result = swarm
                .behaviour_mut()
                .gossipsub
                .unsubscribe(&ident)
                .map(|_| ())
                .map_err(|e| HostError::PubSub(e.to_string()));
            let _ = reply.send(result);
        }
        Command::Publish { topic, data, reply } => {
            let result = match swarm
                .behaviour_mut()
                .gossipsub
                .publish(IdentTopic::new(topic.clone()), data)
            {
                Ok(_) => Ok(()),
                // Nobody to gossip to yet is not a failure of the caller.
                Err(gossipsub::PublishError::InsufficientPeers) => {
                    debug!(topic, "no gossip peers for topic");
                    Ok(())
                }
                Err(gossipsub::PublishError::Duplicate) => Ok(()),
                Err(e) => Err(HostError::PubSub(e.to_string())),
            };
            let _ = reply.send(result);
        }
        Command::SetMode { mode } => {
            swarm.behaviour_mut().kademlia.set_mode(kad_mode(mode));
        }
        Command::Bootstrap { reply } => {
            let result = swarm
                .behaviour_mut()
                .kademlia
                .bootstrap()
                .map(|_| ())
                .map_err(|e| HostError::Dht(e.to_string()));
            let _ = reply.send(result);
        }
        Command::StartProviding { key, reply } => {
            if swarm.connected_peers().next().is_none() {
                let _ = reply.send(Err(HostError::Dht("no peers to advertise to".into())));
                return;
            }
            let result = swarm
                .behaviour_mut()
                .kademlia
                .start_providing(key)
                .map(|_| ())
                .map_err(|e| HostError::Dht(e.to_string()));
            let _ = reply.send(result);
        }
        Command::GetProviders { key, reply } => {
            let id = swarm.behaviour_mut().kademlia.get_providers(key.clone());
            state.pending_providers.insert(
                id,
                ProviderQuery {
                    key,
                    found: HashSet::new(),
                    reply,
                },
            );
        }
        Command::Shutdown => {}
    }
}

fn handle_kademlia_event(
    swarm: &mut Swarm<PocketBehaviour>,
    state: &mut LoopState,
    shared: &Shared,
    local_id: PeerId,
    event: kad::Event,
) {
    match event {
        kad::Event::RoutingUpdated {
            peer,
            addresses,
            old_peer,
            ..
        } => {
            state.remember_addrs(peer, addresses.iter());
            if let Some(evicted) = old_peer {
                state.known_addrs.remove(&evicted);
            }
        }
        kad::Event::OutboundQueryProgressed {
            id, result, step, ..
        } => match result {
            kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                providers,
                ..
            })) => {
                if let Some(query) = state.pending_providers.get_mut(&id) {
                    query.found.extend(providers);
                }
                if step.last {
                    finish_provider_query(swarm, state, shared, local_id, id, Ok(()));
                }
            }
            kad::QueryResult::GetProviders(Ok(
                kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
            )) => {
                finish_provider_query(swarm, state, shared, local_id, id, Ok(()));
            }
            kad::QueryResult::GetProviders(Err(e)) => {
                debug!(error = %e, "provider lookup failed");
                finish_provider_query(swarm, state, shared, local_id, id, Err(e.to_string()));
            }
            kad::QueryResult::StartProviding(Err(e)) => {
                debug!(error = %e, "advertising failed");
            }
            kad::QueryResult::Bootstrap(Err(e)) => {
                debug!(error = %e, "dht bootstrap step failed");
            }
            _ => {}
        },
        _ => {}
    }
}

fn finish_provider_query(
    swarm: &mut Swarm<PocketBehaviour>,
    state: &mut LoopState,
    shared: &Shared,
    local_id: PeerId,
    id: QueryId,
    outcome: Result<(), String>,
) {
    let Some(mut query) = state.pending_providers.remove(&id) else {
        return;
    };

    // Provider records stored locally carry addresses the query does not.
    let records = swarm.behaviour_mut().kademlia.store_mut().providers(&query.key);
    for record in records {
        state.remember_addrs(record.provider, record.addresses.iter());
        query.found.insert(record.provider);
    }

    if query.found.is_empty() {
        if let Err(reason) = outcome {
            let _ = query.reply.send(Err(HostError::Dht(reason)));
            return;
        }
    }

    let found = query
        .found
        .into_iter()
        .filter(|peer| *peer != local_id)
        .map(|peer_id| {
            let mut addrs = state.known_addrs.get(&peer_id).cloned().unwrap_or_default();
            for addr in shared.peerstore.addrs(&peer_id) {
                if !addrs.contains(&addr) {
                    addrs.push(addr);
                }
            }
            AddrInfo { peer_id, addrs }
        })
        .filter(|info| !info.addrs.is_empty())
        .collect();
    let _ = query.reply.send(Ok(found));
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

struct SwarmStream {
    inner: Option<libp2p::Stream>,
    protocol: String,
    remote: PeerId,
    remote_addr: Option<Multiaddr>,
    read_deadline: Option<Instant>,
    write_closed: bool,
}

impl SwarmStream {
    fn new(
        inner: libp2p::Stream,
        protocol: &str,
        remote: PeerId,
        remote_addr: Option<Multiaddr>,
    ) -> Self {
        Self {
            inner: Some(inner),
            protocol: protocol.to_string(),
            remote,
            remote_addr,
            read_deadline: None,
            write_closed: false,
        }
    }
}

fn io_error(e: std::io::Error) -> HostError {
    match e.kind() {
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
            HostError::StreamReset
        }
        _ => HostError::Io(e.to_string()),
    }
}

#[async_trait]
impl Stream for SwarmStream {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn remote_peer(&self) -> PeerId {
        self.remote
    }

    fn remote_multiaddr(&self) -> Option<Multiaddr> {
        self.remote_addr.clone()
    }

    fn set_read_deadline(&mut self, deadline: Instant) {
        self.read_deadline = Some(deadline);
    }

    async fn read_to_end(&mut self, limit: usize) -> Result<Vec<u8>, HostError> {
        let deadline = self.read_deadline;
        let inner = self.inner.as_mut().ok_or(HostError::StreamReset)?;

        let mut buf = Vec::new();
        let read = async {
            let mut limited = inner.take(limit as u64 + 1);
            limited.read_to_end(&mut buf).await
        };
        let result = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, read)
                .await
                .map_err(|_| HostError::ReadTimeout)?,
            None => read.await,
        };
        result.map_err(io_error)?;

        if buf.len() > limit {
            return Err(HostError::ReadLimitExceeded(limit));
        }
        Ok(buf)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), HostError> {
        if self.write_closed {
            return Err(HostError::StreamClosed);
        }
        let inner = self.inner.as_mut().ok_or(HostError::StreamReset)?;
        inner.write_all(data).await.map_err(io_error)?;
        inner.flush().await.map_err(io_error)
    }

    async fn close(&mut self) -> Result<(), HostError> {
        if self.write_closed {
            return Ok(());
        }
        let inner = self.inner.as_mut().ok_or(HostError::StreamReset)?;
        inner.close().await.map_err(io_error)?;
        self.write_closed = true;
        Ok(())
    }

    fn reset(&mut self) {
        // Dropping a yamux stream that was not closed resets it.
        self.inner = None;
    }
}
