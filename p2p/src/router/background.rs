//! # Background Router
//!
//! Opportunistic channel shared by every node, staked or not.
//!
//! - Broadcasts are gossiped on the `pokt/background` topic. A topic
//!   validator drops anything that is not a `BackgroundMessage` frame around
//!   a valid `PocketEnvelope`, so bad messages are never forwarded.
//! - Direct sends open a stream on the background protocol ID and share the
//!   unicast router's inbound handling.
//! - Peers are learned from the bootstrap list, from inbound streams and
//!   from periodic DHT lookups under the discovery namespace. The local node
//!   is always part of its own peerstore.
//!
//! Discovery failures are logged and retried on the next tick; they never
//! abort start.

use async_trait::async_trait;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::{MessageHandler, PeerHandler, Router, RouterKind, UnicastRouter, UnicastRouterConfig};
use crate::codec::{decode_frame, encode_frame, BackgroundMessage, EnvelopeRegistry};
use crate::config::{BACKGROUND_PROTOCOL_ID, BACKGROUND_TOPIC, PEER_DISCOVERY_NAMESPACE};
use crate::crypto::{Address, PublicKey};
use crate::error::P2pError;
use crate::host::{
    add_peer_to_host, AddrInfo, DhtMode, Host, HostError, Subscription,
    TopicValidator,
};
use crate::peer::{Peer, Peerstore};
use crate::telemetry::P2pMetrics;

/// Construction parameters for [`BackgroundRouter`].
pub struct BackgroundRouterConfig {
    /// Transport.
    pub host: Arc<dyn Host>,
    /// Local node key, used to put ourselves in the peerstore.
    pub public_key: PublicKey,
    /// Receives each accepted envelope.
    pub handler: MessageHandler,
    /// Decoders applied by the topic validator.
    pub registry: EnvelopeRegistry,
    /// Seed peers, each ending in `/p2p/<peer id>`.
    pub bootstrap_peers: Vec<Multiaddr>,
    /// Interval between DHT lookups.
    pub discovery_interval: Duration,
    /// Deadline for reading one inbound stream.
    pub read_timeout: Duration,
    /// Client debug nodes accept no streams and run the DHT as a client.
    pub client_debug_mode: bool,
    /// Metrics sink.
    pub metrics: Arc<P2pMetrics>,
}

/// Gossip plus DHT discovery.
pub struct BackgroundRouter {
    host: Arc<dyn Host>,
    local: Peer,
    handler: MessageHandler,
    registry: EnvelopeRegistry,
    metrics: Arc<P2pMetrics>,
    peerstore: RwLock<Arc<Peerstore>>,
    unicast: Arc<UnicastRouter>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BackgroundRouter {
    /// Creates the router, joins the topic, connects to bootstrap peers and
    /// starts the subscription and discovery loops.
    pub async fn new(config: BackgroundRouterConfig) -> Result<Arc<Self>, P2pError> {
        let listen = config
            .host
            .listen_addrs()
            .into_iter()
            .next()
            .ok_or_else(|| P2pError::Config("host has no listen address".into()))?;
        let local = Peer::from_multiaddr(config.public_key, listen)?;
        let (shutdown, _) = watch::channel(false);

        let router = Arc::new_cyclic(|weak: &Weak<Self>| {
            let on_message = weak.clone();
            let on_peer = weak.clone();
            let message_handler: MessageHandler = Arc::new(move |data| match on_message.upgrade() {
                Some(router) => router.handle_stream_data(&data),
                None => Ok(()),
            });
            let peer_handler: PeerHandler = Arc::new(move |peer| match on_peer.upgrade() {
                Some(router) => router.learn_peer(peer.clone()).map(|_| ()),
                None => Err(P2pError::Transport(HostError::Closed)),
            });

            let unicast = UnicastRouter::new(UnicastRouterConfig {
                host: Arc::clone(&config.host),
                protocol: BACKGROUND_PROTOCOL_ID.to_string(),
                read_timeout: config.read_timeout,
                client_debug_mode: config.client_debug_mode,
                message_handler,
                peer_handler,
                metrics: Arc::clone(&config.metrics),
            });

            let peerstore: Peerstore = std::iter::once(local.clone()).collect();
            Self {
                host: config.host,
                local,
                handler: config.handler,
                registry: config.registry,
                metrics: config.metrics,
                peerstore: RwLock::new(Arc::new(peerstore)),
                unicast,
                shutdown,
                tasks: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }
        });
        router.metrics.set_peerstore_size(RouterKind::Background, 1);

        router.unicast.start()?;

        let subscription = router
            .host
            .pubsub()
            .join(BACKGROUND_TOPIC, router.topic_validator())
            .await?;
        let receive = tokio::spawn(Arc::clone(&router).receive_loop(subscription));
        router.tasks.lock().push(receive);

        let mode = if config.client_debug_mode {
            DhtMode::Client
        } else {
            DhtMode::AutoServer
        };
        if let Err(e) = router.host.discovery().set_mode(mode).await {
            warn!(mode = ?mode, error = %e, "setting dht mode failed");
        }

        router.connect_bootstrap_peers(&config.bootstrap_peers).await;

        let discover = tokio::spawn(discovery_loop(
            Arc::downgrade(&router),
            config.discovery_interval,
            router.shutdown.subscribe(),
        ));
        router.tasks.lock().push(discover);

        info!(
            address = %router.local.address(),
            bootstrap_peers = config.bootstrap_peers.len(),
            dht_mode = ?mode,
            "background router started"
        );
        Ok(router)
    }

    /// Local peer entry.
    pub fn local_peer(&self) -> &Peer {
        &self.local
    }

    fn topic_validator(&self) -> TopicValidator {
        let registry = self.registry.clone();
        let metrics = Arc::clone(&self.metrics);
        Arc::new(move |from: &PeerId, data: &[u8]| {
            let result = decode_frame::<BackgroundMessage>(data)
                .and_then(|msg| registry.decode(&msg.data).map(|_| ()));
            match result {
                Ok(()) => true,
                Err(e) => {
                    metrics.background_rejected_total.inc();
                    debug!(peer_id = %from, error = %e, "background message rejected");
                    false
                }
            }
        })
    }

    async fn receive_loop(self: Arc<Self>, mut subscription: Subscription) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let message = tokio::select! {
                message = subscription.next() => message,
                _ = shutdown.changed() => None,
            };
            let Some(message) = message else {
                break;
            };
            trace!(from = %message.propagation_source, bytes = message.data.len(), "background message received");
            if let Err(e) = self.deliver(&message.data) {
                debug!(from = %message.propagation_source, error = %e, "handling background message failed");
            }
        }
        subscription.cancel();
        debug!("background subscription loop stopped");
    }

    /// Handles the bytes of one direct stream.
    fn handle_stream_data(&self, data: &[u8]) -> Result<(), P2pError> {
        self.deliver(data)
    }

    fn deliver(&self, frame: &[u8]) -> Result<(), P2pError> {
        let msg: BackgroundMessage = decode_frame(frame)?;
        self.registry.decode(&msg.data)?;
        (self.handler)(msg.data)
    }

    /// Adds `peer` unless its address is already known. Returns whether it
    /// was added.
    fn learn_peer(&self, peer: Peer) -> Result<bool, P2pError> {
        let size = {
            let mut guard = self.peerstore.write();
            if guard.contains(&peer.address()) {
                return Ok(false);
            }
            let mut next = Peerstore::clone(&guard);
            next.add_peer(peer.clone())?;
            *guard = Arc::new(next);
            guard.size()
        };
        add_peer_to_host(self.host.as_ref(), &peer);
        self.metrics.set_peerstore_size(RouterKind::Background, size);
        debug!(address = %peer.address(), url = peer.service_url(), "background peer added");
        Ok(true)
    }

    async fn connect_bootstrap_peers(&self, peers: &[Multiaddr]) {
        for addr in peers {
            if let Err(e) = self.connect_bootstrap_peer(addr).await {
                warn!(addr = %addr, error = %e, "bootstrap peer unreachable");
            }
        }
    }

    async fn connect_bootstrap_peer(&self, addr: &Multiaddr) -> Result<(), P2pError> {
        let (peer_id, dial_addr) = split_peer_id(addr)
            .ok_or_else(|| P2pError::Config(format!("bootstrap peer {addr} has no /p2p/ suffix")))?;
        if peer_id == self.host.id() {
            return Ok(());
        }
        let peer = Peer::from_peer_id(&peer_id, dial_addr.clone())?;
        self.learn_peer(peer)?;
        self.host
            .connect(AddrInfo {
                peer_id,
                addrs: vec![dial_addr],
            })
            .await?;
        debug!(peer_id = %peer_id, "connected to bootstrap peer");
        Ok(())
    }

    /// One discovery round: refresh the routing table, advertise, and add
    /// whatever the DHT returns.
    pub async fn discover(&self) -> Result<usize, P2pError> {
        let discovery = self.host.discovery();
        if let Err(e) = discovery.bootstrap().await {
            trace!(error = %e, "dht bootstrap failed");
        }
        if let Err(e) = discovery.advertise(PEER_DISCOVERY_NAMESPACE).await {
            trace!(error = %e, "dht advertise failed");
        }

        let mut added = 0;
        for info in discovery.find_peers(PEER_DISCOVERY_NAMESPACE).await? {
            if info.peer_id == self.host.id() {
                continue;
            }
            let Some(addr) = info.addrs.into_iter().next() else {
                continue;
            };
            match Peer::from_peer_id(&info.peer_id, addr) {
                Ok(peer) => {
                    if self.learn_peer(peer)? {
                        added += 1;
                    }
                }
                Err(e) => debug!(peer_id = %info.peer_id, error = %e, "unusable discovered peer"),
            }
        }
        Ok(added)
    }
}

async fn discovery_loop(
    router: Weak<BackgroundRouter>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let Some(router) = router.upgrade() else {
            break;
        };
        match router.discover().await {
            Ok(0) => {}
            Ok(added) => debug!(added, "discovered background peers"),
            Err(e) => debug!(error = %e, "peer discovery failed"),
        }
    }
    debug!("background discovery loop stopped");
}

/// Splits `/…/p2p/<id>` into the peer id and the dialable prefix.
fn split_peer_id(addr: &Multiaddr) -> Option<(PeerId, Multiaddr)> {
    let mut dial = addr.clone();
    match dial.pop()? {
        Protocol::P2p(peer_id) => Some((peer_id, dial)),
        _ => None,
    }
}

#[async_trait]
impl Router for BackgroundRouter {
    fn kind(&self) -> RouterKind {
        RouterKind::Background
    }

    async fn broadcast(&self, data: &[u8]) -> Result<(), P2pError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(P2pError::Transport(HostError::Closed));
        }
        let frame = encode_frame(&BackgroundMessage {
            data: data.to_vec(),
        })?;
        self.host
            .pubsub()
            .publish(BACKGROUND_TOPIC, frame.to_vec())
            .await?;
        self.metrics.background_published_total.inc();
        trace!(bytes = data.len(), "background broadcast published");
        Ok(())
    }

    async fn send(&self, data: &[u8], address: &Address) -> Result<(), P2pError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(P2pError::Transport(HostError::Closed));
        }
        let peer_id = self
            .peerstore
            .read()
            .get_peer(address)
            .map(Peer::peer_id)
            .ok_or(P2pError::PeerNotFound(*address))?;
        let frame = encode_frame(&BackgroundMessage {
            data: data.to_vec(),
        })?;
        self.unicast.send(peer_id, &frame).await?;
        Ok(())
    }

    fn peerstore(&self) -> Arc<Peerstore> {
        Arc::clone(&self.peerstore.read())
    }

    async fn add_peer(&self, peer: Peer) -> Result<(), P2pError> {
        let size = {
            let mut guard = self.peerstore.write();
            let mut next = Peerstore::clone(&guard);
            next.add_peer(peer.clone())?;
            *guard = Arc::new(next);
            guard.size()
        };
        add_peer_to_host(self.host.as_ref(), &peer);
        self.metrics.set_peerstore_size(RouterKind::Background, size);
        Ok(())
    }

    async fn remove_peer(&self, address: &Address) -> Result<(), P2pError> {
        let size = {
            let mut guard = self.peerstore.write();
            let mut next = Peerstore::clone(&guard);
            next.remove_peer(address)?;
            *guard = Arc::new(next);
            guard.size()
        };
        self.metrics.set_peerstore_size(RouterKind::Background, size);
        Ok(())
    }

    async fn close(&self) -> Result<(), P2pError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.send_replace(true);
        self.unicast.close();
        if let Err(e) = self.host.pubsub().leave(BACKGROUND_TOPIC).await {
            debug!(error = %e, "leaving background topic failed");
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(address = %self.local.address(), "background router closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{PocketEnvelope, DEBUG_TYPE_URL};
    use crate::crypto::PrivateKey;
    use crate::host::{MemoryHost, MemoryNetwork};
    use tokio::sync::mpsc;

    struct Node {
        key: PrivateKey,
        host: Arc<MemoryHost>,
        router: Arc<BackgroundRouter>,
        inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    fn bootstrap_addr(node: &Node) -> Multiaddr {
        node.host
            .listen_addr()
            .clone()
            .with(Protocol::P2p(node.key.peer_id()))
    }

    async fn node(network: &MemoryNetwork, bootstrap: Vec<Multiaddr>) -> Node {
        let key = PrivateKey::generate();
        let host = network.add_host(&key);
        let (tx, inbox) = mpsc::unbounded_channel();
        let router = BackgroundRouter::new(BackgroundRouterConfig {
            host: host.clone(),
            public_key: key.public_key(),
            handler: Arc::new(move |data| {
                let _ = tx.send(data);
                Ok(())
            }),
            registry: EnvelopeRegistry::new(),
            bootstrap_peers: bootstrap,
            discovery_interval: Duration::from_millis(20),
            read_timeout: Duration::from_secs(1),
            client_debug_mode: false,
            metrics: Arc::new(P2pMetrics::unregistered().unwrap()),
        })
        .await
        .unwrap();
        Node {
            key,
            host,
            router,
            inbox,
        }
    }

    fn envelope(body: &[u8]) -> Vec<u8> {
        PocketEnvelope::new(DEBUG_TYPE_URL, body.to_vec())
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn peerstore_starts_with_self() {
        let network = MemoryNetwork::new();
        let a = node(&network, vec![]).await;
        let peers = a.router.peerstore();
        assert_eq!(peers.size(), 1);
        assert!(peers.contains(&a.key.address()));
        assert_eq!(a.host.dht_mode(), DhtMode::AutoServer);
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers_but_not_self() {
        let network = MemoryNetwork::new();
        let mut a = node(&network, vec![]).await;
        let mut b = node(&network, vec![]).await;

        let payload = envelope(b"hello");
        a.router.broadcast(&payload).await.unwrap();

        assert_eq!(b.inbox.recv().await.unwrap(), payload);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.inbox.try_recv().is_err());
        assert_eq!(a.router.metrics.background_published_total.get(), 1);
    }

    #[tokio::test]
    async fn validator_drops_invalid_envelopes() {
        let network = MemoryNetwork::new();
        let a = node(&network, vec![]).await;
        let mut b = node(&network, vec![]).await;

        a.router.broadcast(b"definitely not an envelope").await.unwrap();
        a.host
            .pubsub()
            .publish(BACKGROUND_TOPIC, b"not even a frame".to_vec())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(b.inbox.try_recv().is_err());
        assert_eq!(network.rejected_messages(), 2);
        assert_eq!(b.router.metrics.background_rejected_total.get(), 2);
    }

    #[tokio::test]
    async fn bootstrap_and_direct_send() {
        let network = MemoryNetwork::new();
        let mut seed = node(&network, vec![]).await;
        let joiner = node(&network, vec![bootstrap_addr(&seed)]).await;

        assert!(joiner.router.peerstore().contains(&seed.key.address()));

        let payload = envelope(b"direct");
        joiner
            .router
            .send(&payload, &seed.key.address())
            .await
            .unwrap();
        assert_eq!(seed.inbox.recv().await.unwrap(), payload);

        // The seed learned the joiner from the inbound stream.
        assert!(seed.router.peerstore().contains(&joiner.key.address()));

        let stranger = PrivateKey::generate().address();
        assert!(matches!(
            joiner.router.send(&payload, &stranger).await,
            Err(P2pError::PeerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn discovery_fills_peerstores() {
        let network = MemoryNetwork::new();
        let seed = node(&network, vec![]).await;
        let a = node(&network, vec![bootstrap_addr(&seed)]).await;
        let b = node(&network, vec![bootstrap_addr(&seed)]).await;

        let everyone = [seed.key.address(), a.key.address(), b.key.address()];
        for _ in 0..100 {
            let done = [&a, &b]
                .iter()
                .all(|n| everyone.iter().all(|addr| n.router.peerstore().contains(addr)));
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        for n in [&a, &b] {
            assert_eq!(n.router.peerstore().size(), 3);
        }
    }

    #[tokio::test]
    async fn close_leaves_topic() {
        let network = MemoryNetwork::new();
        let a = node(&network, vec![]).await;
        let mut b = node(&network, vec![]).await;

        b.router.close().await.unwrap();
        b.router.close().await.unwrap();
        a.router.broadcast(&envelope(b"late")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.inbox.try_recv().is_err());
        assert!(b.router.broadcast(&envelope(b"x")).await.is_err());
    }

    #[test]
    fn peer_id_suffix_is_split_off() {
        let id = PrivateKey::generate().peer_id();
        let addr: Multiaddr = format!("/ip4/1.2.3.4/tcp/1/p2p/{id}").parse().unwrap();
        let (peer_id, dial) = split_peer_id(&addr).unwrap();
        assert_eq!(peer_id, id);
        assert_eq!(dial.to_string(), "/ip4/1.2.3.4/tcp/1");
        assert!(split_peer_id(&"/ip4/1.2.3.4/tcp/1".parse().unwrap()).is_none());
    }
}
