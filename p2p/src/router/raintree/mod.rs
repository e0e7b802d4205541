//! # RainTree Router
//!
//! Structured broadcast across the staked peer set. Every node sorts the
//! staked addresses (its own included), rotates the list so it sits at
//! index 0, and at each level `L` sends to the peers one third and two
//! thirds into a neighbourhood that shrinks as `L` falls. A receiver of a
//! level-`L` message continues the broadcast from its own position at
//! levels `L-1` down to 1, so no coordination is needed beyond sharing the
//! staked list for the current height.
//!
//! ## Delivery rules
//!
//! - The originator delivers its own payload once and never re-propagates.
//! - A receiver delivers a nonce upward the first time it sees it.
//! - A receiver propagates once per `(nonce, level)`. Copies arriving at a
//!   different level still propagate, which is what lets a node that first
//!   heard the message low in the tree cover its upper subtree.
//!
//! Each outbound copy is its own spawned stream; failures are counted and
//! logged, never retried.

mod targets;

pub use targets::{level_size, max_level, target_offsets};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::{MessageHandler, PeerHandler, Router, RouterKind, UnicastRouter, UnicastRouterConfig};
use crate::codec::{decode_frame, encode_frame, RainTreeMessage};
use crate::config::RAINTREE_PROTOCOL_ID;
use crate::crypto::{random_nonce, Address};
use crate::dedup::{Deduper, NonceDeduper, Observation};
use crate::error::P2pError;
use crate::host::{add_peer_to_host, Host, HostError};
use crate::peer::{Peer, Peerstore};
use crate::providers::{CurrentHeightProvider, StakedPeerstoreProvider};
use crate::telemetry::P2pMetrics;

// ---------------------------------------------------------------------------
// View
// ---------------------------------------------------------------------------

/// The staked set at one height, as seen from the local node.
#[derive(Debug, Clone)]
pub struct RainTreeView {
    peerstore: Arc<Peerstore>,
    addresses: Vec<Address>,
    self_index: usize,
    top: u8,
}

impl RainTreeView {
    /// Builds the view. `self_address` is part of the ring whether or not it
    /// is in `peerstore`.
    pub fn new(self_address: Address, peerstore: Peerstore) -> Self {
        let mut addresses = peerstore.addresses();
        if let Err(pos) = addresses.binary_search(&self_address) {
            addresses.insert(pos, self_address);
        }
        let self_index = addresses
            .binary_search(&self_address)
            .unwrap_or_default();
        let top = max_level(addresses.len());
        Self {
            peerstore: Arc::new(peerstore),
            addresses,
            self_index,
            top,
        }
    }

    /// Staked peers.
    pub fn peerstore(&self) -> &Arc<Peerstore> {
        &self.peerstore
    }

    /// Sorted ring of addresses, self included.
    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    /// Height of the tree.
    pub fn top(&self) -> u8 {
        self.top
    }

    /// Peers this node sends to at `level`.
    pub fn targets(&self, level: u8) -> Vec<Address> {
        let n = self.addresses.len();
        target_offsets(n, self.top, level)
            .into_iter()
            .map(|offset| self.addresses[(self.self_index + offset) % n])
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Construction parameters for [`RainTreeRouter`].
pub struct RainTreeRouterConfig {
    /// Transport.
    pub host: Arc<dyn Host>,
    /// Local node address.
    pub address: Address,
    /// Staked set per height.
    pub provider: Arc<dyn StakedPeerstoreProvider>,
    /// Height used to seed the initial view.
    pub height_provider: Arc<dyn CurrentHeightProvider>,
    /// Receives each delivered payload.
    pub handler: MessageHandler,
    /// Capacity of the nonce deduper.
    pub max_nonces: usize,
    /// Deadline for reading one inbound stream.
    pub read_timeout: Duration,
    /// When set, inbound streams are not accepted.
    pub client_debug_mode: bool,
    /// Metrics sink.
    pub metrics: Arc<P2pMetrics>,
}

/// Staked-peer structured broadcast.
pub struct RainTreeRouter {
    host: Arc<dyn Host>,
    address: Address,
    provider: Arc<dyn StakedPeerstoreProvider>,
    handler: MessageHandler,
    metrics: Arc<P2pMetrics>,
    view: RwLock<Arc<RainTreeView>>,
    nonces: NonceDeduper,
    propagated: Deduper<(u64, u8)>,
    unicast: Arc<UnicastRouter>,
    update: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl RainTreeRouter {
    /// Creates the router, seeds its view from the provider at the current
    /// height and starts accepting streams.
    pub async fn new(config: RainTreeRouterConfig) -> Result<Arc<Self>, P2pError> {
        let staked = config
            .provider
            .staked_peerstore_at_current_height(config.height_provider.as_ref())
            .await?;

        let router = Arc::new_cyclic(|weak: &Weak<Self>| {
            let on_message = weak.clone();
            let on_peer = weak.clone();
            let message_handler: MessageHandler = Arc::new(move |data| match on_message.upgrade() {
                Some(router) => router.handle_network_data(&data),
                None => Ok(()),
            });
            let peer_handler: PeerHandler = Arc::new(move |peer| match on_peer.upgrade() {
                Some(router) => router.handle_peer(peer),
                None => Err(P2pError::Transport(HostError::Closed)),
            });

            let unicast = UnicastRouter::new(UnicastRouterConfig {
                host: Arc::clone(&config.host),
                protocol: RAINTREE_PROTOCOL_ID.to_string(),
                read_timeout: config.read_timeout,
                client_debug_mode: config.client_debug_mode,
                message_handler,
                peer_handler,
                metrics: Arc::clone(&config.metrics),
            });

            Self {
                host: config.host,
                address: config.address,
                provider: config.provider,
                handler: config.handler,
                metrics: config.metrics,
                view: RwLock::new(Arc::new(RainTreeView::new(config.address, Peerstore::new()))),
                nonces: NonceDeduper::new(config.max_nonces),
                propagated: Deduper::new(config.max_nonces.saturating_mul(4)),
                unicast,
                update: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
            }
        });

        router.apply_peerstore(staked).await;
        router.unicast.start()?;

        let view = router.view();
        info!(
            address = %router.address,
            staked = view.peerstore().size(),
            top = view.top(),
            "raintree router started"
        );
        Ok(router)
    }

    /// Local node address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Current view.
    pub fn view(&self) -> Arc<RainTreeView> {
        Arc::clone(&self.view.read())
    }

    /// Replaces the staked set with the provider's snapshot at `height`.
    pub async fn refresh_at_height(&self, height: u64) -> Result<(), P2pError> {
        let next = self.provider.staked_peerstore_at_height(height).await?;
        self.apply_peerstore(next).await;
        debug!(height, staked = self.view().peerstore().size(), "raintree peerstore refreshed");
        Ok(())
    }

    /// Swaps in `next`, syncing the host peerstore with the difference.
    pub async fn apply_peerstore(&self, next: Peerstore) {
        let _guard = self.update.lock().await;
        self.replace_peerstore(next).await;
    }

    async fn replace_peerstore(&self, next: Peerstore) {
        let current = self.view();
        let delta = current.peerstore().delta(&next);

        for peer in delta.removed.iter().filter(|p| p.address() != self.address) {
            trace!(address = %peer.address(), "peer left the staked set");
        }
        for peer in delta.added.iter().filter(|p| p.address() != self.address) {
            add_peer_to_host(self.host.as_ref(), peer);
        }

        let size = next.size();
        *self.view.write() = Arc::new(RainTreeView::new(self.address, next));
        self.metrics.set_peerstore_size(RouterKind::RainTree, size);
        trace!(
            added = delta.added.len(),
            removed = delta.removed.len(),
            "raintree view updated"
        );
    }

    /// Per-nonce copy counts since the last drain.
    pub fn drain_redundancy(&self) -> Vec<(u64, u32)> {
        self.nonces.drain_copy_counts()
    }

    /// Processes the bytes of one inbound RainTree stream.
    pub fn handle_network_data(&self, data: &[u8]) -> Result<(), P2pError> {
        let msg: RainTreeMessage = decode_frame(data)?;

        let delivered = match self.nonces.observe(msg.nonce) {
            Observation::New => {
                self.metrics.raintree_deliveries_total.inc();
                (self.handler)(msg.data.clone())
            }
            Observation::Duplicate { copies } => {
                self.metrics.raintree_duplicates_total.inc();
                trace!(nonce = msg.nonce, level = msg.level, copies, "duplicate raintree message");
                Ok(())
            }
        };

        if msg.level > 0 && self.propagated.push((msg.nonce, msg.level)) {
            let view = self.view();
            let from = (msg.level - 1).min(view.top());
            self.fan_out(&view, msg.nonce, &msg.data, from)?;
        }

        delivered
    }

    /// Peers reaching us on the RainTree protocol are not added to the
    /// staked set; known ones get their transport address refreshed.
    fn handle_peer(&self, peer: &Peer) -> Result<(), P2pError> {
        let view = self.view();
        match view.peerstore().get_peer(&peer.address()) {
            Some(staked) => add_peer_to_host(self.host.as_ref(), staked),
            None => trace!(address = %peer.address(), "raintree stream from unstaked peer"),
        }
        Ok(())
    }

    /// Sends `data` at every level from `from` down to 1.
    fn fan_out(&self, view: &RainTreeView, nonce: u64, data: &[u8], from: u8) -> Result<(), P2pError> {
        for level in (1..=from).rev() {
            let targets = view.targets(level);
            if targets.is_empty() {
                continue;
            }
            let frame = encode_frame(&RainTreeMessage {
                level,
                nonce,
                data: data.to_vec(),
            })?;
            for address in targets {
                self.spawn_send(view, address, frame.clone(), level, nonce);
            }
        }
        Ok(())
    }

    fn spawn_send(&self, view: &RainTreeView, address: Address, frame: Bytes, level: u8, nonce: u64) {
        let Some(peer) = view.peerstore().get_peer(&address) else {
            debug!(address = %address, level, "raintree target not in peerstore");
            return;
        };
        let peer_id = peer.peer_id();
        let unicast = Arc::clone(&self.unicast);
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            match unicast.send(peer_id, &frame).await {
                Ok(()) => {
                    metrics.raintree_messages_sent_total.inc();
                    trace!(address = %address, level, nonce, "raintree message sent");
                }
                Err(e) => {
                    metrics.raintree_send_failures_total.inc();
                    debug!(address = %address, level, nonce, error = %e, "raintree send failed");
                }
            }
        });
    }

    fn ensure_open(&self) -> Result<(), P2pError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(P2pError::Transport(HostError::Closed));
        }
        Ok(())
    }
}

#[async_trait]
impl Router for RainTreeRouter {
    fn kind(&self) -> RouterKind {
        RouterKind::RainTree
    }

    async fn broadcast(&self, data: &[u8]) -> Result<(), P2pError> {
        self.ensure_open()?;
        let view = self.view();
        let nonce = random_nonce();

        self.nonces.observe(nonce);
        for level in 1..=view.top() {
            self.propagated.push((nonce, level));
        }

        self.fan_out(&view, nonce, data, view.top())?;

        self.metrics.raintree_deliveries_total.inc();
        if let Err(e) = (self.handler)(data.to_vec()) {
            warn!(nonce, error = %e, "local delivery of own broadcast failed");
        }
        debug!(nonce, top = view.top(), staked = view.peerstore().size(), "raintree broadcast");
        Ok(())
    }

    async fn send(&self, data: &[u8], address: &Address) -> Result<(), P2pError> {
        self.ensure_open()?;
        let view = self.view();
        let peer = view
            .peerstore()
            .get_peer(address)
            .ok_or(P2pError::PeerNotFound(*address))?;
        let frame = encode_frame(&RainTreeMessage {
            level: 0,
            nonce: random_nonce(),
            data: data.to_vec(),
        })?;
        self.unicast.send(peer.peer_id(), &frame).await?;
        self.metrics.raintree_messages_sent_total.inc();
        Ok(())
    }

    fn peerstore(&self) -> Arc<Peerstore> {
        Arc::clone(self.view().peerstore())
    }

    async fn add_peer(&self, peer: Peer) -> Result<(), P2pError> {
        let _guard = self.update.lock().await;
        let mut next = Peerstore::clone(self.view().peerstore());
        next.add_peer(peer)?;
        self.replace_peerstore(next).await;
        Ok(())
    }

    async fn remove_peer(&self, address: &Address) -> Result<(), P2pError> {
        let _guard = self.update.lock().await;
        let mut next = Peerstore::clone(self.view().peerstore());
        next.remove_peer(address)?;
        self.replace_peerstore(next).await;
        Ok(())
    }

    async fn close(&self) -> Result<(), P2pError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.unicast.close();
            info!(address = %self.address, "raintree router closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrivateKey;
    use crate::host::{AddrInfo, MemoryHost, MemoryNetwork};
    use crate::providers::{AtomicHeight, HeightIndexedProvider, StaticPeerstoreProvider};
    use tokio::sync::mpsc;

    struct Node {
        key: PrivateKey,
        host: Arc<MemoryHost>,
    }

    fn nodes(network: &MemoryNetwork, n: usize) -> (Vec<Node>, Peerstore) {
        let nodes: Vec<Node> = (0..n)
            .map(|_| {
                let key = PrivateKey::generate();
                let host = network.add_host(&key);
                Node { key, host }
            })
            .collect();
        let peerstore = nodes
            .iter()
            .map(|node| {
                Peer::from_multiaddr(node.key.public_key(), node.host.listen_addr().clone()).unwrap()
            })
            .collect();
        (nodes, peerstore)
    }

    async fn router(
        node: &Node,
        provider: Arc<dyn StakedPeerstoreProvider>,
    ) -> (Arc<RainTreeRouter>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = RainTreeRouter::new(RainTreeRouterConfig {
            host: node.host.clone(),
            address: node.key.address(),
            provider,
            height_provider: Arc::new(AtomicHeight::new(1)),
            handler: Arc::new(move |data| {
                let _ = tx.send(data);
                Ok(())
            }),
            max_nonces: 64,
            read_timeout: Duration::from_secs(1),
            client_debug_mode: false,
            metrics: Arc::new(P2pMetrics::unregistered().unwrap()),
        })
        .await
        .unwrap();
        (router, rx)
    }

    fn address_at(i: u8) -> Address {
        Address::from_bytes([i; 20])
    }

    #[test]
    fn view_of_twelve_matches_reference_trace() {
        let (_, peerstore) = nodes(&MemoryNetwork::new(), 11);
        let me = address_at(0);
        let view = RainTreeView::new(me, peerstore);
        let ring = view.addresses().to_vec();
        assert_eq!(ring.len(), 12);
        assert_eq!(ring[0], me);
        assert_eq!(view.top(), 3);
        assert_eq!(view.targets(3), vec![ring[4], ring[8]]);
        assert_eq!(view.targets(2), vec![ring[2], ring[5]]);
        assert_eq!(view.targets(1), vec![ring[1], ring[2]]);
        assert!(view.targets(0).is_empty());
    }

    #[test]
    fn view_wraps_around_from_the_middle() {
        let (_, peerstore) = nodes(&MemoryNetwork::new(), 5);
        let ring = peerstore.addresses();
        let view = RainTreeView::new(ring[4], peerstore);
        assert_eq!(view.addresses(), ring.as_slice());
        assert_eq!(view.top(), 2);
        assert_eq!(view.targets(2), vec![ring[0], ring[2]]);
        assert_eq!(view.targets(1), vec![ring[0], ring[1]]);
    }

    #[test]
    fn lone_node_has_no_targets() {
        let view = RainTreeView::new(address_at(1), Peerstore::new());
        assert_eq!(view.top(), 0);
        assert_eq!(view.addresses(), &[address_at(1)]);
    }

    #[tokio::test]
    async fn three_nodes_each_deliver_once() {
        let network = MemoryNetwork::new();
        let (nodes, peerstore) = nodes(&network, 3);
        let provider: Arc<dyn StakedPeerstoreProvider> =
            Arc::new(StaticPeerstoreProvider::new(peerstore));

        let mut routers = Vec::new();
        for node in &nodes {
            routers.push(router(node, Arc::clone(&provider)).await);
        }

        routers[0].0.broadcast(b"block").await.unwrap();
        for (_, inbox) in routers.iter_mut() {
            let got = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, b"block".to_vec());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        for (_, inbox) in routers.iter_mut() {
            assert!(inbox.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn duplicate_nonce_is_delivered_once() {
        let network = MemoryNetwork::new();
        let (nodes, peerstore) = nodes(&network, 1);
        let (router, mut inbox) =
            router(&nodes[0], Arc::new(StaticPeerstoreProvider::new(peerstore))).await;

        let frame = encode_frame(&RainTreeMessage {
            level: 0,
            nonce: 7,
            data: b"x".to_vec(),
        })
        .unwrap();
        router.handle_network_data(&frame).unwrap();
        router.handle_network_data(&frame).unwrap();

        assert_eq!(inbox.recv().await.unwrap(), b"x".to_vec());
        assert!(inbox.try_recv().is_err());
        assert_eq!(router.metrics.raintree_duplicates_total.get(), 1);
        assert_eq!(router.drain_redundancy(), vec![(7, 2)]);
        assert!(router.drain_redundancy().is_empty());
    }

    #[tokio::test]
    async fn garbage_is_rejected() {
        let network = MemoryNetwork::new();
        let (nodes, peerstore) = nodes(&network, 1);
        let (router, _inbox) =
            router(&nodes[0], Arc::new(StaticPeerstoreProvider::new(peerstore))).await;
        assert!(matches!(
            router.handle_network_data(b"\x00\x00"),
            Err(P2pError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn direct_send_reaches_only_the_target() {
        let network = MemoryNetwork::new();
        let (nodes, peerstore) = nodes(&network, 3);
        let provider: Arc<dyn StakedPeerstoreProvider> =
            Arc::new(StaticPeerstoreProvider::new(peerstore));
        let (a, _) = router(&nodes[0], Arc::clone(&provider)).await;
        let (_b, mut b_inbox) = router(&nodes[1], Arc::clone(&provider)).await;
        let (_c, mut c_inbox) = router(&nodes[2], Arc::clone(&provider)).await;

        a.send(b"hi", &nodes[1].key.address()).await.unwrap();
        assert_eq!(b_inbox.recv().await.unwrap(), b"hi".to_vec());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(c_inbox.try_recv().is_err());

        let stranger = PrivateKey::generate().address();
        assert!(matches!(
            a.send(b"hi", &stranger).await,
            Err(P2pError::PeerNotFound(addr)) if addr == stranger
        ));
    }

    #[tokio::test]
    async fn peer_updates_rebuild_the_view() {
        let network = MemoryNetwork::new();
        let (nodes, peerstore) = nodes(&network, 2);
        let only_first: Peerstore = peerstore.iter().take(1).cloned().collect();
        let (router, _) = router(&nodes[0], Arc::new(StaticPeerstoreProvider::new(only_first))).await;

        let extra = PrivateKey::generate();
        let peer = Peer::from_multiaddr(
            extra.public_key(),
            "/ip4/10.0.0.9/tcp/42069".parse().unwrap(),
        )
        .unwrap();
        router.add_peer(peer.clone()).await.unwrap();
        assert!(router.peerstore().contains(&extra.address()));
        assert!(router.add_peer(peer.clone()).await.is_err());
        assert!(!nodes[0].host.peerstore().addrs(&peer.peer_id()).is_empty());

        router.remove_peer(&extra.address()).await.unwrap();
        assert!(!router.peerstore().contains(&extra.address()));
        assert_eq!(
            nodes[0].host.peerstore().pub_key(&peer.peer_id()),
            Some(extra.public_key())
        );
        assert!(matches!(
            router.remove_peer(&extra.address()).await,
            Err(P2pError::Peerstore(_))
        ));
    }

    #[tokio::test]
    async fn refresh_follows_provider_heights() {
        let network = MemoryNetwork::new();
        let (nodes, peerstore) = nodes(&network, 3);
        let small: Peerstore = peerstore.iter().take(2).cloned().collect();
        let provider = HeightIndexedProvider::new()
            .with_snapshot(0, small)
            .with_snapshot(5, peerstore);
        let (router, _) = router(&nodes[0], Arc::new(provider)).await;
        assert_eq!(router.peerstore().size(), 2);

        router.refresh_at_height(5).await.unwrap();
        assert_eq!(router.peerstore().size(), 3);
        assert_eq!(router.view().top(), 1);
        assert_eq!(
            router
                .metrics
                .peerstore_size
                .with_label_values(&["raintree"])
                .get(),
            3
        );
    }

    #[tokio::test]
    async fn unstaked_peer_keeps_its_connection_and_key() {
        let network = MemoryNetwork::new();
        let (nodes, peerstore) = nodes(&network, 2);
        let only_first: Peerstore = peerstore.iter().take(1).cloned().collect();
        let provider = HeightIndexedProvider::new()
            .with_snapshot(0, peerstore)
            .with_snapshot(5, only_first);
        let (router, _) = router(&nodes[0], Arc::new(provider)).await;
        let other = nodes[1].key.peer_id();

        nodes[0]
            .host
            .connect(AddrInfo {
                peer_id: other,
                addrs: vec![nodes[1].host.listen_addr().clone()],
            })
            .await
            .unwrap();
        assert!(nodes[0].host.connected_peers().contains(&other));

        router.refresh_at_height(5).await.unwrap();
        assert!(!router.peerstore().contains(&nodes[1].key.address()));
        assert!(nodes[0].host.connected_peers().contains(&other));
        assert_eq!(
            nodes[0].host.peerstore().pub_key(&other),
            Some(nodes[1].key.public_key())
        );
    }

    #[tokio::test]
    async fn closed_router_refuses_work() {
        let network = MemoryNetwork::new();
        let (nodes, peerstore) = nodes(&network, 1);
        let (router, _) = router(&nodes[0], Arc::new(StaticPeerstoreProvider::new(peerstore))).await;
        router.close().await.unwrap();
        router.close().await.unwrap();
        assert!(router.broadcast(b"late").await.is_err());
    }
}
