//! # P2P Module
//!
//! The façade the rest of the node talks to. It owns both routers, decides
//! which one carries each broadcast, and turns inbound bytes into
//! [`InboundMessage`]s on a bounded channel.
//!
//! ```text
//!            broadcast / send                     InboundMessage
//!   node ──────────────────────▶ P2PModule ──────────────────────▶ node
//!                                 │      │
//!                      RainTreeRouter  BackgroundRouter
//!                                 │      │
//!                                 └─Host─┘
//! ```
//!
//! The host is built by the caller and handed in; `stop` closes it.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codec::{EnvelopeRegistry, PocketEnvelope};
use crate::config::{BroadcastRoute, P2pConfig, INBOUND_CHANNEL_CAPACITY};
use crate::crypto::{Address, PrivateKey};
use crate::error::P2pError;
use crate::host::Host;
use crate::peer::Peer;
use crate::providers::{CurrentHeightProvider, StakedPeerstoreProvider};
use crate::router::{
    BackgroundRouter, BackgroundRouterConfig, MessageHandler, RainTreeRouter,
    RainTreeRouterConfig, Router, RouterKind,
};
use crate::telemetry::P2pMetrics;

/// An envelope received from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Router that delivered it.
    pub source: RouterKind,
    /// Decoded envelope.
    pub envelope: PocketEnvelope,
}

/// Node events the module reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P2pEvent {
    /// A block was committed; the staked set may have changed.
    BlockCommitted {
        /// Committed height.
        height: u64,
    },
}

/// Which peerstore [`P2PModule::peer_list`] reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouterSelector {
    /// RainTree's staked set.
    Staked,
    /// The background router's peers.
    Unstaked,
    /// Background peers plus staked peers missing from them.
    #[default]
    All,
}

struct Routers {
    raintree: Arc<RainTreeRouter>,
    background: Arc<BackgroundRouter>,
}

/// Collaborators handed to [`P2PModule::new`].
pub struct P2PModuleDeps {
    /// Transport, already listening.
    pub host: Arc<dyn Host>,
    /// Staked set per height.
    pub provider: Arc<dyn StakedPeerstoreProvider>,
    /// Current height.
    pub heights: Arc<dyn CurrentHeightProvider>,
    /// Envelope decoders; unknown type URLs pass through.
    pub registry: EnvelopeRegistry,
    /// Metrics sink.
    pub metrics: Arc<P2pMetrics>,
}

/// The P2P subsystem.
pub struct P2PModule {
    config: P2pConfig,
    key: PrivateKey,
    deps: P2PModuleDeps,
    inbound: mpsc::Sender<InboundMessage>,
    routers: RwLock<Option<Arc<Routers>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl P2PModule {
    /// Validates the configuration. Returns the module and the receiving
    /// end of its inbound channel; nothing runs until [`start`](Self::start).
    pub fn new(
        config: P2pConfig,
        deps: P2PModuleDeps,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>), P2pError> {
        let key_hex = config
            .private_key
            .as_deref()
            .ok_or_else(|| P2pError::Config("private key is required".into()))?;
        let key = PrivateKey::from_hex(key_hex)?;
        if key.peer_id() != deps.host.id() {
            return Err(P2pError::Config(format!(
                "host identity {} does not match private key {}",
                deps.host.id(),
                key.peer_id()
            )));
        }
        if config.max_nonces == 0 {
            return Err(P2pError::Config("max_nonces must be positive".into()));
        }

        let (inbound, receiver) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let module = Self {
            config,
            key,
            deps,
            inbound,
            routers: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        };
        Ok((module, receiver))
    }

    /// Local node address.
    pub fn address(&self) -> Address {
        self.key.address()
    }

    /// Underlying host.
    pub fn host(&self) -> &Arc<dyn Host> {
        &self.deps.host
    }

    /// True between `start` and `stop`.
    pub fn is_started(&self) -> bool {
        self.routers.read().is_some()
    }

    /// Builds both routers and starts discovery.
    pub async fn start(&self) -> Result<(), P2pError> {
        let _guard = self.lifecycle.lock().await;
        if self.is_started() {
            return Err(P2pError::AlreadyStarted);
        }

        let raintree = RainTreeRouter::new(RainTreeRouterConfig {
            host: Arc::clone(&self.deps.host),
            address: self.key.address(),
            provider: Arc::clone(&self.deps.provider),
            height_provider: Arc::clone(&self.deps.heights),
            handler: self.inbound_handler(RouterKind::RainTree),
            max_nonces: self.config.max_nonces,
            read_timeout: self.config.read_timeout,
            client_debug_mode: self.config.client_debug_mode,
            metrics: Arc::clone(&self.deps.metrics),
        })
        .await?;

        let background = match BackgroundRouter::new(BackgroundRouterConfig {
            host: Arc::clone(&self.deps.host),
            public_key: self.key.public_key(),
            handler: self.inbound_handler(RouterKind::Background),
            registry: self.deps.registry.clone(),
            bootstrap_peers: self.config.bootstrap_peers.clone(),
            discovery_interval: self.config.discovery_interval,
            read_timeout: self.config.read_timeout,
            client_debug_mode: self.config.client_debug_mode,
            metrics: Arc::clone(&self.deps.metrics),
        })
        .await
        {
            Ok(router) => router,
            Err(e) => {
                let _ = raintree.close().await;
                return Err(e);
            }
        };

        *self.routers.write() = Some(Arc::new(Routers {
            raintree,
            background,
        }));
        info!(
            address = %self.key.address(),
            peer_id = %self.deps.host.id(),
            client_debug_mode = self.config.client_debug_mode,
            "p2p module started"
        );
        Ok(())
    }

    fn routers(&self) -> Result<Arc<Routers>, P2pError> {
        self.routers.read().clone().ok_or(P2pError::NotStarted)
    }

    /// Decodes inbound bytes and forwards them to the node.
    fn inbound_handler(&self, source: RouterKind) -> MessageHandler {
        let registry = self.deps.registry.clone();
        let inbound = self.inbound.clone();
        Arc::new(move |data: Vec<u8>| {
            let envelope = registry.decode(&data)?;
            inbound
                .try_send(InboundMessage { source, envelope })
                .map_err(|e| P2pError::Handler(format!("inbound channel: {e}")))
        })
    }

    /// Broadcasts `envelope` over the router(s) its type URL maps to.
    pub async fn broadcast(&self, envelope: &PocketEnvelope) -> Result<(), P2pError> {
        let routers = self.routers()?;
        let data = envelope.encode()?;
        let route = self.config.routing.route_for(&envelope.type_url);
        debug!(type_url = %envelope.type_url, route = ?route, "broadcasting envelope");

        match route {
            BroadcastRoute::RainTree => routers.raintree.broadcast(&data).await,
            BroadcastRoute::Background => routers.background.broadcast(&data).await,
            BroadcastRoute::Both => {
                let staked = routers.raintree.broadcast(&data).await;
                let gossip = routers.background.broadcast(&data).await;
                staked.and(gossip)
            }
        }
    }

    /// Sends `envelope` to one peer, through RainTree if the peer is staked
    /// and through the background router otherwise.
    pub async fn send(&self, address: &Address, envelope: &PocketEnvelope) -> Result<(), P2pError> {
        let routers = self.routers()?;
        let data = envelope.encode()?;
        if routers.raintree.peerstore().contains(address) {
            routers.raintree.send(&data, address).await
        } else if routers.background.peerstore().contains(address) {
            routers.background.send(&data, address).await
        } else {
            Err(P2pError::PeerNotFound(*address))
        }
    }

    /// Reacts to a node event.
    pub async fn handle_event(&self, event: P2pEvent) -> Result<(), P2pError> {
        match event {
            P2pEvent::BlockCommitted { height } => {
                let routers = self.routers()?;
                let counts = routers.raintree.drain_redundancy();
                self.deps.metrics.observe_redundancy(&counts);
                routers.raintree.refresh_at_height(height).await?;
                debug!(height, nonces = counts.len(), "block committed");
                Ok(())
            }
        }
    }

    /// Peers known to the selected router(s).
    pub fn peer_list(&self, selector: RouterSelector) -> Result<Vec<Peer>, P2pError> {
        let routers = self.routers()?;
        let peers = match selector {
            RouterSelector::Staked => routers.raintree.peerstore().peer_list(),
            RouterSelector::Unstaked => routers.background.peerstore().peer_list(),
            RouterSelector::All => {
                let unstaked = routers.background.peerstore();
                let mut peers = unstaked.peer_list();
                peers.extend(
                    routers
                        .raintree
                        .peerstore()
                        .iter()
                        .filter(|peer| !unstaked.contains(&peer.address()))
                        .cloned(),
                );
                peers
            }
        };
        Ok(peers)
    }

    /// Closes both routers and the host.
    pub async fn stop(&self) -> Result<(), P2pError> {
        let _guard = self.lifecycle.lock().await;
        let routers = self.routers.write().take().ok_or(P2pError::NotStarted)?;

        if let Err(e) = routers.background.close().await {
            warn!(error = %e, "closing background router failed");
        }
        if let Err(e) = routers.raintree.close().await {
            warn!(error = %e, "closing raintree router failed");
        }
        self.deps.host.close().await?;
        info!(address = %self.key.address(), "p2p module stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CONSENSUS_TYPE_URL, DEBUG_TYPE_URL};
    use crate::config::RoutingPolicy;
    use crate::host::MemoryNetwork;
    use crate::peer::Peerstore;
    use crate::providers::{AtomicHeight, StaticPeerstoreProvider};
    use std::time::Duration;

    fn config(key: &PrivateKey) -> P2pConfig {
        P2pConfig {
            private_key: Some(key.to_hex()),
            discovery_interval: Duration::from_millis(50),
            ..P2pConfig::default()
        }
    }

    fn deps(network: &MemoryNetwork, key: &PrivateKey, staked: Peerstore) -> P2PModuleDeps {
        P2PModuleDeps {
            host: network.add_host(key),
            provider: Arc::new(StaticPeerstoreProvider::new(staked)),
            heights: Arc::new(AtomicHeight::new(1)),
            registry: EnvelopeRegistry::new(),
            metrics: Arc::new(P2pMetrics::unregistered().unwrap()),
        }
    }

    #[test]
    fn private_key_is_required() {
        let network = MemoryNetwork::new();
        let key = PrivateKey::generate();
        let err = P2PModule::new(P2pConfig::default(), deps(&network, &key, Peerstore::new()))
            .err()
            .unwrap();
        assert!(matches!(err, P2pError::Config(_)));
    }

    #[test]
    fn host_must_match_key() {
        let network = MemoryNetwork::new();
        let key = PrivateKey::generate();
        let other = PrivateKey::generate();
        let err = P2PModule::new(config(&key), deps(&network, &other, Peerstore::new()))
            .err()
            .unwrap();
        assert!(matches!(err, P2pError::Config(_)));
    }

    #[tokio::test]
    async fn lifecycle_is_enforced() {
        let network = MemoryNetwork::new();
        let key = PrivateKey::generate();
        let (module, _inbox) =
            P2PModule::new(config(&key), deps(&network, &key, Peerstore::new())).unwrap();

        let envelope = PocketEnvelope::new(DEBUG_TYPE_URL, vec![1]);
        assert!(matches!(module.broadcast(&envelope).await, Err(P2pError::NotStarted)));
        assert!(matches!(module.peer_list(RouterSelector::All), Err(P2pError::NotStarted)));

        module.start().await.unwrap();
        assert!(matches!(module.start().await, Err(P2pError::AlreadyStarted)));
        assert!(module.is_started());

        module.stop().await.unwrap();
        assert!(!module.is_started());
        assert!(matches!(module.stop().await, Err(P2pError::NotStarted)));
    }

    #[tokio::test]
    async fn raintree_broadcast_delivers_locally() {
        let network = MemoryNetwork::new();
        let key = PrivateKey::generate();
        let mut cfg = config(&key);
        cfg.routing = RoutingPolicy {
            default_route: BroadcastRoute::RainTree,
            ..RoutingPolicy::default()
        };
        let (module, mut inbox) = P2PModule::new(cfg, deps(&network, &key, Peerstore::new())).unwrap();
        module.start().await.unwrap();

        let envelope = PocketEnvelope::new(CONSENSUS_TYPE_URL, b"vote".to_vec());
        module.broadcast(&envelope).await.unwrap();

        let got = inbox.recv().await.unwrap();
        assert_eq!(got.source, RouterKind::RainTree);
        assert_eq!(got.envelope, envelope);
        module.stop().await.unwrap();
    }

    #[tokio::test]
    async fn peer_list_merges_routers() {
        let network = MemoryNetwork::new();
        let key = PrivateKey::generate();
        let staked_key = PrivateKey::generate();
        let staked: Peerstore = std::iter::once(
            Peer::from_multiaddr(staked_key.public_key(), "/ip4/10.0.0.1/tcp/42069".parse().unwrap())
                .unwrap(),
        )
        .collect();
        let (module, _inbox) = P2PModule::new(config(&key), deps(&network, &key, staked)).unwrap();
        module.start().await.unwrap();

        let staked = module.peer_list(RouterSelector::Staked).unwrap();
        let unstaked = module.peer_list(RouterSelector::Unstaked).unwrap();
        let all = module.peer_list(RouterSelector::All).unwrap();
        assert_eq!(staked.len(), 1);
        assert_eq!(unstaked.len(), 1);
        assert_eq!(unstaked[0].address(), key.address());
        assert_eq!(all.len(), 2);

        let stranger = PrivateKey::generate().address();
        let envelope = PocketEnvelope::new(DEBUG_TYPE_URL, vec![]);
        assert!(matches!(
            module.send(&stranger, &envelope).await,
            Err(P2pError::PeerNotFound(_))
        ));

        module
            .handle_event(P2pEvent::BlockCommitted { height: 2 })
            .await
            .unwrap();
        module.stop().await.unwrap();
    }
}
