//! # P2P Configuration & Constants
//!
//! Every wire-visible identifier and every timing knob of the P2P layer
//! lives here. Protocol IDs and topic names are part of the network's
//! identity: two nodes that disagree on them simply never talk to each other,
//! so treat changes here as a network upgrade.

use std::collections::BTreeMap;
use std::time::Duration;

use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Protocol Identifiers
// ---------------------------------------------------------------------------

/// Stream protocol used by the RainTree router.
pub const RAINTREE_PROTOCOL_ID: &str = "/pokt/raintree/v1.0.0";

/// Stream protocol used by the Background router for direct sends.
pub const BACKGROUND_PROTOCOL_ID: &str = "/pokt/background/v1.0.0";

/// Gossipsub topic joined by every node.
pub const BACKGROUND_TOPIC: &str = "pokt/background";

/// DHT rendezvous namespace under which nodes advertise themselves.
pub const PEER_DISCOVERY_NAMESPACE: &str = "pokt/peer_discovery";

/// Agent string announced through identify.
pub const AGENT_VERSION: &str = concat!("pocket-p2p/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Deadline for reading one inbound stream to EOF.
pub const READ_STREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the host peerstore keeps addresses of a peer we added.
/// Two weeks: staked peers rarely move, and churn is handled at block commit.
pub const PEER_ADDRESS_TTL: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Interval between DHT provider lookups in the Background router.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// Idle connections are kept open for this long before the swarm prunes them.
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Capacity of the RainTree nonce deduper.
pub const MAX_NONCES: usize = 10_000;

/// Largest frame a stream may carry. Anything bigger is a misbehaving peer.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Capacity of the inbound envelope channel handed to the node.
pub const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Capacity of each pub/sub subscription buffer.
pub const SUBSCRIPTION_CAPACITY: usize = 256;

/// Default TCP port for P2P traffic.
pub const DEFAULT_P2P_PORT: u16 = 42069;

// ---------------------------------------------------------------------------
// Routing Policy
// ---------------------------------------------------------------------------

/// Which router(s) carry a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastRoute {
    /// Staked-only structured broadcast.
    RainTree,
    /// Opportunistic gossip over the background topic.
    Background,
    /// Both of the above.
    Both,
}

/// Maps envelope type URLs to routers.
///
/// The longest matching prefix wins; unmatched type URLs use `default_route`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPolicy {
    /// Route for type URLs that match no prefix.
    pub default_route: BroadcastRoute,
    /// Prefix → route overrides.
    pub routes: BTreeMap<String, BroadcastRoute>,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            default_route: BroadcastRoute::Both,
            routes: BTreeMap::new(),
        }
    }
}

impl RoutingPolicy {
    /// Resolves the route for a type URL.
    pub fn route_for(&self, type_url: &str) -> BroadcastRoute {
        self.routes
            .iter()
            .filter(|(prefix, _)| type_url.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, route)| *route)
            .unwrap_or(self.default_route)
    }
}

// ---------------------------------------------------------------------------
// P2pConfig
// ---------------------------------------------------------------------------

/// Runtime configuration of the P2P module.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Hex-encoded Ed25519 secret key of this node.
    pub private_key: Option<String>,
    /// Multiaddrs the host listens on.
    pub listen_addrs: Vec<Multiaddr>,
    /// Client debug nodes register no inbound stream handlers and run the
    /// DHT in client mode.
    pub client_debug_mode: bool,
    /// Deadline for reading an inbound stream.
    #[serde(with = "duration_secs")]
    pub read_timeout: Duration,
    /// Capacity of the RainTree nonce deduper.
    pub max_nonces: usize,
    /// Seed peers for the DHT. Each multiaddr must end in `/p2p/<peer id>`.
    pub bootstrap_peers: Vec<Multiaddr>,
    /// Interval between DHT provider lookups.
    #[serde(with = "duration_secs")]
    pub discovery_interval: Duration,
    /// Broadcast routing by envelope type URL.
    pub routing: RoutingPolicy,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            private_key: None,
            listen_addrs: Vec::new(),
            client_debug_mode: false,
            read_timeout: READ_STREAM_TIMEOUT,
            max_nonces: MAX_NONCES,
            bootstrap_peers: Vec::new(),
            discovery_interval: DISCOVERY_INTERVAL,
            routing: RoutingPolicy::default(),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
