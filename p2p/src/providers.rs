//! # Staked-Peer Providers
//!
//! Read-side capabilities the routers are seeded from:
//!
//! - [`StakedPeerstoreProvider`] answers "who is staked at height H". It must
//!   be deterministic per height; RainTree's target tree depends on every node
//!   seeing the same list.
//! - [`CurrentHeightProvider`] answers "what height are we at".
//!
//! The implementations here cover tests and static deployments. A node backed
//! by persistence implements the traits over its own state.

use async_trait::async_trait;
use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::crypto::{Address, PublicKey};
use crate::peer::{Peer, PeerError, Peerstore, PeerstoreError, Resolver};

/// Errors raised by providers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Nothing is known at or below the requested height.
    #[error("no staked peerstore at height {0}")]
    UnknownHeight(u64),

    /// An actor record could not be turned into a peer.
    #[error("invalid actor {address}: {source}")]
    InvalidActor {
        /// Address the record claimed.
        address: Address,
        /// Underlying failure.
        #[source]
        source: PeerError,
    },

    /// Two actors collide in the peerstore.
    #[error(transparent)]
    Peerstore(#[from] PeerstoreError),

    /// A bootstrap multiaddr is unusable.
    #[error("invalid bootstrap peer {addr:?}: {reason}")]
    InvalidBootstrapPeer {
        /// Offending entry.
        addr: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The backing store failed.
    #[error("provider backend failed: {0}")]
    Backend(String),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Source of the staked peer set per block height.
#[async_trait]
pub trait StakedPeerstoreProvider: Send + Sync {
    /// Staked peers at `height`.
    async fn staked_peerstore_at_height(&self, height: u64) -> Result<Peerstore, ProviderError>;

    /// Staked peers at whatever height `heights` reports.
    async fn staked_peerstore_at_current_height(
        &self,
        heights: &dyn CurrentHeightProvider,
    ) -> Result<Peerstore, ProviderError> {
        self.staked_peerstore_at_height(heights.current_height()).await
    }
}

/// Source of the current block height.
pub trait CurrentHeightProvider: Send + Sync {
    /// Latest committed height.
    fn current_height(&self) -> u64;
}

// ---------------------------------------------------------------------------
// Heights
// ---------------------------------------------------------------------------

/// Height held in an atomic, advanced by whoever observes block commits.
#[derive(Debug, Default)]
pub struct AtomicHeight(AtomicU64);

impl AtomicHeight {
    /// Starts at `height`.
    pub fn new(height: u64) -> Self {
        Self(AtomicU64::new(height))
    }

    /// Moves to `height`. Never goes backwards.
    pub fn advance_to(&self, height: u64) {
        self.0.fetch_max(height, Ordering::AcqRel);
    }
}

impl CurrentHeightProvider for AtomicHeight {
    fn current_height(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Peerstore providers
// ---------------------------------------------------------------------------

/// The same staked set at every height.
#[derive(Debug, Clone, Default)]
pub struct StaticPeerstoreProvider {
    peerstore: Peerstore,
}

impl StaticPeerstoreProvider {
    /// Wraps a fixed peerstore.
    pub fn new(peerstore: Peerstore) -> Self {
        Self { peerstore }
    }
}

#[async_trait]
impl StakedPeerstoreProvider for StaticPeerstoreProvider {
    async fn staked_peerstore_at_height(&self, _height: u64) -> Result<Peerstore, ProviderError> {
        Ok(self.peerstore.clone())
    }
}

/// Snapshots keyed by the height they take effect at.
///
/// A query for height `H` returns the snapshot with the greatest key `<= H`.
#[derive(Debug, Clone, Default)]
pub struct HeightIndexedProvider {
    snapshots: BTreeMap<u64, Peerstore>,
}

impl HeightIndexedProvider {
    /// No snapshots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a snapshot effective from `height`.
    pub fn with_snapshot(mut self, height: u64, peerstore: Peerstore) -> Self {
        self.snapshots.insert(height, peerstore);
        self
    }

    /// Adds or replaces a snapshot in place.
    pub fn insert(&mut self, height: u64, peerstore: Peerstore) {
        self.snapshots.insert(height, peerstore);
    }
}

#[async_trait]
impl StakedPeerstoreProvider for HeightIndexedProvider {
    async fn staked_peerstore_at_height(&self, height: u64) -> Result<Peerstore, ProviderError> {
        self.snapshots
            .range(..=height)
            .next_back()
            .map(|(_, peerstore)| peerstore.clone())
            .ok_or(ProviderError::UnknownHeight(height))
    }
}

// ---------------------------------------------------------------------------
// Actor records
// ---------------------------------------------------------------------------

/// A staked actor as recorded on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRecord {
    /// Claimed address. Must derive from `public_key`.
    pub address: Address,
    /// Ed25519 public key.
    pub public_key: PublicKey,
    /// `host:port` the actor serves P2P on.
    pub service_url: String,
}

/// Builds a peerstore from actor records, resolving each service URL once.
///
/// Every call resolves afresh; providers queried repeatedly should hold a
/// [`ResolvedPeerCache`] instead.
pub async fn actors_to_peerstore(
    actors: &[ActorRecord],
    resolver: &dyn Resolver,
) -> Result<Peerstore, ProviderError> {
    ResolvedPeerCache::new()
        .actors_to_peerstore(actors, resolver)
        .await
}

/// Remembers the peer each `(public key, service URL)` resolved to.
///
/// A host name is resolved the first time it is seen and the chosen IP
/// stays fixed for as long as the actor keeps that service URL, so the same
/// actor list always yields the same peerstore. Actors that leave the list
/// are forgotten on the next build.
#[derive(Debug, Default)]
pub struct ResolvedPeerCache {
    peers: Mutex<HashMap<(PublicKey, String), Peer>>,
}

impl ResolvedPeerCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of remembered peers.
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// True when nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builds a peerstore from `actors`, resolving only service URLs not
    /// seen before.
    pub async fn actors_to_peerstore(
        &self,
        actors: &[ActorRecord],
        resolver: &dyn Resolver,
    ) -> Result<Peerstore, ProviderError> {
        let mut peerstore = Peerstore::new();
        let mut live = HashSet::with_capacity(actors.len());
        for actor in actors {
            let invalid = |source| ProviderError::InvalidActor {
                address: actor.address,
                source,
            };
            let key = (actor.public_key, actor.service_url.clone());
            let cached = self.peers.lock().get(&key).cloned();
            let peer = match cached {
                Some(peer) => peer,
                None => {
                    let peer = Peer::resolve(actor.public_key, &actor.service_url, resolver)
                        .await
                        .map_err(invalid)?;
                    self.peers.lock().insert(key.clone(), peer.clone());
                    peer
                }
            };
            peer.verify_address(&actor.address).map_err(invalid)?;
            peerstore.add_peer(peer)?;
            live.insert(key);
        }
        self.peers.lock().retain(|key, _| live.contains(key));
        Ok(peerstore)
    }
}

// ---------------------------------------------------------------------------
// Bootstrap peers
// ---------------------------------------------------------------------------

/// Parses a comma-separated list of bootstrap multiaddrs. Each entry must
/// end in `/p2p/<peer id>`; blank entries are skipped.
pub fn parse_bootstrap_peers(csv: &str) -> Result<Vec<Multiaddr>, ProviderError> {
    csv.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let addr: Multiaddr =
                entry
                    .parse()
                    .map_err(|e: libp2p::multiaddr::Error| ProviderError::InvalidBootstrapPeer {
                        addr: entry.to_string(),
                        reason: e.to_string(),
                    })?;
            match addr.iter().last() {
                Some(Protocol::P2p(_)) => Ok(addr),
                _ => Err(ProviderError::InvalidBootstrapPeer {
                    addr: entry.to_string(),
                    reason: "missing /p2p/<peer id> suffix".into(),
                }),
            }
        })
        .collect()
}
