//! # Routers
//!
//! A router owns a view of the network (its [`Peerstore`]) and a way to move
//! bytes across it.
//!
//! ```text
//! unicast.rs     inbound stream handling shared by the others
//! background.rs  gossipsub + DHT discovery, every node (staked or not)
//! raintree/      structured broadcast across staked peers only
//! ```
//!
//! Every peerstore mutation a router performs is mirrored into the host
//! peerstore so the transport can dial the peer.

pub mod background;
pub mod raintree;
pub mod unicast;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::crypto::Address;
use crate::error::P2pError;
use crate::peer::{Peer, Peerstore};

pub use background::{BackgroundRouter, BackgroundRouterConfig};
pub use raintree::{RainTreeRouter, RainTreeRouterConfig};
pub use unicast::{UnicastRouter, UnicastRouterConfig};

/// Receives the inner `PocketEnvelope` bytes of every accepted message.
pub type MessageHandler = Arc<dyn Fn(Vec<u8>) -> Result<(), P2pError> + Send + Sync>;

/// Called with the sender of each inbound stream before it is read.
pub type PeerHandler = Arc<dyn Fn(&Peer) -> Result<(), P2pError> + Send + Sync>;

/// Which router produced or carries a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouterKind {
    /// Staked structured broadcast.
    RainTree,
    /// Gossip plus direct sends.
    Background,
}

impl RouterKind {
    /// Stable lowercase label, used in metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RainTree => "raintree",
            Self::Background => "background",
        }
    }
}

impl fmt::Display for RouterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability shared by the RainTree and Background routers.
#[async_trait]
pub trait Router: Send + Sync {
    /// Identifies the router.
    fn kind(&self) -> RouterKind;

    /// Sends `data` (an encoded `PocketEnvelope`) to everyone the router
    /// reaches.
    async fn broadcast(&self, data: &[u8]) -> Result<(), P2pError>;

    /// Sends `data` to one peer of this router's peerstore.
    async fn send(&self, data: &[u8], address: &Address) -> Result<(), P2pError>;

    /// Snapshot of the router's peerstore.
    fn peerstore(&self) -> Arc<Peerstore>;

    /// Adds a peer and registers it with the host.
    async fn add_peer(&self, peer: Peer) -> Result<(), P2pError>;

    /// Removes a peer and forgets it on the host.
    async fn remove_peer(&self, address: &Address) -> Result<(), P2pError>;

    /// Stops accepting traffic. Idempotent.
    async fn close(&self) -> Result<(), P2pError>;
}
