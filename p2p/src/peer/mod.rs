//! # Peers
//!
//! A [`Peer`] is everything the routers need to reach another node: its
//! public key, the address derived from it, the advertised service URL, and
//! the transport multiaddr the URL resolved to.
//!
//! - **url**: service URL ↔ multiaddr conversion and DNS policy.
//! - **peerstore**: address-keyed set of peers with deterministic ordering.

pub mod peerstore;
pub mod url;

use libp2p::{Multiaddr, PeerId};
use thiserror::Error;

use crate::crypto::{Address, KeyError, PublicKey};

pub use peerstore::{Peerstore, PeerstoreDelta, PeerstoreError};
pub use url::{multiaddr_to_url, url_to_multiaddr, Resolver, StaticResolver, SystemResolver, UrlError};

/// Errors raised while building a [`Peer`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Bad key material.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Service URL or multiaddr could not be converted.
    #[error(transparent)]
    Url(#[from] UrlError),

    /// The claimed address is not the hash of the public key.
    #[error("address {claimed} does not match public key (derives to {derived})")]
    AddressMismatch {
        /// Address the record claimed.
        claimed: Address,
        /// Address the public key actually derives to.
        derived: Address,
    },
}

/// A remote (or local) node known to a router.
///
/// The address is always derived from the public key and the multiaddr is
/// fixed at construction, so two `Peer`s with the same address are the same
/// node unless its service URL changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    public_key: PublicKey,
    address: Address,
    service_url: String,
    multiaddr: Multiaddr,
}

impl Peer {
    /// Builds a peer from its advertised service URL, resolving DNS once.
    pub async fn resolve(
        public_key: PublicKey,
        service_url: &str,
        resolver: &dyn Resolver,
    ) -> Result<Self, PeerError> {
        let multiaddr = url_to_multiaddr(service_url, resolver).await?;
        Ok(Self {
            address: public_key.address(),
            public_key,
            service_url: service_url.to_string(),
            multiaddr,
        })
    }

    /// Builds a peer from a transport address. The service URL is derived
    /// from the multiaddr.
    pub fn from_multiaddr(public_key: PublicKey, multiaddr: Multiaddr) -> Result<Self, PeerError> {
        let service_url = multiaddr_to_url(&multiaddr)?;
        let multiaddr = strip_peer_id(multiaddr);
        Ok(Self {
            address: public_key.address(),
            public_key,
            service_url,
            multiaddr,
        })
    }

    /// Builds a peer from a transport identity and the address it was seen at.
    pub fn from_peer_id(peer_id: &PeerId, multiaddr: Multiaddr) -> Result<Self, PeerError> {
        let public_key = PublicKey::from_peer_id(peer_id)?;
        Self::from_multiaddr(public_key, multiaddr)
    }

    /// Checks that `claimed` is the address of this peer's key.
    pub fn verify_address(&self, claimed: &Address) -> Result<(), PeerError> {
        if *claimed != self.address {
            return Err(PeerError::AddressMismatch {
                claimed: *claimed,
                derived: self.address,
            });
        }
        Ok(())
    }

    /// Ed25519 public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Canonical address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// `host:port` the peer advertised (or was seen at).
    pub fn service_url(&self) -> &str {
        &self.service_url
    }

    /// Resolved transport address.
    pub fn multiaddr(&self) -> &Multiaddr {
        &self.multiaddr
    }

    /// Transport identity.
    pub fn peer_id(&self) -> PeerId {
        self.public_key.peer_id()
    }
}

fn strip_peer_id(mut multiaddr: Multiaddr) -> Multiaddr {
    if let Some(libp2p::multiaddr::Protocol::P2p(_)) = multiaddr.iter().last() {
        multiaddr.pop();
    }
    multiaddr
}
