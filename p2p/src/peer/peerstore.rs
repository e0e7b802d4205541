//! # Peerstore
//!
//! An address-keyed set of [`Peer`]s. Backed by a `BTreeMap` so iteration
//! order is the lexicographic address order every node agrees on; RainTree
//! target selection depends on that.
//!
//! The peerstore itself is plain data. Routers wrap theirs in a
//! `parking_lot::RwLock` (sends vastly outnumber membership changes) and
//! mirror every mutation into the host's transport peerstore.

use std::collections::BTreeMap;
use thiserror::Error;

use super::Peer;
use crate::crypto::Address;

/// Errors returned by peerstore mutations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerstoreError {
    /// A peer with this address is already present.
    #[error("peer {0} already exists in peerstore")]
    DuplicateAddress(Address),

    /// The peer's address does not derive from its public key, or it
    /// collides with a different key under the same address.
    #[error("invalid peer {0}: address does not match public key")]
    InvalidPeer(Address),

    /// No peer with this address.
    #[error("peer {0} not found in peerstore")]
    NotFound(Address),
}

/// Difference between two peerstores.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerstoreDelta {
    /// Peers present in the new set but not the old one (or changed).
    pub added: Vec<Peer>,
    /// Peers present in the old set but not the new one (or changed).
    pub removed: Vec<Peer>,
}

impl PeerstoreDelta {
    /// True when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Set of peers with unique addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Peerstore {
    peers: BTreeMap<Address, Peer>,
}

impl Peerstore {
    /// Empty peerstore.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a peer.
    ///
    /// Fails with `InvalidPeer` if the address is not the hash of the key
    /// (or an entry under the same address holds a different key) and with
    /// `DuplicateAddress` if the peer is already present.
    pub fn add_peer(&mut self, peer: Peer) -> Result<(), PeerstoreError> {
        let address = peer.address();
        if !address.matches(peer.public_key()) {
            return Err(PeerstoreError::InvalidPeer(address));
        }
        if let Some(existing) = self.peers.get(&address) {
            if existing.public_key() != peer.public_key() {
                return Err(PeerstoreError::InvalidPeer(address));
            }
            return Err(PeerstoreError::DuplicateAddress(address));
        }
        self.peers.insert(address, peer);
        Ok(())
    }

    /// Removes and returns the peer with `address`.
    pub fn remove_peer(&mut self, address: &Address) -> Result<Peer, PeerstoreError> {
        self.peers
            .remove(address)
            .ok_or(PeerstoreError::NotFound(*address))
    }

    /// Looks up a peer.
    pub fn get_peer(&self, address: &Address) -> Option<&Peer> {
        self.peers.get(address)
    }

    /// True when `address` is present.
    pub fn contains(&self, address: &Address) -> bool {
        self.peers.contains_key(address)
    }

    /// All peers, sorted by address.
    pub fn peer_list(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }

    /// All addresses, sorted.
    pub fn addresses(&self) -> Vec<Address> {
        self.peers.keys().copied().collect()
    }

    /// Iterates peers in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Number of peers.
    pub fn size(&self) -> usize {
        self.peers.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Computes what must be added and removed to turn `self` into `next`.
    ///
    /// A peer whose service URL changed shows up in both lists so the host
    /// peerstore gets the new address.
    pub fn delta(&self, next: &Peerstore) -> PeerstoreDelta {
        let added = next
            .iter()
            .filter(|peer| self.get_peer(&peer.address()) != Some(*peer))
            .cloned()
            .collect();
        let removed = self
            .iter()
            .filter(|peer| next.get_peer(&peer.address()) != Some(*peer))
            .cloned()
            .collect();
        PeerstoreDelta { added, removed }
    }
}

impl FromIterator<Peer> for Peerstore {
    /// Collects peers, keeping the first entry per address.
    fn from_iter<I: IntoIterator<Item = Peer>>(iter: I) -> Self {
        let mut store = Peerstore::new();
        for peer in iter {
            let _ = store.add_peer(peer);
        }
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrivateKey;

    fn make_peer(port: u16) -> Peer {
        let key = PrivateKey::generate();
        Peer::from_multiaddr(
            key.public_key(),
            format!("/ip4/10.0.0.1/tcp/{port}").parse().unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn add_get_remove() {
        let mut store = Peerstore::new();
        let peer = make_peer(1);
        let address = peer.address();

        store.add_peer(peer.clone()).unwrap();
        assert_eq!(store.size(), 1);
        assert_eq!(store.get_peer(&address), Some(&peer));

        let removed = store.remove_peer(&address).unwrap();
        assert_eq!(removed, peer);
        assert_eq!(store.get_peer(&address), None);
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn duplicate_and_missing_are_errors() {
        let mut store = Peerstore::new();
        let peer = make_peer(1);
        store.add_peer(peer.clone()).unwrap();
        assert_eq!(
            store.add_peer(peer.clone()),
            Err(PeerstoreError::DuplicateAddress(peer.address()))
        );
        assert_eq!(store.size(), 1);

        let missing = make_peer(2).address();
        assert_eq!(store.remove_peer(&missing), Err(PeerstoreError::NotFound(missing)));
    }

    #[test]
    fn peer_list_is_sorted_by_address() {
        let store: Peerstore = (0..20).map(make_peer).collect();
        let addresses: Vec<Address> = store.peer_list().iter().map(Peer::address).collect();
        let mut sorted = addresses.clone();
        sorted.sort();
        assert_eq!(addresses, sorted);
        assert_eq!(store.addresses(), sorted);
    }

    #[test]
    fn delta_reports_additions_removals_and_moves() {
        let kept = make_peer(1);
        let dropped = make_peer(2);
        let joined = make_peer(3);
        let moved_before = make_peer(4);
        let moved_after = Peer::from_multiaddr(
            *moved_before.public_key(),
            "/ip4/10.9.9.9/tcp/4".parse().unwrap(),
        )
        .unwrap();

        let old: Peerstore = [kept.clone(), dropped.clone(), moved_before.clone()]
            .into_iter()
            .collect();
        let new: Peerstore = [kept.clone(), joined.clone(), moved_after.clone()]
            .into_iter()
            .collect();

        let delta = old.delta(&new);
        assert_eq!(delta.added.len(), 2);
        assert!(delta.added.contains(&joined));
        assert!(delta.added.contains(&moved_after));
        assert_eq!(delta.removed.len(), 2);
        assert!(delta.removed.contains(&dropped));
        assert!(delta.removed.contains(&moved_before));

        assert!(new.delta(&new).is_empty());
    }
}
