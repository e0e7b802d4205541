//! Transport-level address book.
//!
//! Distinct from the Pocket [`Peerstore`](crate::peer::Peerstore): this one is
//! keyed by [`PeerId`], stores addresses with an expiry, and is what a host
//! consults when it has to dial. Entries are never removed outright;
//! addresses age out and keys stay.

use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::crypto::PublicKey;

#[derive(Debug, Default)]
struct Record {
    addrs: Vec<(Multiaddr, Instant)>,
    public_key: Option<PublicKey>,
}

impl Record {
    fn live_addrs(&self, now: Instant) -> impl Iterator<Item = &Multiaddr> {
        self.addrs
            .iter()
            .filter(move |(_, expires)| *expires > now)
            .map(|(addr, _)| addr)
    }
}

/// Peer ID → addresses and public key.
#[derive(Debug, Default)]
pub struct HostPeerstore {
    records: RwLock<HashMap<PeerId, Record>>,
}

impl HostPeerstore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds addresses valid for `ttl`. Re-adding an address extends its
    /// expiry, never shortens it.
    pub fn add_addrs(&self, peer: &PeerId, addrs: &[Multiaddr], ttl: Duration) {
        let expires = Instant::now() + ttl;
        let mut records = self.records.write();
        let record = records.entry(*peer).or_default();
        for addr in addrs {
            match record.addrs.iter_mut().find(|(known, _)| known == addr) {
                Some((_, current)) if *current < expires => *current = expires,
                Some(_) => {}
                None => record.addrs.push((addr.clone(), expires)),
            }
        }
    }

    /// Records the peer's public key.
    pub fn add_pub_key(&self, peer: &PeerId, key: PublicKey) {
        self.records.write().entry(*peer).or_default().public_key = Some(key);
    }

    /// Public key, if known.
    pub fn pub_key(&self, peer: &PeerId) -> Option<PublicKey> {
        self.records.read().get(peer).and_then(|r| r.public_key)
    }

    /// Unexpired addresses.
    pub fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        let now = Instant::now();
        self.records
            .read()
            .get(peer)
            .map(|r| r.live_addrs(now).cloned().collect())
            .unwrap_or_default()
    }

    /// Drops every address of `peer`.
    pub fn clear_addrs(&self, peer: &PeerId) {
        if let Some(record) = self.records.write().get_mut(peer) {
            record.addrs.clear();
        }
    }

    /// Peers with a key or at least one live address.
    pub fn peers(&self) -> Vec<PeerId> {
        let now = Instant::now();
        self.records
            .read()
            .iter()
            .filter(|(_, r)| r.public_key.is_some() || r.live_addrs(now).next().is_some())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Removes expired addresses and records left empty.
    pub fn prune_expired(&self) {
        let now = Instant::now();
        let mut records = self.records.write();
        records.retain(|_, r| {
            r.addrs.retain(|(_, expires)| *expires > now);
            r.public_key.is_some() || !r.addrs.is_empty()
        });
    }
}
