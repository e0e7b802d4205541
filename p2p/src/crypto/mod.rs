//! # Identity Primitives
//!
//! Node identity in Pocket is an Ed25519 keypair. The canonical identifier
//! used everywhere inside the node is the [`Address`]: the first 20 bytes of
//! the SHA-256 digest of the public key. Transport-level identifiers
//! (libp2p `PeerId`s) are derived from the same key, so either can be
//! recovered from the other through the public key.
//!
//! - **keys**: Ed25519 private/public key wrappers and libp2p conversions.
//! - **address**: 20-byte address derivation, hex encoding, ordering.

pub mod address;
pub mod keys;

pub use address::{Address, ADDRESS_LENGTH};
pub use keys::{KeyError, PrivateKey, PublicKey};

/// Draws a fresh 64-bit nonce from the thread-local CSPRNG.
pub fn random_nonce() -> u64 {
    rand::random()
}
