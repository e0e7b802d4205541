//! # Key Management
//!
//! Ed25519 keys for node identity, plus the conversions the transport needs:
//! a libp2p [`Keypair`](libp2p::identity::Keypair) for the host and a
//! [`PeerId`] for addressing streams.
//!
//! Ed25519 peer IDs inline the public key (identity multihash), which is what
//! lets an inbound stream be turned back into a Pocket address without any
//! extra handshake.
//!
//! Key bytes are never logged. `Debug` on [`PrivateKey`] prints only the
//! public half.

use ed25519_dalek::{SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use libp2p::identity;
use libp2p::PeerId;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

use super::address::Address;

/// Multihash code of the identity hash.
const IDENTITY_MULTIHASH_CODE: u8 = 0x00;

/// Errors that can occur during key operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Secret key bytes have the wrong length or encoding.
    #[error("invalid secret key bytes")]
    InvalidSecretKey,

    /// Public key bytes are not a valid Ed25519 point.
    #[error("invalid public key bytes: not a valid Ed25519 point")]
    InvalidPublicKey,

    /// Address is not 20 hex-encoded bytes.
    #[error("invalid address encoding")]
    InvalidAddress,

    /// The peer ID does not inline an Ed25519 public key.
    #[error("peer id {0} does not carry an inline ed25519 public key")]
    UnsupportedPeerId(PeerId),
}

// ---------------------------------------------------------------------------
// PrivateKey
// ---------------------------------------------------------------------------

/// An Ed25519 private key identifying this node.
///
/// Deliberately not `Serialize`: exporting key material should be a
/// conscious call to [`to_hex`](Self::to_hex), not a side effect of dumping
/// a config struct.
#[derive(Clone)]
pub struct PrivateKey {
    signing_key: SigningKey,
}

impl PrivateKey {
    /// Generates a fresh key from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic key from a 32-byte seed. Test fixtures use this to get
    /// stable addresses.
    pub fn from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Parses a hex-encoded 32-byte secret.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; SECRET_KEY_LENGTH] =
            bytes.try_into().map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// Hex-encoded secret. Handle with care.
    pub fn to_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// The matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            bytes: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// The node address derived from the public key.
    pub fn address(&self) -> Address {
        Address::from_public_key(&self.public_key())
    }

    /// Converts to the keypair type the libp2p host is built from.
    pub fn to_libp2p_keypair(&self) -> Result<identity::Keypair, KeyError> {
        identity::Keypair::ed25519_from_bytes(self.signing_key.to_bytes())
            .map_err(|_| KeyError::InvalidSecretKey)
    }

    /// Transport identity of this node.
    pub fn peer_id(&self) -> PeerId {
        self.public_key().peer_id()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey(pub={})", self.public_key().to_hex())
    }
}

// ---------------------------------------------------------------------------
// PublicKey
// ---------------------------------------------------------------------------

/// A validated Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    bytes: [u8; 32],
}

impl PublicKey {
    /// Validates and wraps raw key bytes.
    ///
    /// Not every 32-byte string is a curve point; those that aren't are
    /// rejected here so nothing downstream has to care.
    pub fn try_from_slice(slice: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { bytes })
    }

    /// Parses a hex-encoded public key.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| KeyError::InvalidPublicKey)?;
        Self::try_from_slice(&bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Address derived from this key.
    pub fn address(&self) -> Address {
        Address::from_public_key(self)
    }

    /// libp2p representation of this key.
    pub fn to_libp2p(&self) -> Result<identity::PublicKey, KeyError> {
        let key = identity::ed25519::PublicKey::try_from_bytes(&self.bytes)
            .map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(identity::PublicKey::from(key))
    }

    /// Transport identity for this key.
    pub fn peer_id(&self) -> PeerId {
        // Bytes were validated at construction, so the conversion cannot fail
        // for any value of this type.
        match self.to_libp2p() {
            Ok(key) => key.to_peer_id(),
            Err(_) => unreachable!("PublicKey always holds a valid ed25519 point"),
        }
    }

    /// Recovers the public key inlined in an Ed25519 peer ID.
    pub fn from_peer_id(peer_id: &PeerId) -> Result<Self, KeyError> {
        let unsupported = || KeyError::UnsupportedPeerId(*peer_id);

        // Multihash layout: <code varint><length varint><digest>. Identity
        // digests of protobuf-encoded ed25519 keys are 36 bytes, so both
        // varints are single bytes.
        let bytes = peer_id.to_bytes();
        match bytes.as_slice() {
            [code, len, digest @ ..]
                if *code == IDENTITY_MULTIHASH_CODE && *len as usize == digest.len() =>
            {
                let key = identity::PublicKey::try_decode_protobuf(digest)
                    .map_err(|_| unsupported())?;
                let key = key.try_into_ed25519().map_err(|_| unsupported())?;
                Self::try_from_slice(&key.to_bytes())
            }
            _ => Err(unsupported()),
        }
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_is_deterministic() {
        let a = PrivateKey::from_seed(&[1u8; 32]);
        let b = PrivateKey::from_seed(&[1u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn hex_round_trip() {
        let key = PrivateKey::generate();
        let restored = PrivateKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(restored.public_key(), key.public_key());

        let public = PublicKey::from_hex(&key.public_key().to_hex()).unwrap();
        assert_eq!(public, key.public_key());
    }

    #[test]
    fn rejects_wrong_lengths() {
        assert_eq!(PrivateKey::from_hex("abcd").unwrap_err(), KeyError::InvalidSecretKey);
        assert_eq!(
            PublicKey::try_from_slice(&[0u8; 31]).unwrap_err(),
            KeyError::InvalidPublicKey
        );
    }

    #[test]
    fn peer_id_round_trips_to_public_key() {
        let key = PrivateKey::generate();
        let peer_id = key.peer_id();
        let recovered = PublicKey::from_peer_id(&peer_id).unwrap();
        assert_eq!(recovered, key.public_key());
        assert_eq!(recovered.address(), key.address());
    }

    #[test]
    fn libp2p_keypair_matches_peer_id() {
        let key = PrivateKey::generate();
        let keypair = key.to_libp2p_keypair().unwrap();
        assert_eq!(keypair.public().to_peer_id(), key.peer_id());
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let key = PrivateKey::generate();
        let rendered = format!("{key:?}");
        assert!(!rendered.contains(&key.to_hex()));
        assert!(rendered.contains(&key.public_key().to_hex()));
    }
}
