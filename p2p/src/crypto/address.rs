//! # Addresses
//!
//! An address is `SHA-256(public_key)[..20]`. Short enough to index maps
//! with, long enough that collisions are not a practical concern, and
//! trivially recomputed by anyone holding the public key, which is how
//! peerstores detect peers lying about who they are.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use super::keys::{KeyError, PublicKey};

/// Address length in bytes.
pub const ADDRESS_LENGTH: usize = 20;

/// Canonical node identifier derived from an Ed25519 public key.
///
/// Ordering is lexicographic over the raw bytes, which is the same as the
/// ordering of the lowercase hex strings. Peer lists and RainTree views rely
/// on this.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; ADDRESS_LENGTH]);

impl Address {
    /// Derives the address of a public key.
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let digest = Sha256::digest(public_key.as_bytes());
        let mut bytes = [0u8; ADDRESS_LENGTH];
        bytes.copy_from_slice(&digest[..ADDRESS_LENGTH]);
        Self(bytes)
    }

    /// Wraps raw address bytes without any derivation check.
    pub fn from_bytes(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    /// Lowercase hex encoding (40 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a hex-encoded address.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidAddress)?;
        let bytes: [u8; ADDRESS_LENGTH] =
            bytes.try_into().map_err(|_| KeyError::InvalidAddress)?;
        Ok(Self(bytes))
    }

    /// True when this address is the one `public_key` derives to.
    pub fn matches(&self, public_key: &PublicKey) -> bool {
        *self == Self::from_public_key(public_key)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl FromStr for Address {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrivateKey;

    #[test]
    fn address_is_truncated_sha256_of_public_key() {
        let key = PrivateKey::from_seed(&[7u8; 32]);
        let public_key = key.public_key();
        let digest = Sha256::digest(public_key.as_bytes());

        let address = Address::from_public_key(&public_key);
        assert_eq!(address.as_bytes()[..], digest[..ADDRESS_LENGTH]);
        assert!(address.matches(&public_key));
        assert_eq!(key.address(), address);
    }

    #[test]
    fn hex_round_trip_and_rejects_bad_input() {
        let address = PrivateKey::generate().address();
        let parsed: Address = address.to_hex().parse().unwrap();
        assert_eq!(parsed, address);

        assert!(Address::from_hex("zz").is_err());
        assert!(Address::from_hex(&"ab".repeat(19)).is_err());
    }

    #[test]
    fn ordering_matches_hex_ordering() {
        let mut addresses: Vec<Address> = (0..16).map(|_| PrivateKey::generate().address()).collect();
        let mut hexes: Vec<String> = addresses.iter().map(Address::to_hex).collect();
        addresses.sort();
        hexes.sort();
        let sorted_hex: Vec<String> = addresses.iter().map(Address::to_hex).collect();
        assert_eq!(sorted_hex, hexes);
    }
}
