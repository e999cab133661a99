//! DHT keys derived from node addresses.

use crate::{DhtError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// A 160-bit DHT key: the first 20 bytes of SHA-256 over an address string.
///
/// Node ids of the UDP network live in the same key space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AddressHash([u8; 20]);

impl AddressHash {
    /// The key length in bytes.
    pub const LEN: usize = 20;

    /// Hashes a node's public address.
    #[must_use]
    pub fn of(address: &str) -> Self {
        let digest = Sha256::digest(address.as_bytes());
        let mut out = [0u8; Self::LEN];
        out.copy_from_slice(&digest[..Self::LEN]);
        Self(out)
    }

    /// Wraps raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// A uniformly random key.
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Returns the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// XOR distance to `other`; compares big-endian.
    #[must_use]
    pub fn distance(&self, other: &Self) -> [u8; 20] {
        let mut out = [0u8; 20];
        for (o, (a, b)) in out.iter_mut().zip(self.0.iter().zip(other.0.iter())) {
            *o = a ^ b;
        }
        out
    }
}

impl TryFrom<String> for AddressHash {
    type Error = DhtError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<AddressHash> for String {
    fn from(hash: AddressHash) -> Self {
        hash.to_string()
    }
}

impl FromStr for AddressHash {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| DhtError::InvalidHash(e.to_string()))?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| DhtError::InvalidHash(format!("expected 40 hex characters: {s}")))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for AddressHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for AddressHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AddressHash({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn hash_is_truncated_sha256() {
        // SHA-256("abc") = ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad
        let hash = AddressHash::of("abc");
        assert_eq!(hash.to_string(), "ba7816bf8f01cfea414140de5dae2223b00361a3");
        assert_eq!(hash.to_string().len(), 40);
    }

    #[test]
    fn distance_is_symmetric_xor() {
        let a = AddressHash::from_bytes([0xF0; 20]);
        let b = AddressHash::from_bytes([0x0F; 20]);
        assert_eq!(a.distance(&b), [0xFF; 20]);
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), [0; 20]);
    }

    #[test]
    fn serializes_as_hex() {
        let hash = AddressHash::of("abc");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, "\"ba7816bf8f01cfea414140de5dae2223b00361a3\"");
        assert_eq!(serde_json::from_str::<AddressHash>(&json).unwrap(), hash);
    }

    #[test]
    fn parses_hex_form() {
        let hash = AddressHash::of("some node");
        assert_eq!(hash.to_string().parse::<AddressHash>().unwrap(), hash);
        assert!("abcd".parse::<AddressHash>().is_err());
    }
}
