//! Ed25519 public key advertised by a node.

use crate::{IdentityError, Result};
use curve25519_dalek::MontgomeryPoint;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A node's public key.
///
/// Its hex form is the node's public address: it is what the provider
/// directory lists and what the DHT hashes to find the node. It serializes
/// as that hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Length of an encoded key.
    pub const LEN: usize = 32;

    pub(crate) fn new(key: VerifyingKey) -> Self {
        Self(key)
    }

    /// Decodes a compressed Edwards point.
    ///
    /// # Errors
    ///
    /// Fails unless `bytes` is exactly 32 bytes encoding a curve point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: &[u8; Self::LEN] = bytes.try_into().map_err(|_| {
            IdentityError::InvalidPublicKey(format!(
                "expected {} bytes, got {}",
                Self::LEN,
                bytes.len()
            ))
        })?;

        VerifyingKey::from_bytes(raw)
            .map(Self)
            .map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))
    }

    /// The compressed point.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        self.0.as_bytes()
    }

    /// First 8 bytes in hex, for logs.
    #[must_use]
    pub fn short_id(&self) -> String {
        hex::encode(&self.as_bytes()[..8])
    }

    pub(crate) fn to_montgomery(self) -> MontgomeryPoint {
        self.0.to_montgomery()
    }
}

impl FromStr for PublicKey {
    type Err = IdentityError;

    /// Parses hex, with or without a `0x` prefix.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        hex::decode(digits)
            .map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))
            .and_then(|bytes| Self::from_bytes(&bytes))
    }
}

impl TryFrom<String> for PublicKey {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        key.to_string()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.short_id()).finish()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Keypair;
    use pretty_assertions::assert_eq;

    #[test]
    fn short_id_is_16_hex_chars() {
        let key = Keypair::generate().public_key();
        assert_eq!(key.short_id().len(), 16);
        assert!(key.to_string().starts_with(&key.short_id()));
    }

    #[test]
    fn parses_own_display() {
        let key = Keypair::generate().public_key();

        assert_eq!(key.to_string().parse::<PublicKey>().unwrap(), key);
        assert_eq!(format!(" 0x{key}\n").parse::<PublicKey>().unwrap(), key);
        assert_eq!(PublicKey::from_bytes(key.as_bytes()).unwrap(), key);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = PublicKey::from_bytes(&[7u8; 16]).unwrap_err();
        assert!(err.to_string().contains("expected 32 bytes"));
        assert!("abcd".parse::<PublicKey>().is_err());
    }

    #[test]
    fn serializes_as_hex_string() {
        let key = Keypair::generate().public_key();

        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{key}\""));
        assert_eq!(serde_json::from_str::<PublicKey>(&json).unwrap(), key);
        assert!(serde_json::from_str::<PublicKey>("\"zz\"").is_err());
    }
}
