//! Ed25519 keypair and X25519 key agreement.

use crate::{IdentityError, PublicKey, Result};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

/// The identity of a storage node.
///
/// The signing key is zeroized on drop by `ed25519-dalek`.
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// A fresh identity from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Loads an identity from its 32 secret bytes.
    ///
    /// # Errors
    ///
    /// [`IdentityError::InvalidSecretKey`] for any other length.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secret: Zeroizing<[u8; 32]> = Zeroizing::new(
            bytes
                .try_into()
                .map_err(|_| IdentityError::InvalidSecretKey)?,
        );
        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret),
        })
    }

    /// Creates a keypair from a hex encoded secret key.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not hex or not 32 bytes long.
    pub fn from_secret_hex(hex_str: &str) -> Result<Self> {
        let hex_str = hex_str.trim();
        let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
        let bytes =
            Zeroizing::new(hex::decode(hex_str).map_err(|_| IdentityError::InvalidSecretKey)?);
        Self::from_secret_bytes(&bytes)
    }

    /// The advertised half.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey::new(self.signing_key.verifying_key())
    }

    /// Returns the secret key bytes.
    ///
    /// # Security
    ///
    /// Handle with care. The returned bytes are zeroized on drop.
    #[must_use]
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// Derives the secret shared between this keypair and `peer`.
    ///
    /// Both keys are mapped to the Montgomery form of Curve25519 and combined
    /// with X25519, so `a.diffie_hellman(&b.public_key())` equals
    /// `b.diffie_hellman(&a.public_key())`.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::WeakSharedSecret`] if the peer key is of low
    /// order and the agreement collapses to zero.
    pub fn diffie_hellman(&self, peer: &PublicKey) -> Result<SharedSecret> {
        let scalar = Zeroizing::new(self.signing_key.to_scalar_bytes());
        let point = peer.to_montgomery().mul_clamped(*scalar);
        let bytes = Zeroizing::new(point.to_bytes());

        if bytes.iter().all(|b| *b == 0) {
            return Err(IdentityError::WeakSharedSecret);
        }

        Ok(SharedSecret(bytes))
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&self.signing_key.to_bytes()),
        }
    }
}

/// A 32-byte secret agreed between two keypairs.
#[derive(Clone)]
pub struct SharedSecret(Zeroizing<[u8; 32]>);

impl SharedSecret {
    /// Returns the raw secret bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}
