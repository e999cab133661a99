//! The provider directory: which public keys belong to storage providers.
//!
//! In a deployment this is answered by the chain's staking and identity
//! modules; the node only depends on the [`ProviderDirectory`] trait.

use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use stowage_identity::PublicKey;

/// Lists the known storage providers.
#[async_trait]
pub trait ProviderDirectory: Send + Sync + 'static {
    /// All storage providers, including this node if it is one.
    async fn providers(&self) -> Result<Vec<PublicKey>>;

    /// Whether `key` belongs to a storage provider.
    async fn is_storage_provider(&self, key: &PublicKey) -> Result<bool> {
        Ok(self.providers().await?.contains(key))
    }
}

/// A fixed provider list, typically from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    providers: BTreeSet<[u8; 32]>,
}

impl StaticDirectory {
    /// Creates a directory of `providers`.
    pub fn new(providers: impl IntoIterator<Item = PublicKey>) -> Self {
        Self {
            providers: providers.into_iter().map(|k| *k.as_bytes()).collect(),
        }
    }

    /// Parses hex encoded public keys.
    ///
    /// # Errors
    ///
    /// Fails on the first entry that is not a valid public key.
    pub fn from_hex<S: AsRef<str>>(keys: &[S]) -> Result<Self> {
        let keys = keys
            .iter()
            .map(|k| k.as_ref().parse::<PublicKey>())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self::new(keys))
    }

    /// Number of providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether the directory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[async_trait]
impl ProviderDirectory for StaticDirectory {
    async fn providers(&self) -> Result<Vec<PublicKey>> {
        self.providers
            .iter()
            .map(|bytes| PublicKey::from_bytes(bytes).map_err(Into::into))
            .collect()
    }

    async fn is_storage_provider(&self, key: &PublicKey) -> Result<bool> {
        Ok(self.providers.contains(key.as_bytes()))
    }
}
