//! The network seam behind discovery.

use crate::{AddressHash, PeerCache, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;

/// Receives peers discovered during a lookup.
///
/// Every discovery is written into the shared [`PeerCache`] as it arrives,
/// so a lookup that is cut short still leaves what it found.
#[derive(Clone)]
pub struct DiscoverySink {
    cache: Arc<Mutex<PeerCache>>,
}

impl DiscoverySink {
    pub(crate) fn new(cache: Arc<Mutex<PeerCache>>) -> Self {
        Self { cache }
    }

    /// Records that `addr` serves `hash`.
    pub fn discovered(&self, hash: AddressHash, addr: SocketAddr) {
        self.cache.lock().update_hash(hash, addr);
    }
}

/// A distributed hash table carrying `(hash, port)` announcements.
#[async_trait]
pub trait DhtNetwork: Send + Sync + 'static {
    /// Announces that this node serves `hash` on `port`.
    async fn announce(&self, hash: AddressHash, port: u16) -> Result<()>;

    /// Looks `hash` up, reporting each peer found to `sink`. Returns the
    /// number of peers reported.
    async fn lookup(&self, hash: AddressHash, sink: &DiscoverySink) -> Result<usize>;

    /// Adds a known node to bootstrap from.
    async fn add_node(&self, node: SocketAddr) -> Result<()>;
}
