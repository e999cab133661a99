//! An in-process swarm for tests and simulations.

use crate::{AddressHash, DhtNetwork, DiscoverySink, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::debug;

/// Shared announcement table for nodes living in one process.
#[derive(Clone, Default)]
pub struct MemorySwarm {
    announcements: Arc<RwLock<HashMap<AddressHash, BTreeSet<SocketAddr>>>>,
}

impl MemorySwarm {
    /// Creates an empty swarm.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the swarm as a node reachable at `host`.
    #[must_use]
    pub fn join(&self, host: IpAddr) -> MemoryNetwork {
        MemoryNetwork {
            swarm: self.clone(),
            host,
        }
    }

    /// Number of distinct hashes announced so far.
    #[must_use]
    pub fn announced(&self) -> usize {
        self.announcements.read().len()
    }
}

/// One node's view of a [`MemorySwarm`].
#[derive(Clone)]
pub struct MemoryNetwork {
    swarm: MemorySwarm,
    host: IpAddr,
}

#[async_trait]
impl DhtNetwork for MemoryNetwork {
    async fn announce(&self, hash: AddressHash, port: u16) -> Result<()> {
        let addr = SocketAddr::new(self.host, port);
        debug!(%hash, %addr, "announcing in memory swarm");
        self.swarm
            .announcements
            .write()
            .entry(hash)
            .or_default()
            .insert(addr);
        Ok(())
    }

    async fn lookup(&self, hash: AddressHash, sink: &DiscoverySink) -> Result<usize> {
        let found: Vec<SocketAddr> = self
            .swarm
            .announcements
            .read()
            .get(&hash)
            .map(|addrs| addrs.iter().copied().collect())
            .unwrap_or_default();

        for addr in &found {
            sink.discovered(hash, *addr);
        }
        Ok(found.len())
    }

    async fn add_node(&self, node: SocketAddr) -> Result<()> {
        debug!(%node, "memory swarm needs no bootstrap node");
        Ok(())
    }
}
