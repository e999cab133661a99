//! Discovery from a fixed address table.

use crate::{AddressHash, DhtNetwork, DiscoverySink, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::debug;

/// A network answering lookups from a configured `address -> socket` table.
///
/// Announcements are accepted and dropped. Suited to single-host or
/// fixed-topology deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticNetwork {
    table: HashMap<AddressHash, Vec<SocketAddr>>,
}

impl StaticNetwork {
    /// Builds the table from public addresses and where they listen.
    pub fn new<I, A>(peers: I) -> Self
    where
        I: IntoIterator<Item = (A, SocketAddr)>,
        A: AsRef<str>,
    {
        let mut table: HashMap<AddressHash, Vec<SocketAddr>> = HashMap::new();
        for (address, socket) in peers {
            table
                .entry(AddressHash::of(address.as_ref()))
                .or_default()
                .push(socket);
        }
        Self { table }
    }

    /// Number of distinct addresses in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[async_trait]
impl DhtNetwork for StaticNetwork {
    async fn announce(&self, hash: AddressHash, port: u16) -> Result<()> {
        debug!(%hash, port, "static network ignores announcement");
        Ok(())
    }

    async fn lookup(&self, hash: AddressHash, sink: &DiscoverySink) -> Result<usize> {
        let found = self.table.get(&hash).map_or(&[][..], Vec::as_slice);
        for addr in found {
            sink.discovered(hash, *addr);
        }
        Ok(found.len())
    }

    async fn add_node(&self, node: SocketAddr) -> Result<()> {
        debug!(%node, "static network ignores bootstrap node");
        Ok(())
    }
}
