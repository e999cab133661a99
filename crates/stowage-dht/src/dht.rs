//! The discovery service of a node.

use crate::{AddressHash, DhtNetwork, DiscoverySink, PeerCache, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Default interval between announcements.
pub const DEFAULT_ANNOUNCE_PERIOD: Duration = Duration::from_secs(10 * 60);

/// Default extra lifetime of a cached record beyond one announce period.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3 * 60);

/// Default bound on a single lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Discovery settings.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Interval between announcements of the own hash.
    pub announce_period: Duration,
    /// How long a record outlives one announce period.
    pub grace_period: Duration,
    /// Bound on a single network lookup.
    pub lookup_timeout: Duration,
    /// Nodes added to the network on start.
    pub bootstrap: Vec<SocketAddr>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            announce_period: DEFAULT_ANNOUNCE_PERIOD,
            grace_period: DEFAULT_GRACE_PERIOD,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            bootstrap: Vec::new(),
        }
    }
}

/// The ports a node advertises under its hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnouncedPorts {
    /// Public content service.
    pub service: u16,
    /// Peer sync listener.
    pub sync: u16,
    /// RPC endpoint.
    pub rpc: u16,
}

impl AnnouncedPorts {
    fn named(self) -> [(&'static str, u16); 3] {
        [
            ("service", self.service),
            ("sync", self.sync),
            ("rpc", self.rpc),
        ]
    }
}

/// Discovery for one node: announces the node and resolves others.
pub struct Dht<N> {
    network: Arc<N>,
    cache: Arc<Mutex<PeerCache>>,
    own_hash: AddressHash,
    ports: AnnouncedPorts,
    config: DhtConfig,
}

impl<N: DhtNetwork> Dht<N> {
    /// Creates the service for the node with public address `own_address`.
    pub fn new(network: N, own_address: &str, ports: AnnouncedPorts, config: DhtConfig) -> Self {
        let ttl = config.announce_period + config.grace_period;
        Self {
            network: Arc::new(network),
            cache: Arc::new(Mutex::new(PeerCache::new(ttl))),
            own_hash: AddressHash::of(own_address),
            ports,
            config,
        }
    }

    /// The hash this node announces itself under.
    #[must_use]
    pub fn own_hash(&self) -> AddressHash {
        self.own_hash
    }

    /// The underlying network.
    #[must_use]
    pub fn network(&self) -> &N {
        &self.network
    }

    /// Adds the configured bootstrap nodes to the network.
    pub async fn bootstrap(&self) {
        for node in &self.config.bootstrap {
            if let Err(e) = self.network.add_node(*node).await {
                warn!(%node, error = %e, "failed to add bootstrap node");
            }
        }
    }

    /// Announces the own hash under every advertised port. Returns how many
    /// announcements succeeded.
    pub async fn announce_once(&self) -> usize {
        let mut announced = 0;
        for (name, port) in self.ports.named() {
            match self.network.announce(self.own_hash, port).await {
                Ok(()) => announced += 1,
                Err(e) => warn!(hash = %self.own_hash, port, name, error = %e, "announcement failed"),
            }
        }
        debug!(
            hash = %self.own_hash,
            announced,
            next_in = ?self.config.announce_period,
            "announced own address"
        );
        announced
    }

    /// Announces now and then every announce period until the task is
    /// aborted or the runtime shuts down.
    pub fn spawn_announcer(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.config.announce_period;
        info!(hash = %self.own_hash, ?period, "starting announcer");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.announce_once().await;
            }
        })
    }

    /// Records a discovered peer for `hash` and expires old records.
    pub fn update_hash(&self, hash: AddressHash, addr: SocketAddr) {
        self.cache.lock().update_hash(hash, addr);
    }

    /// Drops cached records older than announce period plus grace period.
    pub fn expire_outdated(&self) {
        self.cache.lock().expire_outdated();
    }

    /// Returns the cached addresses for `hash`, newest first.
    #[must_use]
    pub fn get(&self, hash: &AddressHash) -> Vec<SocketAddr> {
        self.cache.lock().get(hash)
    }

    /// Resolves a node's public address to candidate socket addresses,
    /// newest first.
    ///
    /// The lookup only feeds the cache through the [`DiscoverySink`]; the
    /// answer always comes from the cache afterwards, including records found
    /// by earlier lookups. The count the network returns is ignored. A lookup
    /// that times out still answers with whatever the cache holds.
    ///
    /// # Errors
    ///
    /// Returns the network error if the lookup fails outright.
    pub async fn resolve(&self, address: &str) -> Result<Vec<SocketAddr>> {
        let hash = AddressHash::of(address);
        let sink = DiscoverySink::new(Arc::clone(&self.cache));
        debug!(address, %hash, "looking up address");

        match tokio::time::timeout(self.config.lookup_timeout, self.network.lookup(hash, &sink)).await
        {
            Ok(Ok(reported)) => debug!(%hash, reported, "lookup finished"),
            Ok(Err(e)) => return Err(e),
            Err(_) => warn!(
                %hash,
                timeout = ?self.config.lookup_timeout,
                "lookup timed out, answering from cache"
            ),
        }

        self.expire_outdated();
        Ok(self.get(&hash))
    }
}

impl<N> std::fmt::Debug for Dht<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dht")
            .field("own_hash", &self.own_hash)
            .field("ports", &self.ports)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
