//! The storage node: accepts peer sessions and periodically synchronises
//! with every other storage provider.

use crate::session::{Connection, SessionReport};
use crate::{NodeConfig, NodeError, ProviderDirectory, Result, StorageSyncStore};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use stowage_dht::{AnnouncedPorts, Dht, DhtNetwork};
use stowage_identity::{Keypair, PublicKey};
use stowage_storage::Storage;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};

/// Timing and handshake settings of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeOptions {
    /// Challenge length of the handshake in bytes.
    pub challenge_size: usize,
    /// Bound on connecting plus handshake.
    pub connect_timeout: Duration,
    /// Bound on a whole session.
    pub session_timeout: Duration,
    /// Interval between synchronisation rounds.
    pub sync_period: Duration,
    /// Largest archive accepted from a peer, in bytes.
    pub max_transfer_bytes: u64,
    /// Ports providers announce. Resolved candidates on the sync port are
    /// tried first and those on the service or RPC port last.
    pub ports: AnnouncedPorts,
}

impl From<&NodeConfig> for NodeOptions {
    fn from(config: &NodeConfig) -> Self {
        Self {
            challenge_size: config.challenge_size,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            session_timeout: Duration::from_secs(config.session_timeout_secs),
            sync_period: config.sync_period(),
            max_transfer_bytes: config.max_transfer_bytes,
            ports: config.announced_ports(),
        }
    }
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self::from(&NodeConfig::default())
    }
}

/// Which end of a connection this node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Accepted connection.
    Server,
    /// Outgoing connection.
    Client,
}

/// Key identifying a remote endpoint: `family:[addr]:port`.
#[must_use]
pub fn connection_key(addr: &SocketAddr) -> String {
    let family = if addr.is_ipv4() { "IPv4" } else { "IPv6" };
    format!("{family}:[{}]:{}", addr.ip(), addr.port())
}

/// Live connections of one node, per side.
///
/// At most one session per remote endpoint and side runs at a time.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    server: Mutex<HashSet<String>>,
    client: Mutex<HashSet<String>>,
}

impl ConnectionRegistry {
    fn side(&self, side: Side) -> &Mutex<HashSet<String>> {
        match side {
            Side::Server => &self.server,
            Side::Client => &self.client,
        }
    }

    /// Registers a connection to `addr`, held until the guard is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Busy`] if a connection to `addr` on that side is
    /// already registered.
    pub fn register(self: &Arc<Self>, side: Side, addr: &SocketAddr) -> Result<ConnectionGuard> {
        let key = connection_key(addr);
        if !self.side(side).lock().insert(key.clone()) {
            return Err(NodeError::Busy { key });
        }
        Ok(ConnectionGuard {
            registry: Arc::clone(self),
            side,
            key,
        })
    }

    /// Number of live connections on `side`.
    #[must_use]
    pub fn active(&self, side: Side) -> usize {
        self.side(side).lock().len()
    }
}

/// Keeps a connection registered.
#[derive(Debug)]
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    side: Side,
    key: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.side(self.side).lock().remove(&self.key);
    }
}

/// Result of one synchronisation round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    /// Providers contacted.
    pub attempted: usize,
    /// Sessions that finished.
    pub succeeded: usize,
    /// Sessions that failed.
    pub failed: usize,
}

/// A storage node.
pub struct Node<N, D> {
    keypair: Keypair,
    storage: Arc<Storage>,
    store: Arc<StorageSyncStore>,
    directory: Arc<D>,
    dht: Arc<Dht<N>>,
    options: NodeOptions,
    connections: Arc<ConnectionRegistry>,
}

impl<N, D> Node<N, D>
where
    N: DhtNetwork,
    D: ProviderDirectory,
{
    /// Assembles a node. `dht` must be announcing the node's own public key.
    pub fn new(
        keypair: Keypair,
        storage: Arc<Storage>,
        directory: D,
        dht: Dht<N>,
        options: NodeOptions,
    ) -> Self {
        Self {
            keypair,
            store: Arc::new(StorageSyncStore::with_limit(
                Arc::clone(&storage),
                options.max_transfer_bytes,
            )),
            storage,
            directory: Arc::new(directory),
            dht: Arc::new(dht),
            options,
            connections: Arc::new(ConnectionRegistry::default()),
        }
    }

    /// The node's public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// The node's storage.
    #[must_use]
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// The discovery service.
    #[must_use]
    pub fn dht(&self) -> &Arc<Dht<N>> {
        &self.dht
    }

    /// Live connection bookkeeping.
    #[must_use]
    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Accepts peer sessions on `listener` until the task is dropped.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "accepting sync sessions");
        }

        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let node = Arc::clone(&self);
            let span = tracing::info_span!("inbound", remote = %remote);
            tokio::spawn(
                async move {
                    if let Err(e) = node.handle_incoming(stream, remote).await {
                        warn!(error = %e, "inbound session failed");
                    }
                }
                .instrument(span),
            );
        }
    }

    /// Runs one inbound session on an accepted stream.
    ///
    /// # Errors
    ///
    /// Fails if the peer is not an authenticated provider, the session
    /// breaks, or it exceeds the session timeout.
    pub async fn handle_incoming(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
    ) -> Result<SessionReport> {
        let _guard = self.connections.register(Side::Server, &remote)?;
        let session = async {
            let connection = Connection::accept_as_responder(
                stream,
                &self.keypair,
                self.directory.as_ref(),
                self.options.challenge_size,
            )
            .await?;
            debug!(peer = %connection.peer().short_id(), "inbound peer authenticated");
            connection.exchange(Arc::clone(&self.store), false).await
        };

        within("session", self.options.session_timeout, session).await
    }

    /// Connects to `peer` at `addr` and runs one session.
    ///
    /// # Errors
    ///
    /// Fails if connecting, the handshake or the exchange fails or times out.
    pub async fn sync_with(&self, peer: &PublicKey, addr: SocketAddr) -> Result<SessionReport> {
        let _guard = self.connections.register(Side::Client, &addr)?;
        let connect_timeout = self.options.connect_timeout;

        let connection = within("connect", connect_timeout, async {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|source| NodeError::Connect { addr, source })?;
            Connection::connect_as_initiator(
                stream,
                &self.keypair,
                peer,
                self.options.challenge_size,
            )
            .await
        })
        .await?;

        within(
            "session",
            self.options.session_timeout,
            connection.exchange(Arc::clone(&self.store), true),
        )
        .await
    }

    /// Resolves `peer` through the DHT and syncs with the first candidate
    /// address that completes a session, in [`sync_candidates`] order.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::NoAddress`] if nothing is known about the peer,
    /// otherwise the error of the last candidate tried.
    pub async fn sync_peer(&self, peer: &PublicKey) -> Result<SessionReport> {
        let resolved = self.dht.resolve(&peer.to_string()).await?;
        let candidates = sync_candidates(resolved, &self.options.ports);
        let mut last_error = NodeError::NoAddress {
            peer: peer.short_id(),
        };

        for addr in candidates {
            match self.sync_with(peer, addr).await {
                Ok(report) => return Ok(report),
                Err(e) => {
                    debug!(peer = %peer.short_id(), %addr, error = %e, "candidate address failed");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// Syncs with every other known provider concurrently.
    ///
    /// # Errors
    ///
    /// Fails only if the provider list cannot be fetched; failures of
    /// single peers are logged and counted.
    pub async fn synchronize_once(self: &Arc<Self>) -> Result<SyncSummary> {
        let own = self.public_key();
        let peers: Vec<PublicKey> = self
            .directory
            .providers()
            .await?
            .into_iter()
            .filter(|peer| *peer != own)
            .collect();

        let mut summary = SyncSummary {
            attempted: peers.len(),
            ..SyncSummary::default()
        };

        let mut sessions = JoinSet::new();
        for peer in peers {
            let node = Arc::clone(self);
            let span = tracing::info_span!("outbound", peer = %peer.short_id());
            sessions.spawn(
                async move {
                    let result = node.sync_peer(&peer).await;
                    if let Err(e) = &result {
                        warn!(error = %e, "sync with peer failed");
                    }
                    result.is_ok()
                }
                .instrument(span),
            );
        }

        while let Some(joined) = sessions.join_next().await {
            match joined {
                Ok(true) => summary.succeeded += 1,
                Ok(false) => summary.failed += 1,
                Err(e) => {
                    warn!(error = %e, "sync task panicked");
                    summary.failed += 1;
                }
            }
        }

        info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "synchronisation round finished"
        );
        Ok(summary)
    }

    /// Runs the node until `shutdown` resolves: bootstraps the DHT, starts
    /// announcing, serves `listener` and syncs every sync period.
    pub async fn run<F>(self: Arc<Self>, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(public_key = %self.public_key(), hash = %self.dht.own_hash(), "starting node");

        self.dht.bootstrap().await;
        let announcer = Arc::clone(&self.dht).spawn_announcer();
        let server = tokio::spawn(Arc::clone(&self).serve(listener));

        let mut ticker = tokio::time::interval(self.options.sync_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.synchronize_once().await {
                        warn!(error = %e, "synchronisation round failed");
                    }
                }
            }
        }

        announcer.abort();
        server.abort();
        info!("node stopped");
    }
}

/// Orders resolved addresses for a sync attempt: the sync port first, then
/// unknown ports, then the service and RPC ports. Newest first within each
/// group.
#[must_use]
pub fn sync_candidates(
    mut candidates: Vec<SocketAddr>,
    ports: &AnnouncedPorts,
) -> Vec<SocketAddr> {
    candidates.sort_by_key(|addr| {
        let port = addr.port();
        if port == ports.sync {
            0
        } else if port == ports.service || port == ports.rpc {
            2
        } else {
            1
        }
    });
    candidates
}

async fn within<T, F>(what: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| NodeError::Timeout { what, after })?
}

impl<N, D> std::fmt::Debug for Node<N, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("public_key", &self.keypair.public_key())
            .field("storage", &self.storage)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
