//! Node configuration types.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use stowage_dht::{AnnouncedPorts, DhtConfig, UdpConfig};
use stowage_storage::{BackendKind, StorageConfig, DEFAULT_POOL_SIZE};

/// Prefix of environment variables overriding configuration values,
/// e.g. `STOWAGE__POOL_SIZE=64`.
pub const ENV_PREFIX: &str = "STOWAGE";

/// Default cap on a received archive: 16 GiB.
pub const DEFAULT_MAX_TRANSFER_BYTES: u64 = 16 << 30;

/// How the node finds its peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Discovery {
    /// Kademlia-style DHT over UDP on `dht_addr`.
    #[default]
    Udp,
    /// Only the `peers` table.
    Static,
}

/// Configuration for a storage node.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Storage base directory.
    pub base_path: PathBuf,
    /// Open repositories kept in the pool.
    pub pool_size: usize,
    /// Repository backend.
    pub backend: BackendKind,
    /// Largest archive accepted from a peer, in bytes.
    pub max_transfer_bytes: u64,

    /// Sync listener address.
    pub listen_addr: SocketAddr,
    /// Advertised public content service port.
    pub service_port: u16,
    /// Advertised RPC port.
    pub rpc_port: u16,
    /// How peers are discovered.
    pub discovery: Discovery,
    /// UDP address of the DHT node.
    pub dht_addr: SocketAddr,
    /// DHT nodes added on start.
    pub bootstrap: Vec<SocketAddr>,

    /// Seconds between synchronisation rounds.
    pub sync_period_secs: u64,
    /// Seconds between DHT announcements.
    pub announce_period_secs: u64,
    /// Seconds a DHT record outlives one announce period.
    pub grace_period_secs: u64,
    /// Bound on a DHT lookup.
    pub lookup_timeout_secs: u64,
    /// Bound on connecting plus handshake.
    pub connect_timeout_secs: u64,
    /// Bound on a whole sync session.
    pub session_timeout_secs: u64,
    /// Challenge length of the handshake in bytes.
    pub challenge_size: usize,

    /// Hex public keys of the known storage providers.
    pub providers: Vec<String>,
    /// Static table of hex public key to sync address.
    pub peers: HashMap<String, SocketAddr>,

    /// Log level.
    pub log_level: String,
    /// Emit logs as JSON.
    pub log_json: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./data"),
            pool_size: DEFAULT_POOL_SIZE,
            backend: BackendKind::default(),
            max_transfer_bytes: DEFAULT_MAX_TRANSFER_BYTES,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3030)),
            service_port: 3000,
            rpc_port: 3060,
            discovery: Discovery::default(),
            dht_addr: SocketAddr::from(([0, 0, 0, 0], 3090)),
            bootstrap: Vec::new(),
            sync_period_secs: 30,
            announce_period_secs: 600,
            grace_period_secs: 180,
            lookup_timeout_secs: 30,
            connect_timeout_secs: 10,
            session_timeout_secs: 300,
            challenge_size: stowage_protocol::DEFAULT_CHALLENGE_SIZE,
            providers: Vec::new(),
            peers: HashMap::new(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl NodeConfig {
    /// Loads the configuration from an optional YAML file at `path`,
    /// overridden by `STOWAGE__*` environment variables.
    ///
    /// A missing file is not an error; every field has a default.
    ///
    /// # Errors
    ///
    /// Fails if the file or an environment value cannot be parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).required(false))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("providers")
                    .with_list_parse_key("bootstrap"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Storage settings.
    #[must_use]
    pub fn storage(&self) -> StorageConfig {
        StorageConfig {
            base_path: self.base_path.clone(),
            pool_size: self.pool_size,
            backend: self.backend,
        }
    }

    /// Discovery settings.
    #[must_use]
    pub fn dht(&self) -> DhtConfig {
        DhtConfig {
            announce_period: Duration::from_secs(self.announce_period_secs),
            grace_period: Duration::from_secs(self.grace_period_secs),
            lookup_timeout: Duration::from_secs(self.lookup_timeout_secs),
            bootstrap: self.bootstrap.clone(),
        }
    }

    /// The ports announced under the node's hash.
    #[must_use]
    pub fn announced_ports(&self) -> AnnouncedPorts {
        AnnouncedPorts {
            service: self.service_port,
            sync: self.listen_addr.port(),
            rpc: self.rpc_port,
        }
    }

    /// Settings of the UDP discovery network. Records live as long as
    /// cached lookups do.
    #[must_use]
    pub fn udp(&self) -> UdpConfig {
        UdpConfig {
            record_ttl: Duration::from_secs(self.announce_period_secs + self.grace_period_secs),
            ..UdpConfig::default()
        }
    }

    /// Interval between synchronisation rounds.
    #[must_use]
    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_secs)
    }
}
