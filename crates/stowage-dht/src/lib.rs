//! # Stowage DHT
//!
//! Peer discovery for storage nodes.
//!
//! Every node is found under the [`AddressHash`] of its public address.
//! A node periodically announces its hash together with each of its
//! advertised ports; other nodes look the hash up and collect discovered
//! `host:port` pairs in a time-decayed [`PeerCache`]. [`Dht::resolve`]
//! answers from that cache.
//!
//! The network itself sits behind the [`DhtNetwork`] trait.
//! [`UdpNetwork`] is a Kademlia-style network over UDP, [`StaticNetwork`]
//! serves a fixed address table and [`MemorySwarm`] connects nodes inside
//! one process.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod dht;
mod error;
mod hash;
mod memory;
mod network;
mod static_table;
mod udp;

pub use cache::PeerCache;
pub use dht::{AnnouncedPorts, Dht, DhtConfig, DEFAULT_ANNOUNCE_PERIOD, DEFAULT_GRACE_PERIOD};
pub use error::{DhtError, Result};
pub use hash::AddressHash;
pub use memory::{MemoryNetwork, MemorySwarm};
pub use network::{DhtNetwork, DiscoverySink};
pub use static_table::StaticNetwork;
pub use udp::{Contact, UdpConfig, UdpNetwork, BUCKET_SIZE};
