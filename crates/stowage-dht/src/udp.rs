//! Kademlia-style discovery over UDP.
//!
//! Every node has a random id in the [`AddressHash`] key space and keeps a
//! routing table of other nodes bucketed by XOR distance. Announcements are
//! stored by the nodes whose ids are closest to the announced hash:
//!
//! - a lookup walks towards the hash, asking the closest known nodes for
//!   peers and for nodes closer still;
//! - an announcement runs the same walk and then hands `(hash, port)` to the
//!   closest nodes that answered. They record the announcer's source IP
//!   with the announced port.
//!
//! Messages are JSON datagrams carrying a transaction id, so replies are
//! matched to requests regardless of order.

use crate::{AddressHash, DhtError, DhtNetwork, DiscoverySink, PeerCache, Result};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Contacts per routing bucket, and per answer.
pub const BUCKET_SIZE: usize = 8;

/// Requests in flight per lookup round.
const PARALLELISM: usize = 3;

/// Upper bound on nodes queried by one walk.
const MAX_QUERIED: usize = 8 * BUCKET_SIZE;

const MAX_DATAGRAM: usize = 64 * 1024;

const KEY_BITS: usize = AddressHash::LEN * 8;

/// Settings of a [`UdpNetwork`].
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// How long to wait for one reply.
    pub request_timeout: Duration,
    /// How long announcements from other nodes are kept.
    pub record_ttl: Duration,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(2),
            record_ttl: crate::DEFAULT_ANNOUNCE_PERIOD + crate::DEFAULT_GRACE_PERIOD,
        }
    }
}

/// A node of the UDP network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// The node's id.
    pub id: AddressHash,
    /// Where it receives datagrams.
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "q", rename_all = "snake_case")]
enum Request {
    Ping,
    FindNode { target: AddressHash },
    GetPeers { hash: AddressHash },
    AnnouncePeer { hash: AddressHash, port: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "r", rename_all = "snake_case")]
enum Response {
    Pong,
    Nodes {
        nodes: Vec<Contact>,
    },
    Peers {
        peers: Vec<SocketAddr>,
        nodes: Vec<Contact>,
    },
    Announced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Body {
    Request(Request),
    Response(Response),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Envelope {
    tx: u64,
    sender: AddressHash,
    body: Body,
}

/// Contacts bucketed by the length of the prefix they share with `own`.
#[derive(Debug)]
struct RoutingTable {
    own: AddressHash,
    buckets: Vec<Vec<Contact>>,
}

impl RoutingTable {
    fn new(own: AddressHash) -> Self {
        Self {
            own,
            buckets: vec![Vec::new(); KEY_BITS],
        }
    }

    /// Bucket of `id`, farther ids in higher buckets. `None` for the own id.
    fn bucket_of(&self, id: &AddressHash) -> Option<usize> {
        let distance = self.own.distance(id);
        let (byte, value) = distance.iter().enumerate().find(|(_, b)| **b != 0)?;
        Some(KEY_BITS - 1 - (byte * 8 + value.leading_zeros() as usize))
    }

    /// Records `contact` as most recently seen. A full bucket keeps its
    /// existing contacts.
    fn insert(&mut self, contact: Contact) -> bool {
        let Some(index) = self.bucket_of(&contact.id) else {
            return false;
        };
        let bucket = &mut self.buckets[index];

        if let Some(pos) = bucket
            .iter()
            .position(|c| c.id == contact.id || c.addr == contact.addr)
        {
            bucket.remove(pos);
        } else if bucket.len() >= BUCKET_SIZE {
            trace!(id = %contact.id, bucket = index, "bucket full, dropping contact");
            return false;
        }
        bucket.push(contact);
        true
    }

    fn remove(&mut self, addr: &SocketAddr) {
        for bucket in &mut self.buckets {
            bucket.retain(|c| c.addr != *addr);
        }
    }

    fn closest(&self, target: &AddressHash, count: usize) -> Vec<Contact> {
        let mut all: Vec<Contact> = self.buckets.iter().flatten().copied().collect();
        all.sort_by_key(|c| c.id.distance(target));
        all.truncate(count);
        all
    }

    fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }
}

struct Inner {
    socket: UdpSocket,
    id: AddressHash,
    config: UdpConfig,
    routing: Mutex<RoutingTable>,
    records: Mutex<PeerCache>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    next_tx: AtomicU64,
}

impl Inner {
    async fn send(&self, to: SocketAddr, tx: u64, body: Body) -> Result<()> {
        let envelope = Envelope {
            tx,
            sender: self.id,
            body,
        };
        let datagram =
            serde_json::to_vec(&envelope).map_err(|e| DhtError::Network(e.to_string()))?;
        self.socket
            .send_to(&datagram, to)
            .await
            .map_err(|e| DhtError::Network(format!("sending to {to}: {e}")))?;
        Ok(())
    }

    async fn request(&self, to: SocketAddr, request: Request) -> Result<Response> {
        let tx = self.next_tx.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(tx, reply_tx);

        if let Err(e) = self.send(to, tx, Body::Request(request)).await {
            self.pending.lock().remove(&tx);
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            _ => {
                self.pending.lock().remove(&tx);
                self.routing.lock().remove(&to);
                Err(DhtError::Network(format!("no answer from {to}")))
            }
        }
    }

    fn answer(&self, from: SocketAddr, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong,
            Request::FindNode { target } => Response::Nodes {
                nodes: self.routing.lock().closest(&target, BUCKET_SIZE),
            },
            Request::GetPeers { hash } => {
                let peers = {
                    let mut records = self.records.lock();
                    records.expire_outdated();
                    records.get(&hash)
                };
                Response::Peers {
                    peers,
                    nodes: self.routing.lock().closest(&hash, BUCKET_SIZE),
                }
            }
            Request::AnnouncePeer { hash, port } => {
                let addr = SocketAddr::new(from.ip(), port);
                debug!(%hash, %addr, "storing announcement");
                self.records.lock().update_hash(hash, addr);
                Response::Announced
            }
        }
    }

    /// Walks towards `hash`, returning the closest nodes that answered and
    /// reporting every peer they hold for `hash` to `sink`.
    async fn walk(&self, hash: AddressHash, sink: Option<&DiscoverySink>) -> (Vec<Contact>, usize) {
        let mut shortlist = self.routing.lock().closest(&hash, BUCKET_SIZE);
        let mut queried: HashSet<SocketAddr> = HashSet::new();
        let mut answered: Vec<Contact> = Vec::new();
        let mut found = 0;

        while queried.len() < MAX_QUERIED {
            let batch: Vec<Contact> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.addr))
                .take(PARALLELISM)
                .copied()
                .collect();
            if batch.is_empty() {
                break;
            }
            queried.extend(batch.iter().map(|c| c.addr));

            let replies = join_all(
                batch
                    .iter()
                    .map(|c| self.request(c.addr, Request::GetPeers { hash })),
            )
            .await;

            for (contact, reply) in batch.into_iter().zip(replies) {
                match reply {
                    Ok(Response::Peers { peers, nodes }) => {
                        if let Some(sink) = sink {
                            for peer in &peers {
                                sink.discovered(hash, *peer);
                            }
                        }
                        found += peers.len();
                        for node in nodes {
                            if node.id != self.id && !shortlist.iter().any(|c| c.addr == node.addr)
                            {
                                shortlist.push(node);
                            }
                        }
                        answered.push(contact);
                    }
                    Ok(other) => debug!(node = %contact.addr, reply = ?other, "unexpected reply"),
                    Err(e) => debug!(node = %contact.addr, error = %e, "node did not answer"),
                }
            }

            shortlist.sort_by_key(|c| c.id.distance(&hash));
            shortlist.truncate(BUCKET_SIZE);
        }

        answered.sort_by_key(|c| c.id.distance(&hash));
        answered.truncate(BUCKET_SIZE);
        (answered, found)
    }
}

async fn receive(inner: Arc<Inner>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = match inner.socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!(error = %e, "udp receive failed");
                continue;
            }
        };

        let envelope: Envelope = match serde_json::from_slice(&buf[..len]) {
            Ok(envelope) => envelope,
            Err(e) => {
                trace!(%from, error = %e, "dropping malformed datagram");
                continue;
            }
        };

        if envelope.sender != inner.id {
            inner.routing.lock().insert(Contact {
                id: envelope.sender,
                addr: from,
            });
        }

        match envelope.body {
            Body::Response(response) => {
                let waiter = inner.pending.lock().remove(&envelope.tx);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(response);
                }
            }
            Body::Request(request) => {
                trace!(%from, ?request, "answering request");
                let reply = Body::Response(inner.answer(from, request));
                if let Err(e) = inner.send(from, envelope.tx, reply).await {
                    debug!(%from, error = %e, "failed to reply");
                }
            }
        }
    }
}

/// A [`DhtNetwork`] over UDP.
///
/// The receive loop runs until the network is dropped.
pub struct UdpNetwork {
    inner: Arc<Inner>,
    local_addr: SocketAddr,
    receiver: JoinHandle<()>,
}

impl UdpNetwork {
    /// Binds the node's socket and starts answering other nodes.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be bound.
    pub async fn bind(addr: SocketAddr, config: UdpConfig) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| DhtError::Network(format!("binding {addr}: {e}")))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| DhtError::Network(e.to_string()))?;

        let id = AddressHash::random();
        let inner = Arc::new(Inner {
            socket,
            id,
            records: Mutex::new(PeerCache::new(config.record_ttl)),
            config,
            routing: Mutex::new(RoutingTable::new(id)),
            pending: Mutex::new(HashMap::new()),
            next_tx: AtomicU64::new(0),
        });
        let receiver = tokio::spawn(receive(Arc::clone(&inner)));

        info!(%local_addr, %id, "udp discovery listening");
        Ok(Self {
            inner,
            local_addr,
            receiver,
        })
    }

    /// The bound socket address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// This node's id.
    #[must_use]
    pub fn id(&self) -> AddressHash {
        self.inner.id
    }

    /// Number of nodes in the routing table.
    #[must_use]
    pub fn known_nodes(&self) -> usize {
        self.inner.routing.lock().len()
    }
}

impl Drop for UdpNetwork {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

impl std::fmt::Debug for UdpNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpNetwork")
            .field("id", &self.inner.id)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DhtNetwork for UdpNetwork {
    async fn announce(&self, hash: AddressHash, port: u16) -> Result<()> {
        let (closest, _) = self.inner.walk(hash, None).await;
        if closest.is_empty() {
            return Err(DhtError::Network("no reachable nodes to announce to".into()));
        }

        let acks = join_all(
            closest
                .iter()
                .map(|c| self.inner.request(c.addr, Request::AnnouncePeer { hash, port })),
        )
        .await;
        let stored = acks
            .iter()
            .filter(|ack| matches!(ack, Ok(Response::Announced)))
            .count();

        debug!(%hash, port, stored, "announced over udp");
        if stored == 0 {
            return Err(DhtError::Network(format!("no node stored {hash}")));
        }
        Ok(())
    }

    async fn lookup(&self, hash: AddressHash, sink: &DiscoverySink) -> Result<usize> {
        let held = {
            let mut records = self.inner.records.lock();
            records.expire_outdated();
            records.get(&hash)
        };
        for addr in &held {
            sink.discovered(hash, *addr);
        }

        let (_, found) = self.inner.walk(hash, Some(sink)).await;
        Ok(held.len() + found)
    }

    async fn add_node(&self, node: SocketAddr) -> Result<()> {
        match self.inner.request(node, Request::Ping).await? {
            Response::Pong => {}
            other => {
                return Err(DhtError::Network(format!(
                    "unexpected reply from {node}: {other:?}"
                )))
            }
        }

        let (neighbours, _) = self.inner.walk(self.inner.id, None).await;
        debug!(%node, neighbours = neighbours.len(), known = self.known_nodes(), "joined via bootstrap node");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AnnouncedPorts, Dht, DhtConfig};
    use pretty_assertions::assert_eq;

    fn config() -> UdpConfig {
        UdpConfig {
            request_timeout: Duration::from_millis(500),
            record_ttl: Duration::from_secs(60),
        }
    }

    async fn node() -> UdpNetwork {
        UdpNetwork::bind(SocketAddr::from(([127, 0, 0, 1], 0)), config())
            .await
            .unwrap()
    }

    #[test]
    fn envelope_wire_form() {
        let envelope = Envelope {
            tx: 7,
            sender: AddressHash::from_bytes([1; 20]),
            body: Body::Request(Request::AnnouncePeer {
                hash: AddressHash::from_bytes([2; 20]),
                port: 3030,
            }),
        };

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["body"]["request"]["q"], "announce_peer");
        assert_eq!(json["body"]["request"]["port"], 3030);
        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn routing_table_orders_by_distance() {
        let own = AddressHash::from_bytes([0; 20]);
        let mut table = RoutingTable::new(own);
        assert!(!table.insert(Contact {
            id: own,
            addr: SocketAddr::from(([10, 0, 0, 1], 1)),
        }));

        for i in 1..=4u8 {
            let mut id = [0u8; 20];
            id[19] = i;
            table.insert(Contact {
                id: AddressHash::from_bytes(id),
                addr: SocketAddr::from(([10, 0, 0, i], 1)),
            });
        }
        assert_eq!(table.len(), 4);

        let mut target = [0u8; 20];
        target[19] = 3;
        let closest = table.closest(&AddressHash::from_bytes(target), 2);
        assert_eq!(closest[0].id.as_bytes()[19], 3);
        assert_eq!(closest[1].id.as_bytes()[19], 2);

        table.remove(&SocketAddr::from(([10, 0, 0, 3], 1)));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn full_bucket_keeps_old_contacts() {
        let own = AddressHash::from_bytes([0; 20]);
        let mut table = RoutingTable::new(own);
        for i in 0..=BUCKET_SIZE as u8 {
            let mut id = [0u8; 20];
            id[0] = 0x80;
            id[19] = i;
            let inserted = table.insert(Contact {
                id: AddressHash::from_bytes(id),
                addr: SocketAddr::from(([10, 0, 1, i], 1)),
            });
            assert_eq!(inserted, usize::from(i) < BUCKET_SIZE);
        }
        assert_eq!(table.len(), BUCKET_SIZE);
    }

    #[tokio::test]
    async fn announced_port_is_found_by_other_nodes() {
        let bootstrap = node().await;
        let announcer = node().await;
        let seeker = node().await;

        announcer.add_node(bootstrap.local_addr()).await.unwrap();
        seeker.add_node(bootstrap.local_addr()).await.unwrap();
        assert!(bootstrap.known_nodes() >= 2);

        let hash = AddressHash::of("announcer public key");
        announcer.announce(hash, 4000).await.unwrap();

        let cache = Arc::new(Mutex::new(PeerCache::new(Duration::from_secs(60))));
        let sink = DiscoverySink::new(Arc::clone(&cache));
        let found = seeker.lookup(hash, &sink).await.unwrap();

        assert!(found >= 1);
        assert_eq!(
            cache.lock().get(&hash),
            vec![SocketAddr::from(([127, 0, 0, 1], 4000))]
        );
    }

    #[tokio::test]
    async fn unreachable_bootstrap_node_fails() {
        let lonely = node().await;
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let result = lonely.add_node(silent.local_addr().unwrap()).await;
        assert!(matches!(result, Err(DhtError::Network(_))));
        assert_eq!(lonely.known_nodes(), 0);
    }

    #[tokio::test]
    async fn announce_without_nodes_fails() {
        let lonely = node().await;
        let result = lonely.announce(AddressHash::of("x"), 1).await;
        assert!(matches!(result, Err(DhtError::Network(_))));
    }

    #[tokio::test]
    async fn dht_resolves_over_udp() {
        let bootstrap = node().await;
        let dht_config = DhtConfig {
            bootstrap: vec![bootstrap.local_addr()],
            ..DhtConfig::default()
        };
        let ports = AnnouncedPorts {
            service: 3000,
            sync: 3030,
            rpc: 3060,
        };

        let alice = Dht::new(node().await, "alice", ports, dht_config.clone());
        let bob = Dht::new(node().await, "bob", ports, dht_config);
        alice.bootstrap().await;
        bob.bootstrap().await;

        assert_eq!(alice.announce_once().await, 3);

        let mut found = bob.resolve("alice").await.unwrap();
        found.sort();
        assert_eq!(
            found,
            vec![
                SocketAddr::from(([127, 0, 0, 1], 3000)),
                SocketAddr::from(([127, 0, 0, 1], 3030)),
                SocketAddr::from(([127, 0, 0, 1], 3060)),
            ]
        );
    }
}
