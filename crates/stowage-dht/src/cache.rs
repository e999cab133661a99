//! Time-decayed cache of discovered peers.

use crate::AddressHash;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::trace;

/// Discovered `host:port` pairs per address hash, each stamped with the time
/// it was last seen.
///
/// Records older than the time-to-live are dropped by
/// [`expire_outdated`](Self::expire_outdated), and buckets left empty are
/// removed with them.
#[derive(Debug)]
pub struct PeerCache {
    ttl: Duration,
    buckets: HashMap<AddressHash, HashMap<SocketAddr, Instant>>,
}

impl PeerCache {
    /// Creates a cache keeping records for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            buckets: HashMap::new(),
        }
    }

    /// Records that `addr` was seen for `hash` now, then expires old records.
    pub fn update_hash(&mut self, hash: AddressHash, addr: SocketAddr) {
        self.update_hash_at(hash, addr, Instant::now());
    }

    /// [`update_hash`](Self::update_hash) with an explicit clock.
    pub fn update_hash_at(&mut self, hash: AddressHash, addr: SocketAddr, now: Instant) {
        trace!(%hash, %addr, "recording discovered peer");
        self.buckets.entry(hash).or_default().insert(addr, now);
        self.expire_outdated_at(now);
    }

    /// Drops records older than the time-to-live.
    pub fn expire_outdated(&mut self) {
        self.expire_outdated_at(Instant::now());
    }

    /// [`expire_outdated`](Self::expire_outdated) with an explicit clock.
    pub fn expire_outdated_at(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.buckets.retain(|hash, peers| {
            peers.retain(|addr, seen| {
                let fresh = now.saturating_duration_since(*seen) <= ttl;
                if !fresh {
                    trace!(%hash, %addr, "expiring peer record");
                }
                fresh
            });
            !peers.is_empty()
        });
    }

    /// Returns the cached addresses for `hash`, newest first.
    #[must_use]
    pub fn get(&self, hash: &AddressHash) -> Vec<SocketAddr> {
        let Some(peers) = self.buckets.get(hash) else {
            return Vec::new();
        };

        let mut records: Vec<(SocketAddr, Instant)> =
            peers.iter().map(|(addr, seen)| (*addr, *seen)).collect();
        records.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        records.into_iter().map(|(addr, _)| addr).collect()
    }

    /// Whether any record exists for `hash`.
    #[must_use]
    pub fn contains(&self, hash: &AddressHash) -> bool {
        self.buckets.contains_key(hash)
    }

    /// Number of hashes with at least one record.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether the cache holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TTL: Duration = Duration::from_secs(13 * 60);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn newest_record_comes_first() {
        let mut cache = PeerCache::new(TTL);
        let hash = AddressHash::of("node");
        let t0 = Instant::now();

        cache.update_hash_at(hash, addr(1), t0);
        cache.update_hash_at(hash, addr(2), t0 + Duration::from_secs(5));
        cache.update_hash_at(hash, addr(3), t0 + Duration::from_secs(2));

        assert_eq!(cache.get(&hash), vec![addr(2), addr(3), addr(1)]);
    }

    #[test]
    fn repeated_sighting_refreshes_record() {
        let mut cache = PeerCache::new(TTL);
        let hash = AddressHash::of("node");
        let t0 = Instant::now();

        cache.update_hash_at(hash, addr(1), t0);
        cache.update_hash_at(hash, addr(2), t0 + Duration::from_secs(1));
        cache.update_hash_at(hash, addr(1), t0 + Duration::from_secs(2));

        assert_eq!(cache.get(&hash), vec![addr(1), addr(2)]);
    }

    #[test]
    fn records_expire_after_ttl() {
        let mut cache = PeerCache::new(TTL);
        let hash = AddressHash::of("node");
        let t0 = Instant::now();

        cache.update_hash_at(hash, addr(1), t0);
        cache.expire_outdated_at(t0 + TTL);
        assert_eq!(cache.get(&hash), vec![addr(1)]);

        cache.expire_outdated_at(t0 + TTL + Duration::from_secs(1));
        assert!(cache.get(&hash).is_empty());
        assert!(!cache.contains(&hash), "empty bucket is removed");
        assert!(cache.is_empty());
    }

    #[test]
    fn update_expires_other_hashes() {
        let mut cache = PeerCache::new(TTL);
        let old = AddressHash::of("old");
        let new = AddressHash::of("new");
        let t0 = Instant::now();

        cache.update_hash_at(old, addr(1), t0);
        cache.update_hash_at(new, addr(2), t0 + TTL * 2);

        assert!(!cache.contains(&old));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn unknown_hash_is_empty() {
        let cache = PeerCache::new(TTL);
        assert!(cache.get(&AddressHash::of("nobody")).is_empty());
    }
}
