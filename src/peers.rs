//! # Peer Table
//!
//! Tracks every origin we have heard from: the endpoint observed on the
//! datagram envelope, the last-seen instant, and an optional public endpoint
//! recorded by address-translation observation.
//!
//! A record is inserted on the first non-self datagram carrying an unknown
//! origin, refreshed by every datagram arriving from its endpoint, and
//! evicted once it has been silent longer than the configured peer timeout.
//! Endpoints come exclusively from the envelope; self-reported addresses in
//! payloads are never trusted for reachability.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// One known peer.
#[derive(Clone, Debug)]
pub(crate) struct PeerRecord {
    /// Endpoint observed on the datagram envelope.
    pub addr: SocketAddr,
    /// Instant of the most recent datagram from `addr`.
    pub last_seen: Instant,
    /// Envelope endpoint recorded when the peer's self-reported address
    /// disagreed with the envelope (address translation in the path).
    pub public_addr: Option<SocketAddr>,
}

/// Origin-keyed table of observed peers. Owned by the node actor; no
/// interior locking.
pub(crate) struct PeerTable {
    local_origin: String,
    peers: HashMap<String, PeerRecord>,
}

impl PeerTable {
    pub fn new(local_origin: impl Into<String>) -> Self {
        Self {
            local_origin: local_origin.into(),
            peers: HashMap::new(),
        }
    }

    /// Record a datagram from `origin` at envelope endpoint `addr`.
    ///
    /// Every record matching `addr` is refreshed; an unknown non-self origin
    /// is inserted. Returns true when the origin was newly inserted.
    pub fn observe(&mut self, origin: &str, addr: SocketAddr, now: Instant) -> bool {
        if origin == self.local_origin {
            return false;
        }
        for record in self.peers.values_mut() {
            if record.addr == addr {
                record.last_seen = now;
            }
        }
        if self.peers.contains_key(origin) {
            return false;
        }
        self.peers.insert(
            origin.to_string(),
            PeerRecord {
                addr,
                last_seen: now,
                public_addr: None,
            },
        );
        true
    }

    /// Remove every record silent for longer than `timeout`, returning the
    /// evicted (origin, endpoint) pairs.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<(String, SocketAddr)> {
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, record)| now.duration_since(record.last_seen) > timeout)
            .map(|(origin, _)| origin.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|origin| {
                self.peers
                    .remove(&origin)
                    .map(|record| (origin, record.addr))
            })
            .collect()
    }

    pub fn get(&self, origin: &str) -> Option<&PeerRecord> {
        self.peers.get(origin)
    }

    /// The origin owning `addr`, if any record matches it.
    pub fn origin_of_addr(&self, addr: SocketAddr) -> Option<&str> {
        self.peers
            .iter()
            .find(|(_, record)| record.addr == addr)
            .map(|(origin, _)| origin.as_str())
    }

    /// All current (origin, endpoint) pairs, used by broadcast and
    /// anti-entropy fan-out.
    pub fn snapshot(&self) -> Vec<(String, SocketAddr)> {
        self.peers
            .iter()
            .map(|(origin, record)| (origin.clone(), record.addr))
            .collect()
    }

    pub fn set_public_addr(&mut self, origin: &str, addr: SocketAddr) {
        if let Some(record) = self.peers.get_mut(origin) {
            record.public_addr = Some(addr);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn first_observation_inserts() {
        let mut table = PeerTable::new("alice");
        let now = Instant::now();

        assert!(table.observe("bob", addr(9002), now));
        assert!(!table.observe("bob", addr(9002), now));
        assert_eq!(table.snapshot().len(), 1);
        assert_eq!(table.get("bob").unwrap().addr, addr(9002));
    }

    #[test]
    fn self_origin_is_never_inserted() {
        let mut table = PeerTable::new("alice");

        assert!(!table.observe("alice", addr(9001), Instant::now()));
        assert!(table.is_empty());
    }

    #[test]
    fn observation_refreshes_matching_endpoint() {
        let mut table = PeerTable::new("alice");
        let t0 = Instant::now();
        table.observe("bob", addr(9002), t0);

        let t1 = t0 + Duration::from_secs(10);
        table.observe("bob", addr(9002), t1);
        assert_eq!(table.get("bob").unwrap().last_seen, t1);

        // A refresh applies to whichever records match the envelope, even
        // when the datagram's origin differs.
        let t2 = t1 + Duration::from_secs(10);
        table.observe("carol", addr(9002), t2);
        assert_eq!(table.get("bob").unwrap().last_seen, t2);
    }

    #[test]
    fn expire_evicts_silent_peers() {
        let mut table = PeerTable::new("alice");
        let t0 = Instant::now();
        table.observe("bob", addr(9002), t0);
        table.observe("carol", addr(9003), t0 + Duration::from_secs(25));

        let evicted = table.expire(t0 + Duration::from_secs(31), Duration::from_secs(30));
        assert_eq!(evicted, vec![("bob".to_string(), addr(9002))]);
        assert!(table.get("bob").is_none());
        assert!(table.get("carol").is_some());
    }

    #[test]
    fn origin_of_addr_resolves_envelope_owner() {
        let mut table = PeerTable::new("alice");
        table.observe("bob", addr(9002), Instant::now());

        assert_eq!(table.origin_of_addr(addr(9002)), Some("bob"));
        assert_eq!(table.origin_of_addr(addr(9999)), None);
    }

    #[test]
    fn public_addr_is_recorded() {
        let mut table = PeerTable::new("alice");
        table.observe("bob", addr(9002), Instant::now());

        table.set_public_addr("bob", addr(4000));
        assert_eq!(table.get("bob").unwrap().public_addr, Some(addr(4000)));
    }
}
