//! # Sequenced Distance-Vector Routing
//!
//! Destination-sequenced routing table in the DSDV style: every destination
//! owns a monotonic sequence number (set by the destination itself in its
//! route rumors), and freshness beats distance. An entry's sequence number
//! never decreases.
//!
//! Rumor deduplication is separate from the table: the per-origin high-water
//! mark of rumor sequence numbers decides whether a rumor is fresh (and so
//! must be forwarded to one random neighbor) independently of whether it
//! improved the table. The tracker is LRU-bounded so fabricated origins
//! cannot grow it without limit.
//!
//! Routes also have a fast-start path: a user message arriving from its
//! origin installs a direct route with the message sequence, without waiting
//! for the next rumor cycle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::Instant;

use lru::LruCache;

/// Maximum origins tracked for rumor deduplication.
const MAX_TRACKED_ORIGINS: usize = 4096;

/// One routing table entry.
#[derive(Clone, Debug)]
pub(crate) struct RouteEntry {
    /// Endpoint the next datagram toward this destination is sent to.
    pub next_hop: SocketAddr,
    /// Destination-owned sequence number. Monotonic per destination.
    pub seqno: u64,
    /// Hops to the destination through `next_hop` (>= 1). The rumor format
    /// carries no path length, so this stays 1 as installed at the receiver.
    pub hops: u32,
    pub updated: Instant,
    /// True when the route was learned from a datagram whose origin owned
    /// the envelope endpoint.
    pub direct: bool,
    /// Envelope endpoint recorded by address-translation observation.
    pub public_addr: Option<SocketAddr>,
}

/// Public snapshot of one route, as exposed through the node handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteInfo {
    pub dest: String,
    pub next_hop: SocketAddr,
    pub seqno: u64,
    pub hops: u32,
    pub direct: bool,
    /// Observed public endpoint of the destination, when address
    /// translation was detected. Alternate contact information only; never
    /// substituted for `next_hop`.
    pub public_addr: Option<SocketAddr>,
}

/// Outcome of processing one route rumor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RumorOutcome {
    /// Sequence number advanced past the recorded high-water: the rumor must
    /// be forwarded to one random neighbor. `installed` reports whether the
    /// table changed.
    Fresh { installed: bool },
    /// Already-seen or older sequence; drop without forwarding.
    Stale,
}

/// A candidate replaces the incumbent iff it is strictly fresher, or equally
/// fresh and direct where the incumbent is not, or equally fresh, equally
/// direct and strictly closer.
fn better_route(candidate: &RouteEntry, incumbent: &RouteEntry) -> bool {
    if candidate.seqno != incumbent.seqno {
        return candidate.seqno > incumbent.seqno;
    }
    if candidate.direct != incumbent.direct {
        return candidate.direct;
    }
    candidate.hops < incumbent.hops
}

pub(crate) struct RoutingTable {
    local_origin: String,
    routes: HashMap<String, RouteEntry>,
    rumor_seqnos: LruCache<String, u64>,
}

impl RoutingTable {
    pub fn new(local_origin: impl Into<String>) -> Self {
        let capacity =
            NonZeroUsize::new(MAX_TRACKED_ORIGINS).expect("tracker capacity must be non-zero");
        Self {
            local_origin: local_origin.into(),
            routes: HashMap::new(),
            rumor_seqnos: LruCache::new(capacity),
        }
    }

    /// Process a route rumor for `origin` received from envelope endpoint
    /// `from`. Stale sequence numbers are never acted upon.
    pub fn observe_rumor(
        &mut self,
        origin: &str,
        seqno: u64,
        from: SocketAddr,
        direct: bool,
        now: Instant,
    ) -> RumorOutcome {
        if origin == self.local_origin {
            return RumorOutcome::Stale;
        }
        let seen = self.rumor_seqnos.get(origin).copied().unwrap_or(0);
        if seqno <= seen {
            return RumorOutcome::Stale;
        }
        self.rumor_seqnos.put(origin.to_string(), seqno);
        let installed = self.upsert(
            origin,
            RouteEntry {
                next_hop: from,
                seqno,
                hops: 1,
                updated: now,
                direct,
                public_addr: None,
            },
        );
        RumorOutcome::Fresh { installed }
    }

    /// Fast-start path: install or refresh a route from a user message's
    /// origin and sequence. Does not touch rumor deduplication.
    pub fn observe_message(
        &mut self,
        origin: &str,
        seqno: u64,
        from: SocketAddr,
        direct: bool,
        now: Instant,
    ) -> bool {
        if origin == self.local_origin {
            return false;
        }
        self.upsert(
            origin,
            RouteEntry {
                next_hop: from,
                seqno,
                hops: 1,
                updated: now,
                direct,
                public_addr: None,
            },
        )
    }

    fn upsert(&mut self, origin: &str, candidate: RouteEntry) -> bool {
        match self.routes.get_mut(origin) {
            None => {
                self.routes.insert(origin.to_string(), candidate);
                true
            }
            Some(entry) => {
                if !better_route(&candidate, entry) {
                    return false;
                }
                // The public endpoint belongs to the destination, not to the
                // path; keep it across next-hop changes.
                let public_addr = entry.public_addr.take().or(candidate.public_addr);
                *entry = RouteEntry {
                    public_addr,
                    ..candidate
                };
                true
            }
        }
    }

    pub fn next_hop(&self, dest: &str) -> Option<SocketAddr> {
        self.routes.get(dest).map(|entry| entry.next_hop)
    }

    pub fn get(&self, dest: &str) -> Option<&RouteEntry> {
        self.routes.get(dest)
    }

    /// Tear down the direct route to an expired peer. Indirect routes are
    /// left alone; a fresher rumor will repair or replace them.
    pub fn remove_direct(&mut self, origin: &str) -> bool {
        if self.routes.get(origin).is_some_and(|entry| entry.direct) {
            self.routes.remove(origin);
            return true;
        }
        false
    }

    pub fn set_public_addr(&mut self, origin: &str, addr: SocketAddr) {
        if let Some(entry) = self.routes.get_mut(origin) {
            entry.public_addr = Some(addr);
        }
    }

    pub fn snapshot(&self) -> Vec<RouteInfo> {
        self.routes
            .iter()
            .map(|(dest, entry)| RouteInfo {
                dest: dest.clone(),
                next_hop: entry.next_hop,
                seqno: entry.seqno,
                hops: entry.hops,
                direct: entry.direct,
                public_addr: entry.public_addr,
            })
            .collect()
    }
}
