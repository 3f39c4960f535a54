//! # Rumornet - Gossip Messaging Substrate
//!
//! Rumornet is a peer-to-peer messaging substrate over UDP datagrams:
//!
//! - **Discovery**: periodic probing of a bootstrap port range plus manual
//!   endpoint adds, with liveness timeouts
//! - **Anti-entropy**: per-origin high-water summaries (a vector clock over
//!   independent logs) with push back-fill of missing messages
//! - **Routing**: destination-sequenced distance-vector table driving
//!   hop-limited private unicast across multi-hop topologies
//! - **Reliability**: hop-level acks with timer-driven retransmission;
//!   eventual consistency everywhere else
//!
//! ## Architecture
//!
//! All mutable protocol state lives in a single actor task owned by the
//! [`Node`]; the handle communicates with it over async channels, and
//! protocol output reaches the embedding application as [`NodeEvent`]s.
//! Nothing in the protocol is authenticated: origins are opaque strings
//! trusted as-is, and endpoints are only ever taken from datagram envelopes.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | Node handle, builder, actor event loop, timers, outbound API |
//! | `messages` | Wire packet types and the length+magic frame codec |
//! | `peers` | Observed endpoints with last-seen tracking and expiry |
//! | `store` | Per-origin append-only message storage and pending acks |
//! | `routing` | Sequenced distance-vector table with rumor deduplication |

pub mod messages;
mod node;
mod peers;
mod routing;
mod store;

pub use node::{
    DEFAULT_ANTI_ENTROPY_INTERVAL, DEFAULT_BASE_PORT, DEFAULT_DISCOVERY_INTERVAL,
    DEFAULT_HOP_LIMIT, DEFAULT_MAX_PORTS, DEFAULT_PEER_TIMEOUT, DEFAULT_RETRANSMISSION_INTERVAL,
    DEFAULT_ROUTE_RUMOR_INTERVAL, Node, NodeBuilder, NodeConfig, NodeEvent,
};
pub use routing::RouteInfo;
