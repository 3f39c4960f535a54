//! # Node: Dispatcher, Timers, Outbound API
//!
//! A [`Node`] binds one UDP endpoint and runs the whole protocol behind it:
//! peer discovery and liveness, anti-entropy reconciliation, hop-level
//! acknowledgement with retransmission, and sequenced distance-vector
//! routing with hop-limited private forwarding.
//!
//! ## Concurrency
//!
//! All mutable protocol state (peer table, message store, pending acks,
//! routing table, sequence counters) is owned by a single actor task. The
//! public [`Node`] handle talks to it over an mpsc command channel with
//! oneshot replies; a dedicated reader task funnels raw datagrams into the
//! same single-consumer queue. Handlers run to completion, so no state is
//! ever locked.
//!
//! ## Timers
//!
//! | Timer          | Default | Action                                            |
//! |----------------|---------|---------------------------------------------------|
//! | Discovery      | 5 s     | Probe the bootstrap port range; expire stale peers |
//! | Anti-entropy   | 3 s     | Send the vector-clock summary to every peer       |
//! | Retransmission | 2 s     | Re-send messages with outstanding acks            |
//! | Route rumor    | 60 s    | Announce self to one random neighbor              |
//!
//! Delivered messages, topology changes and route updates surface as
//! [`NodeEvent`]s on a take-once receiver; the UI layer consumes them
//! without ever touching protocol state.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow, bail};
use rand::seq::SliceRandom;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::messages::{BROADCAST_DEST, MAX_FRAME_SIZE, Packet, decode_packet, encode_packet};
use crate::peers::PeerTable;
use crate::routing::{RouteInfo, RoutingTable, RumorOutcome};
use crate::store::{MessageRecord, MessageStore, PendingAcks};

// ============================================================================
// Defaults
// ============================================================================

/// Discovery tick: bootstrap-range probing and peer expiry.
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);

/// Anti-entropy tick: vector-clock exchange with every peer.
pub const DEFAULT_ANTI_ENTROPY_INTERVAL: Duration = Duration::from_secs(3);

/// Retransmission tick; also the minimum age before a pending message is
/// re-sent.
pub const DEFAULT_RETRANSMISSION_INTERVAL: Duration = Duration::from_secs(2);

/// Route-rumor tick: self-announcement to one random neighbor.
pub const DEFAULT_ROUTE_RUMOR_INTERVAL: Duration = Duration::from_secs(60);

/// Peers silent for longer than this are evicted on the discovery tick.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// First port of the local bootstrap scan range.
pub const DEFAULT_BASE_PORT: u16 = 9000;

/// Width of the local bootstrap scan range.
pub const DEFAULT_MAX_PORTS: u16 = 10;

/// Initial hop budget of a private datagram.
pub const DEFAULT_HOP_LIMIT: u32 = 10;

// ============================================================================
// Configuration
// ============================================================================

/// Tunable node parameters. Defaults match the protocol constants; tests
/// shorten the intervals and disable the port scan.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub discovery_interval: Duration,
    pub anti_entropy_interval: Duration,
    pub retransmission_interval: Duration,
    pub route_rumor_interval: Duration,
    pub peer_timeout: Duration,
    /// First port probed on the discovery tick.
    pub base_port: u16,
    /// Number of ports probed starting at `base_port`. Zero disables the
    /// scan; manually added peers still work.
    pub max_ports: u16,
    /// Hop budget stamped on outgoing private datagrams.
    pub hop_limit: u32,
    /// Rendezvous mode: never forward private traffic.
    pub no_forward: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            anti_entropy_interval: DEFAULT_ANTI_ENTROPY_INTERVAL,
            retransmission_interval: DEFAULT_RETRANSMISSION_INTERVAL,
            route_rumor_interval: DEFAULT_ROUTE_RUMOR_INTERVAL,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
            base_port: DEFAULT_BASE_PORT,
            max_ports: DEFAULT_MAX_PORTS,
            hop_limit: DEFAULT_HOP_LIMIT,
            no_forward: false,
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Protocol events surfaced to the consumer (UI, logger, tests).
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// A user message addressed to this node or broadcast arrived for the
    /// first time (directly or via anti-entropy back-fill).
    MessageReceived {
        origin: String,
        text: String,
        broadcast: bool,
    },
    PeerAdded {
        origin: String,
        addr: SocketAddr,
    },
    PeerExpired {
        origin: String,
    },
    RouteUpdated {
        dest: String,
        next_hop: SocketAddr,
        seqno: u64,
        hops: u32,
    },
    /// The origin's self-reported endpoint disagreed with the envelope.
    NatObserved {
        origin: String,
        reported: SocketAddr,
        observed: SocketAddr,
    },
    RetransmissionFired {
        origin: String,
        seqno: u64,
    },
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    SendDirect(String, String, oneshot::Sender<Result<u64>>),
    Broadcast(String, oneshot::Sender<Result<u64>>),
    SendPrivate(String, String, oneshot::Sender<Result<()>>),
    AddPeer(SocketAddr, oneshot::Sender<()>),
    Peers(oneshot::Sender<Vec<(String, SocketAddr)>>),
    Routes(oneshot::Sender<Vec<RouteInfo>>),
    Summary(oneshot::Sender<BTreeMap<String, u64>>),
    PendingSequences(oneshot::Sender<Vec<u64>>),
    Quit,
}

/// A receiver that can be taken exactly once via `.take()`.
/// Used for the event receiver, which should only have one consumer.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

// ============================================================================
// Node handle (public API)
// ============================================================================

pub struct Node {
    origin: String,
    local_addr: SocketAddr,
    cmd_tx: mpsc::Sender<Command>,
    event_receiver: TakeOnce<NodeEvent>,
}

impl Node {
    /// Start configuring a node with the given origin id and UDP listen port.
    pub fn builder(origin: impl Into<String>, port: u16) -> NodeBuilder {
        NodeBuilder {
            origin: origin.into(),
            port,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            config: NodeConfig::default(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Take the event receiver. Can only be taken once.
    pub async fn events(&self) -> Result<mpsc::Receiver<NodeEvent>> {
        self.event_receiver
            .lock()
            .await
            .take()
            .context("event receiver already taken")
    }

    /// Send a user message to a named node. Allocates the next local
    /// sequence, tracks the ack, and returns the sequence number.
    pub async fn send_direct(&self, dest: &str, text: &str) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SendDirect(dest.to_string(), text.to_string(), tx))
            .await
            .map_err(|_| anyhow!("node actor closed"))?;
        rx.await.map_err(|_| anyhow!("node actor closed"))?
    }

    /// Send a user message to every known peer. Returns the sequence number.
    pub async fn broadcast(&self, text: &str) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Broadcast(text.to_string(), tx))
            .await
            .map_err(|_| anyhow!("node actor closed"))?;
        rx.await.map_err(|_| anyhow!("node actor closed"))?
    }

    /// Send a routed, hop-limited private message.
    pub async fn send_private(&self, dest: &str, text: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SendPrivate(dest.to_string(), text.to_string(), tx))
            .await
            .map_err(|_| anyhow!("node actor closed"))?;
        rx.await.map_err(|_| anyhow!("node actor closed"))?
    }

    /// Probe an endpoint with a discovery datagram. No peer entry is created
    /// until the endpoint answers.
    pub async fn add_peer(&self, addr: &str) -> Result<()> {
        let addr: SocketAddr = addr
            .parse()
            .context("invalid peer endpoint, expected IP:PORT")?;
        if addr.port() == 0 {
            bail!("peer endpoint must have a nonzero port");
        }
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AddPeer(addr, tx))
            .await
            .map_err(|_| anyhow!("node actor closed"))?;
        rx.await.map_err(|_| anyhow!("node actor closed"))
    }

    /// All currently known (origin, endpoint) pairs.
    pub async fn peers(&self) -> Vec<(String, SocketAddr)> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Peers(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Snapshot of the routing table.
    pub async fn routes(&self) -> Vec<RouteInfo> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Routes(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Per-origin high-water marks of the local message store.
    pub async fn summary(&self) -> BTreeMap<String, u64> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Summary(tx)).await.is_err() {
            return BTreeMap::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Locally originated sequences still awaiting acknowledgement.
    pub async fn pending_acks(&self) -> Vec<u64> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::PendingSequences(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct NodeBuilder {
    origin: String,
    port: u16,
    bind_ip: IpAddr,
    config: NodeConfig,
}

impl NodeBuilder {
    /// Bind to a specific local IP instead of the unspecified address.
    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Rendezvous mode: deliver private traffic addressed to this node but
    /// never forward it.
    pub fn no_forward(mut self, enabled: bool) -> Self {
        self.config.no_forward = enabled;
        self
    }

    /// Bind the UDP socket and start the node actor. Bind failure is fatal
    /// and surfaced to the caller.
    pub async fn spawn(self) -> Result<Node> {
        if self.origin.is_empty() {
            bail!("node origin must not be empty");
        }
        if self.origin == BROADCAST_DEST {
            bail!("node origin collides with the broadcast sentinel");
        }
        if self.port == 0 {
            bail!("listen port must be in 1..=65535");
        }

        let socket = UdpSocket::bind(SocketAddr::new(self.bind_ip, self.port))
            .await
            .with_context(|| {
                format!("failed to bind udp socket on {}:{}", self.bind_ip, self.port)
            })?;
        let local_addr = socket.local_addr().context("udp socket has no local address")?;
        let socket = Arc::new(socket);

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(1024);
        let (datagram_tx, datagram_rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(256);

        // Socket reader: the only task that receives. Everything funnels
        // into the actor's single-consumer queue, so handlers never race.
        {
            let socket = socket.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_FRAME_SIZE];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((len, from)) => {
                            if datagram_tx.send((buf[..len].to_vec(), from)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "udp receive failed");
                        }
                    }
                }
            });
        }

        let actor = NodeActor {
            origin: self.origin.clone(),
            socket,
            local_addr,
            config: self.config.clone(),
            peers: PeerTable::new(self.origin.clone()),
            store: MessageStore::new(),
            pending: PendingAcks::new(),
            routing: RoutingTable::new(self.origin.clone()),
            next_sequence: 1,
            route_seqno: 0,
            event_tx,
        };
        tokio::spawn(actor.run(cmd_rx, datagram_rx));

        info!(
            origin = %self.origin,
            addr = %local_addr,
            no_forward = self.config.no_forward,
            "node started"
        );

        Ok(Node {
            origin: self.origin,
            local_addr,
            cmd_tx,
            event_receiver: tokio::sync::Mutex::new(Some(event_rx)),
        })
    }
}

// ============================================================================
// Node actor (owns all protocol state)
// ============================================================================

struct NodeActor {
    origin: String,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    config: NodeConfig,
    peers: PeerTable,
    store: MessageStore,
    pending: PendingAcks,
    routing: RoutingTable,
    /// Next sequence for locally originated messages. Starts at 1.
    next_sequence: u64,
    /// Own route sequence, incremented on every rumor emission.
    route_seqno: u64,
    event_tx: mpsc::Sender<NodeEvent>,
}

impl NodeActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut datagram_rx: mpsc::Receiver<(Vec<u8>, SocketAddr)>,
    ) {
        let mut discovery = tokio::time::interval(self.config.discovery_interval);
        let mut anti_entropy = tokio::time::interval(self.config.anti_entropy_interval);
        let mut retransmission = tokio::time::interval(self.config.retransmission_interval);
        let mut route_rumor = tokio::time::interval(self.config.route_rumor_interval);

        loop {
            tokio::select! {
                datagram = datagram_rx.recv() => match datagram {
                    Some((data, from)) => self.handle_datagram(&data, from).await,
                    None => {
                        debug!("socket reader stopped, node actor quitting");
                        break;
                    }
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::SendDirect(dest, text, reply)) => {
                        let _ = reply.send(self.handle_send_direct(dest, text).await);
                    }
                    Some(Command::Broadcast(text, reply)) => {
                        let _ = reply.send(self.handle_broadcast(text).await);
                    }
                    Some(Command::SendPrivate(dest, text, reply)) => {
                        let _ = reply.send(self.handle_send_private(dest, text).await);
                    }
                    Some(Command::AddPeer(addr, reply)) => {
                        self.handle_add_peer(addr).await;
                        let _ = reply.send(());
                    }
                    Some(Command::Peers(reply)) => {
                        let _ = reply.send(self.peers.snapshot());
                    }
                    Some(Command::Routes(reply)) => {
                        let _ = reply.send(self.routing.snapshot());
                    }
                    Some(Command::Summary(reply)) => {
                        let _ = reply.send(self.store.summary());
                    }
                    Some(Command::PendingSequences(reply)) => {
                        let _ = reply.send(self.pending.sequences_for(&self.origin));
                    }
                    Some(Command::Quit) => {
                        debug!("node actor quitting");
                        break;
                    }
                    None => {
                        debug!("node handle dropped, actor quitting");
                        break;
                    }
                },
                _ = discovery.tick() => self.discovery_tick().await,
                _ = anti_entropy.tick() => self.anti_entropy_tick().await,
                _ = retransmission.tick() => self.retransmission_tick().await,
                _ = route_rumor.tick() => self.route_rumor_tick().await,
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    async fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        let packet = match decode_packet(data) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(from = %from, error = %e, "dropping undecodable datagram");
                return;
            }
        };
        trace!(from = %from, kind = packet.kind(), "datagram received");

        let origin = packet.origin().to_string();
        let now = Instant::now();
        // Does the envelope endpoint belong to the claimed origin? Decided
        // before the peer table learns about this datagram, so forwarded
        // traffic never counts as direct contact.
        let direct = match self.peers.origin_of_addr(from) {
            Some(owner) => owner == origin,
            None => true,
        };

        if origin != self.origin {
            if self.peers.observe(&origin, from, now) {
                info!(peer = %origin, addr = %from, "peer added");
                self.emit(NodeEvent::PeerAdded {
                    origin: origin.clone(),
                    addr: from,
                });
                if self.routing.observe_message(&origin, 0, from, direct, now) {
                    self.emit_route_update(&origin);
                }
            }
            if let Some(reported) = packet.reported_endpoint() {
                self.observe_translation(&origin, reported, from);
            }
        }

        match packet {
            Packet::Discovery { .. } => self.handle_discovery(from).await,
            Packet::DiscoveryResponse { .. } => {
                // Observe/refresh above is all the work there is.
            }
            Packet::Message {
                origin,
                destination,
                chat_text,
                sequence,
                timestamp,
                ..
            } => {
                self.handle_message(origin, destination, chat_text, sequence, timestamp, from, direct)
                    .await;
            }
            Packet::Ack {
                origin,
                ack_origin,
                ack_sequence,
            } => self.handle_ack(origin, ack_origin, ack_sequence),
            Packet::VectorClock { vector_clock, .. } => {
                self.handle_vector_clock(vector_clock, from).await;
            }
            Packet::SyncMessage {
                sync_origin,
                sync_sequence,
                sync_destination,
                sync_text,
                ..
            } => self.handle_sync_message(sync_origin, sync_sequence, sync_destination, sync_text),
            Packet::RouteRumor {
                origin,
                seq_no,
                last_ip,
                last_port,
            } => {
                self.handle_route_rumor(origin, seq_no, last_ip, last_port, from, direct)
                    .await;
            }
            Packet::Private {
                origin,
                dest,
                chat_text,
                hop_limit,
                sequence,
                ..
            } => {
                self.handle_private(origin, dest, chat_text, hop_limit, sequence, from)
                    .await;
            }
        }
    }

    async fn handle_discovery(&mut self, from: SocketAddr) {
        let response = Packet::DiscoveryResponse {
            origin: self.origin.clone(),
            port: self.local_addr.port(),
            last_ip: self.local_addr.ip().to_string(),
            last_port: self.local_addr.port(),
        };
        self.send_packet(&response, from).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_message(
        &mut self,
        origin: String,
        destination: String,
        chat_text: String,
        sequence: u64,
        timestamp: u64,
        from: SocketAddr,
        direct: bool,
    ) {
        if origin == self.origin {
            return;
        }
        // Fast-start route: a message from its origin doubles as a route
        // announcement with the message sequence.
        if self
            .routing
            .observe_message(&origin, sequence, from, direct, Instant::now())
        {
            debug!(dest = %origin, next_hop = %from, seqno = sequence, "route refreshed from message");
            self.emit_route_update(&origin);
        }
        if self.store.has(&origin, sequence) {
            trace!(origin = %origin, seq = sequence, "duplicate message dropped without ack");
            return;
        }
        self.store.insert(MessageRecord::new(
            origin.clone(),
            sequence,
            destination.clone(),
            chat_text.clone(),
            timestamp,
            Instant::now(),
        ));

        let ack = Packet::Ack {
            origin: self.origin.clone(),
            ack_origin: origin.clone(),
            ack_sequence: sequence,
        };
        self.send_packet(&ack, from).await;

        if destination == self.origin {
            info!(from = %origin, seq = sequence, "message delivered");
            self.emit(NodeEvent::MessageReceived {
                origin,
                text: chat_text,
                broadcast: false,
            });
        } else if destination == BROADCAST_DEST {
            info!(from = %origin, seq = sequence, "broadcast delivered");
            self.emit(NodeEvent::MessageReceived {
                origin,
                text: chat_text,
                broadcast: true,
            });
        }
    }

    fn handle_ack(&mut self, origin: String, ack_origin: String, ack_sequence: u64) {
        if ack_origin == self.origin && self.pending.resolve(&ack_origin, ack_sequence) {
            debug!(seq = ack_sequence, by = %origin, "message acknowledged");
        }
        self.store.record_ack(&ack_origin, ack_sequence, &origin);
    }

    async fn handle_vector_clock(&mut self, peer_clock: BTreeMap<String, u64>, from: SocketAddr) {
        let missing: Vec<Packet> = self
            .store
            .records_above(&peer_clock)
            .map(|record| Packet::SyncMessage {
                origin: self.origin.clone(),
                sync_origin: record.origin.clone(),
                sync_sequence: record.sequence,
                sync_destination: record.destination.clone(),
                sync_text: record.text.clone(),
            })
            .collect();
        if missing.is_empty() {
            return;
        }
        debug!(peer = %from, count = missing.len(), "pushing messages missing from peer");
        for packet in &missing {
            self.send_packet(packet, from).await;
        }
    }

    fn handle_sync_message(
        &mut self,
        sync_origin: String,
        sync_sequence: u64,
        sync_destination: String,
        sync_text: String,
    ) {
        if self.store.has(&sync_origin, sync_sequence) {
            return;
        }
        self.store.insert(MessageRecord::new(
            sync_origin.clone(),
            sync_sequence,
            sync_destination.clone(),
            sync_text.clone(),
            wall_clock_ms(),
            Instant::now(),
        ));
        debug!(origin = %sync_origin, seq = sync_sequence, "message back-filled via anti-entropy");

        if sync_destination == self.origin || sync_destination == BROADCAST_DEST {
            let broadcast = sync_destination == BROADCAST_DEST;
            self.emit(NodeEvent::MessageReceived {
                origin: sync_origin,
                text: sync_text,
                broadcast,
            });
        }
    }

    async fn handle_route_rumor(
        &mut self,
        origin: String,
        seq_no: u64,
        last_ip: String,
        last_port: u16,
        from: SocketAddr,
        direct: bool,
    ) {
        if origin == self.origin {
            return;
        }
        match self
            .routing
            .observe_rumor(&origin, seq_no, from, direct, Instant::now())
        {
            RumorOutcome::Fresh { installed } => {
                if installed {
                    debug!(dest = %origin, next_hop = %from, seqno = seq_no, "route installed from rumor");
                    self.emit_route_update(&origin);
                }
                // Rumor-mongering: forward unchanged to one uniformly random
                // peer other than the envelope sender. Duplicate suppression
                // at the receivers bounds the fan-out.
                let candidates: Vec<SocketAddr> = self
                    .peers
                    .snapshot()
                    .into_iter()
                    .map(|(_, addr)| addr)
                    .filter(|addr| *addr != from)
                    .collect();
                let next = candidates.choose(&mut rand::thread_rng()).copied();
                if let Some(next) = next {
                    let rumor = Packet::RouteRumor {
                        origin,
                        seq_no,
                        last_ip,
                        last_port,
                    };
                    self.send_packet(&rumor, next).await;
                }
            }
            RumorOutcome::Stale => {
                trace!(origin = %origin, seqno = seq_no, "stale route rumor dropped");
            }
        }
    }

    async fn handle_private(
        &mut self,
        origin: String,
        dest: String,
        chat_text: String,
        hop_limit: u32,
        sequence: u64,
        from: SocketAddr,
    ) {
        if dest == self.origin {
            info!(from = %origin, "private message delivered");
            self.emit(NodeEvent::MessageReceived {
                origin,
                text: chat_text,
                broadcast: false,
            });
            return;
        }
        if self.config.no_forward {
            debug!(dest = %dest, from = %from, "forwarding disabled, dropping private message");
            return;
        }
        let remaining = hop_limit.saturating_sub(1);
        if remaining == 0 {
            trace!(dest = %dest, "hop limit exhausted, dropping private message");
            return;
        }
        // The forwarder reports itself as the last hop.
        let forwarded = Packet::Private {
            origin,
            dest: dest.clone(),
            chat_text,
            hop_limit: remaining,
            sequence,
            last_ip: self.local_addr.ip().to_string(),
            last_port: self.local_addr.port(),
        };
        match self.routing.next_hop(&dest) {
            Some(next) => self.send_packet(&forwarded, next).await,
            None => self.broadcast_packet(&forwarded).await,
        }
    }

    // ------------------------------------------------------------------
    // Timer ticks
    // ------------------------------------------------------------------

    async fn discovery_tick(&mut self) {
        let probe = self.discovery_packet();
        let end = self.config.base_port.saturating_add(self.config.max_ports);
        for port in self.config.base_port..end {
            if port == self.local_addr.port() {
                continue;
            }
            let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
            self.send_packet(&probe, target).await;
        }

        let now = Instant::now();
        for (origin, addr) in self.peers.expire(now, self.config.peer_timeout) {
            info!(peer = %origin, addr = %addr, "peer timed out");
            self.routing.remove_direct(&origin);
            self.emit(NodeEvent::PeerExpired { origin });
        }
    }

    async fn anti_entropy_tick(&mut self) {
        if self.peers.is_empty() {
            return;
        }
        let clock = Packet::VectorClock {
            origin: self.origin.clone(),
            vector_clock: self.store.summary(),
        };
        for (_, addr) in self.peers.snapshot() {
            self.send_packet(&clock, addr).await;
        }
    }

    async fn retransmission_tick(&mut self) {
        let now = Instant::now();
        for (origin, sequence) in self.pending.outstanding() {
            let Some(record) = self.store.get(&origin, sequence) else {
                continue;
            };
            if now.duration_since(record.stored_at) <= self.config.retransmission_interval {
                continue;
            }
            let destination = record.destination.clone();
            let packet = Packet::Message {
                origin: record.origin.clone(),
                destination: destination.clone(),
                chat_text: record.text.clone(),
                sequence,
                timestamp: record.timestamp_ms,
                last_ip: self.local_addr.ip().to_string(),
                last_port: self.local_addr.port(),
            };
            debug!(seq = sequence, dest = %destination, "retransmitting unacknowledged message");
            self.emit(NodeEvent::RetransmissionFired {
                origin: origin.clone(),
                seqno: sequence,
            });
            self.send_message_best_path(&destination, &packet).await;
        }
    }

    async fn route_rumor_tick(&mut self) {
        let peers = self.peers.snapshot();
        let Some((_, neighbor)) = peers.choose(&mut rand::thread_rng()) else {
            return;
        };
        self.route_seqno += 1;
        let rumor = Packet::RouteRumor {
            origin: self.origin.clone(),
            seq_no: self.route_seqno,
            last_ip: self.local_addr.ip().to_string(),
            last_port: self.local_addr.port(),
        };
        debug!(seqno = self.route_seqno, neighbor = %neighbor, "announcing route rumor");
        self.send_packet(&rumor, *neighbor).await;
    }

    // ------------------------------------------------------------------
    // Outbound API
    // ------------------------------------------------------------------

    async fn handle_send_direct(&mut self, dest: String, text: String) -> Result<u64> {
        if dest.is_empty() {
            bail!("destination must not be empty");
        }
        let sequence = self.allocate_sequence();
        let timestamp = wall_clock_ms();
        self.store.insert(MessageRecord::new(
            self.origin.clone(),
            sequence,
            dest.clone(),
            text.clone(),
            timestamp,
            Instant::now(),
        ));
        self.pending.add(&self.origin, sequence);

        let packet = Packet::Message {
            origin: self.origin.clone(),
            destination: dest.clone(),
            chat_text: text,
            sequence,
            timestamp,
            last_ip: self.local_addr.ip().to_string(),
            last_port: self.local_addr.port(),
        };
        self.send_message_best_path(&dest, &packet).await;
        Ok(sequence)
    }

    async fn handle_broadcast(&mut self, text: String) -> Result<u64> {
        let sequence = self.allocate_sequence();
        let timestamp = wall_clock_ms();
        // Stored locally as well, so anti-entropy can back-fill late joiners.
        self.store.insert(MessageRecord::new(
            self.origin.clone(),
            sequence,
            BROADCAST_DEST,
            text.clone(),
            timestamp,
            Instant::now(),
        ));

        let packet = Packet::Message {
            origin: self.origin.clone(),
            destination: BROADCAST_DEST.to_string(),
            chat_text: text,
            sequence,
            timestamp,
            last_ip: self.local_addr.ip().to_string(),
            last_port: self.local_addr.port(),
        };
        self.broadcast_packet(&packet).await;
        Ok(sequence)
    }

    async fn handle_send_private(&mut self, dest: String, text: String) -> Result<()> {
        if dest.is_empty() {
            bail!("destination must not be empty");
        }
        let sequence = self.allocate_sequence();
        let packet = Packet::Private {
            origin: self.origin.clone(),
            dest: dest.clone(),
            chat_text: text,
            hop_limit: self.config.hop_limit,
            sequence,
            last_ip: self.local_addr.ip().to_string(),
            last_port: self.local_addr.port(),
        };
        match self.routing.next_hop(&dest) {
            Some(next) => {
                debug!(dest = %dest, next_hop = %next, "private message routed");
                self.send_packet(&packet, next).await;
            }
            None => {
                debug!(dest = %dest, "no route, broadcasting private message");
                self.broadcast_packet(&packet).await;
            }
        }
        Ok(())
    }

    async fn handle_add_peer(&mut self, addr: SocketAddr) {
        debug!(addr = %addr, "probing manually added endpoint");
        let probe = self.discovery_packet();
        self.send_packet(&probe, addr).await;
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn discovery_packet(&self) -> Packet {
        Packet::Discovery {
            origin: self.origin.clone(),
            port: self.local_addr.port(),
            last_ip: self.local_addr.ip().to_string(),
            last_port: self.local_addr.port(),
        }
    }

    fn allocate_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    fn observe_translation(&mut self, origin: &str, reported: SocketAddr, observed: SocketAddr) {
        if !translation_observed(reported, observed) {
            return;
        }
        // The peer record is the source of truth: a translation is logged
        // once per origin, again only if the observed endpoint changes.
        let already_known = self
            .peers
            .get(origin)
            .and_then(|peer| peer.public_addr)
            == Some(observed);
        self.peers.set_public_addr(origin, observed);
        self.routing.set_public_addr(origin, observed);
        if !already_known {
            info!(peer = %origin, reported = %reported, observed = %observed, "address translation observed");
            self.emit(NodeEvent::NatObserved {
                origin: origin.to_string(),
                reported,
                observed,
            });
        }
    }

    fn emit(&self, event: NodeEvent) {
        if self.event_tx.try_send(event).is_err() {
            trace!("event channel full or closed, dropping event");
        }
    }

    fn emit_route_update(&self, dest: &str) {
        if let Some(entry) = self.routing.get(dest) {
            self.emit(NodeEvent::RouteUpdated {
                dest: dest.to_string(),
                next_hop: entry.next_hop,
                seqno: entry.seqno,
                hops: entry.hops,
            });
        }
    }

    /// Best available path for a user message: routing table, then direct
    /// peer record, then broadcast to everyone.
    async fn send_message_best_path(&self, dest: &str, packet: &Packet) {
        if dest == BROADCAST_DEST {
            self.broadcast_packet(packet).await;
            return;
        }
        if let Some(next) = self.routing.next_hop(dest) {
            self.send_packet(packet, next).await;
        } else if let Some(peer) = self.peers.get(dest) {
            self.send_packet(packet, peer.addr).await;
        } else {
            self.broadcast_packet(packet).await;
        }
    }

    async fn broadcast_packet(&self, packet: &Packet) {
        for (_, addr) in self.peers.snapshot() {
            self.send_packet(packet, addr).await;
        }
    }

    async fn send_packet(&self, packet: &Packet, dest: SocketAddr) {
        let frame = match encode_packet(packet) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = packet.kind(), error = %e, "packet encode failed");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&frame, dest).await {
            warn!(dest = %dest, kind = packet.kind(), error = %e, "udp send failed");
        }
    }
}

/// True when the self-reported endpoint disagrees with the envelope and
/// neither side is loopback or unspecified.
fn translation_observed(reported: SocketAddr, observed: SocketAddr) -> bool {
    if reported == observed {
        return false;
    }
    let exempt = |ip: IpAddr| ip.is_loopback() || ip.is_unspecified();
    !exempt(reported.ip()) && !exempt(observed.ip())
}

/// Milliseconds since the Unix epoch, for wire timestamps.
fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
