//! Integration tests for direct exchange between live nodes.
//!
//! Every test binds real UDP sockets on localhost. Intervals are shortened
//! and the bootstrap port scan is disabled, so topologies are built with
//! explicit `add_peer` probes and assertions poll until the protocol
//! settles.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use rumornet::messages::{Packet, encode_packet};
use rumornet::{Node, NodeConfig, NodeEvent};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(30000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Reserve a contiguous block of ports (for port-scan tests).
fn next_ports(n: u16) -> u16 {
    PORT_COUNTER.fetch_add(n, Ordering::SeqCst)
}

const TEST_TIMEOUT: Duration = Duration::from_secs(15);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

fn fast_config() -> NodeConfig {
    NodeConfig {
        discovery_interval: Duration::from_millis(100),
        anti_entropy_interval: Duration::from_millis(150),
        retransmission_interval: Duration::from_millis(200),
        route_rumor_interval: Duration::from_millis(150),
        // Port scanning off: topologies are built with add_peer.
        max_ports: 0,
        ..NodeConfig::default()
    }
}

async fn spawn_node(origin: &str) -> Node {
    Node::builder(origin, next_port())
        .bind_ip("127.0.0.1".parse().unwrap())
        .config(fast_config())
        .spawn()
        .await
        .expect("node spawn failed")
}

/// Drain `events` until a MessageReceived arrives; other protocol events
/// (peer adds, route updates) are skipped.
async fn next_message(
    events: &mut tokio::sync::mpsc::Receiver<NodeEvent>,
) -> (String, String, bool) {
    timeout(TEST_TIMEOUT, async {
        loop {
            match events.recv().await {
                Some(NodeEvent::MessageReceived {
                    origin,
                    text,
                    broadcast,
                }) => return (origin, text, broadcast),
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("no message event arrived")
}

#[tokio::test]
async fn direct_message_is_delivered_and_acknowledged() {
    let n1 = spawn_node("n1").await;
    let n2 = spawn_node("n2").await;
    let mut n2_events = n2.events().await.expect("events taken twice");

    n1.add_peer(&n2.local_addr().to_string())
        .await
        .expect("add_peer failed");

    // One probe/response round populates both peer tables.
    timeout(TEST_TIMEOUT, async {
        loop {
            let n1_knows = n1.peers().await.iter().any(|(o, _)| o == "n2");
            let n2_knows = n2.peers().await.iter().any(|(o, _)| o == "n1");
            if n1_knows && n2_knows {
                break;
            }
            sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .expect("nodes never peered");

    // First contact installs a direct route.
    let routes = n1.routes().await;
    assert!(
        routes.iter().any(|r| r.dest == "n2" && r.direct && r.hops == 1),
        "n1 should hold a direct route to n2, got {:?}",
        routes
    );

    let seq = n1.send_direct("n2", "hi").await.expect("send failed");
    assert_eq!(seq, 1);

    let (origin, text, broadcast) = next_message(&mut n2_events).await;
    assert_eq!(origin, "n1");
    assert_eq!(text, "hi");
    assert!(!broadcast);

    // The hop-level ack drains n1's pending set.
    timeout(TEST_TIMEOUT, async {
        loop {
            if n1.pending_acks().await.is_empty() {
                break;
            }
            sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .expect("ack never resolved the pending entry");
}

#[tokio::test]
async fn broadcast_reaches_every_peer() {
    let n1 = spawn_node("b1").await;
    let n2 = spawn_node("b2").await;
    let n3 = spawn_node("b3").await;
    let mut n2_events = n2.events().await.expect("events");
    let mut n3_events = n3.events().await.expect("events");

    n1.add_peer(&n2.local_addr().to_string()).await.expect("add_peer");
    n1.add_peer(&n3.local_addr().to_string()).await.expect("add_peer");

    timeout(TEST_TIMEOUT, async {
        loop {
            let peers = n1.peers().await;
            if peers.iter().any(|(o, _)| o == "b2") && peers.iter().any(|(o, _)| o == "b3") {
                break;
            }
            sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .expect("b1 never learned both peers");

    let seq = n1.broadcast("hello").await.expect("broadcast failed");

    for events in [&mut n2_events, &mut n3_events] {
        let (origin, text, broadcast) = next_message(events).await;
        assert_eq!(origin, "b1");
        assert_eq!(text, "hello");
        assert!(broadcast);
    }

    // The sender records its own broadcast in the store.
    assert_eq!(n1.summary().await.get("b1"), Some(&seq));
}

#[tokio::test]
async fn port_scan_discovers_neighbors() {
    // Reserve a private block of the port space for the scan range.
    let base = next_ports(2);
    let config = NodeConfig {
        base_port: base,
        max_ports: 2,
        ..fast_config()
    };

    let n1 = Node::builder("d1", base)
        .bind_ip("127.0.0.1".parse().unwrap())
        .config(config.clone())
        .spawn()
        .await
        .expect("spawn failed");
    let n2 = Node::builder("d2", base + 1)
        .bind_ip("127.0.0.1".parse().unwrap())
        .config(config)
        .spawn()
        .await
        .expect("spawn failed");

    // No manual adds: the periodic scan alone must find the neighbor.
    timeout(TEST_TIMEOUT, async {
        loop {
            let n1_knows = n1.peers().await.iter().any(|(o, _)| o == "d2");
            let n2_knows = n2.peers().await.iter().any(|(o, _)| o == "d1");
            if n1_knows && n2_knows {
                break;
            }
            sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .expect("scan never found the neighbor");
}

#[tokio::test]
async fn silent_peers_expire_and_lose_their_direct_route() {
    let config = NodeConfig {
        peer_timeout: Duration::from_millis(500),
        ..fast_config()
    };
    let node = Node::builder("e1", next_port())
        .bind_ip("127.0.0.1".parse().unwrap())
        .config(config)
        .spawn()
        .await
        .expect("spawn failed");
    let mut events = node.events().await.expect("events");

    // A scripted peer announces itself once and then goes silent.
    let ghost = UdpSocket::bind(("127.0.0.1", next_port()))
        .await
        .expect("raw socket bind failed");
    let hello = Packet::Discovery {
        origin: "ghost".to_string(),
        port: ghost.local_addr().unwrap().port(),
        last_ip: "127.0.0.1".to_string(),
        last_port: ghost.local_addr().unwrap().port(),
    };
    let frame = encode_packet(&hello).expect("encode failed");
    ghost
        .send_to(&frame, node.local_addr())
        .await
        .expect("raw send failed");

    timeout(TEST_TIMEOUT, async {
        loop {
            if node.peers().await.iter().any(|(o, _)| o == "ghost") {
                break;
            }
            sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .expect("ghost never became a peer");
    assert!(node.routes().await.iter().any(|r| r.dest == "ghost" && r.direct));

    timeout(TEST_TIMEOUT, async {
        loop {
            match events.recv().await {
                Some(NodeEvent::PeerExpired { origin }) => {
                    assert_eq!(origin, "ghost");
                    break;
                }
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("silent peer never expired");

    assert!(!node.peers().await.iter().any(|(o, _)| o == "ghost"));
    // The direct route is torn down with the peer entry.
    assert!(!node.routes().await.iter().any(|r| r.dest == "ghost"));
}

#[tokio::test]
async fn invalid_manual_endpoints_are_refused() {
    let node = spawn_node("v1").await;

    assert!(node.add_peer("not-an-endpoint").await.is_err());
    assert!(node.add_peer("127.0.0.1").await.is_err());
    assert!(node.add_peer("127.0.0.1:0").await.is_err());
    assert!(node.add_peer("127.0.0.1:9009").await.is_ok());

    // Probing alone inserts nothing; entries appear only on a reply.
    sleep(Duration::from_millis(200)).await;
    assert!(node.peers().await.is_empty());
}
