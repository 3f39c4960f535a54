//! Integration tests for anti-entropy reconciliation.
//!
//! Nodes exchange vector-clock summaries on a short interval and push the
//! messages their peer is missing; these tests assert that stores converge
//! across late joins and in both directions at once.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use rumornet::{Node, NodeConfig, NodeEvent};
use tokio::time::{sleep, timeout};

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(31000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

const TEST_TIMEOUT: Duration = Duration::from_secs(15);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

fn fast_config() -> NodeConfig {
    NodeConfig {
        discovery_interval: Duration::from_millis(100),
        anti_entropy_interval: Duration::from_millis(150),
        retransmission_interval: Duration::from_millis(200),
        route_rumor_interval: Duration::from_millis(150),
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

#[tokio::test]
async fn late_joiner_catches_up() {
    let n1 = spawn_node("a1").await;

    // Three messages for a node that does not exist yet; they are stored
    // locally and wait for anti-entropy to spread them.
    for text in ["one", "two", "three"] {
        n1.send_direct("a3", text).await.expect("send failed");
    }
    assert_eq!(n1.summary().await.get("a1"), Some(&3));

    let n2 = spawn_node("a2").await;
    let mut n2_events = n2.events().await.expect("events");
    n2.add_peer(&n1.local_addr().to_string()).await.expect("add_peer");

    timeout(TEST_TIMEOUT, async {
        loop {
            if n2.summary().await.get("a1") == Some(&3) {
                break;
            }
            sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .expect("n2 never caught up with n1's store");

    // Messages addressed to a third node are stored but never delivered
    // locally.
    while let Ok(event) = n2_events.try_recv() {
        assert!(
            !matches!(event, NodeEvent::MessageReceived { .. }),
            "message for a third node must not be delivered locally: {:?}",
            event
        );
    }
}

#[tokio::test]
async fn stores_converge_in_both_directions() {
    let n1 = spawn_node("c1").await;
    let n2 = spawn_node("c2").await;
    let mut n2_events = n2.events().await.expect("events");

    // Both sides accumulate history before the link exists.
    n1.broadcast("first from c1").await.expect("broadcast failed");
    n1.broadcast("second from c1").await.expect("broadcast failed");
    n2.broadcast("only from c2").await.expect("broadcast failed");

    n1.add_peer(&n2.local_addr().to_string()).await.expect("add_peer");

    // Push-missing runs independently on both sides; one exchange per
    // direction is enough to reach the union of both stores.
    timeout(TEST_TIMEOUT, async {
        loop {
            let s1 = n1.summary().await;
            let s2 = n2.summary().await;
            if s1.get("c2") == Some(&1) && s2.get("c1") == Some(&2) {
                break;
            }
            sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .expect("stores never converged");

    // Back-filled broadcasts surface as broadcast deliveries on the late
    // side.
    let mut backfilled = Vec::new();
    timeout(TEST_TIMEOUT, async {
        while backfilled.len() < 2 {
            match n2_events.recv().await {
                Some(NodeEvent::MessageReceived {
                    origin,
                    text,
                    broadcast,
                }) => {
                    assert_eq!(origin, "c1");
                    assert!(broadcast);
                    backfilled.push(text);
                }
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("back-filled broadcasts never surfaced");

    backfilled.sort();
    assert_eq!(backfilled, vec!["first from c1", "second from c1"]);
}
