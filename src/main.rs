use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use rumornet::{Node, NodeEvent};

#[derive(Parser, Debug)]
#[command(name = "rumornet")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node identifier announced to the overlay.
    #[arg(short, long)]
    id: String,

    /// UDP listen port.
    #[arg(short, long)]
    port: u16,

    /// Bootstrap peer endpoints (IP:PORT), repeatable.
    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<SocketAddr>,

    /// Rendezvous mode: never forward private traffic.
    #[arg(long)]
    no_forward: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let node = Node::builder(args.id, args.port)
        .no_forward(args.no_forward)
        .spawn()
        .await?;
    info!("Node {} on {}", node.origin(), node.local_addr());

    for peer in &args.bootstrap {
        match node.add_peer(&peer.to_string()).await {
            Ok(()) => info!("Probing bootstrap peer {}", peer),
            Err(e) => warn!(error = %e, "Bootstrap probe failed"),
        }
    }

    let mut events = node.events().await?;

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                node.shutdown().await;
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    NodeEvent::MessageReceived { origin, text, broadcast } => {
                        if broadcast {
                            info!("[broadcast] {}: {}", origin, text);
                        } else {
                            info!("[direct] {}: {}", origin, text);
                        }
                    }
                    NodeEvent::PeerAdded { origin, addr } => {
                        info!("Peer {} joined from {}", origin, addr);
                    }
                    NodeEvent::PeerExpired { origin } => {
                        info!("Peer {} timed out", origin);
                    }
                    NodeEvent::RouteUpdated { dest, next_hop, seqno, hops } => {
                        info!("Route to {} via {} (seq {}, {} hops)", dest, next_hop, seqno, hops);
                    }
                    NodeEvent::NatObserved { origin, reported, observed } => {
                        info!("Peer {} reports {} but arrives from {}", origin, reported, observed);
                    }
                    NodeEvent::RetransmissionFired { origin, seqno } => {
                        info!("Retransmitting {}:{}", origin, seqno);
                    }
                }
            }
        }
    }

    Ok(())
}
