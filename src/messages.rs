//! # Wire Protocol Packets
//!
//! This module defines every datagram payload exchanged between nodes and the
//! frame codec that wraps them. A frame is:
//!
//! ```text
//! u32 length (big-endian) || u32 magic = 0xCAFEBABE || JSON map
//! ```
//!
//! where `length` counts the bytes from the magic to the end of the payload.
//! The payload is a self-describing string-keyed map whose `Type` field
//! selects the packet kind:
//!
//! | `Type`               | Required fields                                                      |
//! |----------------------|----------------------------------------------------------------------|
//! | `discovery`          | Origin, Port, LastIP, LastPort                                       |
//! | `discovery_response` | Origin, Port, LastIP, LastPort                                       |
//! | `message`            | Origin, Destination, ChatText, Sequence, Timestamp, LastIP, LastPort |
//! | `ack`                | Origin, AckOrigin, AckSequence                                       |
//! | `vector_clock`       | Origin, VectorClock                                                  |
//! | `sync_message`       | Origin, SyncOrigin, SyncSequence, SyncDestination, SyncText          |
//! | `route_rumor`        | Origin, SeqNo, LastIP, LastPort                                      |
//! | `private`            | Origin, Dest, ChatText, HopLimit, Sequence, LastIP, LastPort         |
//!
//! Frames with an unknown `Type`, a missing field, a bad magic, a length that
//! disagrees with the datagram, or trailing bytes fail to decode; callers drop
//! such datagrams silently. The codec is stateless: re-encoding a decoded
//! frame reproduces it byte for byte.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Frame magic constant, serialized big-endian after the length prefix.
pub const MAGIC: u32 = 0xCAFE_BABE;

/// Destination sentinel marking a `message` as a broadcast.
pub const BROADCAST_DEST: &str = "-1";

/// Maximum accepted frame size (length prefix included).
/// Bounds both decode buffers and encoded output to one UDP datagram.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Bytes occupied by the length prefix and the magic.
const HEADER_SIZE: usize = 8;

/// One wire datagram payload. The serialized form is a string-keyed map with
/// the variant selected by the `Type` field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type", rename_all = "snake_case")]
pub enum Packet {
    /// Probe sent to bootstrap ports and manually added endpoints.
    Discovery {
        #[serde(rename = "Origin")]
        origin: String,
        #[serde(rename = "Port")]
        port: u16,
        #[serde(rename = "LastIP")]
        last_ip: String,
        #[serde(rename = "LastPort")]
        last_port: u16,
    },
    /// Reply to a probe; advertises the responder.
    DiscoveryResponse {
        #[serde(rename = "Origin")]
        origin: String,
        #[serde(rename = "Port")]
        port: u16,
        #[serde(rename = "LastIP")]
        last_ip: String,
        #[serde(rename = "LastPort")]
        last_port: u16,
    },
    /// User chat message. `Destination` is a node id or the `"-1"` broadcast
    /// sentinel.
    Message {
        #[serde(rename = "Origin")]
        origin: String,
        #[serde(rename = "Destination")]
        destination: String,
        #[serde(rename = "ChatText")]
        chat_text: String,
        #[serde(rename = "Sequence")]
        sequence: u64,
        #[serde(rename = "Timestamp")]
        timestamp: u64,
        #[serde(rename = "LastIP")]
        last_ip: String,
        #[serde(rename = "LastPort")]
        last_port: u16,
    },
    /// Hop-level acknowledgement of a `message`.
    Ack {
        #[serde(rename = "Origin")]
        origin: String,
        #[serde(rename = "AckOrigin")]
        ack_origin: String,
        #[serde(rename = "AckSequence")]
        ack_sequence: u64,
    },
    /// Anti-entropy summary: per-origin high-water marks.
    VectorClock {
        #[serde(rename = "Origin")]
        origin: String,
        #[serde(rename = "VectorClock")]
        vector_clock: BTreeMap<String, u64>,
    },
    /// Back-fill of one stored message during anti-entropy.
    SyncMessage {
        #[serde(rename = "Origin")]
        origin: String,
        #[serde(rename = "SyncOrigin")]
        sync_origin: String,
        #[serde(rename = "SyncSequence")]
        sync_sequence: u64,
        #[serde(rename = "SyncDestination")]
        sync_destination: String,
        #[serde(rename = "SyncText")]
        sync_text: String,
    },
    /// Self-announcement carrying the origin's monotonic route sequence.
    RouteRumor {
        #[serde(rename = "Origin")]
        origin: String,
        #[serde(rename = "SeqNo")]
        seq_no: u64,
        #[serde(rename = "LastIP")]
        last_ip: String,
        #[serde(rename = "LastPort")]
        last_port: u16,
    },
    /// Routed, hop-limited unicast.
    Private {
        #[serde(rename = "Origin")]
        origin: String,
        #[serde(rename = "Dest")]
        dest: String,
        #[serde(rename = "ChatText")]
        chat_text: String,
        #[serde(rename = "HopLimit")]
        hop_limit: u32,
        #[serde(rename = "Sequence")]
        sequence: u64,
        #[serde(rename = "LastIP")]
        last_ip: String,
        #[serde(rename = "LastPort")]
        last_port: u16,
    },
}

impl Packet {
    /// The node id that produced this datagram (for forwarded rumors and
    /// privates this is the originator, not the envelope sender).
    pub fn origin(&self) -> &str {
        match self {
            Packet::Discovery { origin, .. } => origin,
            Packet::DiscoveryResponse { origin, .. } => origin,
            Packet::Message { origin, .. } => origin,
            Packet::Ack { origin, .. } => origin,
            Packet::VectorClock { origin, .. } => origin,
            Packet::SyncMessage { origin, .. } => origin,
            Packet::RouteRumor { origin, .. } => origin,
            Packet::Private { origin, .. } => origin,
        }
    }

    /// Short kind tag for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Discovery { .. } => "discovery",
            Packet::DiscoveryResponse { .. } => "discovery_response",
            Packet::Message { .. } => "message",
            Packet::Ack { .. } => "ack",
            Packet::VectorClock { .. } => "vector_clock",
            Packet::SyncMessage { .. } => "sync_message",
            Packet::RouteRumor { .. } => "route_rumor",
            Packet::Private { .. } => "private",
        }
    }

    /// The endpoint the sender reports for itself via `LastIP`/`LastPort`,
    /// when the packet kind carries one and the address parses.
    pub fn reported_endpoint(&self) -> Option<SocketAddr> {
        let (ip, port) = match self {
            Packet::Discovery { last_ip, last_port, .. }
            | Packet::DiscoveryResponse { last_ip, last_port, .. }
            | Packet::Message { last_ip, last_port, .. }
            | Packet::RouteRumor { last_ip, last_port, .. }
            | Packet::Private { last_ip, last_port, .. } => (last_ip, *last_port),
            Packet::Ack { .. } | Packet::VectorClock { .. } | Packet::SyncMessage { .. } => {
                return None;
            }
        };
        ip.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, port))
    }
}

/// Frame codec failure. Datagrams that fail to decode are dropped by the
/// dispatch layer without a reply.
#[derive(Debug)]
pub enum CodecError {
    /// Fewer bytes than the length prefix plus magic.
    Truncated,
    /// Frame larger than [`MAX_FRAME_SIZE`].
    Oversize(usize),
    /// Length prefix disagrees with the datagram size (trailing or missing
    /// bytes).
    LengthMismatch { declared: usize, actual: usize },
    /// Magic constant mismatch.
    BadMagic(u32),
    /// Payload is not a valid packet map.
    Payload(serde_json::Error),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Truncated => write!(f, "frame shorter than header"),
            CodecError::Oversize(len) => {
                write!(f, "frame of {} bytes exceeds limit of {}", len, MAX_FRAME_SIZE)
            }
            CodecError::LengthMismatch { declared, actual } => {
                write!(f, "length prefix {} does not match {} payload bytes", declared, actual)
            }
            CodecError::BadMagic(magic) => write!(f, "bad magic {:#010x}", magic),
            CodecError::Payload(e) => write!(f, "payload decode failed: {}", e),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Payload(e) => Some(e),
            _ => None,
        }
    }
}

/// Encode a packet into a single datagram frame.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, CodecError> {
    let payload = serde_json::to_vec(packet).map_err(CodecError::Payload)?;
    let frame_len = HEADER_SIZE + payload.len();
    if frame_len > MAX_FRAME_SIZE {
        return Err(CodecError::Oversize(frame_len));
    }
    let mut out = Vec::with_capacity(frame_len);
    out.extend_from_slice(&((payload.len() + 4) as u32).to_be_bytes());
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode one datagram frame. The whole input must be consumed: a length
/// prefix that leaves trailing bytes is rejected.
pub fn decode_packet(bytes: &[u8]) -> Result<Packet, CodecError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(CodecError::Oversize(bytes.len()));
    }
    if bytes.len() < HEADER_SIZE {
        return Err(CodecError::Truncated);
    }
    let declared = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let actual = bytes.len() - 4;
    if declared != actual {
        return Err(CodecError::LengthMismatch { declared, actual });
    }
    let magic = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if magic != MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    serde_json::from_slice(&bytes[HEADER_SIZE..]).map_err(CodecError::Payload)
}
