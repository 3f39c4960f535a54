//! # Message Store
//!
//! Per-origin append-only storage of user messages, plus the pending-ack set
//! driving retransmission.
//!
//! Messages are keyed by `(origin, sequence)`. Insertion is idempotent:
//! duplicates are dropped, so receive order of first copies fixes the local
//! delivery order per origin. Records are immutable after insertion except
//! for the acknowledger set. The store never garbage-collects; growth is
//! bounded only by the chat-rate of the application.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::time::Instant;

/// One stored user message.
#[derive(Clone, Debug)]
pub(crate) struct MessageRecord {
    pub origin: String,
    pub sequence: u64,
    /// Node id, or the `"-1"` broadcast sentinel.
    pub destination: String,
    pub text: String,
    /// Wall-clock creation time (ms since the Unix epoch), carried on the
    /// wire and reused verbatim on retransmission.
    pub timestamp_ms: u64,
    /// Local insertion instant; retransmission ages against this.
    pub stored_at: Instant,
    /// Origins that have acknowledged this message.
    pub acknowledged_by: HashSet<String>,
}

impl MessageRecord {
    pub fn new(
        origin: impl Into<String>,
        sequence: u64,
        destination: impl Into<String>,
        text: impl Into<String>,
        timestamp_ms: u64,
        stored_at: Instant,
    ) -> Self {
        Self {
            origin: origin.into(),
            sequence,
            destination: destination.into(),
            text: text.into(),
            timestamp_ms,
            stored_at,
            acknowledged_by: HashSet::new(),
        }
    }
}

/// Origin-keyed append-only message storage.
#[derive(Default)]
pub(crate) struct MessageStore {
    by_origin: BTreeMap<String, BTreeMap<u64, MessageRecord>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent insert. Returns false when `(origin, sequence)` is already
    /// present; the existing record is left untouched.
    pub fn insert(&mut self, record: MessageRecord) -> bool {
        let per_origin = self.by_origin.entry(record.origin.clone()).or_default();
        if per_origin.contains_key(&record.sequence) {
            return false;
        }
        per_origin.insert(record.sequence, record);
        true
    }

    pub fn has(&self, origin: &str, sequence: u64) -> bool {
        self.by_origin
            .get(origin)
            .is_some_and(|m| m.contains_key(&sequence))
    }

    pub fn get(&self, origin: &str, sequence: u64) -> Option<&MessageRecord> {
        self.by_origin.get(origin).and_then(|m| m.get(&sequence))
    }

    /// Record that `by` acknowledged `(origin, sequence)`.
    pub fn record_ack(&mut self, origin: &str, sequence: u64, by: &str) {
        if let Some(record) = self
            .by_origin
            .get_mut(origin)
            .and_then(|m| m.get_mut(&sequence))
        {
            record.acknowledged_by.insert(by.to_string());
        }
    }

    /// Highest stored sequence for `origin`, or 0 when none.
    pub fn high_water(&self, origin: &str) -> u64 {
        self.by_origin
            .get(origin)
            .and_then(|m| m.last_key_value())
            .map(|(seq, _)| *seq)
            .unwrap_or(0)
    }

    /// Per-origin high-water marks across every origin in the store.
    pub fn summary(&self) -> BTreeMap<String, u64> {
        self.by_origin
            .keys()
            .map(|origin| (origin.clone(), self.high_water(origin)))
            .collect()
    }

    /// Every stored record above the peer's high-water mark, per origin.
    /// Origins absent from `peer_clock` count as high-water 0.
    pub fn records_above<'a>(
        &'a self,
        peer_clock: &'a BTreeMap<String, u64>,
    ) -> impl Iterator<Item = &'a MessageRecord> {
        self.by_origin.iter().flat_map(move |(origin, per_origin)| {
            let peer_high = peer_clock.get(origin).copied().unwrap_or(0);
            per_origin
                .range((Bound::Excluded(peer_high), Bound::Unbounded))
                .map(|(_, record)| record)
        })
    }
}

/// Sequences awaiting acknowledgement, keyed by origin. Only the local
/// origin is keyed in practice; the map shape is kept general.
#[derive(Default)]
pub(crate) struct PendingAcks {
    pending: HashMap<String, BTreeSet<u64>>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, origin: &str, sequence: u64) {
        self.pending
            .entry(origin.to_string())
            .or_default()
            .insert(sequence);
    }

    /// Drop `(origin, sequence)` from the pending set. Returns true when the
    /// entry was actually outstanding.
    pub fn resolve(&mut self, origin: &str, sequence: u64) -> bool {
        self.pending
            .get_mut(origin)
            .is_some_and(|s| s.remove(&sequence))
    }

    /// Snapshot of all outstanding (origin, sequence) pairs.
    pub fn outstanding(&self) -> Vec<(String, u64)> {
        self.pending
            .iter()
            .flat_map(|(origin, seqs)| seqs.iter().map(move |seq| (origin.clone(), *seq)))
            .collect()
    }

    pub fn sequences_for(&self, origin: &str) -> Vec<u64> {
        self.pending
            .get(origin)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }
}
