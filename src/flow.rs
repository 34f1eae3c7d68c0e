//! Flow registry: per-direction flow state.
//!
//! A flow is a unidirectional 4-tuple; its reverse twin is a separate record
//! under the swapped key. Twins are linked by lookup rather than by pointer
//! so the reaper can drop either side without dangling anything.

use std::collections::HashMap;

/// Per-direction flow state.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    /// Capture time of the most recent packet in this direction.
    pub last_seen: f64,
    /// Smallest RTT sample emitted for this direction so far.
    pub min_rtt: f64,
    /// Cumulative wire bytes observed in this direction.
    pub bytes_sent: u64,
    /// `bytes_sent` at the previous RTT emission for this direction.
    pub last_bytes_sent: u64,
    /// Reverse direction's `bytes_sent` captured when a TSval was stored;
    /// refreshed when that TSval is matched. Bytes that left the capture
    /// point toward the far side since the reverse flow's last RTT.
    pub bytes_departed: u64,
    /// True once the reverse 4-tuple has also been observed.
    pub bidirectional: bool,
}

impl FlowRecord {
    fn new() -> Self {
        Self {
            last_seen: 0.0,
            min_rtt: f64::INFINITY,
            bytes_sent: 0,
            last_bytes_sent: 0,
            bytes_departed: 0,
            bidirectional: false,
        }
    }
}

/// All known flows, bounded by `max_flows`.
#[derive(Debug)]
pub struct FlowRegistry {
    flows: HashMap<String, FlowRecord>,
    max_flows: usize,
}

impl FlowRegistry {
    pub fn new(max_flows: usize) -> Self {
        Self {
            flows: HashMap::new(),
            max_flows,
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Fetches the record for `fwd_key`, creating it if absent.
    ///
    /// On creation the registry is checked for the reverse twin; if present,
    /// both records are marked bidirectional in the same step so the
    /// symmetry invariant cannot be half-applied. Returns `None` when the
    /// registry is full and the flow is unknown; the caller drops the packet.
    pub fn get_or_create(&mut self, fwd_key: &str, rev_key: &str) -> Option<&mut FlowRecord> {
        if !self.flows.contains_key(fwd_key) {
            if self.flows.len() >= self.max_flows {
                return None;
            }
            let mut rec = FlowRecord::new();
            if let Some(twin) = self.flows.get_mut(rev_key) {
                twin.bidirectional = true;
                rec.bidirectional = true;
            }
            self.flows.insert(fwd_key.to_string(), rec);
        }
        self.flows.get_mut(fwd_key)
    }

    pub fn lookup_mut(&mut self, key: &str) -> Option<&mut FlowRecord> {
        self.flows.get_mut(key)
    }

    pub fn lookup(&self, key: &str) -> Option<&FlowRecord> {
        self.flows.get(key)
    }

    /// Removes a flow; reaper only.
    pub fn remove(&mut self, key: &str) {
        self.flows.remove(key);
    }

    /// Keys of flows idle longer than `max_idle` at capture time `now`.
    pub fn idle_keys(&self, now: f64, max_idle: f64) -> Vec<String> {
        self.flows
            .iter()
            .filter(|(_, f)| now - f.last_seen > max_idle)
            .map(|(k, _)| k.clone())
            .collect()
    }
}
