//! TSval table: first-observation store for TCP timestamp values.
//!
//! One entry per (flow key, TSval). The same TSval rides many packets when
//! the sender's timestamp clock is coarse, so only the first arrival is
//! kept; using it bounds the RTT overestimate and never underestimates.
//!
//! A matched entry is not removed. TSvals can repeat on time scales longer
//! than the RTT, and a deleted entry recreated by a later packet could match
//! an echo from the earlier incarnation, producing a large underestimate.
//! Matching instead flips the entry to `Consumed`, which blocks both
//! re-matching and re-insertion until the reaper ages it out.

use std::collections::HashMap;

/// A TSval observation, keyed by (flow key, tsval).
#[derive(Debug, Clone, PartialEq)]
pub enum TsEntry {
    /// Seen but not yet echoed back.
    Unmatched {
        /// Capture time of the first packet carrying this TSval.
        t: f64,
        /// Forward flow's `bytes_sent` at insertion, this packet included.
        f_bytes: u64,
        /// Forward flow's `bytes_departed` at insertion.
        d_bytes: u64,
    },
    /// Already matched once; retained only to block reuse.
    Consumed {
        /// Original observation time, kept for the age-out predicate.
        t: f64,
    },
}

impl TsEntry {
    /// Observation time regardless of match state.
    fn seen_at(&self) -> f64 {
        match self {
            TsEntry::Unmatched { t, .. } | TsEntry::Consumed { t } => *t,
        }
    }
}

/// The values captured from an entry when it is consumed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TsMatch {
    pub t: f64,
    pub f_bytes: u64,
    pub d_bytes: u64,
}

#[derive(Debug, Default)]
pub struct TsvalTable {
    entries: HashMap<(String, u32), TsEntry>,
}

impl TsvalTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records a TSval observation, keeping the earliest if already present.
    pub fn insert_if_absent(&mut self, flow_key: &str, tsval: u32, t: f64, f_bytes: u64, d_bytes: u64) {
        self.entries
            .entry((flow_key.to_string(), tsval))
            .or_insert(TsEntry::Unmatched { t, f_bytes, d_bytes });
    }

    /// Looks up `tsecr` under the reverse flow and consumes the entry.
    ///
    /// Returns the recorded values iff the entry exists and is unmatched.
    /// The entry stays in the table as `Consumed` so a second echo of the
    /// same value can never produce another sample.
    pub fn consume_reverse(&mut self, rev_flow_key: &str, tsecr: u32) -> Option<TsMatch> {
        let entry = self.entries.get_mut(&(rev_flow_key.to_string(), tsecr))?;
        match *entry {
            TsEntry::Unmatched { t, f_bytes, d_bytes } => {
                *entry = TsEntry::Consumed { t };
                Some(TsMatch { t, f_bytes, d_bytes })
            }
            TsEntry::Consumed { .. } => None,
        }
    }

    /// Drops every entry observed more than `max_age` seconds before `now`.
    pub fn reap(&mut self, now: f64, max_age: f64) {
        self.entries.retain(|_, e| now - e.seen_at() <= max_age);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_keeps_earliest() {
        let mut tbl = TsvalTable::new();
        tbl.insert_if_absent("a:1+b:2", 500, 1.0, 100, 0);
        tbl.insert_if_absent("a:1+b:2", 500, 1.1, 200, 0);

        let m = tbl.consume_reverse("a:1+b:2", 500).unwrap();
        assert_eq!(m.t, 1.0);
        assert_eq!(m.f_bytes, 100);
    }

    #[test]
    fn test_consume_is_one_shot() {
        let mut tbl = TsvalTable::new();
        tbl.insert_if_absent("a:1+b:2", 500, 1.0, 100, 50);

        assert!(tbl.consume_reverse("a:1+b:2", 500).is_some());
        assert!(tbl.consume_reverse("a:1+b:2", 500).is_none());
        // The consumed entry still occupies its slot.
        assert_eq!(tbl.len(), 1);
    }

    #[test]
    fn test_consumed_blocks_reinsertion() {
        let mut tbl = TsvalTable::new();
        tbl.insert_if_absent("a:1+b:2", 500, 1.0, 100, 0);
        tbl.consume_reverse("a:1+b:2", 500).unwrap();

        // A wrapped/reused TSval must not resurrect the slot.
        tbl.insert_if_absent("a:1+b:2", 500, 9.0, 900, 0);
        assert!(tbl.consume_reverse("a:1+b:2", 500).is_none());
    }

    #[test]
    fn test_missing_key() {
        let mut tbl = TsvalTable::new();
        tbl.insert_if_absent("a:1+b:2", 500, 1.0, 100, 0);
        assert!(tbl.consume_reverse("a:1+b:2", 501).is_none());
        assert!(tbl.consume_reverse("b:2+a:1", 500).is_none());
    }

    #[test]
    fn test_reap_by_age() {
        let mut tbl = TsvalTable::new();
        tbl.insert_if_absent("a:1+b:2", 1, 0.0, 10, 0);
        tbl.insert_if_absent("a:1+b:2", 2, 5.0, 20, 0);
        tbl.insert_if_absent("a:1+b:2", 3, 9.5, 30, 0);

        tbl.reap(10.1, 10.0);
        assert_eq!(tbl.len(), 2); // the t=0.0 entry aged out

        tbl.reap(20.0, 10.0);
        assert!(tbl.is_empty());
    }

    #[test]
    fn test_reap_uses_original_time_for_consumed() {
        let mut tbl = TsvalTable::new();
        tbl.insert_if_absent("a:1+b:2", 1, 0.0, 10, 0);
        tbl.consume_reverse("a:1+b:2", 1).unwrap();

        tbl.reap(9.0, 10.0);
        assert_eq!(tbl.len(), 1);

        tbl.reap(10.5, 10.0);
        assert!(tbl.is_empty());
    }
}
