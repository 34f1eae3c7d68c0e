//! The matching engine.
//!
//! Consumes classified packets and turns TSval/TSecr echoes into RTT
//! samples. The engine is the sole owner of the flow registry and the TSval
//! table; reaping and summary reporting are serialized onto the packet loop
//! by capture-time checks, so no packet can race an eviction of the entry it
//! is matching.
//!
//! All aging uses capture time, not wall time: replaying a file ages state
//! by the file's internal clock.

use chrono::{Local, TimeZone};
use tracing::info;

use crate::classify::{Classified, NormalizedPacket, RejectReason};
use crate::flow::FlowRegistry;
use crate::localnet::IgnoreRanges;
use crate::output::{RttSample, RttSink};
use crate::tstable::TsvalTable;

/// Flows tracked at most; creation is refused beyond this.
pub const DEFAULT_MAX_FLOWS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// TTL for unmatched (and consumed) TSval entries, seconds.
    pub tsval_max_age: f64,
    /// Idle time after which a flow is forgotten, seconds.
    pub flow_max_idle: f64,
    /// Summary report interval, seconds; 0 disables summaries.
    pub sum_interval: f64,
    pub max_flows: usize,
    /// Stop after this many captured packets; 0 = unlimited.
    pub max_packets: u64,
    /// Stop after this many seconds of capture time; 0 = unlimited.
    pub time_to_run: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tsval_max_age: 10.0,
            flow_max_idle: 300.0,
            sum_interval: 10.0,
            max_flows: DEFAULT_MAX_FLOWS,
            max_packets: 0,
            time_to_run: 0.0,
        }
    }
}

/// Whether the capture loop should keep going after a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Stop,
}

/// Per-interval packet-class tallies, reset at each summary report.
#[derive(Debug, Default, Clone)]
pub struct Counters {
    pub packets: u64,
    pub not_tcp: u64,
    pub no_ts: u64,
    pub not_v4or6: u64,
    pub uni_dir: u64,
}

pub struct MatchEngine<S: RttSink> {
    cfg: EngineConfig,
    flows: FlowRegistry,
    ts_table: TsvalTable,
    ignore: IgnoreRanges,
    sink: S,
    counters: Counters,
    /// Total packets seen, independent of the summary reset.
    total_packets: u64,
    /// Integer seconds of the first qualifying packet. Capture times are
    /// stored relative to this so a double's mantissa keeps microseconds.
    off_tm: Option<i64>,
    /// Fractional-second part of the first qualifying packet's time.
    start_tm: f64,
    /// Capture time of the latest qualifying packet, relative to `off_tm`.
    cap_tm: f64,
    next_reap: f64,
    next_sum: f64,
}

impl<S: RttSink> MatchEngine<S> {
    pub fn new(cfg: EngineConfig, ignore: IgnoreRanges, sink: S) -> Self {
        let max_flows = cfg.max_flows;
        Self {
            cfg,
            flows: FlowRegistry::new(max_flows),
            ts_table: TsvalTable::new(),
            ignore,
            sink,
            counters: Counters::default(),
            total_packets: 0,
            off_tm: None,
            start_tm: 0.0,
            cap_tm: 0.0,
            next_reap: 0.0,
            next_sum: 0.0,
        }
    }

    /// Handles one captured packet and reports whether to keep capturing.
    pub fn process(&mut self, packet: Classified) -> Step {
        self.counters.packets += 1;
        self.total_packets += 1;

        match packet {
            Classified::Reject(RejectReason::NotTcp) => self.counters.not_tcp += 1,
            Classified::Reject(RejectReason::NoTimestamp) => self.counters.no_ts += 1,
            Classified::Reject(RejectReason::NotV4OrV6) => self.counters.not_v4or6 += 1,
            Classified::Silent => {}
            Classified::Sample(pkt) => self.process_sample(&pkt),
        }

        self.after_packet()
    }

    fn process_sample(&mut self, pkt: &NormalizedPacket) {
        self.anchor_time(pkt);

        let fwd_key = pkt.fwd_key();
        let rev_key = pkt.rev_key();

        // Capacity-refused packets leave no trace at all.
        let Some(flow) = self.flows.get_or_create(&fwd_key, &rev_key) else {
            return;
        };
        flow.last_seen = self.cap_tm;

        // TSvals are only worth recording once both directions are visible;
        // without the reverse flow there is nothing to match against.
        if !flow.bidirectional {
            self.counters.uni_dir += 1;
            return;
        }

        flow.bytes_sent += pkt.wire_len as u64;
        let arr_fwd = flow.bytes_sent;
        let bytes_departed = flow.bytes_departed;

        if !self.ignore.contains(pkt.dst_ip) {
            self.ts_table
                .insert_if_absent(&fwd_key, pkt.tsval, self.cap_tm, arr_fwd, bytes_departed);
        }

        // This packet's TSecr may be the echo of a TSval recorded from the
        // reverse direction; if so, this packet closes the round trip.
        let Some(hit) = self.ts_table.consume_reverse(&rev_key, pkt.tsecr) else {
            return;
        };
        let rtt = self.cap_tm - hit.t;

        let Some(flow) = self.flows.lookup_mut(&fwd_key) else {
            return;
        };
        if rtt < flow.min_rtt {
            flow.min_rtt = rtt;
        }
        let min_rtt = flow.min_rtt;
        let p_bytes = arr_fwd - flow.last_bytes_sent;
        flow.last_bytes_sent = arr_fwd;

        // Bridge the byte accounting: the reverse flow's departed counter
        // advances to where its bytes stood when this TSval was recorded.
        if let Some(rev) = self.flows.lookup_mut(&rev_key) {
            rev.bytes_departed = hit.f_bytes;
        }

        self.sink.emit(&RttSample {
            ts_sec: pkt.ts_sec,
            ts_usec: pkt.ts_usec,
            rtt,
            min_rtt,
            f_bytes: hit.f_bytes,
            d_bytes: hit.d_bytes,
            p_bytes,
            fwd_key,
            src_ip: pkt.src_ip,
            dst_ip: pkt.dst_ip,
            dst_port: pkt.dst_port,
        });
    }

    /// Establishes or advances the capture-time base.
    fn anchor_time(&mut self, pkt: &NormalizedPacket) {
        match self.off_tm {
            None => {
                self.off_tm = Some(pkt.ts_sec);
                self.start_tm = pkt.ts_usec as f64 * 1e-6;
                self.cap_tm = self.start_tm;
                self.next_reap = self.cap_tm + self.cfg.tsval_max_age;
                if self.cfg.sum_interval > 0.0 {
                    let stamp = Local
                        .timestamp_opt(pkt.ts_sec, 0)
                        .single()
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| pkt.ts_sec.to_string());
                    info!("First packet at {}", stamp);
                }
            }
            Some(off) => {
                self.cap_tm = (pkt.ts_sec - off) as f64 + pkt.ts_usec as f64 * 1e-6;
            }
        }
    }

    /// Stop conditions, summary schedule, and the inline reaper.
    fn after_packet(&mut self) -> Step {
        let timed_out = self.cfg.time_to_run > 0.0
            && self.off_tm.is_some()
            && self.cap_tm - self.start_tm >= self.cfg.time_to_run;
        let counted_out = self.cfg.max_packets > 0 && self.total_packets >= self.cfg.max_packets;
        if timed_out || counted_out {
            self.log_summary();
            info!(
                "Captured {} packets in {:.6} seconds",
                self.total_packets,
                self.cap_tm - self.start_tm
            );
            return Step::Stop;
        }

        if self.cfg.sum_interval > 0.0 && self.off_tm.is_some() && self.cap_tm >= self.next_sum {
            if self.next_sum > 0.0 {
                self.log_summary();
                self.counters = Counters::default();
            }
            self.next_sum = self.cap_tm + self.cfg.sum_interval;
        }

        if self.off_tm.is_some() && self.cap_tm >= self.next_reap {
            self.reap(self.cap_tm);
            self.next_reap = self.cap_tm + self.cfg.tsval_max_age;
        }

        Step::Continue
    }

    /// Evicts TSval entries past `tsvalMaxAge` and flows idle past
    /// `flowMaxIdle`, retiring the exported series of dropped flows.
    fn reap(&mut self, now: f64) {
        self.ts_table.reap(now, self.cfg.tsval_max_age);
        for key in self.flows.idle_keys(now, self.cfg.flow_max_idle) {
            self.sink.flow_closed(&key);
            self.flows.remove(&key);
        }
    }

    /// Final pass at shutdown: ages everything out and drops all series.
    pub fn finish(&mut self) {
        let horizon = self.cap_tm + self.cfg.tsval_max_age.max(self.cfg.flow_max_idle) + 1.0;
        self.reap(horizon);
    }

    fn log_summary(&self) {
        let c = &self.counters;
        let mut line = format!("{} flows, {} packets, ", self.flows.len(), c.packets);
        for (v, label) in [
            (c.no_ts, "no TS opt"),
            (c.uni_dir, "uni-directional"),
            (c.not_tcp, "not TCP"),
            (c.not_v4or6, "not v4 or v6"),
        ] {
            if v > 0 {
                line.push_str(&format!("{} {}, ", v, label));
            }
        }
        info!("{}", line);
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn ts_entry_count(&self) -> usize {
        self.ts_table.len()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    #[cfg(test)]
    fn flow(&self, key: &str) -> Option<&crate::flow::FlowRecord> {
        self.flows.lookup(key)
    }
}
