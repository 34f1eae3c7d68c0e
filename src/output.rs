//! RTT sample output.
//!
//! Every match produces one stdout line, in one of two formats chosen at
//! startup, and one observation into the per-flow latency summary. Stdout is
//! buffered and flushed by a dedicated task so a slow consumer never stalls
//! the packet loop.

use std::io::{BufWriter, Stdout, Write};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{Local, TimeZone};
use tokio::time::sleep;
use tracing::debug;

use crate::metrics::{FlowLabels, SharedSummary};

/// One RTT measurement, emitted when a TSecr matches a recorded TSval.
#[derive(Debug, Clone)]
pub struct RttSample {
    /// Capture time of the matching packet, seconds since the epoch.
    pub ts_sec: i64,
    /// Microseconds within the second.
    pub ts_usec: i64,
    /// Round trip between the capture point and the echoing host, seconds.
    pub rtt: f64,
    /// Smallest RTT seen for this flow so far, seconds.
    pub min_rtt: f64,
    /// Flow bytes through the capture point when the TSval was recorded.
    pub f_bytes: u64,
    /// Reverse-direction departed bytes when the TSval was recorded.
    pub d_bytes: u64,
    /// Flow bytes since this flow's previous RTT sample.
    pub p_bytes: u64,
    /// Flow key of the emitting direction, `srcIP:sport+dstIP:dport`.
    pub fwd_key: String,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

/// Where the matching engine delivers samples and flow-retirement events.
pub trait RttSink {
    fn emit(&mut self, sample: &RttSample);

    /// Called by the reaper when a flow ages out, so per-flow exported
    /// series can be dropped.
    fn flow_closed(&mut self, flow_key: &str);
}

/// Shared handle to the buffered stdout writer.
pub type SharedWriter = Arc<Mutex<BufWriter<Stdout>>>;

pub fn new_shared_writer() -> SharedWriter {
    Arc::new(Mutex::new(BufWriter::new(std::io::stdout())))
}

/// Production sink: stdout lines plus latency-summary observations.
pub struct StdoutSink {
    writer: SharedWriter,
    summary: SharedSummary,
    machine: bool,
}

impl StdoutSink {
    pub fn new(writer: SharedWriter, summary: SharedSummary, machine: bool) -> Self {
        Self {
            writer,
            summary,
            machine,
        }
    }
}

impl RttSink for StdoutSink {
    fn emit(&mut self, sample: &RttSample) {
        let line = if self.machine {
            machine_line(sample)
        } else {
            human_line(sample)
        };
        if let Ok(mut w) = self.writer.lock() {
            if let Err(e) = w.write_all(line.as_bytes()) {
                debug!("Failed to write sample: {}", e);
            }
        }

        let labels = FlowLabels::new(sample.src_ip, sample.dst_ip, sample.dst_port);
        if let Ok(mut summary) = self.summary.lock() {
            summary.observe(labels, sample.rtt * 1000.0, Instant::now());
        }
    }

    fn flow_closed(&mut self, flow_key: &str) {
        if let Some(labels) = FlowLabels::from_flow_key(flow_key) {
            if let Ok(mut summary) = self.summary.lock() {
                summary.remove(&labels);
            }
        }
    }
}

/// Renders a duration with an SI prefix: `u` below 1 ms, `m` below 1 s,
/// none for seconds. 2/1/0 fraction digits for <10/<100/>=100 of the
/// scaled unit.
pub fn fmt_time_diff(dt: f64) -> String {
    let (scaled, prefix) = if dt < 1e-3 {
        (dt * 1e6, "u")
    } else if dt < 1.0 {
        (dt * 1e3, "m")
    } else {
        (dt, "")
    };
    if scaled < 10.0 {
        format!("{:.2}{}s", scaled, prefix)
    } else if scaled < 100.0 {
        format!("{:.1}{}s", scaled, prefix)
    } else {
        format!(" {:.0}{}s", scaled, prefix)
    }
}

/// `HH:MM:SS <rtt> <min_rtt> <flow>` in local time.
fn human_line(s: &RttSample) -> String {
    let clock = Local
        .timestamp_opt(s.ts_sec, 0)
        .single()
        .map(|t| t.format("%T").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    format!(
        "{} {} {} {}\n",
        clock,
        fmt_time_diff(s.rtt),
        fmt_time_diff(s.min_rtt),
        s.fwd_key
    )
}

/// `<epoch>.<usec> <rtt> <min_rtt> <f_bytes> <d_bytes> <p_bytes> <flow>`
/// with microsecond time resolution and six fractional digits on seconds.
fn machine_line(s: &RttSample) -> String {
    format!(
        "{}.{:06} {:.6} {:.6} {} {} {} {}\n",
        s.ts_sec, s.ts_usec, s.rtt, s.min_rtt, s.f_bytes, s.d_bytes, s.p_bytes, s.fwd_key
    )
}

/// Periodically forces the shared stdout writer until shutdown.
pub async fn flush_loop(writer: SharedWriter, interval: Duration, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Relaxed) {
        if let Ok(mut w) = writer.lock() {
            let _ = w.flush();
        }
        sleep(interval).await;
    }
    if let Ok(mut w) = writer.lock() {
        let _ = w.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RttSample {
        RttSample {
            ts_sec: 1_700_000_000,
            ts_usec: 42_500,
            rtt: 0.025,
            min_rtt: 0.0213,
            f_bytes: 5000,
            d_bytes: 1200,
            p_bytes: 300,
            fwd_key: "10.0.0.1:45000+10.0.0.2:443".to_string(),
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "10.0.0.2".parse().unwrap(),
            dst_port: 443,
        }
    }

    #[test]
    fn test_fmt_time_diff_microseconds() {
        assert_eq!(fmt_time_diff(0.0000042), "4.20us");
        assert_eq!(fmt_time_diff(0.000050), "50.0us");
        assert_eq!(fmt_time_diff(0.000500), " 500us");
    }

    #[test]
    fn test_fmt_time_diff_milliseconds() {
        assert_eq!(fmt_time_diff(0.0025), "2.50ms");
        assert_eq!(fmt_time_diff(0.050), "50.0ms");
        assert_eq!(fmt_time_diff(0.150), " 150ms");
    }

    #[test]
    fn test_fmt_time_diff_seconds() {
        assert_eq!(fmt_time_diff(2.5), "2.50s");
        assert_eq!(fmt_time_diff(45.0), "45.0s");
        assert_eq!(fmt_time_diff(250.0), " 250s");
    }

    #[test]
    fn test_machine_line() {
        let line = machine_line(&sample());
        assert_eq!(
            line,
            "1700000000.042500 0.025000 0.021300 5000 1200 300 10.0.0.1:45000+10.0.0.2:443\n"
        );
    }

    #[test]
    fn test_human_line_shape() {
        let line = human_line(&sample());
        assert!(line.ends_with(" 25.0ms 21.3ms 10.0.0.1:45000+10.0.0.2:443\n"));
        // HH:MM:SS prefix
        let clock = line.split(' ').next().unwrap();
        assert_eq!(clock.len(), 8);
        assert_eq!(clock.as_bytes()[2], b':');
        assert_eq!(clock.as_bytes()[5], b':');
    }
}
