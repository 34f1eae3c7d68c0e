//! Prometheus export of per-flow RTT.
//!
//! One summary family, labeled `{srcIP, dstIP, dstPort}`, observed in
//! milliseconds. Quantiles are computed over a rolling window of
//! `flowMaxIdle` seconds split into 10 buckets, so a scrape reflects recent
//! behavior rather than the whole flow lifetime; `_count` and `_sum` are
//! cumulative as usual. Series are deleted when the reaper retires their
//! flow.
//!
//! The scrape endpoint is a minimal HTTP responder on a `TcpListener`; a
//! full HTTP framework would be dead weight for a single fixed GET path.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Quantiles exposed per series, with their permitted error.
const QUANTILES: [(f64, f64); 3] = [(0.5, 0.05), (0.9, 0.01), (0.99, 0.001)];

/// Label set identifying one exported series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowLabels {
    pub src_ip: String,
    pub dst_ip: String,
    pub dst_port: String,
}

impl FlowLabels {
    pub fn new(src_ip: IpAddr, dst_ip: IpAddr, dst_port: u16) -> Self {
        Self {
            src_ip: src_ip.to_string(),
            dst_ip: dst_ip.to_string(),
            dst_port: dst_port.to_string(),
        }
    }

    /// Recovers the label values from a `srcIP:sport+dstIP:dport` flow key.
    ///
    /// Each half is split at its last `:` so IPv6 addresses survive intact.
    pub fn from_flow_key(flow_key: &str) -> Option<Self> {
        let (src, dst) = flow_key.split_once('+')?;
        let (src_ip, _) = src.rsplit_once(':')?;
        let (dst_ip, dst_port) = dst.rsplit_once(':')?;
        Some(Self {
            src_ip: src_ip.to_string(),
            dst_ip: dst_ip.to_string(),
            dst_port: dst_port.to_string(),
        })
    }
}

/// Time-windowed quantile summary for a single series.
#[derive(Debug)]
struct RollingSummary {
    count: u64,
    sum: f64,
    buckets: VecDeque<Vec<f64>>,
    bucket_span: Duration,
    window: Duration,
    num_buckets: usize,
    /// End of the newest bucket's span.
    cur_end: Instant,
}

impl RollingSummary {
    fn new(window: Duration, num_buckets: usize, now: Instant) -> Self {
        let bucket_span = window / num_buckets as u32;
        let mut buckets = VecDeque::with_capacity(num_buckets);
        buckets.push_back(Vec::new());
        Self {
            count: 0,
            sum: 0.0,
            buckets,
            bucket_span,
            window,
            num_buckets,
            cur_end: now + bucket_span,
        }
    }

    fn rotate(&mut self, now: Instant) {
        if now < self.cur_end {
            return;
        }
        if now.duration_since(self.cur_end) >= self.window {
            // Idle longer than the whole window; skip the empty spans.
            self.buckets.clear();
            self.buckets.push_back(Vec::new());
            self.cur_end = now + self.bucket_span;
            return;
        }
        while now >= self.cur_end {
            self.buckets.push_back(Vec::new());
            if self.buckets.len() > self.num_buckets {
                self.buckets.pop_front();
            }
            self.cur_end += self.bucket_span;
        }
    }

    fn observe(&mut self, value: f64, now: Instant) {
        self.rotate(now);
        if let Some(bucket) = self.buckets.back_mut() {
            bucket.push(value);
        }
        self.count += 1;
        self.sum += value;
    }

    /// All in-window samples, sorted; empty once the window has drained.
    fn windowed(&mut self, now: Instant) -> Vec<f64> {
        self.rotate(now);
        let mut all: Vec<f64> = self.buckets.iter().flatten().copied().collect();
        all.sort_by(|a, b| a.total_cmp(b));
        all
    }
}

/// Nearest-rank quantile of a sorted slice; NaN when empty.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let n = sorted.len();
    let rank = ((q * n as f64).ceil() as usize).clamp(1, n);
    sorted[rank - 1]
}

/// The per-flow RTT summary family.
#[derive(Debug)]
pub struct FlowSummaryVec {
    name: &'static str,
    help: &'static str,
    window: Duration,
    num_buckets: usize,
    series: HashMap<FlowLabels, RollingSummary>,
}

impl FlowSummaryVec {
    pub fn new(window: Duration, num_buckets: usize) -> Self {
        Self {
            name: "rttscope_flow_rtt",
            help: "Per-flow RTT in milliseconds from source IP to destination IP/port",
            window,
            num_buckets,
            series: HashMap::new(),
        }
    }

    pub fn observe(&mut self, labels: FlowLabels, value_ms: f64, now: Instant) {
        let window = self.window;
        let num_buckets = self.num_buckets;
        self.series
            .entry(labels)
            .or_insert_with(|| RollingSummary::new(window, num_buckets, now))
            .observe(value_ms, now);
    }

    /// Drops a retired flow's series. No-op for flows that never emitted.
    pub fn remove(&mut self, labels: &FlowLabels) {
        self.series.remove(labels);
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    /// Renders the family in Prometheus text exposition format.
    pub fn render(&mut self, now: Instant) -> String {
        let mut out = String::new();
        out.push_str(&format!("# HELP {} {}\n", self.name, self.help));
        out.push_str(&format!("# TYPE {} summary\n", self.name));

        let mut keys: Vec<FlowLabels> = self.series.keys().cloned().collect();
        keys.sort();

        for labels in keys {
            let Some(summary) = self.series.get_mut(&labels) else {
                continue;
            };
            let sorted = summary.windowed(now);
            let base = format!(
                "srcIP=\"{}\",dstIP=\"{}\",dstPort=\"{}\"",
                labels.src_ip, labels.dst_ip, labels.dst_port
            );
            for (q, _) in QUANTILES {
                out.push_str(&format!(
                    "{}{{{},quantile=\"{}\"}} {}\n",
                    self.name,
                    base,
                    q,
                    quantile(&sorted, q)
                ));
            }
            out.push_str(&format!("{}_sum{{{}}} {}\n", self.name, base, summary.sum));
            out.push_str(&format!(
                "{}_count{{{}}} {}\n",
                self.name, base, summary.count
            ));
        }
        out
    }
}

/// Shared handle to the summary family.
pub type SharedSummary = Arc<Mutex<FlowSummaryVec>>;

pub fn new_shared_summary(window: Duration, num_buckets: usize) -> SharedSummary {
    Arc::new(Mutex::new(FlowSummaryVec::new(window, num_buckets)))
}

/// Resolves the listen address, accepting the `:port` shorthand.
pub fn resolve_listen_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{}", port)
    } else {
        addr.to_string()
    }
}

/// Serves `GET /metrics` until shutdown.
///
/// Only responds to the metrics path (plus a bare health probe); anything
/// else is a 404. The accept loop wakes at least once a second to observe
/// the shutdown flag.
pub async fn serve(listener: TcpListener, summary: SharedSummary, shutdown: Arc<AtomicBool>) {
    info!(
        "Prometheus scrape endpoint listening on http://{}/metrics",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string())
    );

    while !shutdown.load(Ordering::Relaxed) {
        let accepted =
            tokio::time::timeout(Duration::from_secs(1), listener.accept()).await;
        let (mut socket, addr) = match accepted {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                error!("Accept error: {}", e);
                continue;
            }
            Err(_) => continue, // timeout; re-check shutdown
        };
        debug!("Scrape request from {}", addr);

        let mut buf = [0u8; 1024];
        let n = match tokio::time::timeout(Duration::from_millis(500), socket.read(&mut buf)).await
        {
            Ok(Ok(n)) if n > 0 => n,
            _ => continue,
        };
        let request = String::from_utf8_lossy(&buf[..n]);

        let response = if request.starts_with("GET /metrics") {
            let body = match summary.lock() {
                Ok(mut s) => s.render(Instant::now()),
                Err(_) => String::new(),
            };
            format!(
                "HTTP/1.1 200 OK\r\n\
                 Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
                 Content-Length: {}\r\n\
                 Connection: close\r\n\
                 \r\n\
                 {}",
                body.len(),
                body
            )
        } else if request.starts_with("GET /health") || request.starts_with("GET / ") {
            let body = "OK\n";
            format!(
                "HTTP/1.1 200 OK\r\n\
                 Content-Type: text/plain\r\n\
                 Content-Length: {}\r\n\
                 Connection: close\r\n\
                 \r\n\
                 {}",
                body.len(),
                body
            )
        } else {
            "HTTP/1.1 404 Not Found\r\n\
             Content-Length: 0\r\n\
             Connection: close\r\n\
             \r\n"
                .to_string()
        };

        if let Err(e) = socket.write_all(response.as_bytes()).await {
            debug!("Failed to write scrape response: {}", e);
        }
    }
    info!("Scrape endpoint shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> FlowLabels {
        FlowLabels {
            src_ip: "10.0.0.1".to_string(),
            dst_ip: "10.0.0.2".to_string(),
            dst_port: "443".to_string(),
        }
    }

    #[test]
    fn test_labels_from_flow_key() {
        let l = FlowLabels::from_flow_key("10.0.0.1:45000+10.0.0.2:443").unwrap();
        assert_eq!(l, labels());
    }

    #[test]
    fn test_labels_from_ipv6_flow_key() {
        let l = FlowLabels::from_flow_key("2001:db8::1:52000+2001:db8::2:80").unwrap();
        assert_eq!(l.src_ip, "2001:db8::1");
        assert_eq!(l.dst_ip, "2001:db8::2");
        assert_eq!(l.dst_port, "80");
    }

    #[test]
    fn test_labels_from_bad_key() {
        assert!(FlowLabels::from_flow_key("nonsense").is_none());
        assert!(FlowLabels::from_flow_key("a+b").is_none());
    }

    #[test]
    fn test_quantiles() {
        let sorted: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(quantile(&sorted, 0.5), 50.0);
        assert_eq!(quantile(&sorted, 0.9), 90.0);
        assert_eq!(quantile(&sorted, 0.99), 99.0);
        assert!(quantile(&[], 0.5).is_nan());
        assert_eq!(quantile(&[7.0], 0.99), 7.0);
    }

    #[test]
    fn test_observe_and_render() {
        let mut vec = FlowSummaryVec::new(Duration::from_secs(300), 10);
        let now = Instant::now();
        for v in [10.0, 20.0, 30.0, 40.0] {
            vec.observe(labels(), v, now);
        }

        let out = vec.render(now);
        assert!(out.contains("# TYPE rttscope_flow_rtt summary"));
        assert!(out.contains(
            "rttscope_flow_rtt{srcIP=\"10.0.0.1\",dstIP=\"10.0.0.2\",dstPort=\"443\",quantile=\"0.5\"} 20\n"
        ));
        assert!(out.contains("rttscope_flow_rtt_sum{srcIP=\"10.0.0.1\",dstIP=\"10.0.0.2\",dstPort=\"443\"} 100\n"));
        assert!(out.contains("rttscope_flow_rtt_count{srcIP=\"10.0.0.1\",dstIP=\"10.0.0.2\",dstPort=\"443\"} 4\n"));
    }

    #[test]
    fn test_window_drains_quantiles_not_counters() {
        let mut vec = FlowSummaryVec::new(Duration::from_secs(300), 10);
        let t0 = Instant::now();
        vec.observe(labels(), 25.0, t0);

        // Past the full window the quantiles go NaN, the counters persist.
        let out = vec.render(t0 + Duration::from_secs(301));
        assert!(out.contains("quantile=\"0.5\"} NaN"));
        assert!(out.contains("_count{srcIP=\"10.0.0.1\",dstIP=\"10.0.0.2\",dstPort=\"443\"} 1\n"));
    }

    #[test]
    fn test_bucket_rotation_expires_oldest() {
        let mut vec = FlowSummaryVec::new(Duration::from_secs(100), 10);
        let t0 = Instant::now();
        vec.observe(labels(), 1.0, t0);
        // Nine buckets later the first observation is still inside the window.
        vec.observe(labels(), 2.0, t0 + Duration::from_secs(95));
        let out = vec.render(t0 + Duration::from_secs(95));
        assert!(out.contains("quantile=\"0.5\"} 1\n"));

        // One more rotation pushes the first bucket out.
        let out = vec.render(t0 + Duration::from_secs(105));
        assert!(out.contains("quantile=\"0.5\"} 2\n"));
    }

    #[test]
    fn test_remove_series() {
        let mut vec = FlowSummaryVec::new(Duration::from_secs(300), 10);
        vec.observe(labels(), 5.0, Instant::now());
        assert_eq!(vec.series_count(), 1);

        vec.remove(&labels());
        assert_eq!(vec.series_count(), 0);
        let out = vec.render(Instant::now());
        assert!(!out.contains("srcIP"));
    }

    #[test]
    fn test_resolve_listen_addr() {
        assert_eq!(resolve_listen_addr(":9876"), "0.0.0.0:9876");
        assert_eq!(resolve_listen_addr("127.0.0.1:9876"), "127.0.0.1:9876");
    }
}
