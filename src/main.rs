//! rttscope command line entry point.
//!
//! One RTT line per match on stdout; a per-flow latency summary on the
//! Prometheus scrape endpoint; diagnostics on stderr.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::{ArgGroup, Parser};
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use rttscope::capture::{self, CaptureConfig, CaptureSource, PacketCapture};
use rttscope::engine::{EngineConfig, MatchEngine, Step, DEFAULT_MAX_FLOWS};
use rttscope::error::Result;
use rttscope::localnet::{self, IgnoreRanges};
use rttscope::output::{self, StdoutSink};
use rttscope::metrics;

/// rttscope: passive RTT measurement from TCP timestamps.
#[derive(Parser, Debug)]
#[command(name = "rttscope")]
#[command(version = "0.1.0")]
#[command(about = "Measure per-flow round-trip times passively from TCP timestamp echoes")]
#[command(group = ArgGroup::new("source").required(true).multiple(false))]
struct Cli {
    /// Do live capture from this interface.
    #[arg(short = 'i', long, group = "source", value_name = "NAME")]
    interface: Option<String>,

    /// Process a pre-recorded capture file.
    #[arg(short = 'r', long, group = "source", value_name = "PATH")]
    read: Option<PathBuf>,

    /// Extra BPF filter, composed as "tcp and (EXPR)".
    /// E.g. -f 'net 74.125.0.0/16' only measures traffic to/from that net.
    #[arg(short = 'f', long, value_name = "EXPR")]
    filter: Option<String>,

    /// Stop after this many packets (0 = unlimited).
    #[arg(short = 'c', long, default_value_t = 0, value_name = "N")]
    count: u64,

    /// Stop after this many seconds of capture time (0 = unlimited).
    #[arg(short = 's', long, default_value_t = 0.0, value_name = "S")]
    seconds: f64,

    /// Don't print periodic summary reports to stderr.
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Print summary reports every sumInt seconds (the default).
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Show RTTs through local host applications (empty ignore set).
    #[arg(short = 'l', long = "showLocal")]
    show_local: bool,

    /// Machine-readable output: epoch timestamps and seconds with 1us
    /// resolution, suitable for graphing or post-processing.
    #[arg(short = 'm', long)]
    machine: bool,

    /// Summary report interval in seconds.
    #[arg(long = "sumInt", default_value_t = 10.0, value_name = "S")]
    sum_int: f64,

    /// Max age of an unmatched TSval in seconds.
    #[arg(long = "tsvalMaxAge", default_value_t = 10.0, value_name = "S")]
    tsval_max_age: f64,

    /// Flows idle longer than this many seconds are deleted.
    #[arg(long = "flowMaxIdle", default_value_t = 300.0, value_name = "S")]
    flow_max_idle: f64,

    /// HTTP listen address for the Prometheus scrape endpoint.
    #[arg(short = 'a', long = "listen", default_value = ":9876", value_name = "ADDR")]
    listen: String,

    /// Local subnet to ignore, in CIDR notation (e.g. 172.16.0.0/24).
    /// Can be given multiple times. Ignored when --showLocal is set.
    #[arg(short = 'L', long = "localSubnet", value_name = "CIDR")]
    local_subnet: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            std::process::exit(code);
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    // -v is accepted for symmetry with -q; summaries are on by default.
    let _ = cli.verbose;
    let sum_interval = if cli.quiet { 0.0 } else { cli.sum_int };
    let live = cli.interface.is_some();

    if !(cli.tsval_max_age > 0.0 && cli.tsval_max_age.is_finite()) {
        anyhow::bail!("tsvalMaxAge must be a positive number of seconds");
    }
    if !(cli.flow_max_idle > 0.0 && cli.flow_max_idle.is_finite()) {
        anyhow::bail!("flowMaxIdle must be a positive number of seconds");
    }

    let ignore = build_ignore_ranges(&cli)?;

    // Bind the scrape endpoint before capture starts so a taken port is a
    // startup failure, not a background log line.
    let listen = metrics::resolve_listen_addr(&cli.listen);
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind scrape endpoint on {}", listen))?;
    let summary = metrics::new_shared_summary(Duration::from_secs_f64(cli.flow_max_idle), 10);

    let shutdown = Arc::new(AtomicBool::new(false));
    tokio::spawn(handle_signals(Arc::clone(&shutdown)));

    let metrics_task = tokio::spawn(metrics::serve(
        listener,
        Arc::clone(&summary),
        Arc::clone(&shutdown),
    ));

    let writer = output::new_shared_writer();
    let mut flush_interval = Duration::from_micros(1_000_000);
    if live && cli.machine {
        // Piped into an analysis/display program; keep it fresh.
        flush_interval /= 100;
    }
    info!("Output flush interval is {} us", flush_interval.as_micros());
    let flush_task = tokio::spawn(output::flush_loop(
        Arc::clone(&writer),
        flush_interval,
        Arc::clone(&shutdown),
    ));

    let source = if let Some(ref name) = cli.interface {
        CaptureSource::Live(name.clone())
    } else if let Some(ref path) = cli.read {
        CaptureSource::File(path.clone())
    } else {
        anyhow::bail!("either --interface or --read is required");
    };
    let filter = match &cli.filter {
        Some(expr) => format!("tcp and ({})", expr),
        None => "tcp".to_string(),
    };
    let cap = PacketCapture::new(
        CaptureConfig {
            source,
            filter,
            channel_capacity: 10_000,
        },
        Arc::clone(&shutdown),
    );
    let (mut rx, capture_handle) = cap.start()?;

    let cfg = EngineConfig {
        tsval_max_age: cli.tsval_max_age,
        flow_max_idle: cli.flow_max_idle,
        sum_interval,
        max_flows: DEFAULT_MAX_FLOWS,
        max_packets: cli.count,
        time_to_run: cli.seconds,
    };
    let sink = StdoutSink::new(Arc::clone(&writer), Arc::clone(&summary), cli.machine);
    let mut engine = MatchEngine::new(cfg, ignore, sink);

    while let Some(packet) = rx.recv().await {
        if engine.process(packet) == Step::Stop {
            break;
        }
    }

    // Teardown: stop the producer, age out all remaining state, and give
    // the background tasks their final wakeup.
    shutdown.store(true, Ordering::Relaxed);
    drop(rx);
    engine.finish();
    if let Ok(mut w) = writer.lock() {
        use std::io::Write;
        let _ = w.flush();
    }
    let _ = capture_handle.join();
    let _ = flush_task.await;
    let _ = metrics_task.await;

    info!("rttscope stopped");
    Ok(())
}

/// Composes the ignore set per the local-filtering rules: the interface's
/// own address (live capture only), plus any user-supplied subnets, unless
/// --showLocal empties the set.
fn build_ignore_ranges(cli: &Cli) -> Result<IgnoreRanges> {
    let mut ignore = IgnoreRanges::new();
    if cli.show_local {
        return Ok(ignore);
    }

    for s in &cli.local_subnet {
        ignore.add(localnet::parse_cidr(s)?);
    }

    if let Some(ref ifname) = cli.interface {
        match capture::local_ipv4_of(ifname) {
            Some(addr) => ignore.add_host(addr),
            None if ignore.is_empty() => {
                warn!("Unable to determine local addresses, disabling local filtering");
            }
            None => {}
        }
    }
    Ok(ignore)
}

/// Sets the termination flag on SIGINT or SIGTERM.
async fn handle_signals(shutdown: Arc<AtomicBool>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    info!("Signal received, shutting down");
    shutdown.store(true, Ordering::Relaxed);
}
