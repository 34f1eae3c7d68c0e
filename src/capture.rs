//! Packet capture: the producer side of the pipeline.
//!
//! Opens a live interface or a capture file, applies the BPF filter, and
//! runs a dedicated thread that classifies each frame and hands the result
//! to the matching engine over a channel. Handles are opened on the calling
//! thread so an unreadable source fails startup instead of dying quietly
//! inside the thread.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use pcap::{Active, Capture, Device, Offline};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::classify::{classify, Classified};
use crate::error::{CaptureError, Result};

/// Maximum bytes captured per packet; headers and options fit comfortably.
pub const SNAP_LEN: i32 = 144;

/// Live read timeout in milliseconds; bounds shutdown-flag latency.
const READ_TIMEOUT_MS: i32 = 250;

/// Where packets come from.
#[derive(Debug, Clone)]
pub enum CaptureSource {
    /// Live capture from a named interface.
    Live(String),
    /// A pre-recorded capture file.
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub source: CaptureSource,
    /// Full BPF expression, already composed with the `tcp` base.
    pub filter: String,
    /// Channel buffer size toward the engine.
    pub channel_capacity: usize,
}

/// An opened capture handle of either flavor.
enum OpenCapture {
    Live(Capture<Active>),
    File(Capture<Offline>),
}

impl OpenCapture {
    fn next_classified(&mut self) -> std::result::Result<Classified, pcap::Error> {
        let packet = match self {
            OpenCapture::Live(cap) => cap.next_packet()?,
            OpenCapture::File(cap) => cap.next_packet()?,
        };
        Ok(classify(
            packet.data,
            packet.header.ts.tv_sec as i64,
            packet.header.ts.tv_usec as i64,
            packet.header.len,
        ))
    }

    fn is_live(&self) -> bool {
        matches!(self, OpenCapture::Live(_))
    }
}

/// The capture producer. Feeds classified packets to the engine until the
/// source is exhausted or shutdown is requested.
pub struct PacketCapture {
    config: CaptureConfig,
    shutdown: Arc<AtomicBool>,
}

impl PacketCapture {
    pub fn new(config: CaptureConfig, shutdown: Arc<AtomicBool>) -> Self {
        Self { config, shutdown }
    }

    /// Opens the source, applies the filter, and starts the capture thread.
    pub fn start(self) -> Result<(mpsc::Receiver<Classified>, thread::JoinHandle<()>)> {
        let mut cap = open_source(&self.config.source)?;

        let filter_err = |e| CaptureError::FilterSet {
            filter: self.config.filter.clone(),
            source: e,
        };
        match &mut cap {
            OpenCapture::Live(c) => c.filter(&self.config.filter, true).map_err(filter_err)?,
            OpenCapture::File(c) => c.filter(&self.config.filter, true).map_err(filter_err)?,
        }
        info!("Applied capture filter: {}", self.config.filter);

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let shutdown = Arc::clone(&self.shutdown);
        let handle = thread::Builder::new()
            .name("packet-capture".into())
            .spawn(move || {
                capture_loop(cap, tx, shutdown);
                info!("Capture thread terminated");
            })
            .context("Failed to spawn capture thread")?;

        Ok((rx, handle))
    }
}

fn open_source(source: &CaptureSource) -> Result<OpenCapture> {
    match source {
        CaptureSource::Live(name) => {
            info!("Opening capture on device: {}", name);
            let cap = Capture::from_device(name.as_str())
                .and_then(|c| {
                    c.promisc(false)
                        .snaplen(SNAP_LEN)
                        .timeout(READ_TIMEOUT_MS)
                        .open()
                })
                .map_err(|e| CaptureError::DeviceOpen {
                    device: name.clone(),
                    source: e,
                })?;
            Ok(OpenCapture::Live(cap))
        }
        CaptureSource::File(path) => {
            info!("Opening capture file: {}", path.display());
            let cap = Capture::from_file(path).map_err(|e| CaptureError::FileOpen {
                file: path.display().to_string(),
                source: e,
            })?;
            Ok(OpenCapture::File(cap))
        }
    }
}

/// Runs until the source ends, the engine goes away, or shutdown is set.
fn capture_loop(
    mut cap: OpenCapture,
    tx: mpsc::Sender<Classified>,
    shutdown: Arc<AtomicBool>,
) {
    let live = cap.is_live();
    while !shutdown.load(Ordering::Relaxed) {
        match cap.next_classified() {
            Ok(classified) => {
                // Every captured frame must reach the engine; a full
                // channel blocks rather than drops.
                if tx.blocking_send(classified).is_err() {
                    break;
                }
            }
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) if live => {
                error!("Packet read error: {}", e);
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                error!("Packet read error: {}", e);
                break;
            }
        }
    }
}

/// First IPv4 address of the named interface, if any.
pub fn local_ipv4_of(ifname: &str) -> Option<Ipv4Addr> {
    let devices = Device::list().ok()?;
    devices
        .into_iter()
        .find(|d| d.name == ifname)?
        .addresses
        .into_iter()
        .find_map(|a| match a.addr {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ipv4_of_unknown_interface() {
        assert!(local_ipv4_of("no-such-interface-0").is_none());
    }

    #[test]
    fn test_open_missing_file_fails() {
        let source = CaptureSource::File(PathBuf::from("/nonexistent/capture.pcap"));
        assert!(open_source(&source).is_err());
    }
}
