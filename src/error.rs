//! Domain-specific error types for rttscope.
//!
//! Uses `thiserror` for ergonomic error definitions that integrate
//! with the broader `anyhow` error handling strategy.

use thiserror::Error;

/// Errors that can occur while opening or driving a capture source.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to open capture device '{device}': {source}")]
    DeviceOpen {
        device: String,
        #[source]
        source: pcap::Error,
    },

    #[error("Failed to open capture file '{file}': {source}")]
    FileOpen {
        file: String,
        #[source]
        source: pcap::Error,
    },

    #[error("Failed to set capture filter '{filter}': {source}")]
    FilterSet {
        filter: String,
        #[source]
        source: pcap::Error,
    },

    #[error("Failed to read packet: {0}")]
    PacketRead(#[from] pcap::Error),
}

/// Errors raised while composing the local-address ignore set.
#[derive(Error, Debug)]
pub enum LocalNetError {
    #[error("'{0}' is not valid CIDR notation (expected a.b.c.d/N)")]
    BadCidr(String),
}

/// Result type alias using anyhow for application-level error handling.
pub type Result<T> = anyhow::Result<T>;
