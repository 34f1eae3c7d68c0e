//! rttscope: passive per-flow TCP round-trip-time measurement.
//!
//! Observes both directions of TCP traffic at a single capture point and
//! infers the RTT between that point and each endpoint from the Timestamps
//! option (RFC 7323): a TSval recorded in one direction eventually returns
//! as the peer's TSecr, and the capture-time delta between the two
//! observations is the round trip to the echoing host.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐      ┌────────────────┐      ┌──────────────┐
//! │   Capture    │─────>│ Matching engine│─────>│ stdout lines │
//! │ (pcap thread)│ mpsc │ (flow registry,│      ├──────────────┤
//! └──────────────┘      │  TSval table)  │─────>│ /metrics     │
//!                       └────────────────┘      └──────────────┘
//! ```
//!
//! - **Capture**: dedicated thread driving libpcap, classifying frames
//! - **Engine**: sole owner of the flow registry and TSval table; reaping
//!   and summary reporting ride the packet loop on capture-time schedules
//! - **Output**: one stdout line per RTT sample plus a per-flow latency
//!   summary served on a Prometheus scrape endpoint

pub mod capture;
pub mod classify;
pub mod engine;
pub mod error;
pub mod flow;
pub mod localnet;
pub mod metrics;
pub mod output;
pub mod tstable;
