//! Local-address ignore ranges.
//!
//! TSvals are not recorded for packets whose destination falls inside one of
//! these IPv4 ranges. On a host running rttscope this keeps the tool from
//! measuring its own applications; on a router or NAT the operator can add
//! the translated subnets with `-L`.

use std::net::{IpAddr, Ipv4Addr};

use ipnet::Ipv4Net;

use crate::error::LocalNetError;

/// Set of IPv4 CIDR ranges whose members are skipped by the record step.
///
/// Ranges are IPv4-only; an IPv6 destination is never a member.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRanges {
    ranges: Vec<Ipv4Net>,
}

impl IgnoreRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Adds a parsed CIDR range.
    pub fn add(&mut self, net: Ipv4Net) {
        self.ranges.push(net);
    }

    /// Adds a single-host /32 range.
    pub fn add_host(&mut self, addr: Ipv4Addr) {
        // Ipv4Net::new only fails for prefix lengths > 32.
        if let Ok(net) = Ipv4Net::new(addr, 32) {
            self.ranges.push(net);
        }
    }

    /// True iff `addr` is an IPv4 address contained in any range.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => self.ranges.iter().any(|r| r.contains(&v4)),
            IpAddr::V6(_) => false,
        }
    }
}

/// Parses user-supplied CIDR notation (`a.b.c.d/N`).
///
/// The prefix length is required; `/32` yields a single-host range.
pub fn parse_cidr(s: &str) -> Result<Ipv4Net, LocalNetError> {
    if !s.contains('/') {
        return Err(LocalNetError::BadCidr(s.to_string()));
    }
    s.parse::<Ipv4Net>()
        .map_err(|_| LocalNetError::BadCidr(s.to_string()))
}
