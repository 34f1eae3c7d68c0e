//! Packet classifier.
//!
//! Reduces a captured frame to the fields the matching engine needs: the
//! capture time, the v4/v6 address pair, TCP ports, and the Timestamps
//! option (RFC 7323). Anything else is a tallied reject or, for the zero
//! TSval/TSecr cases, a silent discard.

use std::net::IpAddr;

use etherparse::{NetSlice, SlicedPacket, TcpOptionElement, TcpOptionsIterator, TransportSlice};

/// Why a packet was rejected by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotTcp,
    NoTimestamp,
    NotV4OrV6,
}

/// A TCP packet carrying a usable Timestamps option.
#[derive(Debug, Clone)]
pub struct NormalizedPacket {
    /// Capture time, integer seconds since the Unix epoch.
    pub ts_sec: i64,
    /// Capture time, microseconds within the second.
    pub ts_usec: i64,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub tsval: u32,
    pub tsecr: u32,
    pub is_syn: bool,
    /// On-wire packet length in bytes.
    pub wire_len: u32,
}

impl NormalizedPacket {
    /// Forward flow key, `srcIP:sport+dstIP:dport`.
    pub fn fwd_key(&self) -> String {
        format!(
            "{}:{}+{}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }

    /// Reverse flow key, `dstIP:dport+srcIP:sport`.
    pub fn rev_key(&self) -> String {
        format!(
            "{}:{}+{}:{}",
            self.dst_ip, self.dst_port, self.src_ip, self.src_port
        )
    }
}

/// Classifier outcome for one captured frame.
#[derive(Debug, Clone)]
pub enum Classified {
    Sample(NormalizedPacket),
    Reject(RejectReason),
    /// Discarded without tallying (zero TSval, or zero TSecr off a pure SYN).
    Silent,
}

/// Classifies one captured frame.
///
/// `wire_len` is the on-wire length from the capture header; `data` may be
/// shorter when the snap length truncated the frame. Parse failures from the
/// slicing layer are absorbed here and tallied, never propagated.
pub fn classify(data: &[u8], ts_sec: i64, ts_usec: i64, wire_len: u32) -> Classified {
    let sliced = match SlicedPacket::from_ethernet(data) {
        Ok(s) => s,
        Err(_) => return Classified::Reject(RejectReason::NotTcp),
    };

    let tcp = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => tcp,
        _ => return Classified::Reject(RejectReason::NotTcp),
    };

    let Some((tsval, tsecr)) = timestamps_option(TcpOptionsIterator::from_slice(tcp.options()))
    else {
        return Classified::Reject(RejectReason::NoTimestamp);
    };

    // A zero TSval carries no usable clock. A zero TSecr is only legitimate
    // on the opening SYN, where the peer's clock has not been seen yet; a
    // SYN/ACK echoes the initiator's TSval, so a zero there is bogus too.
    if tsval == 0 || (tsecr == 0 && !(tcp.syn() && !tcp.ack())) {
        return Classified::Silent;
    }

    let (src_ip, dst_ip) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            (
                IpAddr::from(header.source()),
                IpAddr::from(header.destination()),
            )
        }
        Some(NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            (
                IpAddr::from(header.source()),
                IpAddr::from(header.destination()),
            )
        }
        _ => return Classified::Reject(RejectReason::NotV4OrV6),
    };

    Classified::Sample(NormalizedPacket {
        ts_sec,
        ts_usec,
        src_ip,
        dst_ip,
        src_port: tcp.source_port(),
        dst_port: tcp.destination_port(),
        tsval,
        tsecr,
        is_syn: tcp.syn(),
        wire_len,
    })
}

/// Walks the TCP options for the Timestamps option.
fn timestamps_option(iter: TcpOptionsIterator) -> Option<(u32, u32)> {
    for opt in iter {
        match opt {
            Ok(TcpOptionElement::Timestamp(tsval, tsecr)) => return Some((tsval, tsecr)),
            Ok(_) => continue,
            // Malformed trailing options; nothing usable beyond this point.
            Err(_) => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    fn tcp_frame(tsval: u32, tsecr: u32, syn: bool) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(45000, 443, 1000, 64000);
        let builder = if syn { builder.syn() } else { builder };
        let builder = builder
            .options(&[TcpOptionElement::Timestamp(tsval, tsecr)])
            .unwrap();

        let mut frame = Vec::with_capacity(builder.size(0));
        builder.write(&mut frame, &[]).unwrap();
        frame
    }

    #[test]
    fn test_tcp_with_timestamps() {
        let frame = tcp_frame(100, 50, false);
        match classify(&frame, 1_700_000_000, 250_000, frame.len() as u32) {
            Classified::Sample(pkt) => {
                assert_eq!(pkt.tsval, 100);
                assert_eq!(pkt.tsecr, 50);
                assert_eq!(pkt.src_port, 45000);
                assert_eq!(pkt.dst_port, 443);
                assert_eq!(pkt.src_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
                assert_eq!(pkt.dst_ip, "10.0.0.2".parse::<IpAddr>().unwrap());
                assert!(!pkt.is_syn);
            }
            other => panic!("expected sample, got {:?}", other),
        }
    }

    #[test]
    fn test_flow_keys() {
        let frame = tcp_frame(100, 50, false);
        let Classified::Sample(pkt) = classify(&frame, 0, 0, frame.len() as u32) else {
            panic!("expected sample");
        };
        assert_eq!(pkt.fwd_key(), "10.0.0.1:45000+10.0.0.2:443");
        assert_eq!(pkt.rev_key(), "10.0.0.2:443+10.0.0.1:45000");
    }

    #[test]
    fn test_udp_rejected_not_tcp() {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(1234, 53);
        let mut frame = Vec::new();
        builder.write(&mut frame, &[0u8; 4]).unwrap();

        match classify(&frame, 0, 0, frame.len() as u32) {
            Classified::Reject(RejectReason::NotTcp) => {}
            other => panic!("expected not_tcp, got {:?}", other),
        }
    }

    #[test]
    fn test_tcp_without_option_rejected() {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(45000, 443, 1000, 64000);
        let mut frame = Vec::new();
        builder.write(&mut frame, &[]).unwrap();

        match classify(&frame, 0, 0, frame.len() as u32) {
            Classified::Reject(RejectReason::NoTimestamp) => {}
            other => panic!("expected no_TS, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_tsval_silently_discarded() {
        let frame = tcp_frame(0, 50, false);
        assert!(matches!(
            classify(&frame, 0, 0, frame.len() as u32),
            Classified::Silent
        ));
    }

    fn syn_ack_frame(tsval: u32, tsecr: u32) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([10, 0, 0, 2], [10, 0, 0, 1], 64)
            .tcp(443, 45000, 2000, 64000)
            .syn()
            .ack(1001)
            .options(&[TcpOptionElement::Timestamp(tsval, tsecr)])
            .unwrap();
        let mut frame = Vec::new();
        builder.write(&mut frame, &[]).unwrap();
        frame
    }

    #[test]
    fn test_zero_tsecr_only_allowed_on_pure_syn() {
        let frame = tcp_frame(100, 0, false);
        assert!(matches!(
            classify(&frame, 0, 0, frame.len() as u32),
            Classified::Silent
        ));

        let syn = tcp_frame(100, 0, true);
        match classify(&syn, 0, 0, syn.len() as u32) {
            Classified::Sample(pkt) => assert!(pkt.is_syn),
            other => panic!("expected sample for SYN, got {:?}", other),
        }

        // SYN/ACK is not the opening SYN: a zero TSecr there is discarded.
        let syn_ack = syn_ack_frame(200, 0);
        assert!(matches!(
            classify(&syn_ack, 0, 0, syn_ack.len() as u32),
            Classified::Silent
        ));

        // A SYN/ACK with a real echo is a normal sample.
        let syn_ack = syn_ack_frame(200, 100);
        match classify(&syn_ack, 0, 0, syn_ack.len() as u32) {
            Classified::Sample(pkt) => {
                assert_eq!(pkt.tsecr, 100);
                assert!(pkt.is_syn);
            }
            other => panic!("expected sample for SYN/ACK, got {:?}", other),
        }
    }

    #[test]
    fn test_ipv6_sample() {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv6(
                "2001:db8::1".parse::<std::net::Ipv6Addr>().unwrap().octets(),
                "2001:db8::2".parse::<std::net::Ipv6Addr>().unwrap().octets(),
                64,
            )
            .tcp(52000, 80, 0, 32000)
            .options(&[TcpOptionElement::Timestamp(7, 9)])
            .unwrap();
        let mut frame = Vec::new();
        builder.write(&mut frame, &[]).unwrap();

        match classify(&frame, 0, 0, frame.len() as u32) {
            Classified::Sample(pkt) => {
                assert_eq!(pkt.src_ip, "2001:db8::1".parse::<IpAddr>().unwrap());
                assert_eq!(pkt.fwd_key(), "2001:db8::1:52000+2001:db8::2:80");
            }
            other => panic!("expected sample, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_frame_rejected() {
        let garbage = [0xffu8; 20];
        assert!(matches!(
            classify(&garbage, 0, 0, 20),
            Classified::Reject(RejectReason::NotTcp)
        ));
    }
}
