//! Classification constraints.
//!
//! A constraint is a cross-check required in addition to hints before a rule
//! or precondition may tag a flow. Typical use: sequence-number tracking
//! hints RTP well, but only together with a sane RTP header bit pattern is
//! the verdict trustworthy.

use crate::flow::Flow;
use crate::packet::PacketDescriptor;

/// The closed set of supported constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Constraint {
    RtpHeader,
    UnidirectionalFlow,
    SymmetricFlow,
    FirstUlPacket,
    FirstDlPacket,
}

impl Constraint {
    /// Maps the name used in the classification metadata file.
    pub fn from_name(name: &str) -> Option<Constraint> {
        match name {
            "rtp-header" => Some(Constraint::RtpHeader),
            "unidirectional-flow" => Some(Constraint::UnidirectionalFlow),
            "symmetric-flow" => Some(Constraint::SymmetricFlow),
            "first-ul-packet" => Some(Constraint::FirstUlPacket),
            "first-dl-packet" => Some(Constraint::FirstDlPacket),
            _ => None,
        }
    }

    /// Evaluates the constraint for a packet and its flow.
    pub fn evaluate(&self, packet: &PacketDescriptor, flow: &Flow) -> bool {
        match self {
            Constraint::RtpHeader => rtp_header(packet.payload()),
            Constraint::UnidirectionalFlow => unidirectional(flow),
            Constraint::SymmetricFlow => symmetric(flow),
            Constraint::FirstUlPacket => flow.upload_packets() == 1,
            Constraint::FirstDlPacket => flow.download_packets() == 1,
        }
    }
}

/// RTP version 2 check on the first payload byte.
fn rtp_header(payload: &[u8]) -> bool {
    payload.len() >= 12 && payload[0] & 0xc0 == 0x80
}

/// Reverse-direction packets at most max(1, 1% of the forward direction).
fn unidirectional(flow: &Flow) -> bool {
    const MAX_OTHER_PACKETS: u64 = 1;
    const MAX_OTHER_RATIO: f64 = 0.01;
    let ul = flow.upload_packets();
    let dl = flow.download_packets();
    let (forward, reverse) = if dl > ul { (dl, ul) } else { (ul, dl) };
    reverse <= MAX_OTHER_PACKETS || MAX_OTHER_RATIO * forward as f64 > reverse as f64
}

/// Packet counts of the two directions within a 0.9 ratio of each other.
fn symmetric(flow: &Flow) -> bool {
    const MIN_RATIO: f64 = 0.9;
    let ul = flow.upload_packets() as f64;
    let dl = flow.download_packets() as f64;
    if dl == 0.0 {
        return false;
    }
    let ratio = ul / dl;
    ratio > MIN_RATIO && ratio < 1.0 / MIN_RATIO
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::metadata::tests::test_metadata;
    use crate::flow::FlowId;
    use crate::time::TimeVal;
    use std::sync::Arc;

    fn flow_with(ul: u64, dl: u64) -> Flow {
        let mut flow = Flow::new(FlowId::default(), Arc::new(test_metadata()));
        for i in 0..ul {
            flow.packet(TimeVal::new(i as i64, 0), true, 100);
        }
        for i in 0..dl {
            flow.packet(TimeVal::new(i as i64, 500_000), false, 100);
        }
        flow
    }

    #[test]
    fn symmetric_rejects_lopsided_flow() {
        assert!(!symmetric(&flow_with(100, 20)));
        assert!(symmetric(&flow_with(100, 95)));
        assert!(!symmetric(&flow_with(5, 0)));
    }

    #[test]
    fn unidirectional_allows_single_stray_reply() {
        assert!(unidirectional(&flow_with(50, 1)));
        assert!(unidirectional(&flow_with(500, 4)));
        assert!(!unidirectional(&flow_with(50, 10)));
    }

    #[test]
    fn rtp_checks_version_bits() {
        assert!(rtp_header(&[0x80; 12]));
        assert!(!rtp_header(&[0x80; 11]), "too short");
        assert!(!rtp_header(&[0x40; 12]), "wrong version");
    }
}
