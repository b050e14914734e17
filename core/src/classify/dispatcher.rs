//! Classifier dispatcher stage.
//!
//! Steers packets among the classifier stages by the phase their flow is
//! in: the expensive detectors only see the first packets of a flow (and a
//! periodic recheck), classified flows take the cheap path.

use crate::config::params;
use crate::flow::{TCP_PROTOCOL, UDP_PROTOCOL};
use crate::packet::{Direction, PacketDescriptor};
use crate::stage::{EngineState, Ports, Stage, StageHandle, Verdict};

use anyhow::{Context, Result};

const PORT_NON_UDP_TCP_FIRST: &str = "nonUdpTcpFirstPacket";
const PORT_NON_UDP_TCP: &str = "nonUdpTcp";
const PORT_CLASSIFIED: &str = "classified";
const PORT_RECHECK: &str = "recheck";
const PORT_UNCLASSIFIED: &str = "unclassified";
const PORT_FIRST_FINAL: &str = "firstFinal";
const PORT_FIRST_REPLY: &str = "firstReply";
const PORT_FIRST_PACKET: &str = "firstPacket";

pub struct ClassifierDispatcherStage {
    name: String,
    ports: Ports,
    min_packets: u64,
    max_packets: u64,
    recheck_frequency: u64,
    out_non_udp_tcp_first: Option<StageHandle>,
    out_non_udp_tcp: Option<StageHandle>,
    out_classified: Option<StageHandle>,
    out_recheck: Option<StageHandle>,
    out_unclassified: Option<StageHandle>,
    out_first_final: Option<StageHandle>,
    out_first_reply: Option<StageHandle>,
    out_first_packet: Option<StageHandle>,
}

impl ClassifierDispatcherStage {
    pub fn new(name: &str, settings: &toml::value::Table, ports: Ports) -> Result<Self> {
        ports
            .expect_only(&[
                PORT_NON_UDP_TCP_FIRST,
                PORT_NON_UDP_TCP,
                PORT_CLASSIFIED,
                PORT_RECHECK,
                PORT_UNCLASSIFIED,
                PORT_FIRST_FINAL,
                PORT_FIRST_REPLY,
                PORT_FIRST_PACKET,
            ])
            .with_context(|| format!("{}: connections", name))?;

        let mut stage = ClassifierDispatcherStage {
            name: name.to_string(),
            out_non_udp_tcp_first: ports.named(PORT_NON_UDP_TCP_FIRST),
            out_non_udp_tcp: ports.named(PORT_NON_UDP_TCP),
            out_classified: ports.named(PORT_CLASSIFIED),
            out_recheck: ports.named(PORT_RECHECK),
            out_unclassified: ports.named(PORT_UNCLASSIFIED),
            out_first_final: ports.named(PORT_FIRST_FINAL),
            out_first_reply: ports.named(PORT_FIRST_REPLY),
            out_first_packet: ports.named(PORT_FIRST_PACKET),
            ports,
            min_packets: 10,
            max_packets: 40,
            recheck_frequency: 1000,
        };
        stage.apply_settings(settings);
        Ok(stage)
    }

    fn apply_settings(&mut self, settings: &toml::value::Table) {
        let a = params::u64(settings, "minPackets");
        let b = params::u64(settings, "maxPackets");
        if let Some(v) = a {
            self.min_packets = v;
        }
        if let Some(v) = b {
            self.max_packets = v;
        }
        if a.is_some() || b.is_some() {
            log::info!(
                "{}: classifying between {} and {} packets of each flow",
                self.name,
                self.min_packets,
                self.max_packets
            );
        }
        if let Some(v) = params::u64(settings, "recheckFrequency") {
            self.recheck_frequency = v.max(1);
            log::info!(
                "{}: rechecking classification after every {} packets",
                self.name,
                self.recheck_frequency
            );
        }
    }
}

impl Stage for ClassifierDispatcherStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_packet(&mut self, packet: &mut PacketDescriptor, _: &mut EngineState) -> Verdict {
        let Some(flow) = packet.flow().cloned() else {
            log::warn!(
                "{}: no flow associated with packet (no. {})",
                self.name,
                packet.packet_number()
            );
            return self.ports.forward_default();
        };
        let flow = flow.borrow();
        let packet_number = packet.flow_number();
        let protocol = flow.id().protocol();

        // Flows other than TCP and UDP take their own path.
        if protocol != TCP_PROTOCOL && protocol != UDP_PROTOCOL {
            if packet_number == 1 {
                if let Some(out) = self.out_non_udp_tcp_first {
                    return Verdict::Forward(out);
                }
            }
            if let Some(out) = self.out_non_udp_tcp {
                return Verdict::Forward(out);
            }
        }

        if packet_number == 1 {
            if let Some(out) = self.out_first_packet {
                return Verdict::Forward(out);
            }
        }

        let first_reply = match packet.direction {
            Direction::Uplink => flow.upload_packets() == 1,
            Direction::Downlink => flow.download_packets() == 1,
            // With symmetric flow accounting the responder counts as
            // downlink.
            Direction::Undefined => flow.download_packets() == 1,
        };
        if first_reply {
            if let Some(out) = self.out_first_reply {
                return Verdict::Forward(out);
            }
        }

        if flow.first_final_packet() != u64::MAX && flow.first_final_packet() + 1 == packet_number {
            // The flow became final at the previous packet.
            if let Some(out) = self.out_first_final {
                return Verdict::Forward(out);
            }
        }

        if packet_number <= self.min_packets || (!flow.is_final() && packet_number <= self.max_packets)
        {
            if let Some(out) = self.out_unclassified {
                return Verdict::Forward(out);
            }
        }

        if packet_number % self.recheck_frequency == 1 {
            if let Some(out) = self.out_recheck {
                return Verdict::Forward(out);
            }
        }

        match self.out_classified {
            Some(out) => Verdict::Forward(out),
            None => self.ports.forward_default(),
        }
    }

    fn configure(&mut self, settings: &toml::value::Table) {
        self.apply_settings(settings);
    }
}
