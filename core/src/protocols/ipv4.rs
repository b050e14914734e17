//! IPv4 network stage.
//!
//! Peels the IPv4 header, fills the flow identifier's address half and
//! routes by the encapsulated protocol number through numeric ports. A
//! second instance of this stage typically parses the inner address pair of
//! tunnelled traffic; the GTP stages query the outer instance's saved header
//! for the node addresses.

use crate::config::params;
use crate::packet::PacketDescriptor;
use crate::protocols::{be_u16, ipv4_at};
use crate::stage::{EngineState, Ports, Stage, StageHandle, Verdict};

use std::net::Ipv4Addr;

use anyhow::{Context, Result};

const MIN_HEADER_LEN: usize = 20;
/// Fragment offset part of the flags/fragment-offset field.
const IPV4_FRAG_OFFSET: u16 = 0x1fff;

pub struct Ipv4Stage {
    name: String,
    handle: StageHandle,
    ports: Ports,
    protocols: Vec<(u8, StageHandle)>,
    /// Fill the flow identifier from this header.
    id_flows: bool,
    fragments_seen: u64,
}

impl Ipv4Stage {
    pub fn new(
        name: &str,
        settings: &toml::value::Table,
        ports: Ports,
        handle: StageHandle,
    ) -> Result<Self> {
        let protocols = ports
            .numeric()
            .with_context(|| format!("{}: connections", name))?
            .into_iter()
            .map(|(value, target)| (value as u8, target))
            .collect();
        Ok(Ipv4Stage {
            name: name.to_string(),
            handle,
            ports,
            protocols,
            id_flows: params::bool(settings, "idFlows").unwrap_or(true),
            fragments_seen: 0,
        })
    }

    /// Source and destination address of a previously saved IPv4 header.
    pub fn addresses(segment: &[u8]) -> Option<(Ipv4Addr, Ipv4Addr)> {
        if segment.len() < MIN_HEADER_LEN {
            return None;
        }
        Some((ipv4_at(segment, 12), ipv4_at(segment, 16)))
    }

    /// Header-fix hook: rewrites the total length for truncated dumps.
    fn fix_header(header: &mut [u8], total_len: u32) {
        if header.len() >= 4 {
            header[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        }
    }
}

impl Stage for Ipv4Stage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_packet(&mut self, packet: &mut PacketDescriptor, _: &mut EngineState) -> Verdict {
        let payload = packet.payload();
        if payload.len() < MIN_HEADER_LEN {
            log::info!(
                "{}: payload too short for an IPv4 header, dropping packet (no. {})",
                self.name,
                packet.packet_number()
            );
            return Verdict::Unparsed;
        }
        if payload[0] >> 4 != 4 {
            log::info!(
                "{}: not an IPv4 header, dropping packet (no. {})",
                self.name,
                packet.packet_number()
            );
            return Verdict::Unparsed;
        }
        let header_len = ((payload[0] & 0x0f) as usize) * 4;
        if header_len < MIN_HEADER_LEN || header_len > payload.len() {
            log::info!(
                "{}: invalid IPv4 header length {}, dropping packet (no. {})",
                self.name,
                header_len,
                packet.packet_number()
            );
            return Verdict::Unparsed;
        }

        let flags_frag = be_u16(payload, 6);
        let protocol = payload[9];
        let src = ipv4_at(payload, 12);
        let dst = ipv4_at(payload, 16);

        if self.id_flows {
            packet.flow_id_mut().set_ip(src, dst, protocol);
        }
        packet.push_layer_with_fix(self.handle, header_len, Some(Self::fix_header));

        // Non-first fragments carry no transport header; let them take the
        // default path so the flow still accounts their bytes.
        if flags_frag & IPV4_FRAG_OFFSET != 0 {
            self.fragments_seen += 1;
            return self.ports.forward_default();
        }

        for (value, target) in &self.protocols {
            if *value == protocol {
                return Verdict::Forward(*target);
            }
        }
        self.ports.forward_default()
    }

    fn get_status(&mut self, _: &EngineState, _: u64, _: u64) -> String {
        format!("{} fragments seen", self.fragments_seen)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::flow::UDP_PROTOCOL;
    use crate::packet::CaptureHeader;
    use crate::stage::tests_support;
    use crate::time::TimeVal;

    pub(crate) fn header(src: [u8; 4], dst: [u8; 4], protocol: u8, payload_len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; 20];
        bytes[0] = 0x45;
        let total = 20 + payload_len as u16;
        bytes[2..4].copy_from_slice(&total.to_be_bytes());
        bytes[8] = 64;
        bytes[9] = protocol;
        bytes[12..16].copy_from_slice(&src);
        bytes[16..20].copy_from_slice(&dst);
        bytes.extend(std::iter::repeat(0).take(payload_len));
        bytes
    }

    fn load(packet: &mut PacketDescriptor, bytes: &[u8]) {
        packet.load(
            CaptureHeader {
                ts: TimeVal::new(1, 0),
                caplen: bytes.len() as u32,
                origlen: bytes.len() as u32,
            },
            bytes,
            1,
        );
    }

    #[test]
    fn sets_flow_id_and_routes_by_protocol() {
        let udp = StageHandle::for_tests(2);
        let mut stage = Ipv4Stage::new(
            "ip",
            &toml::value::Table::new(),
            Ports::new(None, vec![("17".to_string(), udp)]),
            StageHandle::for_tests(1),
        )
        .unwrap();

        let mut packet = PacketDescriptor::new();
        load(&mut packet, &header([10, 0, 0, 1], [8, 8, 8, 8], UDP_PROTOCOL, 8));
        let verdict = stage.process_packet(&mut packet, &mut tests_support::state());
        assert_eq!(verdict, Verdict::Forward(udp));
        assert_eq!(packet.flow_id().src_addr(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(packet.flow_id().protocol(), UDP_PROTOCOL);
        assert_eq!(packet.payload().len(), 8);
    }

    #[test]
    fn rejects_short_and_non_v4() {
        let mut stage = Ipv4Stage::new(
            "ip",
            &toml::value::Table::new(),
            Ports::new(None, vec![]),
            StageHandle::for_tests(1),
        )
        .unwrap();
        let mut packet = PacketDescriptor::new();

        load(&mut packet, &[0u8; 10]);
        assert_eq!(
            stage.process_packet(&mut packet, &mut tests_support::state()),
            Verdict::Unparsed
        );

        let mut v6 = header([1, 1, 1, 1], [2, 2, 2, 2], 6, 0);
        v6[0] = 0x65;
        load(&mut packet, &v6);
        assert_eq!(
            stage.process_packet(&mut packet, &mut tests_support::state()),
            Verdict::Unparsed
        );
    }

    #[test]
    fn addresses_read_from_saved_segment() {
        let bytes = header([192, 168, 0, 1], [10, 9, 8, 7], 6, 0);
        let (src, dst) = Ipv4Stage::addresses(&bytes).unwrap();
        assert_eq!(src, Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(dst, Ipv4Addr::new(10, 9, 8, 7));
    }
}
