//! TCP transport stage.

use crate::config::params;
use crate::packet::PacketDescriptor;
use crate::protocols::be_u16;
use crate::stage::{EngineState, Ports, Stage, StageHandle, Verdict};

use anyhow::{Context, Result};

const MIN_TCP_HEADER_LEN: usize = 20;

/// Peels the TCP header (data offset included), fills in the flow
/// identifier's port pair and routes by source or destination port through
/// numeric ports (e.g. 80 → the HTTP stage).
pub struct TcpStage {
    name: String,
    handle: StageHandle,
    ports: Ports,
    port_map: Vec<(u16, StageHandle)>,
    id_flows: bool,
}

impl TcpStage {
    pub fn new(
        name: &str,
        settings: &toml::value::Table,
        ports: Ports,
        handle: StageHandle,
    ) -> Result<Self> {
        let port_map = ports
            .numeric()
            .with_context(|| format!("{}: connections", name))?
            .into_iter()
            .map(|(value, target)| (value as u16, target))
            .collect();
        Ok(TcpStage {
            name: name.to_string(),
            handle,
            ports,
            port_map,
            id_flows: params::bool(settings, "idFlows").unwrap_or(true),
        })
    }
}

impl Stage for TcpStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_packet(&mut self, packet: &mut PacketDescriptor, _: &mut EngineState) -> Verdict {
        let payload = packet.payload();
        if payload.len() < MIN_TCP_HEADER_LEN {
            log::info!(
                "{}: payload too short for a TCP header, dropping packet (no. {})",
                self.name,
                packet.packet_number()
            );
            return Verdict::Unparsed;
        }

        let header_len = ((payload[12] >> 4) as usize) * 4;
        if header_len < MIN_TCP_HEADER_LEN || header_len > payload.len() {
            log::info!(
                "{}: invalid TCP data offset, dropping packet (no. {})",
                self.name,
                packet.packet_number()
            );
            return Verdict::Unparsed;
        }

        let src_port = be_u16(payload, 0);
        let dst_port = be_u16(payload, 2);

        packet.push_layer(self.handle, header_len);
        if self.id_flows {
            packet.flow_id_mut().set_transport(src_port, dst_port);
        }

        for (port, target) in &self.port_map {
            if *port == src_port || *port == dst_port {
                return Verdict::Forward(*target);
            }
        }
        self.ports.forward_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::CaptureHeader;
    use crate::stage::tests_support;
    use crate::time::TimeVal;

    pub(crate) fn header(src: u16, dst: u16, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0u8; MIN_TCP_HEADER_LEN];
        bytes[0..2].copy_from_slice(&src.to_be_bytes());
        bytes[2..4].copy_from_slice(&dst.to_be_bytes());
        bytes[12] = 5 << 4; // data offset: 5 words
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn routes_by_either_port() {
        let http = StageHandle::for_tests(5);
        let mut stage = TcpStage::new(
            "tcp",
            &toml::value::Table::new(),
            Ports::new(None, vec![("80".to_string(), http)]),
            StageHandle::for_tests(4),
        )
        .unwrap();

        let mut packet = PacketDescriptor::new();
        for (src, dst) in [(50000, 80), (80, 50000)] {
            let bytes = header(src, dst, b"GET ");
            packet.load(
                CaptureHeader {
                    ts: TimeVal::new(1, 0),
                    caplen: bytes.len() as u32,
                    origlen: bytes.len() as u32,
                },
                &bytes,
                1,
            );
            assert_eq!(
                stage.process_packet(&mut packet, &mut tests_support::state()),
                Verdict::Forward(http)
            );
            assert_eq!(packet.payload(), b"GET ");
        }
    }

    #[test]
    fn data_offset_beyond_payload_drops() {
        let mut stage = TcpStage::new(
            "tcp",
            &toml::value::Table::new(),
            Ports::new(None, vec![]),
            StageHandle::for_tests(4),
        )
        .unwrap();
        let mut bytes = header(1, 2, &[]);
        bytes[12] = 0xf0; // 60-byte header in a 20-byte packet
        let mut packet = PacketDescriptor::new();
        packet.load(
            CaptureHeader {
                ts: TimeVal::new(1, 0),
                caplen: bytes.len() as u32,
                origlen: bytes.len() as u32,
            },
            &bytes,
            1,
        );
        assert_eq!(
            stage.process_packet(&mut packet, &mut tests_support::state()),
            Verdict::Unparsed
        );
    }
}
