//! UDP transport stage.

use crate::config::params;
use crate::packet::PacketDescriptor;
use crate::protocols::be_u16;
use crate::stage::{EngineState, Ports, Stage, StageHandle, Verdict};

use anyhow::{Context, Result};

const UDP_HEADER_LEN: usize = 8;

/// Peels the UDP header, fills in the flow identifier's port pair and
/// routes by source or destination port through numeric ports (e.g. 2123 →
/// the GTP-C stage, 2152 → the GTP-U stage).
pub struct UdpStage {
    name: String,
    handle: StageHandle,
    ports: Ports,
    port_map: Vec<(u16, StageHandle)>,
    id_flows: bool,
}

impl UdpStage {
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
        Ok(UdpStage {
            name: name.to_string(),
            handle,
            ports,
            port_map,
            id_flows: params::bool(settings, "idFlows").unwrap_or(true),
        })
    }

    /// Header-fix hook: rewrites the length field for truncated dumps.
    fn fix_header(header: &mut [u8], total_len: u32) {
        if header.len() >= 6 {
            header[4..6].copy_from_slice(&(total_len as u16).to_be_bytes());
        }
    }
}

impl Stage for UdpStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_packet(&mut self, packet: &mut PacketDescriptor, _: &mut EngineState) -> Verdict {
        let payload = packet.payload();
        if payload.len() < UDP_HEADER_LEN {
            log::info!(
                "{}: payload too short for a UDP header, dropping packet (no. {})",
                self.name,
                packet.packet_number()
            );
            return Verdict::Unparsed;
        }

        let src_port = be_u16(payload, 0);
        let dst_port = be_u16(payload, 2);

        packet.push_layer_with_fix(self.handle, UDP_HEADER_LEN, Some(Self::fix_header));
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
