//! Port-based classifier stage.
//!
//! Registers a hint when either port of a flow matches a `port` signature
//! of the metadata. Port evidence alone is weak: the metadata must not mark
//! port signatures final.

use crate::classify::hints::Hint;
use crate::classify::metadata::ClassificationMetadata;
use crate::flow::{TCP_PROTOCOL, UDP_PROTOCOL};
use crate::packet::PacketDescriptor;
use crate::stage::{EngineState, Ports, Stage, Verdict};

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};

pub struct PortClassifierStage {
    name: String,
    ports: Ports,
    tcp_ports: HashMap<u16, Hint>,
    udp_ports: HashMap<u16, Hint>,
}

impl PortClassifierStage {
    pub fn new(
        name: &str,
        ports: Ports,
        metadata: &Arc<ClassificationMetadata>,
    ) -> Result<Self> {
        let mut tcp_ports: HashMap<u16, Hint> = HashMap::new();
        let mut udp_ports: HashMap<u16, Hint> = HashMap::new();
        let mut error = None;

        metadata.for_each_signature("port", |block_id, sig| {
            if error.is_some() {
                return;
            }
            if sig.is_final {
                error = Some(format!(
                    "port signature must not be final ({},{})",
                    metadata.blocks().name(block_id),
                    sig.id
                ));
                return;
            }
            let port = match sig.attr("value").and_then(|v| v.parse::<u16>().ok()) {
                Some(port) => port,
                None => {
                    error = Some(format!(
                        "port signature without a valid value ({},{})",
                        metadata.blocks().name(block_id),
                        sig.id
                    ));
                    return;
                }
            };
            let proto = sig.attr("proto").unwrap_or("any");
            let hint = (block_id, sig.id);
            if proto == "tcp" || proto == "any" {
                if tcp_ports.insert(port, hint).is_some() {
                    error = Some(format!("TCP port {} is used in more than one signature", port));
                    return;
                }
            }
            if proto == "udp" || proto == "any" {
                if udp_ports.insert(port, hint).is_some() {
                    error = Some(format!("UDP port {} is used in more than one signature", port));
                }
            }
        });
        if let Some(e) = error {
            bail!("{}: {}", name, e);
        }

        Ok(PortClassifierStage {
            name: name.to_string(),
            ports,
            tcp_ports,
            udp_ports,
        })
    }
}

impl Stage for PortClassifierStage {
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
        let mut flow = flow.borrow_mut();

        let table = match flow.id().protocol() {
            TCP_PROTOCOL => &self.tcp_ports,
            UDP_PROTOCOL => &self.udp_ports,
            _ => return self.ports.forward_default(),
        };
        for port in [flow.id().src_port(), flow.id().dst_port()] {
            if let Some((block_id, sig_id)) = table.get(&port).copied() {
                flow.set_hint(block_id, sig_id);
            }
        }
        self.ports.forward_default()
    }
}
