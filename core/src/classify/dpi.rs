//! Payload-pattern (DPI) classifier stage.
//!
//! Runs every `dpi` signature regex of the metadata over the transport
//! payload and registers a hint per match. Patterns are split by transport
//! so UDP-only signatures do not burn cycles on TCP traffic.

use crate::classify::hints::Hint;
use crate::classify::metadata::ClassificationMetadata;
use crate::flow::{TCP_PROTOCOL, UDP_PROTOCOL};
use crate::packet::PacketDescriptor;
use crate::stage::{EngineState, Ports, Stage, Verdict};

use std::sync::Arc;

use anyhow::{bail, Result};
use regex::bytes::Regex;

pub struct DpiStage {
    name: String,
    ports: Ports,
    tcp_signatures: Vec<(Hint, Regex)>,
    udp_signatures: Vec<(Hint, Regex)>,
}

impl DpiStage {
    pub fn new(name: &str, ports: Ports, metadata: &Arc<ClassificationMetadata>) -> Result<Self> {
        let mut tcp_signatures = Vec::new();
        let mut udp_signatures = Vec::new();
        let mut error = None;

        metadata.for_each_signature("dpi", |block_id, sig| {
            if error.is_some() {
                return;
            }
            let pattern = match sig.attr("regexp") {
                Some(p) => p,
                None => {
                    error = Some(format!(
                        "dpi signature without a regexp ({},{})",
                        metadata.blocks().name(block_id),
                        sig.id
                    ));
                    return;
                }
            };
            let regex = match Regex::new(pattern) {
                Ok(r) => r,
                Err(e) => {
                    error = Some(format!(
                        "could not compile regexp \"{}\" ({},{}): {}",
                        pattern,
                        metadata.blocks().name(block_id),
                        sig.id,
                        e
                    ));
                    return;
                }
            };
            let proto = sig.attr("proto").unwrap_or("any");
            let hint = (block_id, sig.id);
            if proto == "tcp" || proto == "any" {
                tcp_signatures.push((hint, regex.clone()));
            }
            if proto == "udp" || proto == "any" {
                udp_signatures.push((hint, regex));
            }
        });
        if let Some(e) = error {
            bail!("{}: {}", name, e);
        }

        Ok(DpiStage {
            name: name.to_string(),
            ports,
            tcp_signatures,
            udp_signatures,
        })
    }
}

impl Stage for DpiStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_packet(&mut self, packet: &mut PacketDescriptor, _: &mut EngineState) -> Verdict {
        if packet.payload().is_empty() {
            return self.ports.forward_default();
        }
        let Some(flow) = packet.flow().cloned() else {
            log::warn!(
                "{}: no flow associated with packet (no. {})",
                self.name,
                packet.packet_number()
            );
            return self.ports.forward_default();
        };
        let mut flow = flow.borrow_mut();

        let signatures = match flow.id().protocol() {
            TCP_PROTOCOL => &self.tcp_signatures,
            UDP_PROTOCOL => &self.udp_signatures,
            _ => return self.ports.forward_default(),
        };
        for ((block_id, sig_id), regex) in signatures {
            if regex.is_match(packet.payload()) {
                flow.set_hint(*block_id, *sig_id);
            }
        }
        self.ports.forward_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::metadata::ClassificationMetadata;
    use crate::flow::{Flow, FlowId};
    use crate::packet::CaptureHeader;
    use crate::stage::tests_support;
    use crate::time::TimeVal;
    use std::cell::RefCell;
    use std::net::Ipv4Addr;
    use std::rc::Rc;

    const XML: &str = r#"
<classification>
  <facets><facet name="application" required="true"/></facets>
  <block name="BT">
    <tag facet="application" focus="bittorrent"/>
    <signature id="1" type="dpi" regexp="\x13BitTorrent protocol" proto="tcp" standalone="true"/>
  </block>
</classification>
"#;

    #[test]
    fn payload_match_registers_hint() {
        let metadata = Arc::new(ClassificationMetadata::from_str(XML).unwrap());
        let mut stage = DpiStage::new("dpi", Ports::new(None, vec![]), &metadata).unwrap();

        let mut id = FlowId::default();
        id.set_ip(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2), TCP_PROTOCOL);
        id.set_transport(1, 2);

        let payload = b"\x13BitTorrent protocol rest";
        let mut packet = PacketDescriptor::new();
        packet.load(
            CaptureHeader {
                ts: TimeVal::new(1, 0),
                caplen: payload.len() as u32,
                origlen: payload.len() as u32,
            },
            payload,
            1,
        );
        let flow = Rc::new(RefCell::new(Flow::new(id, Arc::clone(&metadata))));
        packet.set_flow(Rc::clone(&flow));

        stage.process_packet(&mut packet, &mut tests_support::state());
        assert!(flow.borrow().hints().contains(1, 1));
    }
}
