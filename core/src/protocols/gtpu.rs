//! GTP-U user-plane stage.
//!
//! Peels the GTP-U header and, for tunnelled PDUs, resolves the carrying
//! tunnel context via the outer destination address and the tunnel
//! identifier. A hit orients the packet (access node → uplink, gateway →
//! downlink), stamps the subscriber and equipment identifiers and refreshes
//! the context's activity. Routing follows the GTP message type through
//! numeric ports (255 → the inner IP stage).

use crate::config::params;
use crate::packet::{Direction, PacketDescriptor};
use crate::protocols::gtp;
use crate::protocols::ipv4::Ipv4Stage;
use crate::stage::{EngineState, Ports, Stage, StageHandle, StageMap, Verdict};
use crate::tunnel::{NodeRole, TunnelEndpoint};

use anyhow::{Context, Result};

pub struct GtpUserStage {
    name: String,
    handle: StageHandle,
    ports: Ports,
    message_types: Vec<(u8, StageHandle)>,
    /// Outer IP stage whose saved header carries the node addresses.
    ip_stage: Option<StageHandle>,
}

impl GtpUserStage {
    pub fn new(
        name: &str,
        settings: &toml::value::Table,
        ports: Ports,
        handle: StageHandle,
        stages: &StageMap,
    ) -> Result<Self> {
        let message_types = ports
            .numeric()
            .with_context(|| format!("{}: connections", name))?
            .into_iter()
            .map(|(value, target)| (value as u8, target))
            .collect();
        let ip_stage = match params::str(settings, "ipStage") {
            Some(stage_name) => Some(
                stages
                    .require(stage_name)
                    .with_context(|| format!("{}: ipStage", name))?,
            ),
            None => {
                log::warn!("{}: ipStage not set, unable to do subscriber mapping", name);
                None
            }
        };
        Ok(GtpUserStage {
            name: name.to_string(),
            handle,
            ports,
            message_types,
            ip_stage,
        })
    }
}

impl Stage for GtpUserStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_packet(&mut self, packet: &mut PacketDescriptor, state: &mut EngineState) -> Verdict {
        let header = match gtp::peel(packet.payload()) {
            Ok(header) => header,
            Err(e) => {
                log::info!(
                    "{}: {}, dropping packet (no. {})",
                    self.name,
                    e,
                    packet.packet_number()
                );
                return Verdict::Unparsed;
            }
        };

        packet.push_layer(self.handle, header.header_len);

        if let (Some(ip_stage), true) = (self.ip_stage, header.teid != 0) {
            let addresses = packet.segment(ip_stage).and_then(Ipv4Stage::addresses);
            match addresses {
                Some((src, dst)) => {
                    let src_role = state.tunnels.role_of(src);
                    let dst_role = state.tunnels.role_of(dst);
                    match (src_role, dst_role) {
                        (Some(NodeRole::Access), Some(NodeRole::Access)) => {
                            log::warn!(
                                "{}: cannot determine direction of packet (no. {}): both tunnel endpoints are access nodes",
                                self.name,
                                packet.packet_number()
                            );
                        }
                        (Some(NodeRole::Gateway), Some(NodeRole::Gateway)) => {
                            log::warn!(
                                "{}: cannot determine direction of packet (no. {}): both tunnel endpoints are gateways",
                                self.name,
                                packet.packet_number()
                            );
                        }
                        (Some(NodeRole::Access), _) | (_, Some(NodeRole::Gateway)) => {
                            packet.direction = Direction::Uplink;
                        }
                        (Some(NodeRole::Gateway), _) | (_, Some(NodeRole::Access)) => {
                            packet.direction = Direction::Downlink;
                        }
                        (None, None) => {
                            log::info!(
                                "{}: direction of packet no. {} cannot be determined (node addresses not yet known)",
                                self.name,
                                packet.packet_number()
                            );
                        }
                    }

                    let endpoint = TunnelEndpoint::new(dst, header.teid);
                    if let Some(context) = state.tunnels.touch_data(&endpoint, packet.header().ts)
                    {
                        let ctx = context.borrow();
                        if let Some(id) = ctx.user_id {
                            packet.set_user_id(id);
                        }
                        if let Some(id) = ctx.equipment_id {
                            packet.set_equipment_id(id);
                        }
                    }
                }
                None => {
                    log::warn!(
                        "{}: unable to find node IP addresses (no. {})",
                        self.name,
                        packet.packet_number()
                    );
                }
            }
        }

        for (value, target) in &self.message_types {
            if *value == header.msg_type {
                return Verdict::Forward(*target);
            }
        }
        self.ports.forward_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::DeviceId;
    use crate::packet::CaptureHeader;
    use crate::protocols::gtp::tests::build;
    use crate::protocols::ipv4::tests::header as ip_header;
    use crate::stage::tests_support;
    use crate::store::Timestamped;
    use crate::time::TimeVal;
    use crate::tunnel::{TunnelContext, TunnelState};
    use std::net::Ipv4Addr;

    const IP_HANDLE: usize = 1;
    const GTPU_HANDLE: usize = 2;
    const INNER_IP: usize = 3;

    fn stage() -> GtpUserStage {
        let mut stages = StageMap::default();
        stages.insert("ip", StageHandle::for_tests(IP_HANDLE));
        let mut settings = toml::value::Table::new();
        settings.insert("ipStage".into(), toml::Value::String("ip".into()));
        GtpUserStage::new(
            "gtpu",
            &settings,
            Ports::new(
                None,
                vec![("255".to_string(), StageHandle::for_tests(INNER_IP))],
            ),
            StageHandle::for_tests(GTPU_HANDLE),
            &stages,
        )
        .unwrap()
    }

    fn tunnelled_packet(teid: u32) -> PacketDescriptor {
        // Outer IP from the access node to the gateway, then GTP-U.
        let gtp = build(gtp::GTP_MESSAGE_TPDU, teid, &[0u8; 24], false);
        let bytes = ip_header([10, 1, 0, 1], [10, 2, 0, 1], 17, gtp.len());
        let mut full = bytes[..20].to_vec();
        full.extend_from_slice(&gtp);

        let mut packet = PacketDescriptor::new();
        packet.load(
            CaptureHeader {
                ts: TimeVal::new(200, 0),
                caplen: full.len() as u32,
                origlen: full.len() as u32,
            },
            &full,
            7,
        );
        packet.push_layer(StageHandle::for_tests(IP_HANDLE), 20);
        packet
    }

    #[test]
    fn direction_and_ids_from_context() {
        let mut state = tests_support::state();
        let access = Ipv4Addr::new(10, 1, 0, 1);
        let gateway = Ipv4Addr::new(10, 2, 0, 1);
        state.tunnels.register_role(access, NodeRole::Access);
        state.tunnels.register_role(gateway, NodeRole::Gateway);

        let mut context = TunnelContext::new(
            TimeVal::new(100, 0),
            TunnelState::Established,
            5,
            DeviceId::from_tbcd(&[0x21, 0xf3]),
        );
        context.control.a = Some(TunnelEndpoint::new(access, 0x11));
        let context = state.tunnels.adopt(context);
        state
            .tunnels
            .register_data(TunnelEndpoint::new(gateway, 0xabcd), &context);

        let mut packet = tunnelled_packet(0xabcd);
        let verdict = stage().process_packet(&mut packet, &mut state);

        assert_eq!(verdict, Verdict::Forward(StageHandle::for_tests(INNER_IP)));
        assert_eq!(packet.direction, Direction::Uplink);
        assert_eq!(packet.user_id().unwrap().to_string(), "123");
        assert_eq!(
            context.borrow().last_activity(),
            TimeVal::new(200, 0),
            "user-plane traffic refreshes the context"
        );
    }

    #[test]
    fn unknown_nodes_leave_direction_undefined() {
        let mut state = tests_support::state();
        let mut packet = tunnelled_packet(0xabcd);
        let verdict = stage().process_packet(&mut packet, &mut state);
        assert_eq!(verdict, Verdict::Forward(StageHandle::for_tests(INNER_IP)));
        assert_eq!(packet.direction, Direction::Undefined);
        assert!(packet.user_id().is_none());
    }

    #[test]
    fn malformed_header_is_unparsed() {
        let mut state = tests_support::state();
        let mut packet = PacketDescriptor::new();
        packet.load(
            CaptureHeader {
                ts: TimeVal::new(1, 0),
                caplen: 3,
                origlen: 3,
            },
            &[0x30, 0xff, 0x00],
            1,
        );
        assert_eq!(
            stage().process_packet(&mut packet, &mut state),
            Verdict::Unparsed
        );
    }
}
