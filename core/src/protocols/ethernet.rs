//! Ethernet link stage.
//!
//! Peels the Ethernet header (skipping any VLAN tags) and routes by
//! EtherType through numeric ports. Optionally a list of gateway MAC
//! addresses orients the traffic: frames addressed to a gateway are uplink,
//! frames sourced by one are downlink. The subscriber-side MAC can be
//! stamped as the equipment identifier where no control-plane signalling is
//! available.

use crate::config::params;
use crate::ids::{parse_mac, DeviceId};
use crate::packet::{Direction, PacketDescriptor};
use crate::protocols::be_u16;
use crate::stage::{EngineState, Ports, Stage, StageHandle, Verdict};

use std::collections::HashSet;
use std::fs;

use anyhow::{Context, Result};

const MAC_LEN: usize = 6;
const ETHERNET_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const ETHERTYPE_VLAN: u16 = 0x8100;

pub struct EthernetStage {
    name: String,
    handle: StageHandle,
    ports: Ports,
    ethertypes: Vec<(u16, StageHandle)>,
    gateway_macs: HashSet<[u8; MAC_LEN]>,
    set_equipment_id: bool,
}

impl EthernetStage {
    pub fn new(
        name: &str,
        settings: &toml::value::Table,
        ports: Ports,
        handle: StageHandle,
    ) -> Result<Self> {
        let ethertypes = ports
            .numeric()
            .with_context(|| format!("{}: connections", name))?
            .into_iter()
            .map(|(value, target)| (value as u16, target))
            .collect();

        let mut gateway_macs = HashSet::new();
        if let Some(path) = params::str(settings, "gatewayAddressFile") {
            let text = fs::read_to_string(path)
                .with_context(|| format!("{}: reading gateway address file {}", name, path))?;
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                match parse_mac(line) {
                    Some(mac) => {
                        gateway_macs.insert(mac);
                    }
                    None => log::warn!("{}: ignoring malformed gateway MAC \"{}\"", name, line),
                }
            }
            log::info!(
                "{}: using {} gateway MACs to determine traffic direction",
                name,
                gateway_macs.len()
            );
        }

        Ok(EthernetStage {
            name: name.to_string(),
            handle,
            ports,
            ethertypes,
            gateway_macs,
            set_equipment_id: params::bool(settings, "setEquipmentId").unwrap_or(false),
        })
    }
}

impl Stage for EthernetStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_packet(&mut self, packet: &mut PacketDescriptor, _: &mut EngineState) -> Verdict {
        let payload = packet.payload();
        if payload.len() < ETHERNET_HEADER_LEN {
            log::info!(
                "{}: payload too short for an Ethernet header, dropping packet (no. {})",
                self.name,
                packet.packet_number()
            );
            return Verdict::Unparsed;
        }

        let dst_mac: [u8; MAC_LEN] = payload[0..MAC_LEN].try_into().unwrap();
        let src_mac: [u8; MAC_LEN] = payload[MAC_LEN..2 * MAC_LEN].try_into().unwrap();

        let mut header_len = ETHERNET_HEADER_LEN;
        let mut ethertype = be_u16(payload, 12);
        while ethertype == ETHERTYPE_VLAN {
            if payload.len() < header_len + VLAN_TAG_LEN {
                log::info!(
                    "{}: truncated VLAN tag, dropping packet (no. {})",
                    self.name,
                    packet.packet_number()
                );
                return Verdict::Unparsed;
            }
            ethertype = be_u16(payload, header_len + 2);
            header_len += VLAN_TAG_LEN;
        }

        if !self.gateway_macs.is_empty() {
            let to_gateway = self.gateway_macs.contains(&dst_mac);
            let from_gateway = self.gateway_macs.contains(&src_mac);
            match (to_gateway, from_gateway) {
                (true, false) => packet.direction = Direction::Uplink,
                (false, true) => packet.direction = Direction::Downlink,
                _ => {}
            }
            if self.set_equipment_id {
                let subscriber_mac = match packet.direction {
                    Direction::Uplink => Some(src_mac),
                    Direction::Downlink => Some(dst_mac),
                    Direction::Undefined => None,
                };
                if let Some(mac) = subscriber_mac.and_then(|m| DeviceId::from_mac(&m)) {
                    packet.set_equipment_id(mac);
                }
            }
        }

        packet.push_layer(self.handle, header_len);

        for (value, target) in &self.ethertypes {
            if *value == ethertype {
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
    use crate::time::TimeVal;

    fn frame(ethertype: u16, vlan: bool) -> Vec<u8> {
        let mut bytes = vec![];
        bytes.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]); // dst
        bytes.extend_from_slice(&[0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb]); // src
        if vlan {
            bytes.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
            bytes.extend_from_slice(&[0x00, 0x64]); // VLAN 100
        }
        bytes.extend_from_slice(&ethertype.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 20]);
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

    fn stage(ports: Ports) -> EthernetStage {
        EthernetStage::new("eth", &toml::value::Table::new(), ports, StageHandle::for_tests(0))
            .unwrap()
    }

    #[test]
    fn routes_by_ethertype() {
        let ip = StageHandle::for_tests(1);
        let mut eth = stage(Ports::new(None, vec![("0x0800".to_string(), ip)]));
        let mut packet = PacketDescriptor::new();

        load(&mut packet, &frame(0x0800, false));
        assert_eq!(eth.process_packet(&mut packet, &mut test_state()), Verdict::Forward(ip));
        assert_eq!(packet.payload().len(), 20);

        load(&mut packet, &frame(0x0806, false));
        assert_eq!(eth.process_packet(&mut packet, &mut test_state()), Verdict::Drop);
    }

    #[test]
    fn vlan_tags_are_skipped() {
        let ip = StageHandle::for_tests(1);
        let mut eth = stage(Ports::new(None, vec![("2048".to_string(), ip)]));
        let mut packet = PacketDescriptor::new();
        load(&mut packet, &frame(0x0800, true));
        assert_eq!(eth.process_packet(&mut packet, &mut test_state()), Verdict::Forward(ip));
        assert_eq!(
            packet.segment(StageHandle::for_tests(0)).unwrap().len(),
            ETHERNET_HEADER_LEN + VLAN_TAG_LEN
        );
    }

    #[test]
    fn gateway_macs_orient_traffic() {
        let mut eth = stage(Ports::new(None, vec![]));
        eth.gateway_macs.insert([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        eth.set_equipment_id = true;

        let mut packet = PacketDescriptor::new();
        load(&mut packet, &frame(0x0800, false));
        eth.process_packet(&mut packet, &mut test_state());
        assert_eq!(packet.direction, Direction::Uplink);
        assert_eq!(
            packet.equipment_id().unwrap().to_string(),
            "66:77:88:99:aa:bb"
        );
    }

    fn test_state() -> EngineState {
        crate::stage::tests_support::state()
    }
}
