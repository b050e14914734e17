//! Compact binary per-packet log.
//!
//! One fixed-size record per packet (network byte order) followed by the
//! per-facet focus values of the packet's flow. Each file starts with a
//! NUL-terminated magic string carrying the format version.

use crate::config::params;
use crate::flow::FlowRef;
use crate::ids::{DeviceId, ID_RAW_LENGTH};
use crate::packet::{Direction, PacketDescriptor};
use crate::stage::{EngineState, Ports, Stage, StageHandle, StageMap, Verdict};

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};

use anyhow::{Context, Result};
use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};

const FILE_HEADER: &str = "Captool packet log";
const FILE_VERSION: u32 = 1;

/// The fixed part of one record plus the trailing focus values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    pub secs: u32,
    pub usecs: u32,
    pub src_ip: u32,
    pub dst_ip: u32,
    pub length: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    /// `'u'`, `'d'` or `' '`.
    pub direction: u8,
    pub user: [u8; ID_RAW_LENGTH],
    pub equipment: [u8; ID_RAW_LENGTH],
    pub focus: Vec<u16>,
}

impl PacketRecord {
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<usize> {
        writer.write_u32::<NetworkEndian>(self.secs)?;
        writer.write_u32::<NetworkEndian>(self.usecs)?;
        writer.write_u32::<NetworkEndian>(self.src_ip)?;
        writer.write_u32::<NetworkEndian>(self.dst_ip)?;
        writer.write_u32::<NetworkEndian>(self.length)?;
        writer.write_u16::<NetworkEndian>(self.src_port)?;
        writer.write_u16::<NetworkEndian>(self.dst_port)?;
        writer.write_u8(self.protocol)?;
        writer.write_u8(self.direction)?;
        writer.write_all(&self.user)?;
        writer.write_all(&self.equipment)?;
        writer.write_u8(self.focus.len() as u8)?;
        for value in &self.focus {
            writer.write_u16::<NetworkEndian>(*value)?;
        }
        Ok(27 + 2 * ID_RAW_LENGTH + 2 * self.focus.len())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<PacketRecord> {
        let mut record = PacketRecord {
            secs: reader.read_u32::<NetworkEndian>()?,
            usecs: reader.read_u32::<NetworkEndian>()?,
            src_ip: reader.read_u32::<NetworkEndian>()?,
            dst_ip: reader.read_u32::<NetworkEndian>()?,
            length: reader.read_u32::<NetworkEndian>()?,
            src_port: reader.read_u16::<NetworkEndian>()?,
            dst_port: reader.read_u16::<NetworkEndian>()?,
            protocol: reader.read_u8()?,
            direction: reader.read_u8()?,
            user: [0; ID_RAW_LENGTH],
            equipment: [0; ID_RAW_LENGTH],
            focus: Vec::new(),
        };
        reader.read_exact(&mut record.user)?;
        reader.read_exact(&mut record.equipment)?;
        let facets = reader.read_u8()?;
        for _ in 0..facets {
            record.focus.push(reader.read_u16::<NetworkEndian>()?);
        }
        Ok(record)
    }
}

fn id_field(id: Option<&DeviceId>) -> [u8; ID_RAW_LENGTH] {
    let mut field = [0u8; ID_RAW_LENGTH];
    if let Some(id) = id {
        let raw = id.raw();
        let n = raw.len().min(ID_RAW_LENGTH);
        field[..n].copy_from_slice(&raw[..n]);
    }
    field
}

pub struct PacketLogStage {
    name: String,
    ports: Ports,
    base_stage: Option<StageHandle>,
    writer: Option<BufWriter<File>>,
    file_prefix: String,
    file_postfix: String,
    current_file_size: u64,
    max_file_size: u64,
    output_enabled: bool,
    anonymize: bool,
}

impl PacketLogStage {
    pub fn new(
        name: &str,
        settings: &toml::value::Table,
        ports: Ports,
        stages: &StageMap,
        anonymize: bool,
    ) -> Result<Self> {
        let file_prefix = params::str(settings, "filePrefix")
            .ok_or_else(|| anyhow::anyhow!("{}: filePrefix not set", name))?
            .to_string();
        let file_postfix = params::str(settings, "filePostfix")
            .ok_or_else(|| anyhow::anyhow!("{}: filePostfix not set", name))?
            .to_string();
        let base_stage = match params::str(settings, "baseStage") {
            Some(base) => Some(
                stages
                    .require(base)
                    .with_context(|| format!("{}: baseStage", name))?,
            ),
            None => None,
        };
        let mut stage = PacketLogStage {
            name: name.to_string(),
            ports,
            base_stage,
            writer: None,
            file_prefix,
            file_postfix,
            current_file_size: 0,
            max_file_size: params::u64(settings, "maxFileSize").unwrap_or(1 << 27),
            output_enabled: true,
            anonymize,
        };
        stage.apply_settings(settings);
        Ok(stage)
    }

    fn apply_settings(&mut self, settings: &toml::value::Table) {
        if let Some(enabled) = params::bool(settings, "outputEnabled") {
            self.output_enabled = enabled;
            log::info!(
                "{}: output {}",
                self.name,
                if enabled { "enabled" } else { "disabled" }
            );
        }
        if let Some(size) = params::u64(settings, "maxFileSize") {
            self.max_file_size = size;
        }
    }

    fn record_for(&self, packet: &PacketDescriptor, flow: Option<&FlowRef>, facets: usize) -> PacketRecord {
        let id = packet.flow_id();
        let mut src_ip = u32::from(id.src_addr());
        let mut dst_ip = u32::from(id.dst_addr());
        let direction = match packet.direction {
            Direction::Uplink => b'u',
            Direction::Downlink => b'd',
            Direction::Undefined => b' ',
        };
        if self.anonymize {
            // Truncate the subscriber side to /16.
            if packet.direction != Direction::Downlink {
                src_ip &= 0xffff0000;
            }
            if packet.direction != Direction::Uplink {
                dst_ip &= 0xffff0000;
            }
        }
        let length = match self.base_stage {
            Some(base) => packet.segment_total_len(base),
            None => packet.header().origlen,
        };
        let focus = match flow {
            Some(flow) => {
                let flow = flow.borrow();
                (1..=facets as u32).map(|f| flow.tags().get_tag(f) as u16).collect()
            }
            None => Vec::new(),
        };
        PacketRecord {
            secs: packet.header().ts.sec as u32,
            usecs: packet.header().ts.usec as u32,
            src_ip,
            dst_ip,
            length,
            src_port: id.src_port(),
            dst_port: id.dst_port(),
            protocol: id.protocol(),
            direction,
            user: id_field(packet.user_id()),
            equipment: id_field(packet.equipment_id()),
            focus,
        }
    }
}

impl Stage for PacketLogStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_packet(&mut self, packet: &mut PacketDescriptor, state: &mut EngineState) -> Verdict {
        if !self.output_enabled {
            return self.ports.forward_default();
        }
        if !packet.flow_id().is_set() {
            return self.ports.forward_default();
        }

        let facets = state.metadata.facets().len();
        let record = self.record_for(packet, packet.flow(), facets);
        if let Some(writer) = self.writer.as_mut() {
            match record.write_to(writer) {
                Ok(written) => {
                    self.current_file_size += written as u64;
                    if self.max_file_size > 0 && self.current_file_size >= self.max_file_size {
                        state.rotate = true;
                    }
                }
                Err(e) => {
                    log::error!("{}: writing packet log failed: {}", self.name, e);
                    state.stop = true;
                }
            }
        }
        self.ports.forward_default()
    }

    fn configure(&mut self, settings: &toml::value::Table) {
        self.apply_settings(settings);
    }

    fn open_new_files(&mut self, state: &mut EngineState) {
        if !self.output_enabled {
            return;
        }
        match state.files.open(&self.file_prefix, &self.file_postfix) {
            Ok(mut writer) => {
                let magic = format!("{} {}\0", FILE_HEADER, FILE_VERSION);
                if let Err(e) = writer.write_all(magic.as_bytes()) {
                    log::error!("{}: {}", self.name, e);
                    state.stop = true;
                    return;
                }
                self.current_file_size = magic.len() as u64;
                self.writer = Some(writer);
            }
            Err(e) => {
                log::error!("{}: {:#}", self.name, e);
                state.stop = true;
            }
        }
    }

    fn drain(&mut self, _: &mut EngineState) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::Ipv4Addr;

    #[test]
    fn record_round_trip() {
        let record = PacketRecord {
            secs: 100,
            usecs: 200_000,
            src_ip: u32::from(Ipv4Addr::new(10, 0, 0, 1)),
            dst_ip: u32::from(Ipv4Addr::new(8, 8, 8, 8)),
            length: 70,
            src_port: 1000,
            dst_port: 53,
            protocol: 17,
            direction: b'u',
            user: [0x21, 0x43, 0x65, 0x87, 0x09, 0xf1, 0xff, 0xff],
            equipment: [0; ID_RAW_LENGTH],
            focus: vec![3, 0, 7],
        };

        let mut buf = Vec::new();
        let written = record.write_to(&mut buf).unwrap();
        assert_eq!(written, buf.len());
        // Fixed part: 5*u32 + 2*u16 + 2*u8 + 2*8 id bytes + facet count.
        assert_eq!(buf.len(), 43 + 2 * record.focus.len());

        let decoded = PacketRecord::read_from(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn network_byte_order_on_the_wire() {
        let record = PacketRecord {
            secs: 0x01020304,
            usecs: 0,
            src_ip: 0,
            dst_ip: 0,
            length: 0,
            src_port: 0xabcd,
            dst_port: 0,
            protocol: 6,
            direction: b'd',
            user: [0; ID_RAW_LENGTH],
            equipment: [0; ID_RAW_LENGTH],
            focus: vec![],
        };
        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();
        assert_eq!(&buf[0..4], &[1, 2, 3, 4]);
        assert_eq!(&buf[20..22], &[0xab, 0xcd]);
    }
}
