//! Pcap dump stage.
//!
//! Writes the packets it sees to a rolling pcap file. The dump can start at
//! a configured base layer (e.g. the inner IP header of tunnelled traffic),
//! be truncated to a snap length, and have upper-layer length fields fixed
//! up so standard tools accept the shortened packets.

use crate::config::params;
use crate::packet::PacketDescriptor;
use crate::stage::{EngineState, Ports, Stage, StageHandle, StageMap, Verdict};

use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};

const PCAP_MAGIC: u32 = 0xa1b2c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;

/// Link types of the pcap file header.
const DLT_EN10MB: u32 = 1;
const DLT_RAW: u32 = 101;

pub struct PcapDumpStage {
    name: String,
    ports: Ports,
    base_stage: Option<StageHandle>,
    snap_length: usize,
    fix_headers: bool,
    datalink: u32,
    writer: Option<BufWriter<File>>,
    file_prefix: String,
    file_postfix: String,
    current_file_size: u64,
    max_file_size: u64,
    output_enabled: bool,
}

impl PcapDumpStage {
    pub fn new(
        name: &str,
        settings: &toml::value::Table,
        ports: Ports,
        stages: &StageMap,
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
        // Dumps starting above the link layer carry raw IP.
        let datalink = match params::str(settings, "datalink") {
            Some("raw") => DLT_RAW,
            Some("ethernet") | None => {
                if base_stage.is_some() {
                    DLT_RAW
                } else {
                    DLT_EN10MB
                }
            }
            Some(other) => anyhow::bail!("{}: unknown datalink \"{}\"", name, other),
        };

        Ok(PcapDumpStage {
            name: name.to_string(),
            ports,
            base_stage,
            snap_length: params::usize(settings, "snapLength").unwrap_or(0),
            fix_headers: params::bool(settings, "fixHeaders").unwrap_or(false),
            datalink,
            writer: None,
            file_prefix,
            file_postfix,
            current_file_size: 0,
            max_file_size: params::u64(settings, "maxFileSize").unwrap_or(1 << 27),
            output_enabled: true,
        })
    }

    fn write_file_header(writer: &mut BufWriter<File>, datalink: u32) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(PCAP_MAGIC)?;
        writer.write_u16::<LittleEndian>(PCAP_VERSION_MAJOR)?;
        writer.write_u16::<LittleEndian>(PCAP_VERSION_MINOR)?;
        writer.write_u32::<LittleEndian>(0)?; // thiszone
        writer.write_u32::<LittleEndian>(0)?; // sigfigs
        writer.write_u32::<LittleEndian>(65535)?; // snaplen
        writer.write_u32::<LittleEndian>(datalink)
    }
}

impl Stage for PcapDumpStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_packet(&mut self, packet: &mut PacketDescriptor, state: &mut EngineState) -> Verdict {
        if !self.output_enabled || self.writer.is_none() {
            return self.ports.forward_default();
        }

        let Some((bytes, header)) =
            packet.to_byte_array(self.base_stage, self.snap_length, self.fix_headers)
        else {
            // The base layer is not on this packet's stack.
            return self.ports.forward_default();
        };

        let writer = self.writer.as_mut().expect("checked above");
        let result = writer
            .write_u32::<LittleEndian>(header.ts.sec as u32)
            .and_then(|_| writer.write_u32::<LittleEndian>(header.ts.usec as u32))
            .and_then(|_| writer.write_u32::<LittleEndian>(header.caplen))
            .and_then(|_| writer.write_u32::<LittleEndian>(header.origlen))
            .and_then(|_| writer.write_all(bytes));
        match result {
            Ok(()) => {
                self.current_file_size += 16 + bytes.len() as u64;
                if self.max_file_size > 0 && self.current_file_size >= self.max_file_size {
                    state.rotate = true;
                }
            }
            Err(e) => {
                log::error!("{}: writing pcap dump failed: {}", self.name, e);
                state.stop = true;
            }
        }
        self.ports.forward_default()
    }

    fn configure(&mut self, settings: &toml::value::Table) {
        if let Some(enabled) = params::bool(settings, "outputEnabled") {
            self.output_enabled = enabled;
        }
        if let Some(size) = params::u64(settings, "maxFileSize") {
            self.max_file_size = size;
        }
        if let Some(snap) = params::usize(settings, "snapLength") {
            self.snap_length = snap;
        }
    }

    fn open_new_files(&mut self, state: &mut EngineState) {
        if !self.output_enabled {
            return;
        }
        match state.files.open(&self.file_prefix, &self.file_postfix) {
            Ok(mut writer) => match Self::write_file_header(&mut writer, self.datalink) {
                Ok(()) => {
                    self.current_file_size = 24;
                    self.writer = Some(writer);
                }
                Err(e) => {
                    log::error!("{}: {}", self.name, e);
                    state.stop = true;
                }
            },
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
