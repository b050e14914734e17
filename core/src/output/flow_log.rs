//! The flow table stage.
//!
//! Owns the time-sorted flow store: every packet with a complete flow
//! identifier lands in a flow record here, and records expire into the
//! flow-level stage chain when their inactivity timeout fires. The stage is
//! also the terminal emitter of the chain, writing one pipe-delimited line
//! per finished flow.
//!
//! Two accounting policies exist, selected by the stage type:
//! `FlowOutput` treats the initiator of a flow as its uplink side and keys
//! the table symmetrically; `FlowOutputStrict` relies on the packet
//! direction established upstream (gateway MACs or tunnel roles), keys the
//! table directionally with the subscriber first, and drops packets whose
//! direction never became known.

use crate::config::params;
use crate::flow::{Flow, FlowId, FlowKey, FlowRef};
use crate::classify::metadata::ClassificationMetadata;
use crate::packet::{Direction, PacketDescriptor};
use crate::stage::{EngineState, ExpiredFlow, Ports, Stage, StageHandle, StageMap, Verdict};
use crate::store::TimeSortedMap;

use std::cell::RefCell;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};

/// Option names for payload bytes stored in the flow log.
const OPTION_UPLINK_BYTES: &str = "uplink-bytes";
const OPTION_DOWNLINK_BYTES: &str = "downlink-bytes";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowPolicy {
    /// The sender of the first packet is the uplink side; endpoint order is
    /// irrelevant for the table key.
    Initiator,
    /// The packet direction decides; the subscriber side is kept first in
    /// the key and direction-less packets are dropped.
    Subscriber,
}

pub struct FlowStage {
    name: String,
    handle: StageHandle,
    ports: Ports,
    policy: FlowPolicy,
    metadata: std::sync::Arc<ClassificationMetadata>,
    flows: TimeSortedMap<FlowKey, FlowRef>,
    /// Stage whose layer defines the counted packet length; the capture
    /// length is used when unset.
    base_stage: Option<StageHandle>,
    /// Root of the flow-level chain run for each expired flow.
    first_flow_stage: Option<StageHandle>,
    writer: Option<BufWriter<File>>,
    file_prefix: String,
    file_postfix: String,
    current_file_size: u64,
    max_file_size: u64,
    output_enabled: bool,
    detailed_statistics: bool,
    print_hints: bool,
    /// Store the first N payload bytes per flow, hex-encoded, as options.
    store_bytes: usize,
    total_bytes: u64,
    dropped_bytes: u64,
    user_identified_bytes: u64,
    equipment_identified_bytes: u64,
    flows_written: u64,
}

impl FlowStage {
    pub fn new(
        name: &str,
        settings: &toml::value::Table,
        ports: Ports,
        handle: StageHandle,
        stages: &StageMap,
        policy: FlowPolicy,
        metadata: &std::sync::Arc<ClassificationMetadata>,
    ) -> Result<Self> {
        let file_prefix = params::str(settings, "filePrefix")
            .ok_or_else(|| anyhow!("{}: filePrefix not set", name))?
            .to_string();
        let file_postfix = params::str(settings, "filePostfix")
            .ok_or_else(|| anyhow!("{}: filePostfix not set", name))?
            .to_string();

        let base_stage = match params::str(settings, "baseStage") {
            Some(base) => Some(
                stages
                    .require(base)
                    .with_context(|| format!("{}: baseStage", name))?,
            ),
            None => {
                log::warn!("{}: baseStage not set, counting captured length", name);
                None
            }
        };
        let first_flow_stage = match params::str(settings, "firstFlowStage") {
            Some(first) => Some(
                stages
                    .require(first)
                    .with_context(|| format!("{}: firstFlowStage", name))?,
            ),
            None => None,
        };

        let mut stage = FlowStage {
            name: name.to_string(),
            handle,
            ports,
            policy,
            metadata: std::sync::Arc::clone(metadata),
            flows: TimeSortedMap::new(),
            base_stage,
            first_flow_stage,
            writer: None,
            file_prefix,
            file_postfix,
            current_file_size: 0,
            max_file_size: params::u64(settings, "maxFileSize").unwrap_or(1 << 27),
            output_enabled: true,
            detailed_statistics: params::bool(settings, "detailedStatistics").unwrap_or(false),
            print_hints: false,
            store_bytes: 0,
            total_bytes: 0,
            dropped_bytes: 0,
            user_identified_bytes: 0,
            equipment_identified_bytes: 0,
            flows_written: 0,
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
        if let Some(timeout) = params::u64(settings, "flowTimeout") {
            self.flows.set_timeout(timeout);
            log::info!("{}: using flow timeout {}s", self.name, timeout);
        }
        if let Some(print) = params::bool(settings, "printHints") {
            self.print_hints = print;
        }
        if let Some(bytes) = params::usize(settings, "storeBytes") {
            self.store_bytes = bytes;
            if bytes > 0 {
                log::info!(
                    "{}: storing first {} payload bytes for each flow",
                    self.name,
                    bytes
                );
            }
        }
        if let Some(size) = params::u64(settings, "maxFileSize") {
            self.max_file_size = size;
        }
    }

    /// Hex-encodes the first payload bytes into per-direction options until
    /// the configured budget is spent.
    fn store_payload_bytes(&self, flow: &mut Flow, payload: &[u8], uplink: bool) {
        let stored = flow.options().get(OPTION_UPLINK_BYTES).map_or(0, str::len)
            + flow.options().get(OPTION_DOWNLINK_BYTES).map_or(0, str::len);
        // Two characters per stored byte.
        if stored >= 2 * self.store_bytes {
            return;
        }
        let budget = self.store_bytes - stored / 2;
        let take = budget.min(payload.len());
        if take == 0 {
            return;
        }
        let mut hex = String::with_capacity(take * 2);
        for byte in &payload[..take] {
            let _ = write!(hex, "{:02x}", byte);
        }
        let option = if uplink {
            OPTION_UPLINK_BYTES
        } else {
            OPTION_DOWNLINK_BYTES
        };
        flow.options_mut().register(option, &hex, true, true, "");
    }

    /// One flow-log line; the column layout matches the header comment
    /// written at the top of each file.
    fn format_flow_line(&self, flow: &Flow) -> String {
        let id = flow.id();
        let mut line = format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            flow.first_packet(),
            flow.last_packet(),
            id.transport_name(),
            id.src_addr(),
            id.src_port(),
            id.dst_addr(),
            id.dst_port(),
            flow.upload_packets(),
            flow.download_packets(),
            flow.upload_bytes(),
            flow.download_bytes(),
        );
        if self.detailed_statistics {
            match flow.statistics() {
                Some(stats) => {
                    let _ = write!(line, "|{}", stats);
                }
                None => line.push_str("|0|0|0|0|0|0|0|0"),
            }
        }
        let _ = write!(
            line,
            "|{}|{}|{}",
            flow.user_id().map_or_else(|| "na".to_string(), |id| id.to_string()),
            flow.equipment_id()
                .map_or_else(|| "na".to_string(), |id| id.to_string()),
            flow.tags().render(),
        );
        if self.print_hints {
            line.push_str(&flow.hints().render(&self.metadata));
        }
        line.push_str(&flow.options().render());
        line.push('\n');
        line
    }

    fn write_header_line(&mut self) {
        let stats_columns = if self.detailed_statistics {
            "|avgPktSizeUL|avgPktSizeDL|devPktSizeUL|devPktSizeDL|avgPktIatUL|avgPktIatDL|devPktIatUL|devPktIatDL"
        } else {
            ""
        };
        let (first, second) = match self.policy {
            FlowPolicy::Initiator => ("initiator", "responder"),
            FlowPolicy::Subscriber => ("subscriber", "peer"),
        };
        let header = format!(
            "# start|end|transport|{first}_IP|{first}_port|{second}_IP|{second}_port|packets_sent|packets_received|bytes_sent|bytes_received{stats}|user_ID|equipment_ID|classification_tags|options...\n",
            first = first,
            second = second,
            stats = stats_columns,
        );
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.write_all(header.as_bytes());
            self.current_file_size += header.len() as u64;
        }
    }

    fn key_for(&self, id: FlowId) -> FlowKey {
        match self.policy {
            FlowPolicy::Initiator => FlowKey::symmetric(id),
            FlowPolicy::Subscriber => FlowKey::directional(id),
        }
    }
}

impl Stage for FlowStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_packet(&mut self, packet: &mut PacketDescriptor, state: &mut EngineState) -> Verdict {
        let mut id = *packet.flow_id();
        if !id.is_set() {
            return self.ports.forward_default();
        }

        let length = match self.base_stage {
            Some(base) => packet.segment_total_len(base) as u64,
            None => packet.header().origlen as u64,
        };
        let ts = packet.header().ts;
        self.total_bytes += length;

        // Expire idle flows against the packet clock before updating.
        let chain = self.first_flow_stage;
        let emitter = self.handle;
        self.flows.cleanup(Some(ts), |flow| {
            state.expired.push(ExpiredFlow {
                flow,
                chain,
                emitter,
            })
        });

        let uplink = match self.policy {
            FlowPolicy::Subscriber => match packet.direction {
                Direction::Uplink => true,
                Direction::Downlink => {
                    id.swap();
                    false
                }
                Direction::Undefined => {
                    // No gateway or tunnel ever identified this packet's
                    // orientation; subscriber accounting cannot place it.
                    self.dropped_bytes += length;
                    log::info!(
                        "{}: direction of packet no. {} cannot be determined, dropping packet",
                        self.name,
                        packet.packet_number()
                    );
                    return Verdict::Drop;
                }
            },
            FlowPolicy::Initiator => true, // fixed up after the table lookup
        };

        let key = self.key_for(id);
        let flow = match self.flows.get(&key) {
            Some(flow) => Rc::clone(flow),
            None => {
                let mut flow = Flow::new(id, std::sync::Arc::clone(&self.metadata));
                if self.detailed_statistics {
                    flow.enable_detailed_statistics();
                }
                let flow = Rc::new(RefCell::new(flow));
                self.flows.insert(key, Rc::clone(&flow));
                flow
            }
        };

        {
            let mut f = flow.borrow_mut();
            let uplink = match self.policy {
                FlowPolicy::Subscriber => uplink,
                // The stored identifier keeps the initiator first.
                FlowPolicy::Initiator => f.id().is_source(id.src_addr(), id.src_port()),
            };
            f.packet(ts, uplink, length);
            packet.set_flow_number(f.packets_number());
            if self.store_bytes > 0 {
                self.store_payload_bytes(&mut f, packet.payload(), uplink);
            }
            if f.packets_number() == 1 {
                if let Some(user) = packet.user_id() {
                    f.set_user_id(*user);
                }
                if let Some(equipment) = packet.equipment_id() {
                    f.set_equipment_id(*equipment);
                }
            }
        }
        self.flows.move_to_end(&key);
        packet.set_flow(flow);

        if packet.user_id().is_some() {
            self.user_identified_bytes += length;
        }
        if packet.equipment_id().is_some() {
            self.equipment_identified_bytes += length;
        }

        self.ports.forward_default()
    }

    /// Terminal emitter of the flow chain.
    fn process_flow(&mut self, flow: &FlowRef, state: &mut EngineState) -> Verdict {
        if !self.output_enabled {
            return Verdict::Drop;
        }
        let line = self.format_flow_line(&flow.borrow());
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.write_all(line.as_bytes()) {
                log::error!("{}: writing flow log failed: {}", self.name, e);
                state.stop = true;
                return Verdict::Drop;
            }
            self.flows_written += 1;
            self.current_file_size += line.len() as u64;
            if self.max_file_size > 0 && self.current_file_size >= self.max_file_size {
                state.rotate = true;
            }
        }
        Verdict::Drop
    }

    fn configure(&mut self, settings: &toml::value::Table) {
        self.apply_settings(settings);
    }

    fn get_status(&mut self, _: &EngineState, _: u64, _: u64) -> String {
        let percent = |part: u64| {
            if self.total_bytes == 0 {
                0.0
            } else {
                part as f64 * 100.0 / self.total_bytes as f64
            }
        };
        let status = format!(
            "{} active flows, {} written, {} bytes processed during period, {:.1}% dropped, {:.1}% with user ID, {:.1}% with equipment ID",
            self.flows.len(),
            self.flows_written,
            self.total_bytes,
            percent(self.dropped_bytes),
            percent(self.user_identified_bytes),
            percent(self.equipment_identified_bytes),
        );
        self.total_bytes = 0;
        self.dropped_bytes = 0;
        self.user_identified_bytes = 0;
        self.equipment_identified_bytes = 0;
        status
    }

    fn open_new_files(&mut self, state: &mut EngineState) {
        if !self.output_enabled {
            return;
        }
        match state.files.open(&self.file_prefix, &self.file_postfix) {
            Ok(writer) => {
                self.writer = Some(writer);
                self.current_file_size = 0;
                self.write_header_line();
            }
            Err(e) => {
                log::error!("{}: {:#}", self.name, e);
                state.stop = true;
            }
        }
    }

    fn drain(&mut self, state: &mut EngineState) {
        let chain = self.first_flow_stage;
        let emitter = self.handle;
        self.flows.cleanup(None, |flow| {
            state.expired.push(ExpiredFlow {
                flow,
                chain,
                emitter,
            })
        });
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}
