//! The processing-stage abstraction.
//!
//! A stage is a node of the packet-processing graph. It consumes the packet
//! descriptor, may peel a layer or update engine state, and names the next
//! stage through its verdict. Stages are created from the configuration,
//! addressed by dense handles, and wired through named output ports.

use crate::classify::metadata::ClassificationMetadata;
use crate::flow::FlowRef;
use crate::output::files::FileManager;
use crate::packet::PacketDescriptor;
use crate::time::TimeVal;
use crate::tunnel::TunnelTable;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

/// Dense index of a stage within the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageHandle(pub(crate) usize);

impl StageHandle {
    pub fn index(&self) -> usize {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn for_tests(index: usize) -> Self {
        StageHandle(index)
    }
}

/// Outcome of a stage's processing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Hand the packet (or flow) to the given stage.
    Forward(StageHandle),
    /// End of the walk: the stage consumed or deliberately dropped it.
    Drop,
    /// The stage could not parse its layer; the packet is dropped.
    Unparsed,
}

/// Name of the reserved default port.
pub const DEFAULT_PORT: &str = "default";

/// A stage's wired output ports.
#[derive(Debug, Default, Clone)]
pub struct Ports {
    default: Option<StageHandle>,
    named: Vec<(String, StageHandle)>,
}

impl Ports {
    pub fn new(default: Option<StageHandle>, named: Vec<(String, StageHandle)>) -> Self {
        Ports { default, named }
    }

    pub fn default_port(&self) -> Option<StageHandle> {
        self.default
    }

    /// The verdict for "continue on the default port": stages without a
    /// wired default end the walk.
    pub fn forward_default(&self) -> Verdict {
        match self.default {
            Some(handle) => Verdict::Forward(handle),
            None => Verdict::Drop,
        }
    }

    pub fn named(&self, name: &str) -> Option<StageHandle> {
        self.named
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, handle)| *handle)
    }

    /// All non-default ports interpreted as numbers (decimal or 0x-prefixed
    /// hex). Fatal when a port name does not parse: these stages route by
    /// protocol/port/message-type value.
    pub fn numeric(&self) -> Result<Vec<(u64, StageHandle)>> {
        self.named
            .iter()
            .map(|(name, handle)| {
                let value = parse_number(name)
                    .ok_or_else(|| anyhow!("connection name \"{}\" is not a number", name))?;
                Ok((value, *handle))
            })
            .collect()
    }

    /// Validates that every non-default port belongs to `allowed`.
    pub fn expect_only(&self, allowed: &[&str]) -> Result<()> {
        for (name, _) in &self.named {
            if !allowed.contains(&name.as_str()) {
                return Err(anyhow!(
                    "connection name must be one of {:?} (or default), got \"{}\"",
                    allowed,
                    name
                ));
            }
        }
        Ok(())
    }
}

pub(crate) fn parse_number(text: &str) -> Option<u64> {
    if let Some(hex) = text.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

/// Stage-name to handle map used while constructing stages that reference
/// collaborators beyond their ports (e.g. the GTP stages naming their outer
/// IP stage).
#[derive(Debug, Default, Clone)]
pub struct StageMap {
    names: HashMap<String, StageHandle>,
}

impl StageMap {
    pub fn insert(&mut self, name: &str, handle: StageHandle) {
        self.names.insert(name.to_string(), handle);
    }

    pub fn resolve(&self, name: &str) -> Option<StageHandle> {
        self.names.get(name).copied()
    }

    pub fn require(&self, name: &str) -> Result<StageHandle> {
        self.resolve(name)
            .with_context(|| format!("cannot find stage \"{}\"", name))
    }
}

/// A flow evicted from a flow table, waiting for the flow-level stage chain.
pub struct ExpiredFlow {
    pub flow: FlowRef,
    /// First stage of the flow chain; `None` runs the emitter directly.
    pub chain: Option<StageHandle>,
    /// The owning flow stage; emits the record after the chain completes.
    pub emitter: StageHandle,
}

/// Engine-plane state shared by the stages of the data-plane thread.
pub struct EngineState {
    pub metadata: Arc<ClassificationMetadata>,
    pub tunnels: TunnelTable,
    pub files: FileManager,
    /// Flows evicted during the current packet, drained by the dispatcher.
    pub expired: Vec<ExpiredFlow>,
    /// Capture time, maintained by the source stage.
    pub current_time: TimeVal,
    /// Set by the source on end-of-stream and by fatal resource errors.
    pub stop: bool,
    /// Set by output stages that reached their size target.
    pub rotate: bool,
}

impl EngineState {
    pub fn new(metadata: Arc<ClassificationMetadata>, files: FileManager) -> Self {
        EngineState {
            metadata,
            tunnels: TunnelTable::new(),
            files,
            expired: Vec::new(),
            current_time: TimeVal::default(),
            stop: false,
            rotate: false,
        }
    }
}

/// A node of the processing graph.
///
/// The packet path is mandatory; the flow path, runtime configuration,
/// status reporting and output-file handling are optional capabilities.
pub trait Stage {
    fn name(&self) -> &str;

    fn process_packet(&mut self, packet: &mut PacketDescriptor, state: &mut EngineState)
        -> Verdict;

    /// Processes a flow evicted from a flow table. Stages without flow-level
    /// behaviour end the chain.
    fn process_flow(&mut self, _flow: &FlowRef, _state: &mut EngineState) -> Verdict {
        Verdict::Drop
    }

    /// Applies a runtime configuration group received on the control socket.
    fn configure(&mut self, _settings: &toml::value::Table) {
        log::warn!("{}: stage does not accept runtime configuration", self.name());
    }

    /// One-line status for the periodic status log.
    fn get_status(&mut self, _state: &EngineState, _runtime_secs: u64, _period_secs: u64) -> String {
        "OK".to_string()
    }

    /// Reopens output files after a rollover.
    fn open_new_files(&mut self, _state: &mut EngineState) {}

    /// Flushes remaining state at shutdown (evict all flows, log all
    /// contexts).
    fn drain(&mut self, _state: &mut EngineState) {}
}

/// The null sink: wired as the target of connections that deliberately end
/// the packet walk.
pub struct NullStage {
    name: String,
}

impl NullStage {
    pub fn new(name: &str) -> Self {
        NullStage {
            name: name.to_string(),
        }
    }
}

impl Stage for NullStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_packet(&mut self, _: &mut PacketDescriptor, _: &mut EngineState) -> Verdict {
        Verdict::Drop
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ports_accept_decimal_and_hex() {
        let ports = Ports::new(
            None,
            vec![
                ("0x0800".to_string(), StageHandle(1)),
                ("53".to_string(), StageHandle(2)),
            ],
        );
        let numeric = ports.numeric().unwrap();
        assert_eq!(numeric, vec![(0x0800, StageHandle(1)), (53, StageHandle(2))]);

        let bad = Ports::new(None, vec![("http".to_string(), StageHandle(1))]);
        assert!(bad.numeric().is_err());
    }

    #[test]
    fn expect_only_flags_foreign_ports() {
        let ports = Ports::new(None, vec![("http".to_string(), StageHandle(1))]);
        assert!(ports.expect_only(&["http", "non-http"]).is_ok());
        assert!(ports.expect_only(&["classified"]).is_err());
    }
}
