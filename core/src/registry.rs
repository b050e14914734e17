//! Stage registry: creation and wiring of the processing graph.
//!
//! Handles are assigned from the configuration order before any stage is
//! constructed, so every stage resolves its output ports and collaborator
//! references against the complete name map. A built-in `null` stage backs
//! connections that deliberately end the packet walk.

use crate::capture::CaptureStage;
use crate::classify::assigner::ClassAssignerStage;
use crate::classify::dispatcher::ClassifierDispatcherStage;
use crate::classify::dpi::DpiStage;
use crate::classify::metadata::ClassificationMetadata;
use crate::classify::port::PortClassifierStage;
use crate::config::{RuntimeConfig, StageConfig};
use crate::output::flow_log::{FlowPolicy, FlowStage};
use crate::output::packet_log::PacketLogStage;
use crate::output::pcap_dump::PcapDumpStage;
use crate::protocols::ethernet::EthernetStage;
use crate::protocols::gtpc::GtpControlStage;
use crate::protocols::gtpu::GtpUserStage;
use crate::protocols::http::HttpStage;
use crate::protocols::ipv4::Ipv4Stage;
use crate::protocols::tcp::TcpStage;
use crate::protocols::udp::UdpStage;
use crate::stage::{NullStage, Ports, Stage, StageHandle, StageMap, DEFAULT_PORT};

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

/// Name of the built-in sink stage.
pub const NULL_STAGE: &str = "null";

pub struct StageRegistry {
    stages: Vec<Box<dyn Stage>>,
    map: StageMap,
}

impl StageRegistry {
    pub fn build(
        config: &RuntimeConfig,
        metadata: &Arc<ClassificationMetadata>,
        running: &Arc<AtomicBool>,
    ) -> Result<Self> {
        let mut map = StageMap::default();
        map.insert(NULL_STAGE, StageHandle(0));
        for (index, name) in config.stages.keys().enumerate() {
            if name == NULL_STAGE {
                bail!("stage name \"{}\" is reserved", NULL_STAGE);
            }
            map.insert(name, StageHandle(index + 1));
        }

        let mut stages: Vec<Box<dyn Stage>> = vec![Box::new(NullStage::new(NULL_STAGE))];
        for (index, (name, stage_config)) in config.stages.iter().enumerate() {
            let handle = StageHandle(index + 1);
            let ports = resolve_ports(name, stage_config, &map)?;
            log::debug!("creating stage {} of type {}", name, stage_config.kind);
            let stage = create_stage(
                name,
                stage_config,
                ports,
                handle,
                &map,
                config,
                metadata,
                running,
            )
            .with_context(|| format!("creating stage \"{}\"", name))?;
            stages.push(stage);
        }

        Ok(StageRegistry { stages, map })
    }

    pub fn handle(&self, name: &str) -> Option<StageHandle> {
        self.map.resolve(name)
    }

    pub fn get_mut(&mut self, handle: StageHandle) -> &mut dyn Stage {
        &mut *self.stages[handle.0]
    }

    /// The configured stages in declaration order (the null sink excluded).
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Stage>> {
        self.stages.iter_mut().skip(1)
    }
}

fn resolve_ports(name: &str, config: &StageConfig, map: &StageMap) -> Result<Ports> {
    let mut default = None;
    let mut named = Vec::new();
    for connection in &config.connections {
        let target = map.require(&connection.1).with_context(|| {
            format!("stage \"{}\": connection \"{}\"", name, connection.0)
        })?;
        if connection.0 == DEFAULT_PORT {
            default = Some(target);
        } else {
            named.push((connection.0.clone(), target));
        }
    }
    Ok(Ports::new(default, named))
}

#[allow(clippy::too_many_arguments)]
fn create_stage(
    name: &str,
    stage_config: &StageConfig,
    ports: Ports,
    handle: StageHandle,
    map: &StageMap,
    config: &RuntimeConfig,
    metadata: &Arc<ClassificationMetadata>,
    running: &Arc<AtomicBool>,
) -> Result<Box<dyn Stage>> {
    let settings = &stage_config.params;
    let anonymize = config.engine.anonymize;
    let stage: Box<dyn Stage> = match stage_config.kind.as_str() {
        "PcapCapture" => Box::new(CaptureStage::new(
            name,
            settings,
            ports,
            Arc::clone(running),
        )?),
        "Ethernet" => Box::new(EthernetStage::new(name, settings, ports, handle)?),
        "IP" => Box::new(Ipv4Stage::new(name, settings, ports, handle)?),
        "UDP" => Box::new(UdpStage::new(name, settings, ports, handle)?),
        "TCP" => Box::new(TcpStage::new(name, settings, ports, handle)?),
        "GTPControl" => Box::new(GtpControlStage::new(name, settings, ports, handle, map)?),
        "GTPUser" => Box::new(GtpUserStage::new(name, settings, ports, handle, map)?),
        "HTTP" => Box::new(HttpStage::new(name, settings, ports, metadata, anonymize)?),
        "FlowOutput" => Box::new(FlowStage::new(
            name,
            settings,
            ports,
            handle,
            map,
            FlowPolicy::Initiator,
            metadata,
        )?),
        "FlowOutputStrict" => Box::new(FlowStage::new(
            name,
            settings,
            ports,
            handle,
            map,
            FlowPolicy::Subscriber,
            metadata,
        )?),
        "FlowPacket" => Box::new(PacketLogStage::new(name, settings, ports, map, anonymize)?),
        "PcapDump" => Box::new(PcapDumpStage::new(name, settings, ports, map)?),
        "PortClassifier" => Box::new(PortClassifierStage::new(name, ports, metadata)?),
        "DPI" => Box::new(DpiStage::new(name, ports, metadata)?),
        "ClassifierDispatcher" => {
            Box::new(ClassifierDispatcherStage::new(name, settings, ports)?)
        }
        "ClassAssigner" => Box::new(ClassAssignerStage::new(name, ports, metadata)?),
        "Null" => Box::new(NullStage::new(name)),
        other => bail!("no such stage type: {}", other),
    };
    Ok(stage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;
    use std::io::Write as _;

    fn sample_config(dir: &std::path::Path) -> std::path::PathBuf {
        // A pcap file with a valid global header and no packets.
        let pcap_path = dir.join("empty.pcap");
        let mut pcap = std::fs::File::create(&pcap_path).unwrap();
        pcap.write_all(&0xa1b2c3d4u32.to_le_bytes()).unwrap();
        pcap.write_all(&2u16.to_le_bytes()).unwrap();
        pcap.write_all(&4u16.to_le_bytes()).unwrap();
        pcap.write_all(&[0u8; 8]).unwrap();
        pcap.write_all(&65535u32.to_le_bytes()).unwrap();
        pcap.write_all(&1u32.to_le_bytes()).unwrap();

        let config_path = dir.join("captool.toml");
        let mut config = std::fs::File::create(&config_path).unwrap();
        write!(
            config,
            r#"
[engine]
rootStage = "capture"
controlPort = 0

[stages.capture]
type = "PcapCapture"
mode = "offline"
input = {pcap:?}
connections = [["default", "eth"]]

[stages.eth]
type = "Ethernet"
connections = [["default", "null"], ["0x0800", "ip"]]

[stages.ip]
type = "IP"
connections = [["default", "flow"]]

[stages.flow]
type = "FlowOutput"
filePrefix = "flows"
filePostfix = ".txt"
flowTimeout = 60
baseStage = "ip"
connections = [["default", "null"]]
"#,
            pcap = pcap_path.to_str().unwrap()
        )
        .unwrap();
        config_path
    }

    #[test]
    fn builds_wired_registry_from_config() {
        let dir = std::env::temp_dir().join(format!("captool-registry-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let config = load_config(sample_config(&dir)).unwrap();

        let metadata = Arc::new(ClassificationMetadata::empty());
        let running = Arc::new(AtomicBool::new(true));
        let mut registry = StageRegistry::build(&config, &metadata, &running).unwrap();

        assert_eq!(registry.handle(NULL_STAGE), Some(StageHandle(0)));
        let capture = registry.handle("capture").unwrap();
        assert_eq!(registry.get_mut(capture).name(), "capture");
        assert_eq!(registry.iter_mut().count(), 4);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn unknown_stage_type_is_fatal() {
        let toml = r#"
[engine]
rootStage = "x"

[stages.x]
type = "Mystery"
"#;
        let config: RuntimeConfig = toml::from_str(toml).unwrap();
        let metadata = Arc::new(ClassificationMetadata::empty());
        let running = Arc::new(AtomicBool::new(true));
        assert!(StageRegistry::build(&config, &metadata, &running).is_err());
    }
}
