//! Runtime configuration.
//!
//! The engine is configured from a single hierarchical TOML file: one
//! `[stages.<name>]` table per stage (carrying its `type`, its wired
//! `connections` and free-form stage parameters) plus global tables for the
//! engine, the output files and the status log. The same syntax is accepted
//! on the control socket for runtime reconfiguration.
//!
//! ```toml
//! [engine]
//! rootStage = "capture"
//! timerPeriod = 30
//! controlPort = 44444
//! classification = "configs/classification.xml"
//!
//! [files]
//! outputDirectory = "out"
//! splitFiles = true
//!
//! [stages.capture]
//! type = "PcapCapture"
//! mode = "offline"
//! input = "traces/sample.pcap"
//! connections = [["default", "eth"]]
//!
//! [stages.eth]
//! type = "Ethernet"
//! connections = [["default", "null"], ["0x0800", "ip"]]
//! ```

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;

use crate::output::files::DEFAULT_MIN_FREE_SPACE;

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RuntimeConfig> {
    let text = fs::read_to_string(&path)
        .with_context(|| format!("reading config file {:?}", path.as_ref()))?;
    let config: RuntimeConfig = toml::from_str(&text)
        .with_context(|| format!("parsing config file {:?}", path.as_ref()))?;
    config.validate()?;
    Ok(config)
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    pub engine: EngineConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub status: Option<StatusConfig>,
    /// Stages in declaration order; order is kept for status reporting.
    pub stages: IndexMap<String, StageConfig>,
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if !self.stages.contains_key(&self.engine.root_stage) {
            bail!("active stage \"{}\" is not defined", self.engine.root_stage);
        }
        for (name, stage) in &self.stages {
            for connection in &stage.connections {
                let target = &connection.1;
                if target != "null" && !self.stages.contains_key(target) {
                    bail!(
                        "stage \"{}\": connection \"{}\" references unknown stage \"{}\"",
                        name,
                        connection.0,
                        target
                    );
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EngineConfig {
    /// The source stage each packet walk starts from.
    pub root_stage: String,
    /// Interval of the periodic tick in capture-time seconds; 0 disables
    /// the status log and time-driven file rollover.
    #[serde(default = "default_timer_period")]
    pub timer_period: u64,
    /// TCP port of the control socket; 0 disables the control thread.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Path of the classification metadata file.
    #[serde(default)]
    pub classification: Option<String>,
    /// Remove sensitive detail from outputs (URL parameters, subscriber
    /// addresses in the packet log).
    #[serde(default)]
    pub anonymize: bool,
}

fn default_timer_period() -> u64 {
    30
}

fn default_control_port() -> u16 {
    44444
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FilesConfig {
    #[serde(default = "default_output_directory")]
    pub output_directory: String,
    #[serde(default = "default_split_files")]
    pub split_files: bool,
    #[serde(default = "default_min_free_space")]
    pub min_free_space: u64,
}

impl Default for FilesConfig {
    fn default() -> Self {
        FilesConfig {
            output_directory: default_output_directory(),
            split_files: default_split_files(),
            min_free_space: default_min_free_space(),
        }
    }
}

fn default_output_directory() -> String {
    ".".to_string()
}

fn default_split_files() -> bool {
    true
}

fn default_min_free_space() -> u64 {
    DEFAULT_MIN_FREE_SPACE
}

/// Periodic status log output.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StatusConfig {
    pub file_prefix: String,
    pub file_postfix: String,
}

/// One `(port name, target stage)` pair of a stage's `connections` list.
#[derive(Debug, Clone, Deserialize)]
pub struct Connection(pub String, pub String);

/// Configuration of one stage.
#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    /// Implementation name, e.g. `PcapCapture` or `FlowOutputStrict`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Stage-specific parameters; interpreted by the stage itself.
    #[serde(flatten)]
    pub params: toml::value::Table,
}

/// Typed accessors over a stage's free-form parameter table, shared between
/// initialisation and runtime reconfiguration.
pub mod params {
    use toml::value::Table;

    pub fn str<'a>(table: &'a Table, key: &str) -> Option<&'a str> {
        table.get(key).and_then(|v| v.as_str())
    }

    pub fn u64(table: &Table, key: &str) -> Option<u64> {
        table.get(key).and_then(|v| v.as_integer()).map(|v| v as u64)
    }

    pub fn usize(table: &Table, key: &str) -> Option<usize> {
        u64(table, key).map(|v| v as usize)
    }

    pub fn bool(table: &Table, key: &str) -> Option<bool> {
        table.get(key).and_then(|v| v.as_bool())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[engine]
rootStage = "capture"
timerPeriod = 10

[stages.capture]
type = "PcapCapture"
mode = "offline"
input = "trace.pcap"
connections = [["default", "eth"]]

[stages.eth]
type = "Ethernet"
connections = [["0x0800", "null"]]
"#;

    #[test]
    fn parses_stages_in_order_with_params() {
        let config: RuntimeConfig = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        let names: Vec<&String> = config.stages.keys().collect();
        assert_eq!(names, vec!["capture", "eth"]);

        let capture = &config.stages["capture"];
        assert_eq!(capture.kind, "PcapCapture");
        assert_eq!(params::str(&capture.params, "mode"), Some("offline"));
        assert_eq!(capture.connections[0].0, "default");
        assert_eq!(config.engine.timer_period, 10);
        assert_eq!(config.engine.control_port, 44444);
    }

    #[test]
    fn unknown_connection_target_is_fatal() {
        let bad = SAMPLE.replace("\"null\"", "\"nowhere\"");
        let config: RuntimeConfig = toml::from_str(&bad).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_root_stage_is_fatal() {
        let bad = SAMPLE.replace("rootStage = \"capture\"", "rootStage = \"nope\"");
        let config: RuntimeConfig = toml::from_str(&bad).unwrap();
        assert!(config.validate().is_err());
    }
}
