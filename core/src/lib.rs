//! A passive network-traffic profiling engine.
//!
//! Captool reads captured packets, offline from a pcap file or live from
//! an interface, and peels the protocol layers (link, IP, UDP/TCP, GTP
//! tunnels, HTTP), reconstructs bidirectional flows, associates them with
//! subscriber identifiers learned from control-plane signalling, and emits
//! per-flow summaries enriched with a multi-facet classification verdict.
//!
//! The engine is a directed graph of named *stages* wired together by the
//! configuration file; each stage peels one layer or makes a routing
//! decision and names the next stage. A typical offline run:
//!
//! ```no_run
//! use captool_core::config::load_config;
//! use captool_core::Runtime;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = load_config("configs/captool.toml")?;
//!     let mut runtime = Runtime::new(config)?;
//!     runtime.run();
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod classify;
pub mod config;
pub mod control;
pub mod flow;
pub mod ids;
pub mod output;
pub mod packet;
pub mod protocols;
pub mod registry;
mod runtime;
pub mod stage;
pub mod store;
pub mod time;
pub mod tunnel;

pub use self::flow::{Flow, FlowId};
pub use self::packet::{Direction, PacketDescriptor};
pub use self::runtime::Runtime;
pub use self::stage::{Stage, StageHandle, Verdict};
pub use self::time::TimeVal;
