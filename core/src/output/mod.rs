//! Output stages and file management.

pub mod files;
pub mod flow_log;
pub mod packet_log;
pub mod pcap_dump;
