//! The packet source stage.
//!
//! Root of every packet walk: reads the next frame from a pcap file or a
//! live interface into the reused descriptor, maintains the engine's
//! capture clock and stops the run on end-of-stream, read errors or an
//! optional packet limit. Out-of-order frames are logged but not reordered;
//! the clock never moves backwards.

use crate::config::params;
use crate::packet::{CaptureHeader, PacketDescriptor};
use crate::stage::{EngineState, Ports, Stage, Verdict};
use crate::time::TimeVal;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use pcap::{Active, Capture, Offline};

/// Read timeout for live captures so a termination request is noticed.
const LIVE_READ_TIMEOUT_MS: i32 = 1000;

enum CaptureHandle {
    OfflineFile(Capture<Offline>),
    OnlineDevice(Capture<Active>),
}

pub struct CaptureStage {
    name: String,
    ports: Ports,
    handle: CaptureHandle,
    online: bool,
    /// Cleared by the termination signal.
    running: Arc<AtomicBool>,
    max_packets: u64,
    packets: u64,
    period_traffic: u64,
}

impl CaptureStage {
    pub fn new(
        name: &str,
        settings: &toml::value::Table,
        ports: Ports,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let input = params::str(settings, "input")
            .ok_or_else(|| anyhow::anyhow!("{}: input not set", name))?;
        let mode = params::str(settings, "mode")
            .ok_or_else(|| anyhow::anyhow!("{}: mode not set", name))?;

        let (handle, online) = match mode {
            "offline" => {
                let capture = Capture::from_file(input)
                    .with_context(|| format!("{}: opening capture file \"{}\"", name, input))?;
                (CaptureHandle::OfflineFile(capture), false)
            }
            "online" => {
                let capture = Capture::from_device(input)
                    .with_context(|| format!("{}: opening device \"{}\"", name, input))?
                    .promisc(true)
                    .snaplen(65535)
                    .timeout(LIVE_READ_TIMEOUT_MS)
                    .open()
                    .with_context(|| format!("{}: activating device \"{}\"", name, input))?;
                (CaptureHandle::OnlineDevice(capture), true)
            }
            other => bail!("{}: invalid mode \"{}\"", name, other),
        };

        Ok(CaptureStage {
            name: name.to_string(),
            ports,
            handle,
            online,
            running,
            max_packets: params::u64(settings, "maxPackets").unwrap_or(0),
            packets: 0,
            period_traffic: 0,
        })
    }

}

impl Stage for CaptureStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_packet(&mut self, packet: &mut PacketDescriptor, state: &mut EngineState) -> Verdict {
        if !self.running.load(Ordering::Relaxed) {
            state.stop = true;
            return Verdict::Drop;
        }
        if self.max_packets != 0 && self.packets >= self.max_packets {
            log::info!("{}: packet limit reached", self.name);
            state.stop = true;
            return Verdict::Drop;
        }

        let result = match &mut self.handle {
            CaptureHandle::OfflineFile(capture) => capture.next(),
            CaptureHandle::OnlineDevice(capture) => capture.next(),
        };
        let frame = match result {
            Ok(frame) => frame,
            Err(pcap::Error::TimeoutExpired) => {
                log::warn!("{}: capture timed out", self.name);
                return Verdict::Drop;
            }
            // End of the capture file and hard read errors both unwind the
            // run; the distinction only matters for the log.
            Err(e) => {
                log::info!("{}: input end ({})", self.name, e);
                state.stop = true;
                return Verdict::Drop;
            }
        };
        let header = CaptureHeader {
            ts: TimeVal::new(frame.header.ts.tv_sec as i64, frame.header.ts.tv_usec as i64),
            caplen: frame.header.caplen,
            origlen: frame.header.len,
        };

        self.packets += 1;
        packet.load(header, frame.data, self.packets);

        if header.ts < state.current_time {
            log::warn!("{}: out of order packet (no. {})", self.name, self.packets);
        } else {
            state.current_time = header.ts;
        }
        self.period_traffic += header.origlen as u64;

        self.ports.forward_default()
    }

    fn configure(&mut self, settings: &toml::value::Table) {
        if let Some(max) = params::u64(settings, "maxPackets") {
            self.max_packets = max;
            log::info!("{}: capturing at most {} packets", self.name, max);
        }
    }

    fn get_status(&mut self, _: &EngineState, _: u64, period_secs: u64) -> String {
        let mut status = format!("packets: {}", self.packets);
        if self.online {
            if let CaptureHandle::OnlineDevice(capture) = &mut self.handle {
                if let Ok(stats) = capture.stats() {
                    let drop_percent = if stats.received > 0 {
                        stats.dropped as f64 * 100.0 / stats.received as f64
                    } else {
                        0.0
                    };
                    status.push_str(&format!(
                        "; stat: recv: {}, drop: {} ({:.1}%)",
                        stats.received, stats.dropped, drop_percent
                    ));
                }
            }
        }
        if period_secs > 0 {
            let mbps = self.period_traffic as f64 * 8.0 / 1e6 / period_secs as f64;
            status.push_str(&format!("; traffic: {:.2} Mbps", mbps));
        }
        self.period_traffic = 0;
        status
    }
}
