//! Detailed per-direction packet statistics.

use crate::time::TimeVal;

use std::fmt;

/// Running size and inter-arrival-time statistics, kept separately for the
/// uplink and downlink direction. Enabled per flow table by configuration;
/// the extra columns appear in the flow log when active.
#[derive(Debug, Default, Clone)]
pub struct PacketStatistics {
    uplink: DirectionStats,
    downlink: DirectionStats,
}

#[derive(Debug, Default, Clone)]
struct DirectionStats {
    first: Option<TimeVal>,
    last: Option<TimeVal>,
    packets: u64,
    bytes: u64,
    size_sqr_sum: f64,
    iat_sqr_sum: f64,
}

impl DirectionStats {
    fn packet(&mut self, ts: TimeVal, length: u64) {
        if let Some(last) = self.last {
            let iat = ts.secs_f64_since(last);
            self.iat_sqr_sum += iat * iat;
        } else {
            self.first = Some(ts);
        }
        self.last = Some(ts);
        self.packets += 1;
        self.bytes += length;
        self.size_sqr_sum += (length * length) as f64;
    }

    fn avg_size(&self) -> f64 {
        if self.packets == 0 {
            return 0.0;
        }
        self.bytes as f64 / self.packets as f64
    }

    fn dev_size(&self) -> f64 {
        if self.packets == 0 {
            return 0.0;
        }
        let avg = self.avg_size();
        (self.size_sqr_sum / self.packets as f64 - avg * avg).max(0.0).sqrt()
    }

    fn avg_iat(&self) -> f64 {
        match (self.first, self.last) {
            (Some(first), Some(last)) if self.packets > 1 => {
                last.secs_f64_since(first) / (self.packets - 1) as f64
            }
            _ => 0.0,
        }
    }

    fn dev_iat(&self) -> f64 {
        if self.packets < 2 {
            return 0.0;
        }
        let n = (self.packets - 1) as f64;
        let avg = self.avg_iat();
        (self.iat_sqr_sum / n - avg * avg).max(0.0).sqrt()
    }
}

impl PacketStatistics {
    pub fn packet(&mut self, ts: TimeVal, upload: bool, length: u64) {
        if upload {
            self.uplink.packet(ts, length);
        } else {
            self.downlink.packet(ts, length);
        }
    }
}

impl fmt::Display for PacketStatistics {
    /// The eight statistics columns of the flow log:
    /// `avgSizeUL|avgSizeDL|devSizeUL|devSizeDL|avgIatUL|avgIatDL|devIatUL|devIatDL`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2}|{:.2}|{:.2}|{:.2}|{:.6}|{:.6}|{:.6}|{:.6}",
            self.uplink.avg_size(),
            self.downlink.avg_size(),
            self.uplink.dev_size(),
            self.downlink.dev_size(),
            self.uplink.avg_iat(),
            self.downlink.avg_iat(),
            self.uplink.dev_iat(),
            self.downlink.dev_iat(),
        )
    }
}
