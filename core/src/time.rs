//! Capture-time timestamps.
//!
//! All periodic work in the engine (flow expiry, tunnel purging, the status
//! tick) is driven by the timestamps of captured packets, never by the wall
//! clock, so that offline replays behave identically to live runs.

use std::fmt;
use std::ops::Sub;

/// A capture timestamp with microsecond resolution.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeVal {
    /// Seconds since the epoch.
    pub sec: i64,
    /// Microseconds within the second, `0..1_000_000`.
    pub usec: i64,
}

impl TimeVal {
    pub fn new(sec: i64, usec: i64) -> Self {
        TimeVal { sec, usec }
    }

    /// True until the first packet has been seen.
    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.usec == 0
    }

    /// Difference in whole seconds, saturating at zero.
    pub fn secs_since(&self, earlier: TimeVal) -> u64 {
        (self.sec - earlier.sec).max(0) as u64
    }

    /// Difference in fractional seconds; negative when `earlier` is later.
    pub fn secs_f64_since(&self, earlier: TimeVal) -> f64 {
        (self.sec - earlier.sec) as f64 + (self.usec - earlier.usec) as f64 / 1e6
    }
}

impl Sub for TimeVal {
    type Output = f64;

    fn sub(self, rhs: TimeVal) -> f64 {
        self.secs_f64_since(rhs)
    }
}

impl fmt::Display for TimeVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_uses_microseconds() {
        let a = TimeVal::new(100, 1);
        let b = TimeVal::new(100, 2);
        let c = TimeVal::new(101, 0);
        assert!(a < b && b < c);
    }

    #[test]
    fn display_pads_microseconds() {
        assert_eq!(TimeVal::new(100, 200).to_string(), "100.000200");
    }
}
