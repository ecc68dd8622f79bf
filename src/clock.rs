//! Mapping device-clock event times onto the host's monotonic timeline.
//!
//! Each device gets its own EWMA of `host_arrival - t_device`. A single
//! update can move the offset by at most `clamp_s`, so one device clock jump
//! or delayed datagram can't drag the whole timeline with it.

use std::collections::HashMap;
use tracing::{info, warn};

pub const DEFAULT_ALPHA: f64 = 0.05;
pub const DEFAULT_CLAMP_S: f64 = 1.0;

#[derive(Debug)]
struct OffsetEwma {
    alpha: f64,
    clamp: f64,
    inited: bool,
    offset: f64,
}

impl OffsetEwma {
    fn new(alpha: f64, clamp: f64) -> Self {
        Self {
            alpha,
            clamp,
            inited: false,
            offset: 0.0,
        }
    }

    fn update(&mut self, mut sample: f64) -> f64 {
        if self.inited {
            let delta = sample - self.offset;
            if delta.abs() > self.clamp {
                warn!(
                    delta,
                    clamp = self.clamp,
                    sample,
                    prev = self.offset,
                    "clock offset sample clamped"
                );
                sample = self.offset + if delta > 0.0 { self.clamp } else { -self.clamp };
            }
            self.offset = (1.0 - self.alpha) * self.offset + self.alpha * sample;
        } else {
            self.offset = sample;
            self.inited = true;
            info!(offset = self.offset, "clock offset initialized");
        }
        self.offset
    }
}

/// Per-device source-time to host-time mapper
#[derive(Debug)]
pub struct ClockSync {
    alpha: f64,
    clamp_s: f64,
    per_device: HashMap<String, OffsetEwma>,
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSync {
    pub fn new() -> Self {
        Self::with_params(DEFAULT_ALPHA, DEFAULT_CLAMP_S)
    }

    pub fn with_params(alpha: f64, clamp_s: f64) -> Self {
        Self {
            alpha,
            clamp_s,
            per_device: HashMap::new(),
        }
    }

    /// Map an event stamped in `device`'s clock to the host timeline.
    ///
    /// `t_device` is the packet time in the device clock, `te` an optional
    /// event time in the same clock, `t_arrival` the host clock at receipt.
    /// Without a device time the arrival time is the best we have.
    pub fn map_event_ts(
        &mut self,
        device: &str,
        t_device: Option<f64>,
        te: Option<f64>,
        t_arrival: f64,
    ) -> f64 {
        let Some(t_dev) = t_device else {
            return t_arrival;
        };
        let (alpha, clamp_s) = (self.alpha, self.clamp_s);
        let est = self
            .per_device
            .entry(device.to_string())
            .or_insert_with(|| OffsetEwma::new(alpha, clamp_s));
        let off = est.update(t_arrival - t_dev);
        te.unwrap_or(t_dev) + off
    }

    /// Forget one device's estimate, or all of them
    pub fn reset(&mut self, device: Option<&str>) {
        match device {
            Some(d) => {
                self.per_device.remove(d);
            }
            None => self.per_device.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_initializes_offset() {
        let mut cs = ClockSync::new();
        // arrival 5000.100, device 1000.000 -> offset 4000.100; event at 1000.020
        let ts = cs.map_event_ts("H10", Some(1000.000), Some(1000.020), 5000.100);
        assert!((ts - 5000.120).abs() < 1e-9);
    }

    #[test]
    fn no_device_time_falls_back_to_arrival() {
        let mut cs = ClockSync::new();
        assert_eq!(cs.map_event_ts("H10", None, Some(3.0), 42.0), 42.0);
    }

    #[test]
    fn outlier_moves_offset_by_at_most_alpha_clamp() {
        let mut cs = ClockSync::with_params(0.05, 1.0);
        cs.map_event_ts("H10", Some(0.0), None, 100.0); // offset = 100
        // A 50 s jump in the sample offset is clamped to 1 s before smoothing
        let ts = cs.map_event_ts("H10", Some(0.0), None, 150.0);
        let off = ts; // te/t_device are 0, so the return is the offset itself
        assert!((off - (100.0 + 0.05 * 1.0)).abs() < 1e-9);
    }

    #[test]
    fn devices_are_independent() {
        let mut cs = ClockSync::new();
        cs.map_event_ts("H10", Some(0.0), None, 100.0);
        let ts = cs.map_event_ts("Verity", Some(0.0), None, 7.0);
        assert!((ts - 7.0).abs() < 1e-9);
    }

    #[test]
    fn mapped_time_tracks_device_time() {
        let mut cs = ClockSync::new();
        let mut prev = cs.map_event_ts("H10", Some(10.0), None, 110.0);
        for i in 1..50 {
            let t_dev = 10.0 + i as f64 * 0.1;
            let ts = cs.map_event_ts("H10", Some(t_dev), None, 110.0 + i as f64 * 0.1);
            assert!(ts > prev);
            prev = ts;
        }
    }
}
