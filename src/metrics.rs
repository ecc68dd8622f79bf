//! Per-stream packet accounting: loss, reordering, inter-arrival jitter, and
//! sample throughput against the advertised rate for fixed-rate streams.
//!
//! Keyed by (device, kind). Data packets are expected to carry `seq`.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Short window for rate/jitter readouts
pub const WIN_SHORT_S: f64 = 10.0;
/// Long window, also holds sample-throughput rows
pub const WIN_LONG_S: f64 = 60.0;

/// Event streams carry physiological rhythm, so jitter is meaningless for them
const EVENT_KINDS: &[&str] = &["rr", "hr", "ppi"];
/// Control traffic never touches the counters
pub const CONTROL_KINDS: &[&str] = &["ping", "pong", "hub_status"];

pub fn is_control(kind: &str) -> bool {
    CONTROL_KINDS.contains(&kind)
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IaStats {
    pub rate_hz: f64,
    pub jitter_ms: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SampleStats {
    pub arrived: f64,
    pub expected: f64,
    pub gap: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PacketStats {
    pub recv: u64,
    pub miss: u64,
    pub ooo: u64,
    pub loss_rate: f64,
}

/// One `"device|kind"` entry of a snapshot
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StreamSnapshot {
    pub pkts: PacketStats,
    pub ia_10s: IaStats,
    pub ia_60s: IaStats,
    pub samples_60s: SampleStats,
}

/// Bounded deque of arrival times, plus `(t, n, fs)` rows for fixed-rate kinds
#[derive(Debug)]
struct RollingWindow {
    seconds: f64,
    arrivals: VecDeque<f64>,
    samples: VecDeque<(f64, u64, f64)>,
}

impl RollingWindow {
    fn new(seconds: f64) -> Self {
        Self {
            seconds,
            arrivals: VecDeque::new(),
            samples: VecDeque::new(),
        }
    }

    fn add_arrival(&mut self, t_mono: f64) {
        self.arrivals.push_back(t_mono);
        self.prune(t_mono);
    }

    fn add_samples(&mut self, t_mono: f64, n: u64, fs: f64) {
        self.samples.push_back((t_mono, n, fs));
        self.prune(t_mono);
    }

    fn prune(&mut self, now: f64) {
        let cutoff = now - self.seconds;
        while self.arrivals.front().is_some_and(|&t| t < cutoff) {
            self.arrivals.pop_front();
        }
        while self.samples.front().is_some_and(|&(t, _, _)| t < cutoff) {
            self.samples.pop_front();
        }
    }

    fn interarrival_stats(&self) -> IaStats {
        if self.arrivals.len() < 2 {
            return IaStats::default();
        }
        let dts: Vec<f64> = self
            .arrivals
            .iter()
            .zip(self.arrivals.iter().skip(1))
            .map(|(a, b)| b - a)
            .collect();
        let mean = dts.iter().sum::<f64>() / dts.len() as f64;
        let var = dts.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (dts.len() - 1).max(1) as f64;
        IaStats {
            rate_hz: if mean > 0.0 { 1.0 / mean } else { 0.0 },
            jitter_ms: var.sqrt() * 1000.0,
        }
    }

    /// Arrived vs. theoretical sample count; only meaningful for fixed-rate kinds
    fn sample_stats(&self) -> SampleStats {
        let (Some(&(first, _, _)), Some(&(last, _, _))) =
            (self.samples.front(), self.samples.back())
        else {
            return SampleStats::default();
        };
        let elapsed = (last - first).clamp(0.0, self.seconds);
        let arrived: f64 = self.samples.iter().map(|&(_, n, _)| n as f64).sum();
        // The most recent advertised fs counts as the current one
        let fs = self
            .samples
            .iter()
            .rev()
            .map(|&(_, _, f)| f)
            .find(|&f| f > 0.0)
            .unwrap_or(0.0);
        let expected = if fs > 0.0 { fs * elapsed } else { 0.0 };
        SampleStats {
            arrived,
            expected,
            gap: (expected - arrived).max(0.0),
        }
    }
}

#[derive(Debug)]
struct StreamState {
    recv: u64,
    miss: u64,
    ooo: u64,
    last_seq: Option<i64>,
    win_s: RollingWindow,
    win_l: RollingWindow,
}

impl StreamState {
    fn new(win_short: f64, win_long: f64) -> Self {
        Self {
            recv: 0,
            miss: 0,
            ooo: 0,
            last_seq: None,
            win_s: RollingWindow::new(win_short),
            win_l: RollingWindow::new(win_long),
        }
    }
}

/// Accounting for every (device, kind) pair seen on the wire
#[derive(Debug)]
pub struct StreamMetrics {
    win_short: f64,
    win_long: f64,
    streams: HashMap<(String, String), StreamState>,
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::with_windows(WIN_SHORT_S, WIN_LONG_S)
    }

    pub fn with_windows(win_short: f64, win_long: f64) -> Self {
        Self {
            win_short,
            win_long,
            streams: HashMap::new(),
        }
    }

    fn key(obj: &serde_json::Map<String, Value>) -> Option<(String, String)> {
        let kind = obj.get("type")?.as_str()?;
        let device = obj
            .get("device")
            .or_else(|| obj.get("deviceLabel"))
            .or_else(|| obj.get("deviceId"))?
            .as_str()?;
        Some((device.to_string(), kind.to_string()))
    }

    /// Account one inbound business packet at monotonic arrival time `t_mono`
    pub fn observe(&mut self, obj: &serde_json::Map<String, Value>, t_mono: f64) {
        // Control traffic would poison the statistics
        if let Some(kind) = obj.get("type").and_then(Value::as_str) {
            if is_control(kind) {
                return;
            }
        }
        let Some(key) = Self::key(obj) else { return };
        let (win_short, win_long) = (self.win_short, self.win_long);
        let state = self
            .streams
            .entry(key)
            .or_insert_with(|| StreamState::new(win_short, win_long));

        state.recv += 1;

        if let Some(seq) = obj.get("seq").and_then(Value::as_i64) {
            if let Some(last) = state.last_seq {
                let gap = seq - last - 1;
                if gap > 0 {
                    state.miss += gap as u64;
                } else if gap < 0 {
                    state.ooo += 1;
                }
                // Forward progress only: a late packet never rolls the cursor back
                if seq > last {
                    state.last_seq = Some(seq);
                }
            } else {
                state.last_seq = Some(seq);
            }
        }

        state.win_s.add_arrival(t_mono);
        state.win_l.add_arrival(t_mono);

        let fs = crate::guard::num(obj.get("fs"));
        let n = obj.get("n").and_then(Value::as_u64);
        if let (Some(fs), Some(n)) = (fs, n) {
            state.win_s.add_samples(t_mono, n, fs);
            state.win_l.add_samples(t_mono, n, fs);
        }
    }

    /// Snapshot keyed `"device|kind"`, stable order for the journal
    pub fn snapshot(&self) -> BTreeMap<String, StreamSnapshot> {
        let mut out = BTreeMap::new();
        for ((device, kind), state) in &self.streams {
            let denom = state.recv + state.miss;
            out.insert(
                format!("{device}|{kind}"),
                StreamSnapshot {
                    pkts: PacketStats {
                        recv: state.recv,
                        miss: state.miss,
                        ooo: state.ooo,
                        loss_rate: if denom > 0 {
                            state.miss as f64 / denom as f64
                        } else {
                            0.0
                        },
                    },
                    ia_10s: state.win_s.interarrival_stats(),
                    ia_60s: state.win_l.interarrival_stats(),
                    samples_60s: state.win_l.sample_stats(),
                },
            );
        }
        out
    }

    /// One human line per stream for the stand-alone console
    pub fn format_brief(&self) -> String {
        let snap = self.snapshot();
        if snap.is_empty() {
            return "(no streams)".to_string();
        }
        let mut lines = Vec::with_capacity(snap.len());
        for (key, s) in &snap {
            let lr = s.pkts.loss_rate * 100.0;
            let rate = s.ia_10s.rate_hz;
            let kind = key.split_once('|').map(|(_, k)| k).unwrap_or("");
            if EVENT_KINDS.contains(&kind) {
                lines.push(format!(
                    "{key}: pkts={} miss={} ({lr:.2}%)  rate={rate:.1}Hz  jitter=—",
                    s.pkts.recv, s.pkts.miss
                ));
            } else {
                lines.push(format!(
                    "{key}: pkts={} miss={} ({lr:.2}%)  rate={rate:.1}Hz  jitter={:.1}ms  gap60s={:.0}",
                    s.pkts.recv, s.pkts.miss, s.ia_10s.jitter_ms, s.samples_60s.gap
                ));
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> serde_json::Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    fn stream<'a>(
        snap: &'a BTreeMap<String, StreamSnapshot>,
        key: &str,
    ) -> &'a StreamSnapshot {
        snap.get(key).unwrap()
    }

    #[test]
    fn gap_and_reorder_accounting() {
        let mut m = StreamMetrics::new();
        for (i, seq) in [0, 1, 4].iter().enumerate() {
            m.observe(
                &obj(json!({"type":"ppg","device":"Verity","seq":seq})),
                i as f64 * 0.1,
            );
        }
        let s = *stream(&m.snapshot(), "Verity|ppg");
        assert_eq!(s.pkts.recv, 3);
        assert_eq!(s.pkts.miss, 2);
        assert_eq!(s.pkts.ooo, 0);

        // A late seq=3 counts as out-of-order and leaves the cursor at 4
        m.observe(&obj(json!({"type":"ppg","device":"Verity","seq":3})), 0.3);
        let s = *stream(&m.snapshot(), "Verity|ppg");
        assert_eq!(s.pkts.ooo, 1);
        assert_eq!(s.pkts.miss, 2);

        m.observe(&obj(json!({"type":"ppg","device":"Verity","seq":5})), 0.4);
        let s = *stream(&m.snapshot(), "Verity|ppg");
        assert_eq!(s.pkts.miss, 2);
    }

    #[test]
    fn loss_rate_bounded() {
        let mut m = StreamMetrics::new();
        m.observe(&obj(json!({"type":"hr","device":"H10","seq":0})), 0.0);
        m.observe(&obj(json!({"type":"hr","device":"H10","seq":10})), 0.1);
        let s = *stream(&m.snapshot(), "H10|hr");
        let lr = s.pkts.loss_rate;
        assert!((0.0..=1.0).contains(&lr));
        assert!((lr - 9.0 / 11.0).abs() < 1e-12);
    }

    #[test]
    fn control_packets_do_not_count() {
        let mut m = StreamMetrics::new();
        m.observe(&obj(json!({"type":"pong","device":"H10","seq":9})), 0.0);
        m.observe(&obj(json!({"type":"ping","device":"H10"})), 0.1);
        m.observe(&obj(json!({"type":"hub_status","device":"H10"})), 0.2);
        assert!(m.snapshot().is_empty());
    }

    #[test]
    fn missing_device_is_ignored() {
        let mut m = StreamMetrics::new();
        m.observe(&obj(json!({"type":"marker","label":"baseline_start"})), 0.0);
        assert!(m.snapshot().is_empty());
    }

    #[test]
    fn interarrival_rate_and_jitter() {
        let mut m = StreamMetrics::new();
        for i in 0..11 {
            m.observe(
                &obj(json!({"type":"ecg","device":"H10","seq":i})),
                i as f64 * 0.5,
            );
        }
        let s = *stream(&m.snapshot(), "H10|ecg");
        assert!((s.ia_10s.rate_hz - 2.0).abs() < 1e-9);
        assert!(s.ia_10s.jitter_ms.abs() < 1e-9);
    }

    #[test]
    fn throughput_gap_against_advertised_rate() {
        let mut m = StreamMetrics::new();
        // 130 Hz stream delivering only 100 samples/s over 10 s
        for i in 0..11 {
            m.observe(
                &obj(json!({"type":"ecg","device":"H10","seq":i,"fs":130.0,"n":100})),
                i as f64,
            );
        }
        let s = *stream(&m.snapshot(), "H10|ecg");
        assert!((s.samples_60s.arrived - 1100.0).abs() < 1e-9);
        assert!((s.samples_60s.expected - 1300.0).abs() < 1e-9);
        assert!((s.samples_60s.gap - 200.0).abs() < 1e-9);
    }

    #[test]
    fn windows_are_pruned() {
        let mut m = StreamMetrics::with_windows(1.0, 2.0);
        m.observe(&obj(json!({"type":"acc","device":"H10","seq":0})), 0.0);
        m.observe(&obj(json!({"type":"acc","device":"H10","seq":1})), 10.0);
        let s = *stream(&m.snapshot(), "H10|acc");
        // Only the last arrival survives the prune, so no stats
        assert_eq!(s.ia_10s.rate_hz, 0.0);
        assert_eq!(s.pkts.recv, 2);
    }
}
