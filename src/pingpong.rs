//! NTP-like round-trip probe piggy-backing on the ingress socket.
//!
//! Every known device gets a periodic `{"type":"ping","t0_pc":...}` and is
//! expected to answer with `{"type":"pong", t0_pc, t1_ph, t2_ph}`. The
//! four-timestamp formula isolates the round trip from remote processing time
//! and gives a clock-offset estimate independent of mean path asymmetry.

use crate::common::host_clock;
use crate::guard;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use tracing::debug;

pub const PING_PERIOD_S: f64 = 10.0;
/// A pong only counts if it matches a ping we sent within this window
const MATCH_WINDOW_S: f64 = 2.0;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Measurement {
    pub ts_pc: f64,
    pub rtt_ms: f64,
    pub offset_ms: f64,
}

pub struct PingPong {
    sock: UdpSocket,
    period: f64,
    endpoints: HashMap<String, SocketAddr>,
    last: HashMap<String, Measurement>,
    pending: HashMap<String, f64>,
    last_sent: f64,
}

impl PingPong {
    /// `sock` is a clone of the ingress socket; replies come back through the
    /// normal receive loop.
    pub fn new(sock: UdpSocket) -> Self {
        Self::with_period(sock, PING_PERIOD_S)
    }

    pub fn with_period(sock: UdpSocket, period: f64) -> Self {
        Self {
            sock,
            period,
            endpoints: HashMap::new(),
            last: HashMap::new(),
            pending: HashMap::new(),
            last_sent: 0.0,
        }
    }

    /// Remember where a device lives; called for every inbound packet that
    /// names one.
    pub fn update_endpoint(&mut self, device: Option<&str>, addr: SocketAddr) {
        if let Some(device) = device {
            if !device.is_empty() {
                self.endpoints.insert(device.to_string(), addr);
            }
        }
    }

    /// Called on the summary tick; sends one ping per known device once per period
    pub fn maybe_send_pings(&mut self, now: f64) {
        if now - self.last_sent < self.period {
            return;
        }
        self.last_sent = now;
        for (dev, addr) in &self.endpoints {
            let t0 = host_clock();
            let pkt = json!({"type": "ping", "t0_pc": t0, "device": dev});
            match self.sock.send_to(pkt.to_string().as_bytes(), addr) {
                Ok(_) => {
                    // A new ping supersedes any unanswered one
                    self.pending.insert(dev.clone(), t0);
                }
                Err(e) => debug!(device = dev.as_str(), %addr, "ping send failed: {e}"),
            }
        }
    }

    /// Handle an inbound pong observed at host time `t3`
    pub fn on_pong(
        &mut self,
        obj: &serde_json::Map<String, Value>,
        t3: f64,
        device_hint: Option<&str>,
    ) {
        if obj.get("type").and_then(Value::as_str) != Some("pong") {
            return;
        }
        let dev = device_hint
            .or_else(|| obj.get("device").and_then(Value::as_str))
            .or_else(|| obj.get("deviceLabel").and_then(Value::as_str))
            .unwrap_or("UNKNOWN")
            .to_string();
        let (Some(t0), Some(t1), Some(t2)) = (
            guard::num(obj.get("t0_pc")),
            guard::num(obj.get("t1_ph")),
            guard::num(obj.get("t2_ph")),
        ) else {
            return;
        };
        // Only a reply to our most recent ping for this device counts
        let solicited = matches!(
            self.pending.get(&dev),
            Some(&pend) if (pend - t0).abs() <= MATCH_WINDOW_S
        );
        if !solicited {
            return;
        }
        let rtt = (t3 - t0) - (t2 - t1);
        let offset = ((t1 - t0) + (t2 - t3)) / 2.0;
        self.last.insert(
            dev.clone(),
            Measurement {
                ts_pc: t3,
                rtt_ms: (rtt * 1000.0).max(0.0),
                offset_ms: offset * 1000.0,
            },
        );
        self.pending.remove(&dev);
    }

    pub fn snapshot(&self) -> HashMap<String, Measurement> {
        self.last.clone()
    }

    /// Mean one-way latency estimate across devices, for the heartbeat line
    pub fn mean_latency_ms(&self) -> f64 {
        if self.last.is_empty() {
            return 0.0;
        }
        self.last.values().map(|m| m.rtt_ms / 2.0).sum::<f64>() / self.last.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn probe() -> PingPong {
        PingPong::new(UdpSocket::bind("127.0.0.1:0").unwrap())
    }

    fn pong(t0: f64, t1: f64, t2: f64) -> serde_json::Map<String, Value> {
        json!({"type":"pong","t0_pc":t0,"t1_ph":t1,"t2_ph":t2,"device":"H10"})
            .as_object()
            .unwrap()
            .clone()
    }

    #[test]
    fn four_timestamp_formula() {
        let mut pp = probe();
        pp.pending.insert("H10".into(), 100.000);
        pp.on_pong(&pong(100.000, 50.010, 50.030), 100.050, None);
        let m = pp.snapshot()["H10"];
        assert!((m.rtt_ms - 30.0).abs() < 1e-9);
        assert!((m.offset_ms - -50005.0).abs() < 1e-6);
        assert!(pp.pending.is_empty());
    }

    #[test]
    fn rtt_never_negative() {
        let mut pp = probe();
        pp.pending.insert("H10".into(), 100.0);
        // Remote claims more processing time than the whole round trip
        pp.on_pong(&pong(100.0, 50.0, 51.0), 100.1, None);
        assert!(pp.snapshot()["H10"].rtt_ms >= 0.0);
    }

    #[test]
    fn stale_or_unsolicited_pongs_dropped() {
        let mut pp = probe();
        pp.on_pong(&pong(100.0, 50.0, 50.1), 100.2, None);
        assert!(pp.snapshot().is_empty());

        pp.pending.insert("H10".into(), 100.0);
        pp.on_pong(&pong(90.0, 50.0, 50.1), 100.2, None);
        assert!(pp.snapshot().is_empty());
        // The pending ping survives a mismatched reply
        assert_eq!(pp.pending.len(), 1);
    }

    #[test]
    fn device_hint_wins_over_packet_field() {
        let mut pp = probe();
        pp.pending.insert("Verity".into(), 100.0);
        pp.on_pong(&pong(100.0, 50.0, 50.1), 100.2, Some("Verity"));
        assert!(pp.snapshot().contains_key("Verity"));
    }
}
