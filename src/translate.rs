//! Translation of Polar JSON packets into typed numeric outlet samples.
//!
//! Event streams (hr, rr, ppi) are single samples stamped through the clock
//! mapper; fixed-rate streams (ecg, acc, ppg) are pushed as chunks and get
//! their per-sample times reconstructed by the consumer.

use crate::clock::ClockSync;
use crate::guard::{int, num, rows_as_float};
use crate::outlet::OutletRegistry;
use serde_json::{Map, Value};

type Obj = Map<String, Value>;
type Handler = fn(&mut PolarTranslator, &Obj, f64) -> eyre::Result<bool>;

/// Dispatch table; first matching tag wins
const HANDLERS: &[(&str, Handler)] = &[
    ("hr", PolarTranslator::on_hr),
    ("rr", PolarTranslator::on_rr),
    ("ppi", PolarTranslator::on_ppi),
    ("ecg", PolarTranslator::on_ecg),
    ("acc", PolarTranslator::on_acc),
    ("ppg", PolarTranslator::on_ppg),
];

fn device_of(obj: &Obj) -> String {
    obj.get("device")
        .and_then(Value::as_str)
        .filter(|d| !d.is_empty())
        .unwrap_or("Unknown")
        .to_string()
}

/// iOS sends the boolean flags as 0/1 or true/false; everything else is off
fn flag(v: Option<&Value>) -> f32 {
    match v {
        Some(Value::Bool(true)) => 1.0,
        Some(Value::Number(n)) if n.as_i64() == Some(1) => 1.0,
        _ => 0.0,
    }
}

pub struct PolarTranslator {
    registry: OutletRegistry,
    clock: ClockSync,
}

impl PolarTranslator {
    pub fn new(registry: OutletRegistry, clock: ClockSync) -> Self {
        Self { registry, clock }
    }

    /// Offer one parsed packet; true when it produced a sample.
    /// Unknown tags are not an error, malformed known tags are dropped.
    pub fn handle(&mut self, obj: &Obj, host_ts: f64) -> eyre::Result<bool> {
        let Some(tag) = obj.get("type").and_then(Value::as_str) else {
            return Ok(false);
        };
        let tag = tag.trim().to_lowercase();
        match HANDLERS.iter().find(|(t, _)| *t == tag) {
            Some((_, handler)) => handler(self, obj, host_ts),
            None => Ok(false),
        }
    }

    fn event_ts(&mut self, obj: &Obj, device: &str, te: Option<f64>, host_ts: f64) -> f64 {
        let t_dev = num(obj.get("t_device"));
        self.clock.map_event_ts(device, t_dev, te, host_ts)
    }

    fn on_hr(&mut self, obj: &Obj, host_ts: f64) -> eyre::Result<bool> {
        let Some(bpm) = num(obj.get("bpm")) else {
            return Ok(false);
        };
        let device = device_of(obj);
        let ts = self.event_ts(obj, &device, None, host_ts);
        let out = self.registry.ensure("hr", &device, 1, 0.0, "bpm")?;
        out.push_sample(ts, &[bpm as f32]);
        Ok(true)
    }

    fn on_rr(&mut self, obj: &Obj, host_ts: f64) -> eyre::Result<bool> {
        let Some(ms) = num(obj.get("ms")) else {
            return Ok(false);
        };
        let device = device_of(obj);
        let te = num(obj.get("te"));
        let ts = self.event_ts(obj, &device, te, host_ts);
        let out = self.registry.ensure("rr", &device, 2, 0.0, "ms,te")?;
        out.push_sample(ts, &[ms as f32, te.map_or(f32::NAN, |v| v as f32)]);
        Ok(true)
    }

    fn on_ppi(&mut self, obj: &Obj, host_ts: f64) -> eyre::Result<bool> {
        let Some(ms) = num(obj.get("ms")) else {
            return Ok(false);
        };
        let device = device_of(obj);
        let te = num(obj.get("te"));
        let quality = num(obj.get("quality")).map_or(f32::NAN, |v| v as f32);
        let ts = self.event_ts(obj, &device, te, host_ts);
        let out = self.registry.ensure(
            "ppi",
            &device,
            6,
            0.0,
            "ms,quality,blocker,skinContact,skinSupported,te",
        )?;
        out.push_sample(
            ts,
            &[
                ms as f32,
                quality,
                flag(obj.get("blocker")),
                flag(obj.get("skinContact")),
                flag(obj.get("skinSupported")),
                te.map_or(f32::NAN, |v| v as f32),
            ],
        );
        Ok(true)
    }

    fn on_ecg(&mut self, obj: &Obj, _host_ts: f64) -> eyre::Result<bool> {
        let Some(fs) = num(obj.get("fs")) else {
            return Ok(false);
        };
        let Some(Value::Array(uv)) = obj.get("uV") else {
            return Ok(false);
        };
        let rows: Vec<Vec<f32>> = uv
            .iter()
            .filter_map(Value::as_f64)
            .map(|x| vec![x as f32])
            .collect();
        if rows.is_empty() {
            return Ok(false);
        }
        let device = device_of(obj);
        let out = self.registry.ensure("ecg", &device, 1, fs, "uV")?;
        out.push_chunk(&rows);
        Ok(true)
    }

    fn on_acc(&mut self, obj: &Obj, _host_ts: f64) -> eyre::Result<bool> {
        let Some(fs) = num(obj.get("fs")) else {
            return Ok(false);
        };
        let rows = rows_as_float(obj.get("mG"), 3);
        if rows.is_empty() {
            return Ok(false);
        }
        let device = device_of(obj);
        let out = self.registry.ensure("acc", &device, 3, fs, "mG")?;
        out.push_chunk(&rows);
        Ok(true)
    }

    fn on_ppg(&mut self, obj: &Obj, _host_ts: f64) -> eyre::Result<bool> {
        let Some(fs) = num(obj.get("fs")) else {
            return Ok(false);
        };
        let ch = int(obj.get("ch")).unwrap_or(0);
        if ch <= 0 {
            return Ok(false);
        }
        let rows = rows_as_float(obj.get("mU"), ch as usize);
        if rows.is_empty() {
            return Ok(false);
        }
        let device = device_of(obj);
        let out = self
            .registry
            .ensure("ppg", &device, ch as usize, fs, "a.u.")?;
        out.push_chunk(&rows);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outlet::OutletHub;
    use serde_json::json;
    use std::sync::Arc;

    fn translator() -> PolarTranslator {
        let hub = Arc::new(OutletHub::with_discovery_port(0).unwrap());
        PolarTranslator::new(OutletRegistry::new(hub, "S1"), ClockSync::new())
    }

    fn obj(v: Value) -> Obj {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn rr_event_is_consumed() {
        let mut tr = translator();
        let consumed = tr
            .handle(
                &obj(json!({
                    "type": "rr", "device": "H10",
                    "t_device": 1000.000, "te": 1000.020, "ms": 812, "seq": 0
                })),
                5000.100,
            )
            .unwrap();
        assert!(consumed);
    }

    #[test]
    fn tags_are_case_insensitive() {
        let mut tr = translator();
        let consumed = tr
            .handle(
                &obj(json!({"type": " HR ", "device": "H10", "bpm": 61})),
                1.0,
            )
            .unwrap();
        assert!(consumed);
    }

    #[test]
    fn unknown_and_malformed_are_not_consumed() {
        let mut tr = translator();
        assert!(!tr
            .handle(&obj(json!({"type": "marker", "label": "x"})), 1.0)
            .unwrap());
        assert!(!tr.handle(&obj(json!({"no_type": 1})), 1.0).unwrap());
        // hr without a numeric bpm is dropped
        assert!(!tr
            .handle(&obj(json!({"type": "hr", "device": "H10", "bpm": "fast"})), 1.0)
            .unwrap());
        // ecg without fs is dropped
        assert!(!tr
            .handle(
                &obj(json!({"type": "ecg", "device": "H10", "uV": [1, 2]})),
                1.0
            )
            .unwrap());
    }

    #[test]
    fn ppg_needs_positive_channel_count() {
        let mut tr = translator();
        assert!(!tr
            .handle(
                &obj(json!({
                    "type": "ppg", "device": "Verity",
                    "fs": 55.0, "ch": 0, "mU": [[1, 2, 3]]
                })),
                1.0
            )
            .unwrap());
        assert!(tr
            .handle(
                &obj(json!({
                    "type": "ppg", "device": "Verity",
                    "fs": 55.0, "ch": 3, "mU": [[1, 2, 3], [4, 5, 6]]
                })),
                1.0
            )
            .unwrap());
    }

    #[test]
    fn acc_rows_must_be_three_wide() {
        let mut tr = translator();
        assert!(!tr
            .handle(
                &obj(json!({
                    "type": "acc", "device": "H10", "fs": 50.0, "mG": [[1, 2]]
                })),
                1.0
            )
            .unwrap());
    }

    #[test]
    fn fs_change_is_a_loud_failure() {
        let mut tr = translator();
        tr.handle(
            &obj(json!({"type": "ecg", "device": "H10", "fs": 130.0, "uV": [1]})),
            1.0,
        )
        .unwrap();
        assert!(tr
            .handle(
                &obj(json!({"type": "ecg", "device": "H10", "fs": 65.0, "uV": [1]})),
                2.0
            )
            .is_err());
    }

    #[test]
    fn flag_coercion() {
        assert_eq!(flag(Some(&json!(true))), 1.0);
        assert_eq!(flag(Some(&json!(1))), 1.0);
        assert_eq!(flag(Some(&json!(0))), 0.0);
        assert_eq!(flag(Some(&json!(false))), 0.0);
        assert_eq!(flag(Some(&json!("1"))), 0.0);
        assert_eq!(flag(None), 0.0);
    }
}
