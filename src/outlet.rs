//! Typed outlet streams and the loopback bus that carries them to consumers.
//!
//! A producing process owns one [`OutletHub`]: a datagram socket on an
//! ephemeral loopback port. The hub periodically announces its stream
//! descriptors on the discovery port; consumers answer with a subscription
//! and from then on every push is forwarded to them. Fixed-rate chunks travel
//! without per-sample timestamps and are reconstructed by the consumer from
//! the nominal rate.

use crate::common::{host_clock, rand_suffix};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Consumers listen here for outlet announcements
pub const DISCOVERY_PORT: u16 = 16571;
/// Descriptor broadcast cadence (a new outlet is announced immediately)
const ANNOUNCE_EVERY: Duration = Duration::from_secs(2);
/// Service loop wake granularity
const SERVICE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("outlet {key} requested as {want}, but it was created as {have}")]
    ShapeMismatch {
        key: String,
        have: String,
        want: String,
    },
    #[error("duplicate outlet source id {0}")]
    DuplicateSourceId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelFormat {
    Float32,
    String,
}

impl ChannelFormat {
    pub fn is_numeric(self) -> bool {
        self == ChannelFormat::Float32
    }
}

/// Everything a consumer needs to subscribe to and persist a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutletDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub stype: String,
    pub source_id: String,
    pub channel_count: usize,
    pub nominal_rate: f64,
    pub channel_format: ChannelFormat,
    pub units: String,
    pub session: String,
}

impl OutletDescriptor {
    fn shape(&self) -> String {
        format!(
            "{} ch @ {} Hz [{}]",
            self.channel_count, self.nominal_rate, self.units
        )
    }
}

/// Wire format of the bus, one JSON object per datagram
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BusMsg {
    Announce {
        data_port: u16,
        streams: Vec<OutletDescriptor>,
    },
    Subscribe {
        source_id: String,
        port: u16,
    },
    Sample {
        source_id: String,
        ts: f64,
        values: Vec<Option<f32>>,
    },
    Text {
        source_id: String,
        ts: f64,
        value: String,
    },
    Chunk {
        source_id: String,
        t_end: f64,
        fs: f64,
        rows: Vec<Vec<Option<f32>>>,
    },
    TimePing {
        t0: f64,
    },
    TimePong {
        t0: f64,
        t1: f64,
    },
}

/// JSON cannot carry NaN; it crosses the wire as null
pub(crate) fn wrap_row(values: &[f32]) -> Vec<Option<f32>> {
    values
        .iter()
        .map(|&v| if v.is_finite() { Some(v) } else { None })
        .collect()
}

pub(crate) fn unwrap_row(values: Vec<Option<f32>>) -> Vec<f32> {
    values.into_iter().map(|v| v.unwrap_or(f32::NAN)).collect()
}

#[derive(Debug, Default)]
struct HubState {
    streams: Vec<OutletDescriptor>,
    subs: HashMap<String, Vec<SocketAddr>>,
    dirty: bool,
}

/// One per producing process; owns the bus socket and the descriptor table
pub struct OutletHub {
    sock: Arc<UdpSocket>,
    data_port: u16,
    state: Arc<Mutex<HubState>>,
}

impl OutletHub {
    pub fn new() -> eyre::Result<Self> {
        Self::with_discovery_port(DISCOVERY_PORT)
    }

    pub fn with_discovery_port(discovery_port: u16) -> eyre::Result<Self> {
        let sock = Arc::new(UdpSocket::bind("127.0.0.1:0")?);
        sock.set_read_timeout(Some(SERVICE_TIMEOUT))?;
        let data_port = sock.local_addr()?.port();
        let state = Arc::new(Mutex::new(HubState::default()));
        {
            let sock = Arc::clone(&sock);
            let state = Arc::clone(&state);
            std::thread::Builder::new()
                .name("outlet-bus".to_string())
                .spawn(move || service_loop(&sock, &state, data_port, discovery_port))?;
        }
        Ok(Self {
            sock,
            data_port,
            state,
        })
    }

    pub fn data_port(&self) -> u16 {
        self.data_port
    }

    /// Register a stream and hand back its push handle
    pub fn create_outlet(&self, desc: OutletDescriptor) -> eyre::Result<Outlet> {
        let mut st = self.state.lock().unwrap();
        if st.streams.iter().any(|d| d.source_id == desc.source_id) {
            return Err(Error::DuplicateSourceId(desc.source_id).into());
        }
        info!(
            name = desc.name.as_str(),
            stype = desc.stype.as_str(),
            ch = desc.channel_count,
            fs = desc.nominal_rate,
            units = desc.units.as_str(),
            "outlet created"
        );
        st.streams.push(desc.clone());
        st.dirty = true;
        Ok(Outlet {
            desc,
            sock: Arc::clone(&self.sock),
            state: Arc::clone(&self.state),
        })
    }
}

/// Answers subscriptions and time pings, and re-announces the stream table
fn service_loop(
    sock: &UdpSocket,
    state: &Mutex<HubState>,
    data_port: u16,
    discovery_port: u16,
) {
    let announce_addr = SocketAddr::from(([127, 0, 0, 1], discovery_port));
    let mut last_announce = Instant::now() - ANNOUNCE_EVERY;
    let mut buf = [0u8; 4096];
    loop {
        let due = {
            let mut st = state.lock().unwrap();
            let due = !st.streams.is_empty()
                && (st.dirty || last_announce.elapsed() >= ANNOUNCE_EVERY);
            if due {
                st.dirty = false;
            }
            due
        };
        if due {
            last_announce = Instant::now();
            let streams = state.lock().unwrap().streams.clone();
            let msg = BusMsg::Announce { data_port, streams };
            if let Ok(body) = serde_json::to_vec(&msg) {
                let _ = sock.send_to(&body, announce_addr);
            }
        }
        match sock.recv_from(&mut buf) {
            Ok((n, from)) => {
                let Ok(msg) = serde_json::from_slice::<BusMsg>(&buf[..n]) else {
                    continue;
                };
                match msg {
                    BusMsg::Subscribe { source_id, port } => {
                        let addr = SocketAddr::new(from.ip(), port);
                        let mut st = state.lock().unwrap();
                        let subs = st.subs.entry(source_id.clone()).or_default();
                        if !subs.contains(&addr) {
                            debug!(source_id = source_id.as_str(), %addr, "subscriber added");
                            subs.push(addr);
                        }
                    }
                    BusMsg::TimePing { t0 } => {
                        let reply = BusMsg::TimePong {
                            t0,
                            t1: host_clock(),
                        };
                        if let Ok(body) = serde_json::to_vec(&reply) {
                            let _ = sock.send_to(&body, from);
                        }
                    }
                    _ => {}
                }
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                debug!("bus socket receive failed: {e}");
            }
        }
    }
}

/// Push handle for one stream. Sends are best-effort; a consumer that fell
/// behind or went away shows up as idle on its side, not as an error here.
#[derive(Clone)]
pub struct Outlet {
    desc: OutletDescriptor,
    sock: Arc<UdpSocket>,
    state: Arc<Mutex<HubState>>,
}

impl Outlet {
    pub fn descriptor(&self) -> &OutletDescriptor {
        &self.desc
    }

    fn fanout(&self, msg: &BusMsg) {
        let subs = {
            let st = self.state.lock().unwrap();
            match st.subs.get(&self.desc.source_id) {
                Some(s) if !s.is_empty() => s.clone(),
                _ => return,
            }
        };
        let Ok(body) = serde_json::to_vec(msg) else {
            return;
        };
        for addr in subs {
            if let Err(e) = self.sock.send_to(&body, addr) {
                debug!(source_id = self.desc.source_id.as_str(), %addr, "push dropped: {e}");
            }
        }
    }

    /// One sample with an explicit host timestamp
    pub fn push_sample(&self, ts: f64, values: &[f32]) {
        self.fanout(&BusMsg::Sample {
            source_id: self.desc.source_id.clone(),
            ts,
            values: wrap_row(values),
        });
    }

    /// One string sample with an explicit host timestamp
    pub fn push_text(&self, ts: f64, value: &str) {
        self.fanout(&BusMsg::Text {
            source_id: self.desc.source_id.clone(),
            ts,
            value: value.to_string(),
        });
    }

    /// A fixed-rate chunk without per-sample timestamps; consumers reconstruct
    /// them right-aligned against the arrival time and the nominal rate.
    pub fn push_chunk(&self, rows: &[Vec<f32>]) {
        if rows.is_empty() {
            return;
        }
        self.fanout(&BusMsg::Chunk {
            source_id: self.desc.source_id.clone(),
            t_end: host_clock(),
            fs: self.desc.nominal_rate,
            rows: rows.iter().map(|r| wrap_row(r)).collect(),
        });
    }
}

/// Lazily creates and caches numeric outlets keyed by (kind, device)
pub struct OutletRegistry {
    hub: Arc<OutletHub>,
    session: String,
    name_suffix: String,
    outlets: HashMap<String, Outlet>,
}

impl OutletRegistry {
    pub fn new(hub: Arc<OutletHub>, session: &str) -> Self {
        Self {
            hub,
            session: session.to_string(),
            name_suffix: String::new(),
            outlets: HashMap::new(),
        }
    }

    /// Idempotent on (kind, device). The first call fixes the stream shape;
    /// a later call with a different shape is a programming error upstream
    /// and fails loudly rather than silently emitting misshapen samples.
    pub fn ensure(
        &mut self,
        kind: &str,
        device: &str,
        channels: usize,
        rate: f64,
        units: &str,
    ) -> eyre::Result<Outlet> {
        let key = format!("{}::{}", kind.to_uppercase(), device);
        if let Some(existing) = self.outlets.get(&key) {
            let d = existing.descriptor();
            if d.channel_count != channels || d.nominal_rate != rate || d.units != units {
                return Err(Error::ShapeMismatch {
                    key,
                    have: d.shape(),
                    want: format!("{channels} ch @ {rate} Hz [{units}]"),
                }
                .into());
            }
            return Ok(existing.clone());
        }
        let name = format!(
            "PB_{}_{}{}",
            kind.to_uppercase(),
            device,
            self.name_suffix
        );
        let source_id = format!(
            "pb_{}_{}_{}_{}",
            kind.to_lowercase(),
            device,
            self.session,
            rand_suffix()
        );
        let desc = OutletDescriptor {
            name,
            stype: kind.to_uppercase(),
            source_id,
            channel_count: channels,
            nominal_rate: rate,
            channel_format: ChannelFormat::Float32,
            units: units.to_string(),
            session: self.session.clone(),
        };
        let outlet = self.hub.create_outlet(desc)?;
        self.outlets.insert(key, outlet.clone());
        Ok(outlet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_survives_the_wire() {
        let wrapped = wrap_row(&[1.0, f32::NAN, 3.0]);
        assert_eq!(wrapped, vec![Some(1.0), None, Some(3.0)]);
        let back = unwrap_row(wrapped);
        assert_eq!(back[0], 1.0);
        assert!(back[1].is_nan());
        assert_eq!(back[2], 3.0);
    }

    #[test]
    fn wire_roundtrip() {
        let msg = BusMsg::Chunk {
            source_id: "pb_ecg_H10_S1_00000000".to_string(),
            t_end: 12.5,
            fs: 130.0,
            rows: vec![vec![Some(1.0)], vec![None]],
        };
        let body = serde_json::to_vec(&msg).unwrap();
        match serde_json::from_slice::<BusMsg>(&body).unwrap() {
            BusMsg::Chunk { fs, rows, .. } => {
                assert_eq!(fs, 130.0);
                assert_eq!(rows.len(), 2);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn registry_is_idempotent() {
        let hub = Arc::new(OutletHub::with_discovery_port(0).unwrap());
        let mut reg = OutletRegistry::new(hub, "S1");
        let a = reg.ensure("rr", "H10", 2, 0.0, "ms,te").unwrap();
        let b = reg.ensure("rr", "H10", 2, 0.0, "ms,te").unwrap();
        assert_eq!(a.descriptor().source_id, b.descriptor().source_id);
        assert_eq!(a.descriptor().name, "PB_RR_H10");
        assert_eq!(a.descriptor().stype, "RR");
    }

    #[test]
    fn registry_rejects_shape_changes() {
        let hub = Arc::new(OutletHub::with_discovery_port(0).unwrap());
        let mut reg = OutletRegistry::new(hub, "S1");
        reg.ensure("ppg", "Verity", 3, 55.0, "a.u.").unwrap();
        assert!(reg.ensure("ppg", "Verity", 4, 55.0, "a.u.").is_err());
        assert!(reg.ensure("ppg", "Verity", 3, 64.0, "a.u.").is_err());
        assert!(reg.ensure("ppg", "Verity", 3, 55.0, "mU").is_err());
    }

    #[test]
    fn source_ids_are_unique_per_outlet() {
        let hub = Arc::new(OutletHub::with_discovery_port(0).unwrap());
        let mut reg = OutletRegistry::new(Arc::clone(&hub), "S1");
        let a = reg.ensure("hr", "H10", 1, 0.0, "bpm").unwrap();
        let b = reg.ensure("hr", "Verity", 1, 0.0, "bpm").unwrap();
        assert_ne!(a.descriptor().source_id, b.descriptor().source_id);
    }
}
