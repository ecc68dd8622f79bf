//! Consumer side of the outlet bus: discovery, subscription, buffered pulls,
//! and a lazily refreshed per-hub time correction.

use crate::common::host_clock;
use crate::outlet::{unwrap_row, BusMsg, OutletDescriptor, DISCOVERY_PORT};
use socket2::{Domain, Socket, Type};
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use tracing::debug;

/// How often each hub's correction estimate is re-queried
const CORRECTION_REFRESH_S: f64 = 5.0;
/// A pong only counts against a ping sent within this window
const CORRECTION_MATCH_S: f64 = 2.0;

/// One pulled sample, already expanded from chunks where needed
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Numeric { ts: f64, values: Vec<f32> },
    Text { ts: f64, value: String },
}

/// One subscribed stream
pub struct Inlet {
    desc: OutletDescriptor,
    hub_addr: SocketAddr,
    buf: VecDeque<Record>,
    correction: f64,
    corr_sent: Option<f64>,
    corr_at: f64,
}

impl Inlet {
    pub fn descriptor(&self) -> &OutletDescriptor {
        &self.desc
    }

    /// Latest offset added to pulled timestamps; 0 until a pong arrives
    pub fn time_correction(&self) -> f64 {
        self.correction
    }
}

/// All inlets of one consumer process, demuxed over a single data socket
pub struct InletPool {
    discovery: UdpSocket,
    data: UdpSocket,
    data_port: u16,
    inlets: HashMap<String, Inlet>,
}

impl InletPool {
    pub fn new() -> eyre::Result<Self> {
        Self::with_discovery_port(DISCOVERY_PORT)
    }

    pub fn with_discovery_port(port: u16) -> eyre::Result<Self> {
        // Reuse the address so an external recorder can share the port
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
        sock.set_reuse_address(true)?;
        let address = SocketAddr::from(([127, 0, 0, 1], port));
        sock.bind(&address.into())?;
        sock.set_nonblocking(true)?;
        let discovery: UdpSocket = sock.into();

        let data = UdpSocket::bind("127.0.0.1:0")?;
        data.set_nonblocking(true)?;
        let data_port = data.local_addr()?.port();
        Ok(Self {
            discovery,
            data,
            data_port,
            inlets: HashMap::new(),
        })
    }

    /// Drain announcements, subscribing as we go. Returns descriptors of
    /// streams not seen before so the caller can open sinks for them.
    pub fn discover(&mut self) -> Vec<OutletDescriptor> {
        let mut fresh = Vec::new();
        let mut buf = [0u8; 65536];
        loop {
            let (n, from) = match self.discovery.recv_from(&mut buf) {
                Ok(ok) => ok,
                Err(ref e) if would_block(e) => break,
                Err(e) => {
                    debug!("discovery receive failed: {e}");
                    break;
                }
            };
            let Ok(BusMsg::Announce { data_port, streams }) =
                serde_json::from_slice::<BusMsg>(&buf[..n])
            else {
                continue;
            };
            let hub_addr = SocketAddr::new(from.ip(), data_port);
            for desc in streams {
                if desc.source_id.is_empty() {
                    continue;
                }
                // (Re-)subscribe on every announce; the hub dedupes, and a
                // hub that restarted re-learns us this way.
                let sub = BusMsg::Subscribe {
                    source_id: desc.source_id.clone(),
                    port: self.data_port,
                };
                if let Ok(body) = serde_json::to_vec(&sub) {
                    let _ = self.data.send_to(&body, hub_addr);
                }
                if !self.inlets.contains_key(&desc.source_id) {
                    self.inlets.insert(
                        desc.source_id.clone(),
                        Inlet {
                            desc: desc.clone(),
                            hub_addr,
                            buf: VecDeque::new(),
                            correction: 0.0,
                            corr_sent: None,
                            corr_at: 0.0,
                        },
                    );
                    fresh.push(desc);
                }
            }
        }
        fresh
    }

    /// Drain the data socket into the per-inlet buffers
    pub fn pump(&mut self) {
        let mut buf = [0u8; 65536];
        loop {
            let (n, from) = match self.data.recv_from(&mut buf) {
                Ok(ok) => ok,
                Err(ref e) if would_block(e) => break,
                Err(e) => {
                    debug!("data receive failed: {e}");
                    break;
                }
            };
            match serde_json::from_slice::<BusMsg>(&buf[..n]) {
                Ok(msg) => self.route(msg, from),
                Err(e) => debug!("undecodable bus datagram: {e}"),
            }
        }
    }

    fn route(&mut self, msg: BusMsg, from: SocketAddr) {
        match msg {
            BusMsg::Sample {
                source_id,
                ts,
                values,
            } => {
                if let Some(inlet) = self.inlets.get_mut(&source_id) {
                    inlet.buf.push_back(Record::Numeric {
                        ts,
                        values: unwrap_row(values),
                    });
                }
            }
            BusMsg::Text {
                source_id,
                ts,
                value,
            } => {
                if let Some(inlet) = self.inlets.get_mut(&source_id) {
                    inlet.buf.push_back(Record::Text { ts, value });
                }
            }
            BusMsg::Chunk {
                source_id,
                t_end,
                fs,
                rows,
            } => {
                let Some(inlet) = self.inlets.get_mut(&source_id) else {
                    return;
                };
                let n = rows.len();
                for (i, row) in rows.into_iter().enumerate() {
                    // Right-aligned reconstruction: the last row carries the
                    // arrival stamp, earlier rows step back by 1/fs.
                    let ts = if fs > 0.0 {
                        t_end - (n - 1 - i) as f64 / fs
                    } else {
                        t_end
                    };
                    inlet.buf.push_back(Record::Numeric {
                        ts,
                        values: unwrap_row(row),
                    });
                }
            }
            BusMsg::TimePong { t0, t1 } => {
                let t3 = host_clock();
                for inlet in self.inlets.values_mut().filter(|i| i.hub_addr == from) {
                    if inlet
                        .corr_sent
                        .is_some_and(|sent| (sent - t0).abs() <= CORRECTION_MATCH_S)
                    {
                        // Single-exchange probe: the hub stamps t1 == t2
                        let theta = ((t1 - t0) + (t1 - t3)) / 2.0;
                        inlet.correction = -theta;
                        inlet.corr_sent = None;
                    }
                }
            }
            BusMsg::Announce { .. } | BusMsg::Subscribe { .. } | BusMsg::TimePing { .. } => {}
        }
    }

    /// Re-query corrections that have gone stale. Silence just leaves the
    /// previous (or zero) correction in place.
    pub fn maybe_refresh_corrections(&mut self, now: f64) {
        for inlet in self.inlets.values_mut() {
            if now - inlet.corr_at < CORRECTION_REFRESH_S {
                continue;
            }
            inlet.corr_at = now;
            let t0 = host_clock();
            if let Ok(body) = serde_json::to_vec(&BusMsg::TimePing { t0 }) {
                if self.data.send_to(&body, inlet.hub_addr).is_ok() {
                    inlet.corr_sent = Some(t0);
                }
            }
        }
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.inlets.keys().cloned().collect()
    }

    pub fn get(&self, source_id: &str) -> Option<&Inlet> {
        self.inlets.get(source_id)
    }

    /// Everything buffered for one stream, timestamps corrected into the
    /// local timeline
    pub fn pull_chunk(&mut self, source_id: &str) -> Vec<Record> {
        let Some(inlet) = self.inlets.get_mut(source_id) else {
            return Vec::new();
        };
        let corr = inlet.correction;
        inlet
            .buf
            .drain(..)
            .map(|r| match r {
                Record::Numeric { ts, values } => Record::Numeric {
                    ts: ts + corr,
                    values,
                },
                Record::Text { ts, value } => Record::Text {
                    ts: ts + corr,
                    value,
                },
            })
            .collect()
    }
}

fn would_block(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outlet::{ChannelFormat, OutletHub, OutletRegistry};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    // Off the production discovery port so a running bridge doesn't interfere
    const TEST_PORT: u16 = 17999;

    fn wait_for<T>(mut f: impl FnMut() -> Option<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(v) = f() {
                return v;
            }
            assert!(Instant::now() < deadline, "timed out waiting for bus");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn discover_subscribe_pull_roundtrip() {
        let mut pool = InletPool::with_discovery_port(TEST_PORT).unwrap();
        let hub = Arc::new(OutletHub::with_discovery_port(TEST_PORT).unwrap());
        let mut reg = OutletRegistry::new(Arc::clone(&hub), "S1");
        let rr = reg.ensure("rr", "H10", 2, 0.0, "ms,te").unwrap();
        let marks = hub
            .create_outlet(OutletDescriptor {
                name: "PB_MARKERS".to_string(),
                stype: "Markers".to_string(),
                source_id: "pb_markers_S1_cafecafe".to_string(),
                channel_count: 1,
                nominal_rate: 0.0,
                channel_format: ChannelFormat::String,
                units: String::new(),
                session: "S1".to_string(),
            })
            .unwrap();

        wait_for(|| {
            pool.discover();
            (pool.source_ids().len() >= 2).then_some(())
        });
        // Give the hub's service thread a beat to register the subscription
        std::thread::sleep(Duration::from_millis(200));

        rr.push_sample(5000.120, &[812.0, f32::NAN]);
        marks.push_text(5000.2, "baseline_start");

        let rr_sid = rr.descriptor().source_id.clone();
        let recs = wait_for(|| {
            pool.pump();
            let recs = pool.pull_chunk(&rr_sid);
            if recs.is_empty() {
                None
            } else {
                Some(recs)
            }
        });
        match &recs[0] {
            Record::Numeric { ts, values } => {
                assert!((ts - 5000.120).abs() < 1e-9);
                assert_eq!(values[0], 812.0);
                assert!(values[1].is_nan());
            }
            other => panic!("wrong record: {other:?}"),
        }

        let recs = wait_for(|| {
            pool.pump();
            let recs = pool.pull_chunk("pb_markers_S1_cafecafe");
            if recs.is_empty() {
                None
            } else {
                Some(recs)
            }
        });
        assert_eq!(
            recs[0],
            Record::Text {
                ts: 5000.2,
                value: "baseline_start".to_string()
            }
        );
    }

    #[test]
    fn chunk_rows_are_right_aligned() {
        let mut pool = InletPool::with_discovery_port(0).unwrap();
        let desc = OutletDescriptor {
            name: "PB_ECG_H10".to_string(),
            stype: "ECG".to_string(),
            source_id: "sid".to_string(),
            channel_count: 1,
            nominal_rate: 130.0,
            channel_format: ChannelFormat::Float32,
            units: "uV".to_string(),
            session: "S1".to_string(),
        };
        let hub_addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        pool.inlets.insert(
            "sid".to_string(),
            Inlet {
                desc,
                hub_addr,
                buf: VecDeque::new(),
                correction: 0.0,
                corr_sent: None,
                corr_at: 0.0,
            },
        );
        pool.route(
            BusMsg::Chunk {
                source_id: "sid".to_string(),
                t_end: 10.0,
                fs: 100.0,
                rows: vec![vec![Some(1.0)], vec![Some(2.0)], vec![Some(3.0)]],
            },
            hub_addr,
        );
        let recs = pool.pull_chunk("sid");
        let ts: Vec<f64> = recs
            .iter()
            .map(|r| match r {
                Record::Numeric { ts, .. } => *ts,
                _ => unreachable!(),
            })
            .collect();
        assert!((ts[0] - 9.98).abs() < 1e-9);
        assert!((ts[1] - 9.99).abs() < 1e-9);
        assert!((ts[2] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn correction_applies_to_pulled_timestamps() {
        let mut pool = InletPool::with_discovery_port(0).unwrap();
        let hub_addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        pool.inlets.insert(
            "sid".to_string(),
            Inlet {
                desc: OutletDescriptor {
                    name: "X".to_string(),
                    stype: "X".to_string(),
                    source_id: "sid".to_string(),
                    channel_count: 1,
                    nominal_rate: 0.0,
                    channel_format: ChannelFormat::Float32,
                    units: String::new(),
                    session: String::new(),
                },
                hub_addr,
                buf: VecDeque::new(),
                correction: 0.25,
                corr_sent: None,
                corr_at: 0.0,
            },
        );
        pool.route(
            BusMsg::Sample {
                source_id: "sid".to_string(),
                ts: 1.0,
                values: vec![Some(1.0)],
            },
            hub_addr,
        );
        match &pool.pull_chunk("sid")[0] {
            Record::Numeric { ts, .. } => assert!((ts - 1.25).abs() < 1e-9),
            _ => unreachable!(),
        }
    }
}
