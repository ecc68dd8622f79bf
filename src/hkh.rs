//! Serial ingress for the HKH-11C respiration belt: probe the port, start
//! streaming, push each breathing value with its host timestamp, and keep a
//! preview CSV alongside.

use crate::args::HkhArgs;
use crate::common::{
    host_clock, rand_suffix, spawn_signal_task, timestamp_compact, EscWatcher,
};
use crate::outlet::{ChannelFormat, OutletDescriptor, OutletHub};
use crate::serial::SerialPort;
use serde_json::json;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Probe order; the belt's CP210x bridge enumerates as ttyUSB, clones as ttyACM
const CANDIDATE_PORTS: &[&str] = &[
    "/dev/ttyUSB0",
    "/dev/ttyUSB1",
    "/dev/ttyACM0",
    "/dev/ttyACM1",
];
/// The belt samples the breathing wave at 50 Hz
const NOMINAL_RATE_HZ: f64 = 50.0;

/// Vendor protocol start/stop commands
pub const CMD_START: [u8; 5] = [0xFF, 0xCC, 0x03, 0xA3, 0xA0];
pub const CMD_STOP: [u8; 5] = [0xFF, 0xCC, 0x03, 0xA4, 0xA1];

const FRAME_START: u8 = 0xFF;
const FRAME_DEVICE_ID: u8 = 0xCC;
const PAYLOAD_LEN: usize = 5;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(
        "no serial port accepted 115200 baud (tried {0}). Find the belt's \
         USB-UART bridge (Silicon Labs CP210x) and adjust the candidate list"
    )]
    NoPort(String),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    #[default]
    Start,
    DeviceId,
    Payload {
        got: usize,
    },
}

/// Resynchronizing parser for the 7-byte frame `FF CC b2 b3 b4 b5 b6`.
/// The breathing value is the signed big-endian word in the last two bytes.
#[derive(Debug, Default)]
pub struct FrameParser {
    state: ParserState,
    payload: [u8; PAYLOAD_LEN],
}

impl FrameParser {
    /// Feed one byte; yields a breathing value whenever a frame completes
    pub fn push(&mut self, byte: u8) -> Option<i16> {
        match self.state {
            ParserState::Start => {
                if byte == FRAME_START {
                    self.state = ParserState::DeviceId;
                }
                None
            }
            ParserState::DeviceId => {
                if byte == FRAME_DEVICE_ID {
                    self.state = ParserState::Payload { got: 0 };
                } else if byte != FRAME_START {
                    // A repeated 0xFF may still be the real start byte
                    self.state = ParserState::Start;
                }
                None
            }
            ParserState::Payload { got } => {
                self.payload[got] = byte;
                if got + 1 == PAYLOAD_LEN {
                    self.state = ParserState::Start;
                    Some(i16::from_be_bytes([self.payload[3], self.payload[4]]))
                } else {
                    self.state = ParserState::Payload { got: got + 1 };
                    None
                }
            }
        }
    }
}

/// First candidate port that opens at the belt's baud rate wins
fn probe_ports() -> Result<(&'static str, SerialPort), Error> {
    for &path in CANDIDATE_PORTS {
        match SerialPort::open(path) {
            Ok(port) => return Ok((path, port)),
            Err(e) => debug!(path, "probe failed: {e}"),
        }
    }
    Err(Error::NoPort(CANDIDATE_PORTS.join(", ")))
}

pub async fn run(args: HkhArgs) -> eyre::Result<()> {
    let (sd_s, sd_r) = broadcast::channel(1);
    spawn_signal_task(sd_s);
    tokio::task::spawn_blocking(move || belt_loop(args, sd_r)).await?
}

fn belt_loop(args: HkhArgs, mut shutdown: broadcast::Receiver<()>) -> eyre::Result<()> {
    info!("Starting belt task!");
    let session = args.worker.session_or_new()?;
    let (port_name, mut port) = probe_ports()?;
    info!(port = port_name, "serial port open");

    let dir = args.csv_dir.join(&session);
    std::fs::create_dir_all(&dir)?;
    let csv_path = dir.join(format!("preview_{}.csv", timestamp_compact()?));
    let mut csv = csv::Writer::from_path(&csv_path)?;
    csv.write_record(["LSL_Timestamp", "BreathingValue"])?;

    let hub = Arc::new(OutletHub::new()?);
    let outlet = hub.create_outlet(OutletDescriptor {
        name: "HB_Respiration_HKH".to_string(),
        stype: "Respiration".to_string(),
        source_id: format!("hkh_respiration_{}_{}", session, rand_suffix()),
        channel_count: 1,
        nominal_rate: NOMINAL_RATE_HZ,
        channel_format: ChannelFormat::Float32,
        units: "arbitrary_units".to_string(),
        session: session.clone(),
    })?;

    println!("[hkh] session={session}");
    println!("[hkh] port={port_name}");
    println!("[hkh] preview={}", csv_path.display());
    println!("[READY] hkh");

    port.write_all(&CMD_START)?;

    let esc = (!args.worker.under_hub).then(EscWatcher::new);
    let hb_every = args.worker.hb_every();
    let start = host_clock();
    let mut last_hb = start;
    let mut parser = FrameParser::default();
    let mut recent: u64 = 0;
    let mut last_value: i16 = 0;
    let mut buf = [0u8; 64];

    loop {
        // Look for shutdown signal
        if shutdown.try_recv().is_ok() {
            info!("Belt task stopping");
            break;
        }
        if esc.as_ref().is_some_and(EscWatcher::pressed) {
            println!("[hkh] ESC, stopping");
            break;
        }

        // VTIME bounds this read at 100 ms; a silent line returns 0 bytes
        let n = port.read(&mut buf)?;
        for &byte in &buf[..n] {
            if let Some(value) = parser.push(byte) {
                let t = host_clock();
                outlet.push_sample(t, &[f32::from(value)]);
                csv.write_record([t.to_string(), value.to_string()])?;
                recent += 1;
                last_value = value;
            }
        }
        if n == 0 {
            // Nothing on the line; yield before the next poll
            std::thread::sleep(Duration::from_millis(2));
        }

        let now = host_clock();
        if now - last_hb >= hb_every {
            last_hb = now;
            let hb = json!({
                "hb": "hkh",
                "elapsed_s": now - start,
                "recent_samples": recent,
                "last_value": last_value,
            });
            println!("{hb}");
            if !args.worker.under_hub {
                println!(
                    "[hkh] recording: {:.1}s elapsed, last breathing value {last_value}",
                    now - start
                );
            }
            recent = 0;
        }
    }

    // Tell the hardware to stop before the port closes
    if let Err(e) = port.write_all(&CMD_STOP) {
        warn!("stop command failed: {e}");
    }
    csv.flush()?;
    println!("[hkh] stopped, preview saved to {}", csv_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut FrameParser, bytes: &[u8]) -> Vec<i16> {
        bytes.iter().filter_map(|&b| parser.push(b)).collect()
    }

    #[test]
    fn clean_frame_decodes() {
        let mut p = FrameParser::default();
        // payload bytes [3],[4] form the big-endian value
        let out = feed(&mut p, &[0xFF, 0xCC, 0x03, 0x00, 0x00, 0x01, 0x2C]);
        assert_eq!(out, vec![300]);
    }

    #[test]
    fn negative_values_are_signed() {
        let mut p = FrameParser::default();
        let out = feed(&mut p, &[0xFF, 0xCC, 0x00, 0x00, 0x00, 0xFF, 0xFE]);
        assert_eq!(out, vec![-2]);
    }

    #[test]
    fn resyncs_on_garbage() {
        let mut p = FrameParser::default();
        let out = feed(
            &mut p,
            &[
                0x12, 0xFF, 0x99, // false start
                0xFF, 0xCC, 0x01, 0x02, 0x03, 0x00, 0x2A, // good frame
            ],
        );
        assert_eq!(out, vec![42]);
    }

    #[test]
    fn repeated_start_bytes_do_not_lose_the_frame() {
        let mut p = FrameParser::default();
        let out = feed(&mut p, &[0xFF, 0xFF, 0xCC, 0x00, 0x00, 0x00, 0x00, 0x07]);
        assert_eq!(out, vec![7]);
    }

    #[test]
    fn back_to_back_frames() {
        let mut p = FrameParser::default();
        let mut bytes = Vec::new();
        for v in [100i16, -100, 0] {
            let be = v.to_be_bytes();
            bytes.extend_from_slice(&[0xFF, 0xCC, 0x00, 0x00, 0x00, be[0], be[1]]);
        }
        assert_eq!(feed(&mut p, &bytes), vec![100, -100, 0]);
    }

    #[test]
    fn commands_match_the_vendor_protocol() {
        assert_eq!(CMD_START, [0xFF, 0xCC, 0x03, 0xA3, 0xA0]);
        assert_eq!(CMD_STOP, [0xFF, 0xCC, 0x03, 0xA4, 0xA1]);
    }
}
