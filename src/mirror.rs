//! Mirrors every discovered stream into columnar session files.
//!
//! Discovery and pulling alternate in one loop: announcements open a netcdf
//! file per stream and extend `session_index.json`; pulled samples are
//! buffered and flushed on a row-count or age threshold. "stop" texts on
//! string streams are recorded to `stop_markers.jsonl` but never interpreted.

use crate::args::MirrorArgs;
use crate::common::{host_clock, spawn_signal_task, timestamp_human, EscWatcher};
use crate::inlet::{InletPool, Record};
use crate::outlet::OutletDescriptor;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Cadence of the stream-discovery scan
pub const DISCOVER_EVERY: f64 = 5.0;
/// Main loop sleep between pulls
const PULL_SLEEP: Duration = Duration::from_millis(20);
/// Flush a file once this many rows are buffered...
const FLUSH_ROWS: usize = 10_000;
/// ...or once the oldest buffered row is this old
const FLUSH_SEC: f64 = 3.0;
/// Deflate level; light compression that doesn't eat the CPU
const COMPRESSION_LEVEL: i32 = 1;

/// Buffered columnar writer for one stream
struct MirrorWriter {
    file: netcdf::FileMut,
    desc: OutletDescriptor,
    rows_written: usize,
    buf_times: Vec<f64>,
    buf_rows: Vec<Vec<f32>>,
    buf_text: Vec<String>,
    last_flush: f64,
    broken: bool,
}

impl MirrorWriter {
    fn create(path: &Path, desc: &OutletDescriptor, now: f64) -> eyre::Result<Self> {
        let mut file = netcdf::create(path)?;
        file.add_unlimited_dimension("time")?;
        {
            let mut t = file.add_variable::<f64>("time", &["time"])?;
            t.put_attribute("long_name", "Host monotonic time")?;
            t.put_attribute("units", "seconds")?;
        }
        if desc.channel_format.is_numeric() {
            for i in 0..desc.channel_count {
                let mut v = file.add_variable::<f32>(&format!("ch_{i}"), &["time"])?;
                v.set_compression(COMPRESSION_LEVEL, true)?;
                if !desc.units.is_empty() {
                    v.put_attribute("units", desc.units.as_str())?;
                }
            }
        } else {
            file.add_string_variable("value", &["time"])?;
        }
        Ok(Self {
            file,
            desc: desc.clone(),
            rows_written: 0,
            buf_times: Vec::new(),
            buf_rows: Vec::new(),
            buf_text: Vec::new(),
            last_flush: now,
            broken: false,
        })
    }

    fn append(&mut self, rec: &Record) {
        match rec {
            Record::Numeric { ts, values } => {
                self.buf_times.push(*ts);
                // Short rows are padded; the registry fixes shapes upstream
                let mut row = values.clone();
                row.resize(self.desc.channel_count, f32::NAN);
                self.buf_rows.push(row);
            }
            Record::Text { ts, value } => {
                self.buf_times.push(*ts);
                self.buf_text.push(value.clone());
            }
        }
    }

    fn rows(&self) -> usize {
        self.rows_written + self.buf_times.len()
    }

    fn should_flush(&self, now: f64) -> bool {
        !self.buf_times.is_empty()
            && (self.buf_times.len() >= FLUSH_ROWS || now - self.last_flush >= FLUSH_SEC)
    }

    fn flush(&mut self, now: f64) -> eyre::Result<()> {
        self.last_flush = now;
        if self.buf_times.is_empty() {
            return Ok(());
        }
        let start = self.rows_written;
        let n = self.buf_times.len();
        {
            let mut t = self
                .file
                .variable_mut("time")
                .ok_or_else(|| eyre::eyre!("time variable missing"))?;
            t.put_values(&self.buf_times, start..start + n)?;
        }
        if self.desc.channel_format.is_numeric() {
            for i in 0..self.desc.channel_count {
                let col: Vec<f32> = self.buf_rows.iter().map(|r| r[i]).collect();
                let mut v = self
                    .file
                    .variable_mut(&format!("ch_{i}"))
                    .ok_or_else(|| eyre::eyre!("channel variable missing"))?;
                v.put_values(&col, start..start + n)?;
            }
            self.buf_rows.clear();
        } else {
            let mut v = self
                .file
                .variable_mut("value")
                .ok_or_else(|| eyre::eyre!("value variable missing"))?;
            for (i, s) in self.buf_text.iter().enumerate() {
                v.put_string(s, start + i)?;
            }
            self.buf_text.clear();
        }
        self.buf_times.clear();
        self.rows_written = start + n;
        Ok(())
    }

    /// Final flush; dropping the file writes the metadata that makes it valid
    fn close(mut self, now: f64) -> eyre::Result<()> {
        self.flush(now)
    }
}

#[derive(Serialize)]
struct IndexEntry {
    file: String,
    #[serde(flatten)]
    desc: OutletDescriptor,
}

#[derive(Serialize)]
struct SessionIndex {
    session: String,
    started_at: String,
    streams: Vec<IndexEntry>,
}

fn write_index(dir: &Path, index: &SessionIndex) -> eyre::Result<()> {
    let body = serde_json::to_string_pretty(index)?;
    std::fs::write(dir.join("session_index.json"), body)?;
    Ok(())
}

/// A marker or command that asks the rig to stop; record-only
fn contains_stop(text: &str) -> bool {
    match serde_json::from_str::<Value>(text) {
        Ok(v) => {
            let label = v
                .get("label")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_lowercase();
            let cmd = v
                .get("cmd")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_lowercase();
            label.contains("stop") || cmd == "stop"
        }
        Err(_) => text.to_lowercase().contains("stop"),
    }
}

pub async fn run(args: MirrorArgs) -> eyre::Result<()> {
    let (sd_s, sd_r) = broadcast::channel(1);
    spawn_signal_task(sd_s);
    tokio::task::spawn_blocking(move || mirror_loop(args, sd_r)).await?
}

fn mirror_loop(args: MirrorArgs, mut shutdown: broadcast::Receiver<()>) -> eyre::Result<()> {
    info!("Starting mirror task!");
    let session = args.worker.session_or_new()?;
    let session_dir: PathBuf = args.out.join(&session);
    std::fs::create_dir_all(&session_dir)?;

    let mut pool = InletPool::new()?;
    let mut index = SessionIndex {
        session: session.clone(),
        started_at: timestamp_human()?,
        streams: Vec::new(),
    };
    write_index(&session_dir, &index)?;
    let mut stop_markers = OpenOptions::new()
        .create(true)
        .append(true)
        .open(session_dir.join("stop_markers.jsonl"))?;

    let mut writers: HashMap<String, MirrorWriter> = HashMap::new();
    let mut last_seen: HashMap<String, f64> = HashMap::new();

    println!("[mirror] out={}", session_dir.display());
    println!("[READY] mirror");

    let esc = (!args.worker.under_hub).then(EscWatcher::new);
    let hb_every = args.worker.hb_every();
    let mut last_discover = f64::MIN;
    let mut last_hb = host_clock();

    loop {
        // Look for shutdown signal
        if shutdown.try_recv().is_ok() {
            info!("Mirror task stopping");
            break;
        }
        if esc.as_ref().is_some_and(EscWatcher::pressed) {
            println!("[mirror] ESC, stopping");
            break;
        }

        let now = host_clock();
        if now - last_discover >= DISCOVER_EVERY {
            last_discover = now;
            for desc in pool.discover() {
                let base = desc.name.replace('/', "_");
                let sid8 = &desc.source_id[..desc.source_id.len().min(8)];
                let fname = format!("{base}__{sid8}.nc");
                match MirrorWriter::create(&session_dir.join(&fname), &desc, now) {
                    Ok(w) => {
                        println!(
                            "[mirror] + {}  type={}  ch={}  -> {}",
                            desc.name, desc.stype, desc.channel_count, fname
                        );
                        writers.insert(desc.source_id.clone(), w);
                        last_seen.insert(desc.source_id.clone(), now);
                        index.streams.push(IndexEntry { file: fname, desc });
                        if let Err(e) = write_index(&session_dir, &index) {
                            warn!("session index rewrite failed: {e}");
                        }
                    }
                    Err(e) => warn!(stream = desc.name.as_str(), "mirror file open failed: {e}"),
                }
            }
        }

        pool.pump();
        pool.maybe_refresh_corrections(now);

        for sid in pool.source_ids() {
            let recs = pool.pull_chunk(&sid);
            if recs.is_empty() {
                continue;
            }
            last_seen.insert(sid.clone(), now);
            let Some(w) = writers.get_mut(&sid) else {
                continue;
            };
            for rec in &recs {
                if let Record::Text { ts, value } = rec {
                    if contains_stop(value) {
                        let line = json!({"time": ts, "label": value, "stream": w.desc.name});
                        if writeln!(stop_markers, "{line}")
                            .and_then(|()| stop_markers.flush())
                            .is_err()
                        {
                            warn!("stop marker record failed");
                        }
                    }
                }
                if !w.broken {
                    w.append(rec);
                }
            }
        }

        for w in writers.values_mut() {
            if !w.broken && w.should_flush(now) {
                if let Err(e) = w.flush(now) {
                    // One sick file must not take the rest of the mirror down
                    warn!(stream = w.desc.name.as_str(), "mirror flush failed: {e}");
                    w.broken = true;
                }
            }
        }

        if now - last_hb >= hb_every {
            last_hb = now;
            let max_idle = writers
                .keys()
                .map(|sid| now - last_seen.get(sid).copied().unwrap_or(now))
                .fold(0.0_f64, f64::max);
            let hb = json!({
                "hb": "mirror",
                "streams": writers.len(),
                "rows": writers.values().map(MirrorWriter::rows).sum::<usize>(),
                "max_idle_s": (max_idle * 100.0).round() / 100.0,
            });
            println!("{hb}");
            if !args.worker.under_hub {
                if writers.is_empty() {
                    println!("[mirror] no streams yet; start the bridges and the data sources");
                } else {
                    let mut line = format!("[mirror] streams={}", writers.len());
                    for (sid, w) in &writers {
                        let idle = now - last_seen.get(sid).copied().unwrap_or(now);
                        line.push_str(&format!(
                            " | {}: rows={} idle={idle:.1}s",
                            w.desc.name.trim_start_matches("PB_"),
                            w.rows()
                        ));
                    }
                    println!("{line}");
                }
            }
        }

        std::thread::sleep(PULL_SLEEP);
    }

    // Closing writes each file's footer; try every writer even if one fails
    let now = host_clock();
    for (_, w) in writers.drain() {
        let name = w.desc.name.clone();
        if let Err(e) = w.close(now) {
            warn!(stream = name.as_str(), "mirror close failed: {e}");
        }
    }
    let end = json!({
        "ended_at": timestamp_human()?,
        "streams": index.streams.len(),
    });
    std::fs::write(
        session_dir.join("session_end.json"),
        serde_json::to_string_pretty(&end)?,
    )?;
    println!("[mirror] stopped. session={session}");
    Ok(())
}
