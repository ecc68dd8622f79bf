//! The wireless-device ingress worker. Every datagram becomes a raw-text
//! sample and a log line; recognized JSON additionally feeds the packet
//! accounting, the time-sync probe, and the typed translators.

use crate::args::PolarArgs;
use crate::clock::ClockSync;
use crate::common::{host_clock, rand_suffix, spawn_signal_task, wall_clock, EscWatcher, BLOCK_TIMEOUT};
use crate::metrics::{is_control, StreamMetrics};
use crate::monitoring::{self, IngressCounters};
use crate::outlet::{ChannelFormat, OutletDescriptor, OutletHub, OutletRegistry};
use crate::pingpong::PingPong;
use crate::translate::PolarTranslator;
use serde_json::{json, Map, Value};
use socket2::{Domain, Socket, Type};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Receive buffer size; ecg/acc/ppg chunk bursts arrive back to back
const SOCK_BUF_SIZE: usize = 4 * 1024 * 1024;
/// Cadence of the metrics journal, ping probes, and console summary
const SUMMARY_EVERY: f64 = 5.0;
/// Largest datagram we accept
const MAX_DATAGRAM: usize = 65536;

fn bind_ingress(port: u16) -> eyre::Result<UdpSocket> {
    // Create UDP socket
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    // Reuse local address without timeout
    socket.set_reuse_address(true)?;
    // Bind our listening address
    let address = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&address.into())?;
    socket.set_recv_buffer_size(SOCK_BUF_SIZE)?;
    // The kernel caps this at net.core.rmem_max without complaining
    let got = socket.recv_buffer_size()?;
    if got < SOCK_BUF_SIZE {
        warn!(
            requested = SOCK_BUF_SIZE,
            got, "receive buffer smaller than requested. Check sysctl net.core.rmem_max"
        );
    }
    let sock: UdpSocket = socket.into();
    // The shutdown flag must be able to interrupt the blocking receive
    sock.set_read_timeout(Some(BLOCK_TIMEOUT))?;
    Ok(sock)
}

pub async fn run(args: PolarArgs) -> eyre::Result<()> {
    let (sd_s, sd_ingress) = broadcast::channel(1);
    spawn_signal_task(sd_s);
    // Bind before anything else; a taken port is fatal, not retryable
    let sock = bind_ingress(args.port)?;
    let web = tokio::spawn(monitoring::start_web_server(args.metrics_port)?);
    let ingress = tokio::task::spawn_blocking(move || ingress_loop(args, sock, sd_ingress));
    let (web_res, ingress_res) = tokio::try_join!(web, ingress)?;
    web_res?;
    ingress_res
}

struct Journals {
    raw: BufWriter<std::fs::File>,
    metrics: BufWriter<std::fs::File>,
}

impl Journals {
    fn open(dir: &std::path::Path, session: &str) -> eyre::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let open = |name: String| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(name))
        };
        Ok(Self {
            raw: BufWriter::new(open(format!("{session}.log.jsonl"))?),
            metrics: BufWriter::new(open(format!("{session}.metrics.jsonl"))?),
        })
    }
}

fn ingress_loop(
    args: PolarArgs,
    sock: UdpSocket,
    mut shutdown: broadcast::Receiver<()>,
) -> eyre::Result<()> {
    info!("Starting ingress task!");
    let session = args.worker.session_or_new()?;
    let mut journals = Journals::open(&args.log_dir.join(&session), &session)?;

    let hub = Arc::new(OutletHub::new()?);
    // The raw bypass and marker streams exist from the start
    let udp_out = hub.create_outlet(OutletDescriptor {
        name: "PB_UDP".to_string(),
        stype: "udp_text".to_string(),
        source_id: format!("pb_udp_{}_{}", session, rand_suffix()),
        channel_count: 1,
        nominal_rate: 0.0,
        channel_format: ChannelFormat::String,
        units: String::new(),
        session: session.clone(),
    })?;
    let mark_out = hub.create_outlet(OutletDescriptor {
        name: "PB_MARKERS".to_string(),
        stype: "Markers".to_string(),
        source_id: format!("pb_markers_{}_{}", session, rand_suffix()),
        channel_count: 1,
        nominal_rate: 0.0,
        channel_format: ChannelFormat::String,
        units: String::new(),
        session: session.clone(),
    })?;
    let registry = OutletRegistry::new(Arc::clone(&hub), &session);
    let mut translator = PolarTranslator::new(registry, ClockSync::new());
    let mut metrics = StreamMetrics::new();
    let mut pingpong = PingPong::new(sock.try_clone()?);
    let mut counters = IngressCounters::default();

    println!("[polar] session={session}");
    println!("[polar] listening on 0.0.0.0:{}", args.port);
    println!("[READY] polar");

    let esc = (!args.worker.under_hub).then(EscWatcher::new);
    let hb_every = args.worker.hb_every();
    let mut last_hb = host_clock();
    let mut last_summary = host_clock();
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        // Look for shutdown signal
        if shutdown.try_recv().is_ok() {
            info!("Ingress task stopping");
            break;
        }
        if esc.as_ref().is_some_and(EscWatcher::pressed) {
            println!("[polar] ESC, stopping");
            break;
        }

        let now = host_clock();
        if now - last_hb >= hb_every {
            last_hb = now;
            let snapshot = metrics.snapshot();
            let timesync = pingpong.snapshot();
            let hb = json!({
                "hb": "polar",
                "udp_pkts": counters.udp_pkts,
                "handled": counters.handled,
                "unknown": counters.unknown,
                "errors": counters.errors,
                "udp_loss": &snapshot,
                "lat_avg_ms": pingpong.mean_latency_ms(),
            });
            println!("{hb}");
            monitoring::update_ingress(counters, &snapshot, &timesync);
        }
        if now - last_summary >= SUMMARY_EVERY {
            last_summary = now;
            pingpong.maybe_send_pings(now);
            let line = json!({
                "ts": wall_clock(),
                "snapshot": metrics.snapshot(),
                "timesync": pingpong.snapshot(),
            });
            writeln!(journals.metrics, "{line}")?;
            journals.metrics.flush()?;
            if !args.worker.under_hub {
                println!("[SUMMARY]");
                println!("{}", metrics.format_brief());
            }
        }

        let (n, remote) = match sock.recv_from(&mut buf) {
            Ok(x) => x,
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let t_host = host_clock();
        counters.udp_pkts += 1;
        let text = String::from_utf8_lossy(&buf[..n]).trim().to_string();

        // The raw journal retains everything for post-hoc diagnosis
        let rec = json!({"ts_host": wall_clock(), "remote": remote.to_string(), "raw": &text});
        writeln!(journals.raw, "{rec}")?;
        journals.raw.flush()?;

        let parsed: Option<Map<String, Value>> = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.as_object().cloned());

        // Markers get their own stream
        let mut routed = false;
        if let Some(obj) = &parsed {
            if obj.get("type").and_then(Value::as_str) == Some("marker") {
                let label = obj
                    .get("label")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or("unknown");
                mark_out.push_text(t_host, label);
                counters.handled += 1;
                routed = true;
            }
        }
        // The raw bypass gets every decoded datagram
        udp_out.push_text(t_host, &text);

        let Some(obj) = parsed else { continue };
        let device = obj
            .get("device")
            .or_else(|| obj.get("deviceLabel"))
            .and_then(Value::as_str);
        pingpong.update_endpoint(device, remote);

        let kind = obj.get("type").and_then(Value::as_str).unwrap_or("");
        if is_control(kind) {
            if kind == "pong" {
                pingpong.on_pong(&obj, t_host, device);
            }
            continue;
        }
        metrics.observe(&obj, t_host);
        if routed {
            continue;
        }
        match translator.handle(&obj, t_host) {
            Ok(true) => counters.handled += 1,
            Ok(false) => counters.unknown += 1,
            Err(e) => {
                counters.errors += 1;
                warn!("translator failed: {e}");
            }
        }
    }

    journals.raw.flush()?;
    journals.metrics.flush()?;
    Ok(())
}
