//! The supervisor: one session id, three worker children, aggregated status
//! lines, and an ordered wind-down (soft stop, bounded wait, then force).

use crate::args::Cli;
use crate::common::{gen_session, host_clock, EscWatcher, SessionDirs};
use eyre::WrapErr;
use serde_json::Value;
use std::net::UdpSocket;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// How long children get to wind down after the soft stop
const SOFT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Low-level bus chatter that may end up on a child's stdout; not worth relaying
const NOISY_MARKERS: &[&str] = &["outlet-bus", "subscriber added"];

struct Worker {
    name: &'static str,
    child: Child,
    lines: mpsc::UnboundedReceiver<String>,
    ready: bool,
    status: Option<Value>,
    exit: Option<std::process::ExitStatus>,
}

fn spawn_worker(name: &'static str, mut cmd: Command) -> eyre::Result<Worker> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    // Each child leads its own process group so the soft stop reaches any
    // helpers it spawned too
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    let mut child = cmd.spawn().wrap_err_with(|| format!("spawning {name}"))?;
    let stdout = child.stdout.take().expect("stdout was piped");
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    Ok(Worker {
        name,
        child,
        lines: rx,
        ready: false,
        status: None,
        exit: None,
    })
}

fn group_signal(w: &Worker, sig: libc::c_int) {
    if w.exit.is_some() {
        return;
    }
    if let Some(pid) = w.child.id() {
        // Safety: signalling the process group the child leads
        unsafe {
            libc::killpg(pid as libc::c_int, sig);
        }
    }
}

fn is_noisy(line: &str) -> bool {
    NOISY_MARKERS.iter().any(|m| line.contains(m))
}

/// Route probe: connecting a datagram socket picks the outbound interface
/// without sending anything
fn local_lan_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let s = UdpSocket::bind("0.0.0.0:0")?;
        s.connect("8.8.8.8:80")?;
        Ok(s.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn get_u64(s: &Value, key: &str) -> u64 {
    s.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn get_f64(s: &Value, key: &str) -> f64 {
    s.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

fn format_udp_loss(loss: Option<&Value>) -> Vec<String> {
    let Some(Value::Object(map)) = loss else {
        return Vec::new();
    };
    map.iter()
        .map(|(key, v)| {
            let pk = v.get("pkts").cloned().unwrap_or(Value::Null);
            let ia = v.get("ia_10s").cloned().unwrap_or(Value::Null);
            format!(
                "    {key}: recv {} miss {} ooo {} loss {:.2}% rate {:.2}Hz jitter {:.1}ms",
                get_u64(&pk, "recv"),
                get_u64(&pk, "miss"),
                get_u64(&pk, "ooo"),
                get_f64(&pk, "loss_rate") * 100.0,
                get_f64(&ia, "rate_hz"),
                get_f64(&ia, "jitter_ms"),
            )
        })
        .collect()
}

fn print_worker_status(name: &str, s: &Value) {
    match s.get("hb").and_then(Value::as_str) {
        Some("polar") => {
            println!(
                "[hub] {name}: udp {} handled {} unknown {} errors {} lat {:.1}ms",
                get_u64(s, "udp_pkts"),
                get_u64(s, "handled"),
                get_u64(s, "unknown"),
                get_u64(s, "errors"),
                get_f64(s, "lat_avg_ms"),
            );
            for line in format_udp_loss(s.get("udp_loss")) {
                println!("[hub] {line}");
            }
        }
        Some("hkh") => println!(
            "[hub] {name}: {:.1}s elapsed, {} samples in the last beat, last value {}",
            get_f64(s, "elapsed_s"),
            get_u64(s, "recent_samples"),
            s.get("last_value").cloned().unwrap_or(Value::Null),
        ),
        Some("mirror") => println!(
            "[hub] {name}: {} streams, {} rows written, max idle {:.1}s",
            get_u64(s, "streams"),
            get_u64(s, "rows"),
            get_f64(s, "max_idle_s"),
        ),
        _ => {}
    }
}

pub async fn run(cli: &Cli) -> eyre::Result<()> {
    let session = gen_session()?;
    let dirs = SessionDirs::new(&cli.data_root, &session);
    dirs.create_all()?;
    let interval = cli.interval();
    let ip = local_lan_ip();

    println!("{}", "=".repeat(78));
    println!("Physio Recording Suite");
    println!("- session id: {session}");
    println!("- host LAN IP: {ip} ; point the phone's UDP target at {ip}:9001");
    println!("- recorder: tick the PB_* streams plus PB_UDP/PB_MARKERS, then start it");
    println!("- press ESC or Ctrl-C to finish; file locations print after the wind-down");
    println!("{}", "=".repeat(78));

    let exe = std::env::current_exe()?;
    let hb = format!("{interval}");
    let logs_root = cli.data_root.join("recorder_data").join("logs");
    let preview_root = cli.data_root.join("recorder_data");

    let worker_cmd = |role: &str| {
        let mut cmd = Command::new(&exe);
        cmd.args([
            role,
            "--session",
            session.as_str(),
            "--under-hub",
            "--hb-interval",
            hb.as_str(),
        ]);
        cmd
    };
    let mut workers = vec![
        spawn_worker("Polar", {
            let mut cmd = worker_cmd("polar");
            cmd.arg("--log-dir").arg(&logs_root);
            cmd
        })?,
        spawn_worker("HKH", {
            let mut cmd = worker_cmd("hkh");
            cmd.arg("--csv-dir").arg(&preview_root);
            cmd
        })?,
        spawn_worker("Mirror", {
            let mut cmd = worker_cmd("mirror");
            cmd.arg("--out").arg(&dirs.mirror_root);
            cmd
        })?,
    ];

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = signal(SignalKind::terminate()).unwrap();
            let mut quit = signal(SignalKind::quit()).unwrap();
            let mut int = signal(SignalKind::interrupt()).unwrap();
            tokio::select! {
                _ = term.recv() => (),
                _ = quit.recv() => (),
                _ = int.recv() => (),
            }
            stop.store(true, Ordering::SeqCst);
        });
    }
    let esc = EscWatcher::new();

    let mut announced_ready = false;
    let mut last_status = host_clock();
    let mut tick = tokio::time::interval(Duration::from_millis(100));
    loop {
        tick.tick().await;
        if stop.load(Ordering::SeqCst) {
            println!("[hub] stop requested, winding down...");
            break;
        }
        if esc.pressed() {
            println!("[hub] ESC, winding down...");
            break;
        }

        for w in &mut workers {
            while let Ok(line) = w.lines.try_recv() {
                let trimmed = line.trim();
                // Heartbeats are consumed silently and shown aggregated
                if trimmed.starts_with('{') {
                    if let Ok(obj) = serde_json::from_str::<Value>(trimmed) {
                        if matches!(
                            obj.get("hb").and_then(Value::as_str),
                            Some("polar" | "hkh" | "mirror")
                        ) {
                            w.status = Some(obj);
                            continue;
                        }
                    }
                }
                if trimmed.contains("[READY]") {
                    w.ready = true;
                }
                if trimmed.is_empty() || is_noisy(trimmed) {
                    continue;
                }
                println!("[{}] {}", w.name, line);
            }
        }

        if !announced_ready && workers.iter().all(|w| w.ready) {
            announced_ready = true;
            println!("[hub] all workers ready; recording is live");
            println!("[hub] confirm the recorder has started capturing");
        }

        let now = host_clock();
        if now - last_status >= interval {
            last_status = now;
            for w in &workers {
                if let Some(s) = &w.status {
                    print_worker_status(w.name, s);
                }
            }
        }

        let mut early_exit = false;
        for w in &mut workers {
            if w.exit.is_none() {
                if let Ok(Some(status)) = w.child.try_wait() {
                    w.exit = Some(status);
                    println!(
                        "[hub] warning: {} exited early (code {:?}); stopping the rest",
                        w.name,
                        status.code()
                    );
                    early_exit = true;
                }
            }
        }
        if early_exit {
            break;
        }
    }

    // Soft stop first; workers flush files and send device stop commands
    println!("[hub] sending soft stop to workers...");
    for w in &workers {
        group_signal(w, libc::SIGTERM);
    }
    let deadline = tokio::time::Instant::now() + SOFT_STOP_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        for w in &mut workers {
            if w.exit.is_none() {
                if let Ok(Some(status)) = w.child.try_wait() {
                    w.exit = Some(status);
                }
            }
        }
        if workers.iter().all(|w| w.exit.is_some()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    for w in &mut workers {
        if w.exit.is_none() {
            println!("[hub] {} did not stop in time, killing", w.name);
            group_signal(w, libc::SIGKILL);
            if let Ok(status) = w.child.wait().await {
                w.exit = Some(status);
            }
        }
    }
    for w in &workers {
        match w.exit {
            Some(st) if st.success() => println!("[hub] {} stopped", w.name),
            Some(st) => println!(
                "[hub] {} stopped (exit code {})",
                w.name,
                st.code()
                    .map_or_else(|| "killed by signal".to_string(), |c| c.to_string())
            ),
            None => println!("[hub] {} stopped (forced)", w.name),
        }
    }
    // Swallow whatever output is still queued so it doesn't bury the summary
    for w in &mut workers {
        while w.lines.try_recv().is_ok() {}
    }

    println!();
    println!("{}", "=".repeat(78));
    println!("Recording finished:");
    println!("1) stop the recorder and collect its file from its own save path");
    println!("2) network logs: {}", dirs.logs.display());
    println!("3) respiration preview CSVs: {}", dirs.preview.display());
    println!(
        "4) mirrored streams: {}",
        dirs.mirror_root.join(&session).display()
    );
    println!("{}", "=".repeat(78));
    Ok(())
}
