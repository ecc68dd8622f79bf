//! Clocks, session identifiers, and the on-disk session layout shared between workers

use hifitime::prelude::*;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Standard timeout for blocking ops
pub const BLOCK_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(100);

/// The monotonic host clock, in seconds. Readings are comparable across
/// processes on the same host, which is what lets the mirror line its files up
/// with the workers' sample timestamps.
pub fn host_clock() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Safety: ts is a valid timespec for the kernel to write into
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as f64 + ts.tv_nsec as f64 * 1e-9
}

/// Wall-clock UNIX seconds, used only for human-facing journal fields
pub fn wall_clock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Compact UTC timestamp for filenames
pub fn timestamp_compact() -> eyre::Result<String> {
    // Filename with ISO 8610 standard format
    let fmt = Format::from_str("%Y%m%dT%H%M%S").unwrap();
    Ok(format!("{}", Formatter::new(Epoch::now()?, fmt)))
}

/// Human-readable UTC timestamp for manifests
pub fn timestamp_human() -> eyre::Result<String> {
    let fmt = Format::from_str("%Y-%m-%d %H:%M:%S").unwrap();
    Ok(format!("{}", Formatter::new(Epoch::now()?, fmt)))
}

/// Generate a fresh session identifier, `S<YYYYMMDD-HHMMSS>-<salt4>`.
/// The salt keeps two hubs started within the same second apart.
pub fn gen_session() -> eyre::Result<String> {
    let fmt = Format::from_str("%Y%m%d-%H%M%S").unwrap();
    let stamp = format!("{}", Formatter::new(Epoch::now()?, fmt));
    Ok(format!("S{}-{:04x}", stamp, rand::random::<u16>()))
}

/// Short random hex suffix for process-unique source ids
pub fn rand_suffix() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// Directory layout under one session. The tree is created before workers
/// start and never deleted by this system.
#[derive(Debug, Clone)]
pub struct SessionDirs {
    /// HKH preview CSVs
    pub preview: PathBuf,
    /// Raw datagram log and metrics journal
    pub logs: PathBuf,
    /// Root handed to the mirror via `--out` (the mirror appends the session)
    pub mirror_root: PathBuf,
}

impl SessionDirs {
    pub fn new(data_root: &Path, session: &str) -> Self {
        let recorder = data_root.join("recorder_data");
        Self {
            preview: recorder.join(session),
            logs: recorder.join("logs").join(session),
            mirror_root: data_root.join("mirror_data"),
        }
    }

    pub fn create_all(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.preview)?;
        std::fs::create_dir_all(&self.logs)?;
        std::fs::create_dir_all(&self.mirror_root)?;
        Ok(())
    }
}

/// Translate the portable signal set into the shared stop broadcast
pub fn spawn_signal_task(sd_s: tokio::sync::broadcast::Sender<()>) {
    use tokio::signal::unix::{signal, SignalKind};
    tokio::spawn(async move {
        let mut term = signal(SignalKind::terminate()).unwrap();
        let mut quit = signal(SignalKind::quit()).unwrap();
        let mut int = signal(SignalKind::interrupt()).unwrap();
        tokio::select! {
            _ = term.recv() => (),
            _ = quit.recv() => (),
            _ = int.recv() => (),
        }
        tracing::info!("Shutting down!");
        let _ = sd_s.send(());
    });
}

/// Puts the controlling terminal in cbreak mode so a bare ESC keypress can be
/// polled from the main loop without blocking. Restores the terminal on drop.
/// When stdin is not a tty every poll returns false and Ctrl-C remains the
/// fallback.
pub struct EscWatcher {
    fd: Option<RawFd>,
    saved: Option<libc::termios>,
}

impl Default for EscWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EscWatcher {
    pub fn new() -> Self {
        let fd: RawFd = 0;
        // Safety: isatty on a plain fd
        if unsafe { libc::isatty(fd) } != 1 {
            return Self {
                fd: None,
                saved: None,
            };
        }
        // Safety: termios is plain-old-data, fd checked above
        let saved = unsafe {
            let mut t: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut t) != 0 {
                return Self {
                    fd: None,
                    saved: None,
                };
            }
            let mut raw = t;
            raw.c_lflag &= !(libc::ICANON | libc::ECHO);
            raw.c_cc[libc::VMIN] = 0;
            raw.c_cc[libc::VTIME] = 0;
            if libc::tcsetattr(fd, libc::TCSANOW, &raw) != 0 {
                return Self {
                    fd: None,
                    saved: None,
                };
            }
            t
        };
        Self {
            fd: Some(fd),
            saved: Some(saved),
        }
    }

    /// Non-blocking poll; true once when ESC has been pressed
    pub fn pressed(&self) -> bool {
        let Some(fd) = self.fd else { return false };
        let mut buf = [0u8; 1];
        // Safety: reading one byte into a valid buffer; VMIN=0 makes this non-blocking
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), 1) };
        n == 1 && buf[0] == 0x1b
    }
}

impl Drop for EscWatcher {
    fn drop(&mut self) {
        if let (Some(fd), Some(saved)) = (self.fd, self.saved.as_ref()) {
            // Safety: restoring the attrs we saved in new()
            unsafe {
                libc::tcsetattr(fd, libc::TCSADRAIN, saved);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_clock_is_monotonic() {
        let a = host_clock();
        let b = host_clock();
        assert!(b >= a);
    }

    #[test]
    fn session_id_shape() {
        let s = gen_session().unwrap();
        assert!(s.starts_with('S'));
        // S + 8 date + '-' + 6 time + '-' + 4 salt
        assert_eq!(s.len(), 1 + 8 + 1 + 6 + 1 + 4);
    }

    #[test]
    fn session_dirs_layout() {
        let d = SessionDirs::new(Path::new("/tmp/data"), "S1");
        assert_eq!(d.preview, Path::new("/tmp/data/recorder_data/S1"));
        assert_eq!(d.logs, Path::new("/tmp/data/recorder_data/logs/S1"));
        assert_eq!(d.mirror_root, Path::new("/tmp/data/mirror_data"));
    }
}
