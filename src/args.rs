use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Status print interval in seconds (floor 0.5)
    #[arg(long, default_value_t = 2.0)]
    pub interval: f64,
    /// Root directory for session output
    #[arg(long, default_value = "./data")]
    pub data_root: PathBuf,
    /// Worker role; without one, the supervisor launches all three
    #[command(subcommand)]
    pub role: Option<Role>,
}

impl Cli {
    pub fn interval(&self) -> f64 {
        self.interval.max(0.5)
    }
}

#[derive(Debug, Subcommand)]
pub enum Role {
    /// UDP ingress bridging the wireless biosignal devices
    Polar(PolarArgs),
    /// Serial ingress for the respiration belt
    Hkh(HkhArgs),
    /// Mirror every visible stream into columnar session files
    Mirror(MirrorArgs),
}

/// Flags every worker honors
#[derive(Debug, Args, Clone)]
pub struct WorkerArgs {
    /// Session identifier; generated when absent
    #[arg(long)]
    pub session: Option<String>,
    /// Suppress human summaries; the supervisor consumes our heartbeats
    #[arg(long)]
    pub under_hub: bool,
    /// Heartbeat interval in seconds (floor 0.5)
    #[arg(long, default_value_t = 2.0)]
    pub hb_interval: f64,
}

impl WorkerArgs {
    pub fn session_or_new(&self) -> eyre::Result<String> {
        match &self.session {
            Some(s) => Ok(s.clone()),
            None => crate::common::gen_session(),
        }
    }

    pub fn hb_every(&self) -> f64 {
        self.hb_interval.max(0.5)
    }
}

#[derive(Debug, Args, Clone)]
pub struct PolarArgs {
    #[command(flatten)]
    pub worker: WorkerArgs,
    /// Port the devices direct their datagrams to
    #[arg(long, default_value_t = 9001)]
    #[clap(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,
    /// Port to respond to prometheus requests for metrics
    #[arg(long, default_value_t = 8083)]
    #[clap(value_parser = clap::value_parser!(u16).range(1..))]
    pub metrics_port: u16,
    /// Root directory for the raw datagram log and metrics journal
    /// (a session subdirectory is created)
    #[arg(long, default_value = "./data/recorder_data/logs")]
    pub log_dir: PathBuf,
}

#[derive(Debug, Args, Clone)]
pub struct HkhArgs {
    #[command(flatten)]
    pub worker: WorkerArgs,
    /// Root directory for preview CSVs (a session subdirectory is created)
    #[arg(long, default_value = "./data/recorder_data")]
    pub csv_dir: PathBuf,
}

#[derive(Debug, Args, Clone)]
pub struct MirrorArgs {
    #[command(flatten)]
    pub worker: WorkerArgs,
    /// Output root (a session subdirectory is created)
    #[arg(long, default_value = "./data/mirror_data")]
    pub out: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervisor_is_the_default_role() {
        let cli = Cli::parse_from(["physio_bridge"]);
        assert!(cli.role.is_none());
        assert_eq!(cli.interval(), 2.0);
    }

    #[test]
    fn interval_has_a_floor() {
        let cli = Cli::parse_from(["physio_bridge", "--interval", "0.1"]);
        assert_eq!(cli.interval(), 0.5);
    }

    #[test]
    fn worker_flags_parse() {
        let cli = Cli::parse_from([
            "physio_bridge",
            "mirror",
            "--session",
            "S20260801-120000-abcd",
            "--under-hub",
            "--hb-interval",
            "1.5",
            "--out",
            "/tmp/mirror",
        ]);
        match cli.role {
            Some(Role::Mirror(m)) => {
                assert_eq!(m.worker.session.as_deref(), Some("S20260801-120000-abcd"));
                assert!(m.worker.under_hub);
                assert_eq!(m.worker.hb_every(), 1.5);
                assert_eq!(m.out, PathBuf::from("/tmp/mirror"));
            }
            other => panic!("wrong role: {other:?}"),
        }
    }
}
