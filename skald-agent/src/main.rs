//! met - command line front door of the skald monitoring daemon
//!
//! - `met run [-n NAME] -- <command...>`: launch a job in its own process
//!   group and register it with the daemon
//! - `met list cpu|gpu`: query the daemon and print job summaries

mod display;
mod execution;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use display::{probe_status, render_cpu, render_gpu};
use execution::{JobLauncher, LaunchRequest};
use skald_contracts::messages::{DEFAULT_QUERY_SOCKET, DEFAULT_REGISTRATION_SOCKET, FALLBACK_JOB_NAME};
use skald_contracts::messages::UnknownKind;
use skald_contracts::MetricKind;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "met")]
#[command(version, about = "Run and inspect jobs monitored by skald", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch a command and register it with the daemon
    Run {
        /// Job name, also used for the log file names
        #[arg(short, long, default_value = FALLBACK_JOB_NAME)]
        name: String,

        /// Directory receiving <name>.out and <name>.err
        #[arg(long, default_value = ".")]
        log_dir: PathBuf,

        /// Registration socket of the daemon
        #[arg(long, default_value = DEFAULT_REGISTRATION_SOCKET)]
        socket: PathBuf,

        /// Stay attached and exit with the job's status
        #[arg(long)]
        wait: bool,

        /// Command to run through `sh -c`
        #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },
    /// Print the summaries of every tracked job
    List {
        /// Metric family: cpu or gpu
        #[arg(value_parser = parse_kind)]
        kind: MetricKind,

        /// Query socket of the daemon
        #[arg(long, default_value = DEFAULT_QUERY_SOCKET)]
        socket: PathBuf,
    },
}

fn parse_kind(value: &str) -> Result<MetricKind, UnknownKind> {
    value.parse()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("SKALD_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { name, log_dir, socket, wait, command } => {
            let request = LaunchRequest { name, command, log_dir };
            let code = run_job(&request, &socket, wait).await?;
            std::process::exit(code);
        }
        Commands::List { kind, socket } => {
            println!("{}", list_jobs(kind, &socket).await?);
        }
    }
    Ok(())
}

/// Launches the job and registers it; returns the exit code for `met`
async fn run_job(request: &LaunchRequest, socket: &Path, wait: bool) -> Result<i32> {
    let job = JobLauncher::launch(request)?;
    println!(
        "Started {} (pgid {}), logs: {} / {}",
        job.registration.name,
        job.pgid(),
        job.stdout_path.display(),
        job.stderr_path.display()
    );

    // the job keeps running even if the daemon cannot be reached
    if let Err(e) = skald_contracts::notify(socket, &job.registration).await {
        warn!("Job {} is not monitored: {}", job.pgid(), e);
        eprintln!("warning: daemon not notified ({e})");
    }

    if !wait {
        return Ok(0);
    }
    let status = job.wait().await?;
    Ok(status.code().unwrap_or(1))
}

async fn list_jobs(kind: MetricKind, socket: &Path) -> Result<String> {
    let now = Utc::now();
    let table = match kind {
        MetricKind::Cpu => {
            let snapshot = skald_contracts::query_cpu(socket)
                .await
                .context("Failed to query CPU summaries")?;
            render_cpu(&snapshot, probe_status, now)
        }
        MetricKind::Gpu => {
            let snapshot = skald_contracts::query_gpu(socket)
                .await
                .context("Failed to query GPU summaries")?;
            render_gpu(&snapshot, probe_status, now)
        }
    };
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use skald_contracts::{CpuSnapshot, CpuSummary, GpuSnapshot, GpuSummary, MockDaemon};

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_takes_trailing_command() {
        let cli = Cli::parse_from(["met", "run", "-n", "build", "--", "make", "-j8"]);
        match cli.command {
            Commands::Run { name, command, wait, .. } => {
                assert_eq!(name, "build");
                assert_eq!(command, vec!["make", "-j8"]);
                assert!(!wait);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(Cli::try_parse_from(["met", "list", "disk"]).is_err());
    }

    #[tokio::test]
    async fn test_run_registers_with_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = MockDaemon::start(dir.path()).await.unwrap();
        let request = LaunchRequest {
            name: "build".to_string(),
            command: vec!["exit 3".to_string()],
            log_dir: dir.path().join("logs"),
        };

        let code = run_job(&request, daemon.registration_path(), true).await.unwrap();
        assert_eq!(code, 3);

        let received = daemon.wait_for_registrations(1).await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].name, "build");
        assert_eq!(received[0].command, "exit 3");
        assert!(dir.path().join("logs").join("build.err").exists());
    }

    #[tokio::test]
    async fn test_run_survives_missing_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let request = LaunchRequest {
            name: "orphan".to_string(),
            command: vec!["true".to_string()],
            log_dir: dir.path().to_path_buf(),
        };
        let code = run_job(&request, &dir.path().join("absent.socket"), true).await.unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_list_renders_daemon_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = MockDaemon::start(dir.path()).await.unwrap();
        let mut snapshot = CpuSnapshot::new();
        snapshot.insert(i32::MAX, CpuSummary::new("build", Utc::now()));
        daemon.set_cpu(snapshot);

        let table = list_jobs(MetricKind::Cpu, daemon.query_path()).await.unwrap();
        assert!(table.contains("build"));
        assert!(table.contains("Finished"));

        let empty = list_jobs(MetricKind::Gpu, daemon.query_path()).await.unwrap();
        assert_eq!(empty, "No jobs tracked.");

        let mut gpu = GpuSnapshot::new();
        let mut train = GpuSummary::new("train", Utc::now());
        train.avg_util = 87.5;
        train.energy = 2.25;
        train.max_temp = 74.0;
        gpu.insert(i32::MAX, train);
        daemon.set_gpu(gpu);

        let table = list_jobs(MetricKind::Gpu, daemon.query_path()).await.unwrap();
        assert!(table.contains("train"));
        assert!(table.contains("87.50"));
        assert!(table.contains("2.250"));
        assert!(table.contains("74"));
        assert!(table.contains("Finished"));
    }
}
