//! Tables for `met list`
//!
//! Status is probed live: a job is Active while its process group still has
//! a member (`killpg(pgid, 0)` succeeds or is refused with EPERM).

use chrono::{DateTime, Duration, Utc};
use nix::errno::Errno;
use nix::sys::signal::killpg;
use nix::unistd::Pid;
use skald_contracts::{CpuSnapshot, GpuSnapshot, Pgid};
use std::fmt;
use tabled::settings::object::Columns;
use tabled::settings::{Alignment, Modify, Style};
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Active,
    Finished,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Active => f.write_str("Active"),
            JobStatus::Finished => f.write_str("Finished"),
        }
    }
}

pub fn probe_status(pgid: Pgid) -> JobStatus {
    match killpg(Pid::from_raw(pgid), None) {
        Ok(()) | Err(Errno::EPERM) => JobStatus::Active,
        Err(_) => JobStatus::Finished,
    }
}

/// Running time of a job: until now while active, until its last sample otherwise
pub fn job_duration(
    status: JobStatus,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Duration {
    let until = match status {
        JobStatus::Active => Some(now),
        JobStatus::Finished => end,
    };
    match until {
        Some(until) if until > start => until - start,
        _ => Duration::zero(),
    }
}

/// Whole seconds, humantime style ("1h 2m 3s")
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.num_seconds().max(0) as u64;
    humantime::format_duration(std::time::Duration::from_secs(secs)).to_string()
}

#[derive(Tabled)]
struct CpuRow {
    #[tabled(rename = "PGID")]
    pgid: Pgid,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "CPU % (avg)")]
    cpu: String,
    #[tabled(rename = "MEM % (avg)")]
    memory: String,
    #[tabled(rename = "Status")]
    status: JobStatus,
    #[tabled(rename = "Duration")]
    duration: String,
}

#[derive(Tabled)]
struct GpuRow {
    #[tabled(rename = "PGID")]
    pgid: Pgid,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "GPU util (avg)")]
    util: String,
    #[tabled(rename = "MEM GB (avg)")]
    memory: String,
    #[tabled(rename = "Energy Wh")]
    energy: String,
    #[tabled(rename = "Max temp °C")]
    max_temp: String,
    #[tabled(rename = "Status")]
    status: JobStatus,
    #[tabled(rename = "Duration")]
    duration: String,
}

fn build_table<T: Tabled>(rows: Vec<T>) -> String {
    if rows.is_empty() {
        return "No jobs tracked.".to_string();
    }
    let mut table = Table::new(rows);
    table
        .with(Style::modern())
        .with(Modify::new(Columns::new(2..)).with(Alignment::right()));
    table.to_string()
}

pub fn render_cpu(snapshot: &CpuSnapshot, status_of: impl Fn(Pgid) -> JobStatus, now: DateTime<Utc>) -> String {
    let rows = snapshot
        .iter()
        .map(|(pgid, summary)| {
            let status = status_of(*pgid);
            CpuRow {
                pgid: *pgid,
                name: summary.name.clone(),
                cpu: format!("{:.2}", summary.cpu),
                memory: format!("{:.2}", summary.memory),
                status,
                duration: format_duration(job_duration(status, summary.start, summary.end, now)),
            }
        })
        .collect();
    build_table::<CpuRow>(rows)
}

pub fn render_gpu(snapshot: &GpuSnapshot, status_of: impl Fn(Pgid) -> JobStatus, now: DateTime<Utc>) -> String {
    let rows = snapshot
        .iter()
        .map(|(pgid, summary)| {
            let status = status_of(*pgid);
            GpuRow {
                pgid: *pgid,
                name: summary.name.clone(),
                util: format!("{:.2}", summary.avg_util),
                memory: format!("{:.2}", summary.avg_memory),
                energy: format!("{:.3}", summary.energy),
                max_temp: format!("{:.0}", summary.max_temp),
                status,
                duration: format_duration(job_duration(status, summary.start, summary.end, now)),
            }
        })
        .collect();
    build_table::<GpuRow>(rows)
}
