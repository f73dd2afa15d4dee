//! CPU and memory collector
//!
//! Polls every pid of the tree snapshot and emits one observation per job
//! root per tick: CPU percent and memory percent summed over the root's
//! processes. Pids that vanished between refresh and poll are skipped.

use super::{Collector, CollectorError, SampleBuffer};
use crate::config::CollectorSettings;
use crate::metrics::{Batch, Sample};
use crate::tree::TreeSnapshot;
use chrono::Utc;
use skald_contracts::Pid;
use std::collections::HashSet;
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, System};

pub const SECTION: &str = "cpu";

/// Usage of one process
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Per-process usage lookups; `None` when the pid cannot be polled
pub trait UsageProbe: Send {
    fn usage(&mut self, pid: Pid) -> Option<ProcessUsage>;

    /// Forget per-pid state for processes that left the tree
    fn retain(&mut self, _live: &HashSet<Pid>) {}
}

/// sysinfo-backed probe. CPU percent is the delta between two refreshes of
/// the same pid; on a pid's first poll it is the lifetime average since the
/// process started, so short-lived processes are still counted.
pub struct SysinfoProbe {
    system: System,
    total_memory: u64,
    seen: HashSet<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let total_memory = system.total_memory();
        Self { system, total_memory, seen: HashSet::new() }
    }
}

impl UsageProbe for SysinfoProbe {
    fn usage(&mut self, pid: Pid) -> Option<ProcessUsage> {
        let key = sysinfo::Pid::from_u32(u32::try_from(pid).ok()?);
        let refreshed = self
            .system
            .refresh_process_specifics(key, ProcessRefreshKind::new().with_cpu().with_memory());
        if !refreshed {
            self.seen.remove(&pid);
            return None;
        }
        let process = self.system.process(key)?;
        let memory_percent = if self.total_memory > 0 {
            process.memory() as f64 / self.total_memory as f64 * 100.0
        } else {
            0.0
        };
        let cpu_percent = if self.seen.insert(pid) {
            lifetime_cpu(pid).unwrap_or(process.cpu_usage() as f64)
        } else {
            process.cpu_usage() as f64
        };
        Some(ProcessUsage { cpu_percent, memory_percent })
    }

    fn retain(&mut self, live: &HashSet<Pid>) {
        self.seen.retain(|pid| live.contains(pid));
    }
}

/// Average CPU percent over a process lifetime, from clock-tick counters:
/// busy ticks (user + system) over the ticks elapsed since it started.
fn lifetime_cpu_percent(busy_ticks: u64, start_ticks: u64, uptime_secs: f64, ticks_per_second: u64) -> f64 {
    if ticks_per_second == 0 {
        return 0.0;
    }
    let hz = ticks_per_second as f64;
    let alive = uptime_secs - start_ticks as f64 / hz;
    if alive <= 0.0 {
        return 0.0;
    }
    busy_ticks as f64 / hz / alive * 100.0
}

#[cfg(target_os = "linux")]
fn lifetime_cpu(pid: Pid) -> Option<f64> {
    use procfs::Current;

    let stat = procfs::process::Process::new(pid).ok()?.stat().ok()?;
    let uptime = procfs::Uptime::current().ok()?;
    Some(lifetime_cpu_percent(
        stat.utime + stat.stime,
        stat.starttime,
        uptime.uptime,
        procfs::ticks_per_second(),
    ))
}

#[cfg(not(target_os = "linux"))]
fn lifetime_cpu(_pid: Pid) -> Option<f64> {
    None
}

pub struct CpuCollector {
    interval: Duration,
    buffer: SampleBuffer,
    probe: Box<dyn UsageProbe>,
}

impl CpuCollector {
    pub fn new(settings: &CollectorSettings, probe: Box<dyn UsageProbe>) -> Self {
        Self {
            interval: settings.interval,
            buffer: SampleBuffer::new(settings.size),
            probe,
        }
    }
}

pub fn build(settings: &CollectorSettings) -> Result<Box<dyn Collector>, CollectorError> {
    Ok(Box::new(CpuCollector::new(settings, Box::new(SysinfoProbe::new()))))
}

impl Collector for CpuCollector {
    fn name(&self) -> &str {
        SECTION
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn collect(&mut self, targets: &TreeSnapshot) -> Option<Batch> {
        let now = Utc::now();
        let mut live = HashSet::new();
        for (root, pids) in targets.by_root() {
            let mut polled = false;
            let (mut cpu, mut memory) = (0.0, 0.0);
            for pid in pids {
                live.insert(pid);
                if let Some(usage) = self.probe.usage(pid) {
                    polled = true;
                    cpu += usage.cpu_percent;
                    memory += usage.memory_percent;
                }
            }
            if polled {
                self.buffer.push(Sample::cpu(root, now, cpu, memory));
            }
        }
        self.probe.retain(&live);
        self.buffer.take_if_full()
    }

    fn drain(&mut self) -> Option<Batch> {
        self.buffer.take()
    }

    fn finalize(&mut self) -> Result<(), CollectorError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{CpuReading, Reading};
    use std::collections::HashMap;

    struct FixedUsage(HashMap<Pid, ProcessUsage>);

    impl UsageProbe for FixedUsage {
        fn usage(&mut self, pid: Pid) -> Option<ProcessUsage> {
            self.0.get(&pid).copied()
        }
    }

    fn usage(cpu_percent: f64, memory_percent: f64) -> ProcessUsage {
        ProcessUsage { cpu_percent, memory_percent }
    }

    fn collector(size: usize, probe: FixedUsage) -> CpuCollector {
        let settings = CollectorSettings { interval: Duration::from_secs(1), size };
        CpuCollector::new(&settings, Box::new(probe))
    }

    #[test]
    fn test_one_observation_per_root() {
        let probe = FixedUsage(HashMap::from([
            (100, usage(20.0, 1.5)),
            (101, usage(30.0, 2.5)),
            (200, usage(5.0, 0.5)),
        ]));
        let mut cpu = collector(2, probe);
        let targets: TreeSnapshot = [(100, 100), (101, 100), (200, 200)].into_iter().collect();

        let batch = cpu.collect(&targets).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].root, 100);
        assert_eq!(batch[0].reading, Reading::Cpu(CpuReading { cpu: 50.0, memory: 4.0 }));
        assert_eq!(batch[1].root, 200);
        assert_eq!(batch[0].time, batch[1].time);
    }

    #[test]
    fn test_unpollable_pids_are_skipped() {
        let probe = FixedUsage(HashMap::from([(100, usage(10.0, 1.0))]));
        let mut cpu = collector(1, probe);
        // 101 vanished, 300 belongs to a root with no pollable pid
        let targets: TreeSnapshot = [(100, 100), (101, 100), (300, 300)].into_iter().collect();

        let batch = cpu.collect(&targets).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].reading, Reading::Cpu(CpuReading { cpu: 10.0, memory: 1.0 }));
    }

    #[test]
    fn test_threshold_counts_observations() {
        let probe = FixedUsage(HashMap::from([(100, usage(10.0, 1.0))]));
        let mut cpu = collector(3, probe);
        let targets: TreeSnapshot = [(100, 100)].into_iter().collect();

        assert!(cpu.collect(&targets).is_none());
        assert!(cpu.collect(&targets).is_none());
        assert_eq!(cpu.collect(&targets).map(|b| b.len()), Some(3));
        assert!(cpu.drain().is_none());
        assert!(cpu.finalize().is_ok());
    }

    #[test]
    fn test_lifetime_cpu_percent() {
        // started 10s after boot at 100 Hz, now 14s: 4s alive, 3s busy
        assert!((lifetime_cpu_percent(300, 1000, 14.0, 100) - 75.0).abs() < 1e-9);
        // two busy threads over the whole lifetime
        assert!((lifetime_cpu_percent(800, 1000, 14.0, 100) - 200.0).abs() < 1e-9);
        assert_eq!(lifetime_cpu_percent(5, 1400, 14.0, 100), 0.0);
        assert_eq!(lifetime_cpu_percent(5, 0, 14.0, 0), 0.0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_first_poll_reports_lifetime_usage() {
        let mut busy = std::process::Command::new("sh")
            .args(["-c", "while :; do :; done"])
            .spawn()
            .unwrap();
        std::thread::sleep(Duration::from_millis(400));

        let pid = busy.id() as Pid;
        let mut probe = SysinfoProbe::new();
        let first = probe.usage(pid).map(|u| u.cpu_percent);
        busy.kill().unwrap();
        busy.wait().unwrap();

        // a delta-only probe reads 0 here
        assert!(first.unwrap() > 10.0, "first poll read {first:?}");
    }

    #[test]
    fn test_probe_forgets_pids_that_left_the_tree() {
        let mut probe = SysinfoProbe::new();
        let me = std::process::id() as Pid;
        probe.usage(me).unwrap();
        assert!(probe.seen.contains(&me));

        probe.retain(&HashSet::new());
        assert!(probe.seen.is_empty());
    }

    #[test]
    fn test_sysinfo_probe_sees_current_process() {
        let mut probe = SysinfoProbe::new();
        let me = std::process::id() as Pid;
        let usage = probe.usage(me).unwrap();
        assert!(usage.memory_percent > 0.0);
        assert!(probe.usage(-1).is_none());
    }
}
