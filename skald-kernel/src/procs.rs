//! Host process listing
//!
//! The resolver only needs (pid, ppid, pgid) for every live process:
//! - Linux: one `/proc/<pid>/stat` read per process through procfs
//! - elsewhere: sysinfo listing, process group from `getpgid`

use skald_contracts::{Pgid, Pid};

#[derive(Debug, thiserror::Error)]
pub enum ListError {
    #[error("process listing failed: {0}")]
    Listing(String),
}

/// One live process as seen in a full host listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: Pid,
    pub ppid: Option<Pid>,
    pub pgid: Option<Pgid>,
}

impl ProcessEntry {
    pub fn new(pid: Pid, ppid: Pid, pgid: Pgid) -> Self {
        Self { pid, ppid: Some(ppid), pgid: Some(pgid) }
    }
}

/// Source of full host process listings
pub trait ProcessSource: Send {
    fn list(&mut self) -> Result<Vec<ProcessEntry>, ListError>;
}

#[cfg(target_os = "linux")]
pub use linux::ProcfsSource as HostProcesses;
#[cfg(not(target_os = "linux"))]
pub use portable::SysinfoSource as HostProcesses;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    /// Reads `/proc`. Threads are not listed, only thread-group leaders.
    #[derive(Debug, Default)]
    pub struct ProcfsSource;

    impl ProcfsSource {
        pub fn new() -> Self {
            Self
        }
    }

    impl ProcessSource for ProcfsSource {
        fn list(&mut self) -> Result<Vec<ProcessEntry>, ListError> {
            let all = procfs::process::all_processes().map_err(|e| ListError::Listing(e.to_string()))?;
            let mut entries = Vec::new();
            // processes exiting mid-listing are skipped
            for process in all.flatten() {
                if let Ok(stat) = process.stat() {
                    entries.push(ProcessEntry::new(stat.pid, stat.ppid, stat.pgrp));
                }
            }
            Ok(entries)
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod portable {
    use super::*;
    use nix::unistd::{getpgid, Pid as NixPid};
    use sysinfo::System;

    pub struct SysinfoSource {
        system: System,
    }

    impl SysinfoSource {
        pub fn new() -> Self {
            Self { system: System::new() }
        }
    }

    impl ProcessSource for SysinfoSource {
        fn list(&mut self) -> Result<Vec<ProcessEntry>, ListError> {
            self.system.refresh_processes();
            let entries = self
                .system
                .processes()
                .iter()
                .map(|(pid, process)| {
                    let pid = pid.as_u32() as Pid;
                    ProcessEntry {
                        pid,
                        ppid: process.parent().map(|p| p.as_u32() as Pid),
                        pgid: getpgid(Some(NixPid::from_raw(pid))).ok().map(|g| g.as_raw()),
                    }
                })
                .collect();
            Ok(entries)
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn test_procfs_lists_current_process() {
        let me = std::process::id() as Pid;
        let entries = HostProcesses::new().list().unwrap();
        let own = entries.iter().find(|e| e.pid == me).unwrap();
        assert_eq!(own.pgid, Some(nix::unistd::getpgrp().as_raw()));
        assert_eq!(own.ppid, Some(nix::unistd::getppid().as_raw()));
    }
}
