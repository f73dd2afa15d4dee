//! Job launcher for `met run`
//!
//! Starts a shell command under skald monitoring:
//! - `sh -c <command>` in a new process group (pgid == child pid)
//! - stdout/stderr redirected to `<log_dir>/<name>.out` and `<name>.err`
//! - the registration message describing the job is prepared for the daemon

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use skald_contracts::messages::FALLBACK_JOB_NAME;
use skald_contracts::{JobRegistration, Pgid};
use std::fs::File;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command as AsyncCommand};
use tracing::{debug, info};

/// What to launch and where its logs go
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub name: String,
    pub command: Vec<String>,
    pub log_dir: PathBuf,
}

impl LaunchRequest {
    /// A single argument is taken as a shell string, several are quoted
    /// so each keeps its boundaries.
    pub fn command_line(&self) -> String {
        match self.command.as_slice() {
            [single] => single.clone(),
            args => shell_words::join(args),
        }
    }
}

/// A running job and its registration
#[derive(Debug)]
pub struct LaunchedJob {
    pub registration: JobRegistration,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    child: Child,
}

impl LaunchedJob {
    pub fn pgid(&self) -> Pgid {
        self.registration.pgid
    }

    /// Wait for the shell to exit (the rest of the group may outlive it)
    pub async fn wait(mut self) -> Result<ExitStatus> {
        self.child.wait().await.context("Failed to wait for job")
    }
}

/// Job name used as the log file stem. A blank name falls back to the
/// default label; a name that would leave the log directory is refused.
fn log_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Ok(FALLBACK_JOB_NAME);
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(anyhow!("Invalid job name {name:?}: it cannot contain path separators"));
    }
    Ok(name)
}

/// Launches jobs in their own process group
pub struct JobLauncher;

impl JobLauncher {
    pub fn launch(request: &LaunchRequest) -> Result<LaunchedJob> {
        let command_line = request.command_line();
        if command_line.trim().is_empty() {
            return Err(anyhow!("No command given"));
        }

        let name = log_name(&request.name)?;

        std::fs::create_dir_all(&request.log_dir)
            .with_context(|| format!("Failed to create log directory {}", request.log_dir.display()))?;
        let stdout_path = request.log_dir.join(format!("{name}.out"));
        let stderr_path = request.log_dir.join(format!("{name}.err"));
        let stdout = File::create(&stdout_path)
            .with_context(|| format!("Failed to create {}", stdout_path.display()))?;
        let stderr = File::create(&stderr_path)
            .with_context(|| format!("Failed to create {}", stderr_path.display()))?;

        debug!("Launching: sh -c {}", command_line);
        let child = AsyncCommand::new("sh")
            .arg("-c")
            .arg(&command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .spawn()
            .context("Failed to spawn job")?;

        let pid = child.id().ok_or_else(|| anyhow!("Job exited before it could be registered"))?;
        // process_group(0) makes the child the leader of a group named after its pid
        let pgid = Pgid::try_from(pid).context("Job pid out of range")?;
        let start_time = Utc::now();
        info!("Job {} started with pgid {}", name, pgid);

        let registration = JobRegistration::new(
            pgid,
            name,
            command_line,
            stdout_path.display().to_string(),
            start_time,
        );
        Ok(LaunchedJob { registration, stdout_path, stderr_path, child })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{getpgid, Pid};

    fn request(dir: &std::path::Path, command: &[&str]) -> LaunchRequest {
        LaunchRequest {
            name: "build".to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            log_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_command_line_joining() {
        let dir = std::path::Path::new("/tmp");
        assert_eq!(request(dir, &["make -j8 && echo ok"]).command_line(), "make -j8 && echo ok");
        assert_eq!(request(dir, &["echo", "two words"]).command_line(), "echo 'two words'");
    }

    #[tokio::test]
    async fn test_launch_writes_logs_and_registration() {
        let dir = tempfile::tempdir().unwrap();
        let job = JobLauncher::launch(&request(dir.path(), &["echo hello; echo oops >&2; sleep 0.2"])).unwrap();

        let pgid = getpgid(Some(Pid::from_raw(job.pgid()))).unwrap();
        assert_eq!(pgid.as_raw(), job.pgid());
        assert_eq!(job.registration.name, "build");
        assert_eq!(job.registration.log_path, dir.path().join("build.out").display().to_string());

        let status = job.wait().await.unwrap();
        assert!(status.success());
        let out = std::fs::read_to_string(dir.path().join("build.out")).unwrap();
        let err = std::fs::read_to_string(dir.path().join("build.err")).unwrap();
        assert_eq!(out.trim(), "hello");
        assert_eq!(err.trim(), "oops");
    }

    #[test]
    fn test_names_cannot_escape_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        for name in ["../x", "a/b", "..", "."] {
            let mut req = request(&logs, &["true"]);
            req.name = name.to_string();
            assert!(JobLauncher::launch(&req).is_err(), "accepted {name:?}");
        }
        assert!(!dir.path().join("x.out").exists());
        assert!(!logs.exists());

        assert_eq!(log_name("  ").unwrap(), FALLBACK_JOB_NAME);
        assert_eq!(log_name("build-2").unwrap(), "build-2");
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(JobLauncher::launch(&request(dir.path(), &["  "])).is_err());
    }
}
