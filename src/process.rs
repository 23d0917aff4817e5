//! Subprocess lifecycle for one agent invocation, plus out-of-process abort.
//!
//! The child PID is written to `.waypoint/agent.pid` on spawn so a separate
//! invocation of the tool can request cancellation. The PID file is a weak
//! reference: the process may have exited or the PID recycled, so the
//! executable name is re-verified before any signal is sent.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// Relative path of the PID file within the project directory.
pub const PID_FILE: &str = ".waypoint/agent.pid";

/// Executable names the PID file may legitimately point at. The agent CLI
/// runs under node, so both count.
const AGENT_PROCESS_NAMES: [&str; 2] = ["claude", "node"];

/// Owns one running agent subprocess and its PID file.
pub struct ProcessSession {
    child: Child,
    pid_file: PathBuf,
}

impl ProcessSession {
    /// Spawn the command with piped stdout/stderr and record the child PID.
    pub fn spawn(mut command: Command, project_dir: &Path) -> std::io::Result<Self> {
        let child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .current_dir(project_dir)
            .kill_on_drop(true)
            .spawn()?;

        let pid_file = project_dir.join(PID_FILE);
        if let Some(pid) = child.id() {
            if let Some(parent) = pid_file.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Err(err) = std::fs::write(&pid_file, pid.to_string()) {
                tracing::warn!(%err, "failed to write PID file; external abort unavailable");
            }
        }

        Ok(Self { child, pid_file })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Non-blocking completion check. Returns the exit code once the child
    /// has exited (-1 when terminated by signal).
    pub fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| status.code().unwrap_or(-1)))
    }

    /// Reap the child, returning its exit code (-1 when signal-terminated).
    pub async fn wait(&mut self) -> std::io::Result<i32> {
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }

    pub async fn kill(&mut self) {
        if let Err(err) = self.child.kill().await {
            // Already exited is the common case here.
            tracing::debug!(%err, "kill after exit");
        }
    }

    /// Remove the PID file. Safe to call multiple times.
    pub fn cleanup(&self) {
        if self.pid_file.exists() {
            let _ = std::fs::remove_file(&self.pid_file);
        }
    }
}

/// Abort a running agent recorded in the PID file of `project_dir`.
///
/// Verifies the referenced process is actually the agent before signaling,
/// guarding against PID reuse. The PID file is removed regardless of
/// outcome. Returns true if a process was signaled.
pub fn abort_running_agent(project_dir: &Path) -> Result<bool> {
    let pid_file = project_dir.join(PID_FILE);
    if !pid_file.exists() {
        return Ok(false);
    }

    let remove_pid_file = || {
        let _ = std::fs::remove_file(&pid_file);
    };

    let content = std::fs::read_to_string(&pid_file).context("Failed to read PID file")?;
    let pid: u32 = match content.trim().parse() {
        Ok(pid) => pid,
        Err(_) => {
            tracing::warn!(content = %content.trim(), "PID file does not contain a PID");
            remove_pid_file();
            return Ok(false);
        }
    };

    match process_name(pid) {
        Some(name) => {
            let lower = name.to_lowercase();
            if !AGENT_PROCESS_NAMES.iter().any(|n| lower.contains(n)) {
                tracing::warn!(pid, process = %name, "PID is not an agent process, skipping kill");
                remove_pid_file();
                return Ok(false);
            }
        }
        None => {
            tracing::warn!(pid, "process no longer exists");
            remove_pid_file();
            return Ok(false);
        }
    }

    let killed = terminate(pid);
    if killed {
        tracing::info!(pid, "agent process terminated");
    }
    remove_pid_file();
    Ok(killed)
}

/// Resolve the executable name of a live process, or None if it is gone.
fn process_name(pid: u32) -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(comm) = std::fs::read_to_string(format!("/proc/{pid}/comm")) {
            return Some(comm.trim().to_string());
        }
    }
    // Portable fallback (also the macOS path).
    let output = std::process::Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "comm="])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if name.is_empty() { None } else { Some(name) }
}

#[cfg(unix)]
fn terminate(pid: u32) -> bool {
    // SAFETY: plain syscall; the worst a stale PID can do here was excluded
    // by the name check above.
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> bool {
    tracing::warn!(pid, "external abort is not supported on this platform");
    false
}

/// Check that the agent binary responds to `--version`.
pub async fn check_agent_installed(binary: &str) -> bool {
    let probe = Command::new(binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match tokio::time::timeout(Duration::from_secs(10), probe).await {
        Ok(Ok(status)) => status.success(),
        _ => false,
    }
}
