//! Process inspection and control
//!
//! Containment works on live OS processes through signals; detection only
//! needs liveness checks and best-effort cmdline snapshots. Both go through
//! the [`ProcessControl`] trait so tests can substitute a fake.

use std::path::Path;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};

/// OS process operations needed by the engine and the containment handler.
pub trait ProcessControl: Send + Sync + 'static {
    /// Best-effort command-line snapshot. `None` if the process is gone or
    /// unreadable; callers degrade to partial information.
    fn cmdline(&self, pid: u32) -> Option<String>;

    /// Whether the pid currently names a running process.
    fn is_alive(&self, pid: u32) -> bool;

    /// Pause execution (SIGSTOP). Reversible.
    fn suspend(&self, pid: u32) -> anyhow::Result<()>;

    /// Resume a previously suspended process (SIGCONT).
    fn resume(&self, pid: u32) -> anyhow::Result<()>;

    /// Terminate the process (SIGKILL).
    fn kill(&self, pid: u32) -> anyhow::Result<()>;
}

/// The real thing: signal(2) plus /proc.
pub struct SysProcessControl;

impl ProcessControl for SysProcessControl {
    fn cmdline(&self, pid: u32) -> Option<String> {
        let raw = std::fs::read_to_string(format!("/proc/{}/cmdline", pid)).ok()?;
        let cmdline = raw.replace('\0', " ").trim().to_string();
        if cmdline.is_empty() {
            // Kernel threads and zombies have an empty cmdline; fall back
            // to comm so the whitelist still has something to match on.
            let comm = std::fs::read_to_string(format!("/proc/{}/comm", pid)).ok()?;
            let comm = comm.trim().to_string();
            if comm.is_empty() {
                return None;
            }
            return Some(comm);
        }
        Some(cmdline)
    }

    fn is_alive(&self, pid: u32) -> bool {
        Path::new(&format!("/proc/{}", pid)).exists()
    }

    fn suspend(&self, pid: u32) -> anyhow::Result<()> {
        signal::kill(Pid::from_raw(pid as i32), Signal::SIGSTOP)?;
        info!("suspended process {}", pid);
        Ok(())
    }

    fn resume(&self, pid: u32) -> anyhow::Result<()> {
        signal::kill(Pid::from_raw(pid as i32), Signal::SIGCONT)?;
        info!("resumed process {}", pid);
        Ok(())
    }

    fn kill(&self, pid: u32) -> anyhow::Result<()> {
        signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL)?;
        warn!("killed process {}", pid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdline_of_current_process() {
        let control = SysProcessControl;
        let cmdline = control.cmdline(std::process::id());
        assert!(cmdline.is_some());
        assert!(!cmdline.unwrap().is_empty());
    }

    #[test]
    fn liveness_of_current_process() {
        let control = SysProcessControl;
        assert!(control.is_alive(std::process::id()));
        // Way past any realistic pid_max.
        assert!(!control.is_alive(u32::MAX - 1));
    }
}
