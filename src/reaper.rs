//! Child-exit notification.
//!
//! The kernel's child-exit signal is the only authoritative evidence that a
//! supervised process terminated. The reaper is modeled as a capability
//! that, given a process, resolves once with its wait status, or `None`
//! when the status is unobservable (the pid was never our child, or was
//! lost). The manager attaches a completion that folds the result back
//! into its mailbox.

use crate::constants::REAPER_POLL_INTERVAL;
use async_trait::async_trait;
use tokio::process::Child;

/// Capability that notifies on process exit.
#[async_trait]
pub trait Reaper: Send + Sync {
    /// Waits for a child we spawned ourselves.
    ///
    /// Resolves with the exit code, using the shell convention
    /// `128 + signal` for signal deaths; `None` if the status was lost.
    async fn reap_child(&self, child: Child) -> Option<i32>;

    /// Waits for a pid that may not be our child (recovery adoption,
    /// engine container roots).
    ///
    /// Uses `waitpid` when the pid turns out to be ours and falls back to
    /// liveness polling otherwise; in the polling case the status is
    /// unobservable and the result is `None`.
    async fn reap_pid(&self, pid: i32) -> Option<i32>;
}

/// Production reaper backed by the OS.
#[derive(Debug, Default)]
pub struct OsReaper;

impl OsReaper {
    /// Creates an OS reaper.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Reaper for OsReaper {
    async fn reap_child(&self, mut child: Child) -> Option<i32> {
        match child.wait().await {
            Ok(status) => exit_code(status),
            Err(_) => None,
        }
    }

    #[cfg(unix)]
    async fn reap_pid(&self, pid: i32) -> Option<i32> {
        loop {
            let mut raw: libc::c_int = 0;
            let rc = unsafe { libc::waitpid(pid, &mut raw, libc::WNOHANG) };

            if rc == pid {
                if libc::WIFEXITED(raw) {
                    return Some(libc::WEXITSTATUS(raw));
                }
                if libc::WIFSIGNALED(raw) {
                    return Some(128 + libc::WTERMSIG(raw));
                }
                // Stopped or continued; keep waiting for termination.
            } else if rc < 0 {
                // Not our child (or waitpid failed): poll for liveness.
                if unsafe { libc::kill(pid, 0) } != 0 {
                    let errno = std::io::Error::last_os_error().raw_os_error();
                    if errno == Some(libc::ESRCH) {
                        return None;
                    }
                    // EPERM means the process exists but belongs to
                    // someone else; keep polling.
                }
            }

            tokio::time::sleep(REAPER_POLL_INTERVAL).await;
        }
    }

    #[cfg(not(unix))]
    async fn reap_pid(&self, _pid: i32) -> Option<i32> {
        None
    }
}

/// Converts a wait status to the exit-code convention used throughout.
fn exit_code(status: std::process::ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(128 + signal);
        }
    }

    None
}
