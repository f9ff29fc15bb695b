use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;

use crate::error::KillError;

const TERM_GRACE: Duration = Duration::from_secs(5);

/// Force-terminates OS processes by pid.
pub trait ProcessKiller: Send + Sync + Clone + 'static {
    fn kill(&self, pid: i32) -> Result<(), KillError>;
}

/// SIGKILL via `nix`. Jobs are spawned as process-group leaders, so the
/// whole group is signalled; a pid that leads no group is signalled alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NixKiller;

impl ProcessKiller for NixKiller {
    fn kill(&self, pid: i32) -> Result<(), KillError> {
        if pid <= 0 {
            return Err(KillError::InvalidPid { pid });
        }
        let target = Pid::from_raw(pid);
        match killpg(target, Signal::SIGKILL) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                kill(target, Signal::SIGKILL).map_err(|source| KillError::Signal { pid, source })
            }
            Err(source) => Err(KillError::Signal { pid, source }),
        }
    }
}

/// SIGTERM the child's process group, wait up to 5 s, then SIGKILL.
pub(crate) async fn terminate_child(child: &mut tokio::process::Child, job_id: &str) {
    if let Some(pid) = child.id() {
        let group = Pid::from_raw(pid as i32);
        if let Err(e) = killpg(group, Signal::SIGTERM) {
            tracing::debug!(job_id, pid, error = %e, "SIGTERM to process group failed");
        }
        match tokio::time::timeout(TERM_GRACE, child.wait()).await {
            Ok(_) => return,
            Err(_) => tracing::warn!(job_id, pid, "SIGTERM ignored, escalating to SIGKILL"),
        }
        let _ = killpg(group, Signal::SIGKILL);
    }

    let _ = child.start_kill();
    match tokio::time::timeout(TERM_GRACE, child.wait()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::error!(job_id, error = %e, "Error waiting for killed process"),
        Err(_) => tracing::error!(job_id, "Process still alive 5 s after SIGKILL"),
    }
}
