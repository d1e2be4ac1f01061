// src/process.rs
// OS process liveness checks and signal-based termination of tunnel processes.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How a tracked process ended up after `terminate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// SIGTERM was enough.
    Terminated,
    /// The process ignored SIGTERM and was killed.
    Killed,
    /// The process was already gone.
    NotRunning,
    /// Signals could not be delivered (e.g. EPERM).
    Failed,
}

fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|raw| *raw > 0).map(Pid::from_raw)
}

/// `kill(pid, 0)` semantics: the process exists, even if owned by someone else.
pub fn is_alive(pid: u32) -> bool {
    let Some(pid) = to_pid(pid) else {
        return false;
    };
    match signal::kill(pid, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            trace!("Liveness probe for pid {} failed: {}", pid, e);
            false
        }
    }
}

/// Sends SIGTERM, waits `grace`, then SIGKILL if the process is still there.
/// A process that is already gone counts as success.
pub async fn terminate(pid: u32, grace: Duration) -> TerminateOutcome {
    let Some(raw) = to_pid(pid) else {
        return TerminateOutcome::NotRunning;
    };

    match signal::kill(raw, Signal::SIGTERM) {
        Ok(()) => debug!("Sent SIGTERM to pid {}", pid),
        Err(Errno::ESRCH) => {
            debug!("Process {} already exited", pid);
            return TerminateOutcome::NotRunning;
        }
        Err(e) => {
            warn!("Failed to send SIGTERM to pid {}: {}", pid, e);
            return TerminateOutcome::Failed;
        }
    }

    tokio::time::sleep(grace).await;

    if !is_alive(pid) {
        return TerminateOutcome::Terminated;
    }

    match signal::kill(raw, Signal::SIGKILL) {
        Ok(()) => {
            debug!("Process {} ignored SIGTERM, sent SIGKILL", pid);
            TerminateOutcome::Killed
        }
        Err(Errno::ESRCH) => TerminateOutcome::Terminated,
        Err(e) => {
            warn!("Failed to send SIGKILL to pid {}: {}", pid, e);
            TerminateOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn dead_pid() -> u32 {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn test_own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn test_reaped_child_is_dead() {
        assert!(!is_alive(dead_pid()));
    }

    #[test]
    fn test_invalid_pids_are_dead() {
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
    }

    #[tokio::test]
    async fn test_terminate_running_process() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let reaper = std::thread::spawn(move || child.wait());

        let outcome = terminate(pid, Duration::from_millis(200)).await;
        assert!(matches!(
            outcome,
            TerminateOutcome::Terminated | TerminateOutcome::Killed
        ));
        reaper.join().unwrap().unwrap();
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_terminate_already_dead_process() {
        let outcome = terminate(dead_pid(), Duration::from_millis(10)).await;
        assert_eq!(outcome, TerminateOutcome::NotRunning);
    }
}
