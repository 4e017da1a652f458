//! SIGCHLD handling: collects exited children and feeds their wait status
//! to the executor.

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::job::model::{raw_exit_status, raw_signal_status};
use crate::sbd::executor::JobExecutor;

/// Raw wait status of a terminated child, as `(pid, status)`.
///
/// Stops and continues are not terminations and yield `None`.
pub fn raw_wait_status(status: &WaitStatus) -> Option<(i32, i32)> {
    match *status {
        WaitStatus::Exited(pid, code) => Some((pid.as_raw(), raw_exit_status(code))),
        WaitStatus::Signaled(pid, sig, core) => {
            Some((pid.as_raw(), raw_signal_status(sig as i32, core)))
        }
        _ => None,
    }
}

/// Reaps every exited child without blocking. Returns the number of
/// children collected.
pub fn reap_children(executor: &mut JobExecutor) -> usize {
    let mut reaped = 0;

    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some((pid, raw)) = raw_wait_status(&status) {
                    executor.reap(pid, raw);
                    reaped += 1;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(e) => {
                tracing::error!(error = %e, "waitpid failed");
                break;
            }
        }
    }

    if reaped > 0 {
        tracing::debug!(reaped, "Reaped children");
    }
    reaped
}
