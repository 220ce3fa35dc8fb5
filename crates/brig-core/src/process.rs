//! Child wait and two-stage terminate helpers

use crate::{BrigError, Result};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::time::Duration;

/// How long and how often to wait for a child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Number of non-blocking attempts; 0 blocks until the child changes state
    pub tries: u32,
    /// Sleep between attempts
    pub interval: Duration,
}

impl WaitPolicy {
    /// Block until the child exits
    pub const BLOCKING: Self = Self {
        tries: 0,
        interval: Duration::ZERO,
    };

    #[must_use]
    pub const fn polling(tries: u32, interval: Duration) -> Self {
        Self { tries, interval }
    }
}

/// Result of waiting for a child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Child exited or was killed, and has been reaped
    Reaped(WaitStatus),
    /// No such child (already reaped, or never ours)
    Gone,
    /// Child still running after the retry budget
    Pending,
    /// A signal interrupted a blocking wait
    Interrupted,
}

impl WaitOutcome {
    /// The child no longer exists
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Reaped(_) | Self::Gone)
    }
}

/// Wait for `pid` according to `policy`
///
/// Only exit and kill events count; other state changes are ignored.
pub fn wait_for_pid(pid: Pid, policy: WaitPolicy, flags: WaitPidFlag) -> Result<WaitOutcome> {
    let blocking = policy.tries == 0;
    let flags = if blocking {
        flags
    } else {
        flags | WaitPidFlag::WNOHANG
    };
    let mut remaining = policy.tries;

    loop {
        match waitpid(pid, Some(flags)) {
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                return Ok(WaitOutcome::Reaped(status));
            }
            Ok(_) => {}
            Err(Errno::ECHILD) => return Ok(WaitOutcome::Gone),
            Err(Errno::EINTR) => return Ok(WaitOutcome::Interrupted),
            Err(e) => {
                return Err(BrigError::Process(format!("waitpid({pid}) failed: {e}")));
            }
        }

        if blocking {
            continue;
        }
        remaining -= 1;
        if remaining == 0 {
            return Ok(WaitOutcome::Pending);
        }
        std::thread::sleep(policy.interval);
    }
}

/// Send `signal` to `pid`; returns `true` if the process no longer exists
pub fn try_kill(pid: Pid, signal: Signal) -> Result<bool> {
    match kill(pid, signal) {
        Ok(()) => Ok(false),
        Err(Errno::ESRCH) => Ok(true),
        Err(e) => Err(BrigError::Process(format!(
            "kill({pid}, {signal}) failed: {e}"
        ))),
    }
}

/// Check, SIGTERM, wait a second, SIGKILL, reap
///
/// Tolerates children that already exited. Returns the reaped status when
/// this call was the one to collect it.
pub fn patient_terminate(pid: Pid, flags: WaitPidFlag) -> Result<Option<WaitStatus>> {
    const FIRST_CHECK: WaitPolicy = WaitPolicy::polling(1, Duration::from_millis(100));
    const GRACE: WaitPolicy = WaitPolicy::polling(10, Duration::from_millis(100));

    if let Some(done) = finished(wait_for_pid(pid, FIRST_CHECK, flags)?) {
        return Ok(done);
    }

    if try_kill(pid, Signal::SIGTERM)? {
        return Ok(None);
    }
    if let Some(done) = finished(wait_for_pid(pid, GRACE, flags)?) {
        return Ok(done);
    }

    tracing::debug!(%pid, "child ignored SIGTERM, killing");
    if try_kill(pid, Signal::SIGKILL)? {
        return Ok(None);
    }
    loop {
        if let Some(done) = finished(wait_for_pid(pid, WaitPolicy::BLOCKING, flags)?) {
            return Ok(done);
        }
    }
}

fn finished(outcome: WaitOutcome) -> Option<Option<WaitStatus>> {
    match outcome {
        WaitOutcome::Reaped(status) => Some(Some(status)),
        WaitOutcome::Gone => Some(None),
        WaitOutcome::Pending | WaitOutcome::Interrupted => None,
    }
}

/// Reap every child that has already finished, without blocking
pub fn reap_finished() -> Result<Vec<WaitStatus>> {
    let mut reaped = Vec::new();
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return Ok(reaped),
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => reaped.push(status),
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => return Err(BrigError::Process(format!("waitpid failed: {e}"))),
        }
    }
}

/// Shell-style exit code of a finished child (`128 + n` when killed)
#[must_use]
pub fn exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::process::Command;
    use std::time::Instant;

    fn spawn(program: &str, args: &[&str]) -> Pid {
        let child = Command::new(program).args(args).spawn().unwrap();
        Pid::from_raw(i32::try_from(child.id()).unwrap())
    }

    #[test]
    #[serial]
    fn polling_wait_on_running_child_is_pending() {
        let pid = spawn("sleep", &["30"]);
        let outcome = wait_for_pid(
            pid,
            WaitPolicy::polling(2, Duration::from_millis(10)),
            WaitPidFlag::empty(),
        )
        .unwrap();
        assert_eq!(outcome, WaitOutcome::Pending);
        patient_terminate(pid, WaitPidFlag::empty()).unwrap();
    }

    #[test]
    #[serial]
    fn blocking_wait_reaps_exit_status() {
        let pid = spawn("sh", &["-c", "exit 3"]);
        let outcome = wait_for_pid(pid, WaitPolicy::BLOCKING, WaitPidFlag::empty()).unwrap();
        assert_eq!(outcome, WaitOutcome::Reaped(WaitStatus::Exited(pid, 3)));
        assert_eq!(
            wait_for_pid(pid, WaitPolicy::BLOCKING, WaitPidFlag::empty()).unwrap(),
            WaitOutcome::Gone
        );
    }

    #[test]
    #[serial]
    fn patient_terminate_stops_cooperative_child_quickly() {
        let pid = spawn("sleep", &["30"]);
        let started = Instant::now();
        let status = patient_terminate(pid, WaitPidFlag::empty()).unwrap();

        assert_eq!(status, Some(WaitStatus::Signaled(pid, Signal::SIGTERM, false)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(try_kill(pid, Signal::SIGTERM).unwrap());
    }

    #[test]
    #[serial]
    fn patient_terminate_escalates_to_sigkill() {
        let pid = spawn("sh", &["-c", "trap '' TERM; exec sleep 30"]);
        std::thread::sleep(Duration::from_millis(100));
        let status = patient_terminate(pid, WaitPidFlag::empty()).unwrap();
        assert_eq!(status, Some(WaitStatus::Signaled(pid, Signal::SIGKILL, false)));
    }

    #[test]
    #[serial]
    fn patient_terminate_tolerates_exited_child() {
        let pid = spawn("true", &[]);
        wait_for_pid(pid, WaitPolicy::BLOCKING, WaitPidFlag::empty()).unwrap();
        assert_eq!(patient_terminate(pid, WaitPidFlag::empty()).unwrap(), None);
    }

    #[test]
    #[serial]
    fn reap_finished_collects_exited_children() {
        let pid = spawn("true", &[]);
        std::thread::sleep(Duration::from_millis(200));
        let reaped = reap_finished().unwrap();
        assert!(reaped.iter().any(|s| s.pid() == Some(pid)));
    }

    #[test]
    fn exit_codes() {
        let pid = Pid::from_raw(42);
        assert_eq!(exit_code(WaitStatus::Exited(pid, 7)), 7);
        assert_eq!(exit_code(WaitStatus::Signaled(pid, Signal::SIGKILL, false)), 137);
    }
}
