//! Worker pool management

use brig_core::process::{self, WaitPolicy};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitPidFlag;
use nix::unistd::Pid;
use std::collections::HashSet;
use std::time::Duration;

/// Pause after each shutdown signal before reaping
const SHUTDOWN_PAUSE: Duration = Duration::from_millis(200);

/// Final per-worker wait after SIGKILL
const FINAL_WAIT: WaitPolicy = WaitPolicy::polling(10, Duration::from_millis(20));

/// Live worker processes
///
/// Grows only after a successful fork and shrinks only by reaping.
#[derive(Debug)]
pub struct WorkerPool {
    workers: HashSet<Pid>,
    capacity: usize,
}

impl WorkerPool {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            workers: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Another worker may be started
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.workers.len() < self.capacity
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    #[must_use]
    pub fn contains(&self, pid: Pid) -> bool {
        self.workers.contains(&pid)
    }

    /// Track a freshly forked worker
    pub fn admit(&mut self, pid: Pid) {
        self.workers.insert(pid);
        tracing::info!(%pid, workers = self.workers.len(), "worker started");
    }

    /// Reap every finished child, tracked or not
    ///
    /// As PID 1 of its namespace the supervisor also inherits orphans, so
    /// children it never forked are collected here too. Returns how many
    /// tracked workers left the pool.
    pub fn reap(&mut self) -> usize {
        let statuses = match process::reap_finished() {
            Ok(statuses) => statuses,
            Err(e) => {
                tracing::warn!(error = %e, "reaping failed");
                return 0;
            }
        };

        let mut removed = 0;
        for status in statuses {
            let Some(pid) = status.pid() else { continue };
            if self.workers.remove(&pid) {
                removed += 1;
                tracing::info!(
                    %pid,
                    code = process::exit_code(status),
                    workers = self.workers.len(),
                    "worker finished"
                );
            } else {
                tracing::debug!(%pid, "reaped orphan");
            }
        }
        removed
    }

    /// Send `signal` to every tracked worker
    pub fn signal_all(&self, signal: Signal) {
        for &pid in &self.workers {
            tracing::debug!(%pid, %signal, "signalling worker");
            if let Err(e) = process::try_kill(pid, signal) {
                tracing::warn!(%pid, error = %e, "failed to signal worker");
            }
        }
    }

    /// Stop every worker: SIGTERM, pause, reap, SIGKILL, pause, reap
    ///
    /// Bounded in time and safe to call more than once. The pool is empty
    /// afterwards.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        tracing::info!(workers = self.workers.len(), "stopping workers");

        self.signal_all(Signal::SIGTERM);
        std::thread::sleep(SHUTDOWN_PAUSE);
        self.reap();

        if !self.workers.is_empty() {
            tracing::warn!(workers = self.workers.len(), "workers survived SIGTERM");
            self.signal_all(Signal::SIGKILL);
            std::thread::sleep(SHUTDOWN_PAUSE);
            self.reap();
        }

        for pid in self.workers.drain() {
            match process::wait_for_pid(pid, FINAL_WAIT, WaitPidFlag::empty()) {
                Ok(outcome) if outcome.is_finished() => {}
                Ok(_) => tracing::warn!(%pid, "worker did not exit"),
                Err(e) => tracing::warn!(%pid, error = %e, "final wait failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::process::Command;

    fn spawn(program: &str, args: &[&str]) -> Pid {
        let child = Command::new(program).args(args).spawn().unwrap();
        Pid::from_raw(i32::try_from(child.id()).unwrap())
    }

    #[test]
    fn capacity_is_enforced() {
        let mut pool = WorkerPool::new(2);
        pool.admit(Pid::from_raw(100_001));
        assert!(pool.has_capacity());
        pool.admit(Pid::from_raw(100_002));
        assert!(!pool.has_capacity());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    #[serial]
    fn reap_removes_finished_workers() {
        let mut pool = WorkerPool::new(5);
        let done = spawn("true", &[]);
        let running = spawn("sleep", &["30"]);
        pool.admit(done);
        pool.admit(running);

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(pool.reap(), 1);
        assert!(!pool.contains(done));
        assert!(pool.contains(running));

        pool.shutdown();
        assert!(pool.is_empty());
    }

    #[test]
    #[serial]
    fn shutdown_stops_every_worker() {
        let mut pool = WorkerPool::new(5);
        let polite = spawn("sleep", &["30"]);
        let stubborn = spawn("sh", &["-c", "trap '' TERM; exec sleep 30"]);
        pool.admit(polite);
        pool.admit(stubborn);
        std::thread::sleep(Duration::from_millis(100));

        pool.shutdown();

        assert!(pool.is_empty());
        assert!(process::try_kill(polite, Signal::SIGTERM).unwrap());
        assert!(process::try_kill(stubborn, Signal::SIGTERM).unwrap());
    }

    #[test]
    fn shutdown_of_empty_pool_is_a_no_op() {
        let mut pool = WorkerPool::new(1);
        pool.shutdown();
        pool.shutdown();
        assert!(pool.is_empty());
    }
}
