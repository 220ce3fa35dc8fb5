//! Payload outcome classification

use crate::protocol::{CPU_LIMIT_MESSAGE, OUTPUT_TOO_LARGE_MESSAGE};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// How a payload process ended, as far as the client needs to know
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadOutcome {
    /// Normal exit with the given code
    Exited(i32),
    /// Killed by SIGXCPU after its CPU soft limit
    CpuLimit,
    /// Killed by SIGXFSZ after filling the buffered capture sink
    OutputLimit,
    /// Killed by any other signal
    Killed(Signal),
}

impl PayloadOutcome {
    /// Classify a reaped wait status
    #[must_use]
    pub fn from_status(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Self::Exited(code),
            WaitStatus::Signaled(_, Signal::SIGXCPU, _) => Self::CpuLimit,
            WaitStatus::Signaled(_, Signal::SIGXFSZ, _) => Self::OutputLimit,
            WaitStatus::Signaled(_, signal, _) => Self::Killed(signal),
            _ => Self::Exited(-1),
        }
    }

    /// Text appended to the response, if the outcome needs explaining
    ///
    /// A normal exit, whatever its code, is explained by the payload's own
    /// output.
    #[must_use]
    pub fn diagnostic(&self) -> Option<Vec<u8>> {
        match self {
            Self::Exited(_) => None,
            Self::CpuLimit => Some(CPU_LIMIT_MESSAGE.to_vec()),
            Self::OutputLimit => Some(OUTPUT_TOO_LARGE_MESSAGE.to_vec()),
            Self::Killed(Signal::SIGKILL) => Some(b"Process killed".to_vec()),
            Self::Killed(signal) => Some(format!("Process terminated by {signal}").into_bytes()),
        }
    }

    /// Exit status of the worker that relayed this payload
    #[must_use]
    pub const fn worker_status(&self) -> i32 {
        match self {
            Self::CpuLimit | Self::OutputLimit => 1,
            Self::Exited(_) | Self::Killed(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn normal_exit_needs_no_diagnostic() {
        let outcome = PayloadOutcome::from_status(WaitStatus::Exited(Pid::from_raw(9), 2));
        assert_eq!(outcome, PayloadOutcome::Exited(2));
        assert_eq!(outcome.diagnostic(), None);
        assert_eq!(outcome.worker_status(), 0);
    }

    #[test]
    fn sigxcpu_is_cpu_limit() {
        let status = WaitStatus::Signaled(Pid::from_raw(9), Signal::SIGXCPU, true);
        let outcome = PayloadOutcome::from_status(status);
        assert_eq!(outcome, PayloadOutcome::CpuLimit);
        assert_eq!(outcome.diagnostic().as_deref(), Some(CPU_LIMIT_MESSAGE));
        assert_eq!(outcome.worker_status(), 1);
    }

    #[test]
    fn sigxfsz_is_output_limit() {
        let status = WaitStatus::Signaled(Pid::from_raw(9), Signal::SIGXFSZ, true);
        let outcome = PayloadOutcome::from_status(status);
        assert_eq!(outcome, PayloadOutcome::OutputLimit);
        assert_eq!(outcome.worker_status(), 1);
    }

    #[test]
    fn other_signals_are_named() {
        let status = WaitStatus::Signaled(Pid::from_raw(9), Signal::SIGSEGV, false);
        let text = PayloadOutcome::from_status(status).diagnostic().unwrap();
        assert_eq!(text, b"Process terminated by SIGSEGV");
    }
}
