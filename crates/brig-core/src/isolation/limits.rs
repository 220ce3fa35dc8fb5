//! Per-payload resource envelope (rlimits)

use crate::{BrigError, Result};
use nix::sys::resource::{Resource, setrlimit};
use serde::{Deserialize, Serialize};

/// Ceilings applied to a payload process before it runs untrusted code
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceEnvelope {
    /// Maximum processes for the payload's uid (1 blocks fork bombs)
    pub max_processes: u64,
    /// Virtual address space in bytes
    pub memory_bytes: u64,
    /// CPU seconds before SIGXCPU
    pub cpu_soft_secs: u64,
    /// CPU seconds before the kernel sends SIGKILL
    pub cpu_hard_secs: u64,
}

impl Default for ResourceEnvelope {
    fn default() -> Self {
        Self {
            max_processes: 1,
            memory_bytes: 100 * 1024 * 1024, // 100MB
            cpu_soft_secs: 5,
            cpu_hard_secs: 7,
        }
    }
}

impl ResourceEnvelope {
    /// Reject envelopes the kernel would refuse or that could never fire
    pub fn validate(&self) -> Result<()> {
        if self.cpu_soft_secs > self.cpu_hard_secs {
            return Err(BrigError::Config(format!(
                "cpu soft limit {}s above hard limit {}s",
                self.cpu_soft_secs, self.cpu_hard_secs
            )));
        }
        if self.max_processes == 0 || self.memory_bytes == 0 || self.cpu_hard_secs == 0 {
            return Err(BrigError::Config(
                "resource limits must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Apply all ceilings to the calling process
    ///
    /// Called in the payload process right before `exec`. Lowering limits
    /// never needs privileges, so failure here means something is badly off
    /// and the payload must not run.
    pub fn apply(&self) -> Result<()> {
        set(Resource::RLIMIT_NPROC, self.max_processes, self.max_processes, "process")?;
        set(Resource::RLIMIT_AS, self.memory_bytes, self.memory_bytes, "memory")?;
        set(Resource::RLIMIT_CPU, self.cpu_soft_secs, self.cpu_hard_secs, "cpu")?;
        Ok(())
    }
}

fn set(resource: Resource, soft: u64, hard: u64, what: &str) -> Result<()> {
    setrlimit(resource, soft, hard)
        .map_err(|e| BrigError::Limits(format!("failed to set {what} limit: {e}")))
}
