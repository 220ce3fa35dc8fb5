//! Linux namespace isolation

use crate::isolation::clone3;
use crate::{BrigError, Result};
use nix::sched::CloneFlags;
use nix::unistd::Pid;

/// The namespaces a jail is created in
///
/// All enabled kinds are created atomically by one duplication call. There
/// is deliberately no user namespace: uid remapping is out of scope.
#[derive(Debug, Clone)]
pub struct NamespaceSet {
    /// Create new PID namespace
    pub pid: bool,
    /// Create new mount namespace
    pub mount: bool,
    /// Create new network namespace
    pub net: bool,
    /// Create new IPC namespace
    pub ipc: bool,
    /// Create new UTS namespace
    pub uts: bool,
}

impl Default for NamespaceSet {
    fn default() -> Self {
        Self {
            pid: true,
            mount: true,
            net: true,
            ipc: true,
            uts: true,
        }
    }
}

/// The two continuations of a namespace split
#[derive(Debug)]
pub enum Split {
    /// Original process: keeps its identity and PID space, owns the child
    Outer(Outer),
    /// New process inside the fresh namespaces
    Inner(Inner),
}

/// Handle held by the outer context
#[derive(Debug, Clone, Copy)]
pub struct Outer {
    /// Pid of the inner context as seen from outside
    pub child: Pid,
}

/// Marker held by the inner context
#[derive(Debug)]
pub struct Inner {
    pid_namespace: bool,
}

impl Inner {
    /// Check that the PID namespace really took effect
    ///
    /// A fresh PID namespace makes us its process 1; anything else means the
    /// isolation primitive silently failed and nothing below can be trusted.
    pub fn verify(&self) -> Result<()> {
        if !self.pid_namespace {
            return Ok(());
        }
        let pid = crate::sys::raw_getpid();
        if pid.as_raw() != 1 {
            return Err(BrigError::Namespace(format!(
                "expected pid 1 inside new PID namespace, got {pid}"
            )));
        }
        Ok(())
    }
}

impl NamespaceSet {
    /// Convert to nix CloneFlags
    #[must_use]
    pub fn to_clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();

        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.net {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }

        flags
    }

    /// Create the namespaces with a single duplication call
    ///
    /// Must be called while the process is single-threaded.
    pub fn split(&self) -> Result<Split> {
        let flags = self.to_clone_flags();
        let bits = u64::try_from(flags.bits())
            .map_err(|_| BrigError::Namespace(format!("invalid clone flags {flags:?}")))?;

        tracing::debug!(?flags, "creating namespaces");
        let pid = clone3::fork_into(bits)?;

        if pid == 0 {
            Ok(Split::Inner(Inner {
                pid_namespace: self.pid,
            }))
        } else {
            Ok(Split::Outer(Outer {
                child: Pid::from_raw(pid),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_set_has_every_namespace_but_user() {
        let flags = NamespaceSet::default().to_clone_flags();
        assert!(flags.contains(
            CloneFlags::CLONE_NEWPID
                | CloneFlags::CLONE_NEWNS
                | CloneFlags::CLONE_NEWNET
                | CloneFlags::CLONE_NEWIPC
                | CloneFlags::CLONE_NEWUTS
        ));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn disabled_kinds_are_left_out() {
        let set = NamespaceSet {
            net: false,
            ipc: false,
            ..NamespaceSet::default()
        };
        let flags = set.to_clone_flags();
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(!flags.contains(CloneFlags::CLONE_NEWIPC));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
    }

    #[test]
    fn inner_without_pid_namespace_skips_check() {
        let inner = Inner {
            pid_namespace: false,
        };
        assert!(inner.verify().is_ok());
    }

    #[test]
    fn inner_outside_pid_namespace_is_rejected() {
        let inner = Inner {
            pid_namespace: true,
        };
        assert!(matches!(inner.verify(), Err(BrigError::Namespace(_))));
    }
}
