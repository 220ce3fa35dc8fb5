//! clone3 syscall wrapper with fork semantics

use crate::{BrigError, Result};
use libc::pid_t;

/// clone3 clone_args structure (from linux/sched.h)
#[repr(C)]
#[derive(Debug, Default)]
pub struct CloneArgs {
    /// Flags for the new process
    pub flags: u64,
    /// File descriptor for pidfd
    pub pidfd: u64,
    /// Pointer to the child tid
    pub child_tid: u64,
    /// Pointer to the parent tid
    pub parent_tid: u64,
    /// Signal to deliver on child termination
    pub exit_signal: u64,
    /// Stack pointer (0 = copy parent stack)
    pub stack: u64,
    /// Stack size (0 if using parent stack)
    pub stack_size: u64,
    /// TLS pointer
    pub tls: u64,
}

/// clone3 syscall number
const SYS_CLONE3: libc::c_long = 435;

/// Wrapper around the clone3 syscall
///
/// # Safety
/// This function makes a raw syscall and duplicates the process. The caller
/// must be single-threaded, and the child must not return into code that
/// assumes it is still the parent.
pub unsafe fn clone3(args: &CloneArgs) -> Result<pid_t> {
    // SAFETY: Making clone3 syscall with valid args
    let ret = unsafe {
        libc::syscall(
            SYS_CLONE3,
            std::ptr::from_ref(args),
            std::mem::size_of::<CloneArgs>(),
        )
    };

    if ret == -1 {
        return Err(BrigError::Namespace(format!(
            "clone3 failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    pid_t::try_from(ret)
        .map_err(|_| BrigError::Namespace(format!("clone3 returned invalid pid {ret}")))
}

/// Duplicate the process into fresh namespaces, `fork(2)` style
///
/// Returns the child pid in the parent and 0 in the child. The child shares
/// nothing with the parent except copied memory and the file descriptor
/// table.
pub fn fork_into(namespace_flags: u64) -> Result<pid_t> {
    let args = CloneArgs {
        flags: namespace_flags,
        exit_signal: u64::try_from(libc::SIGCHLD).unwrap_or(17),
        ..Default::default()
    };

    // SAFETY: fork semantics; callers handle both continuations
    unsafe { clone3(&args) }
}
