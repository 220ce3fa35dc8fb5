//! Typed wrappers over the mount, pivot, hostname and pid syscalls
//!
//! Every wrapper turns a failing return code into a [`BrigError`] that names
//! the operation and the path it was applied to, so setup failures are
//! diagnosable from a single log line.

use crate::{BrigError, Result};
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::mount::{MntFlags, MsFlags};
use nix::unistd::Pid;
use std::os::fd::AsFd;
use std::panic::AssertUnwindSafe;
use std::path::Path;

/// `mount(2)` with error context
pub fn mount(
    source: Option<&str>,
    target: &Path,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    nix::mount::mount(source, target, fstype, flags, data).map_err(|e| {
        BrigError::Mount(format!(
            "failed to mount {} ({}) at {}: {e}",
            source.unwrap_or("none"),
            fstype.unwrap_or("none"),
            target.display()
        ))
    })
}

/// `umount(2)`
pub fn umount(target: &Path) -> Result<()> {
    nix::mount::umount(target)
        .map_err(|e| BrigError::Mount(format!("failed to unmount {}: {e}", target.display())))
}

/// `umount2(2)` with `MNT_DETACH`; used only for what normal unmounting
/// could not release
pub fn umount_detach(target: &Path) -> Result<()> {
    nix::mount::umount2(target, MntFlags::MNT_DETACH).map_err(|e| {
        BrigError::Mount(format!("failed to detach {}: {e}", target.display()))
    })
}

/// `pivot_root(2)`: `new_root` becomes `/`, the old root moves to `put_old`
pub fn pivot_root(new_root: &Path, put_old: &Path) -> Result<()> {
    nix::unistd::pivot_root(new_root, put_old).map_err(|e| {
        BrigError::Mount(format!(
            "pivot_root {} -> {} failed: {e}",
            new_root.display(),
            put_old.display()
        ))
    })
}

/// `sethostname(2)` in the current UTS namespace
pub fn sethostname(name: &str) -> Result<()> {
    nix::unistd::sethostname(name)
        .map_err(|e| BrigError::Namespace(format!("failed to set hostname {name:?}: {e}")))
}

/// Process id straight from the kernel
///
/// Bypasses any libc-level caching so a PID namespace switch done through a
/// raw `clone3` is observed correctly.
#[must_use]
pub fn raw_getpid() -> Pid {
    // SAFETY: getpid takes no arguments and cannot fail
    let pid = unsafe { libc::syscall(libc::SYS_getpid) };
    Pid::from_raw(libc::pid_t::try_from(pid).unwrap_or(-1))
}

/// Set `PR_SET_NO_NEW_PRIVS` so exec can never grant privileges back
pub fn set_no_new_privs() -> Result<()> {
    // SAFETY: prctl with constant integer arguments
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(BrigError::Privilege(format!(
            "PR_SET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Put a descriptor into non-blocking mode
pub fn set_nonblocking(fd: impl AsFd) -> Result<()> {
    let flags = OFlag::from_bits_retain(fcntl(fd.as_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Leave the process immediately, skipping destructors and atexit handlers
///
/// Used on every path after a process split where unwinding back into the
/// caller would run cleanup meant for the other side of the split.
pub fn exit_now(status: i32) -> ! {
    // SAFETY: _exit is async-signal-safe and never returns
    unsafe { libc::_exit(status) }
}

/// Run the rest of a forked child and exit with its status
///
/// A panic in `body` ends the child with status 1 instead of unwinding
/// into code that belongs to the parent's side of the fork.
pub fn run_child<F: FnOnce() -> i32>(body: F) -> ! {
    let status = std::panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|_| {
        tracing::error!("child panicked");
        1
    });
    exit_now(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_getpid_matches_std() {
        assert_eq!(raw_getpid().as_raw(), i32::try_from(std::process::id()).unwrap());
    }

    #[test]
    fn set_nonblocking_sets_flag() {
        let (read, _write) = nix::unistd::pipe().unwrap();
        set_nonblocking(&read).unwrap();
        let flags = OFlag::from_bits_retain(fcntl(&read, FcntlArg::F_GETFL).unwrap());
        assert!(flags.contains(OFlag::O_NONBLOCK));
    }

    #[test]
    #[serial_test::serial]
    fn panicking_child_exits_with_failure() {
        use nix::sys::wait::{WaitStatus, waitpid};
        use nix::unistd::{ForkResult, fork};

        // SAFETY: the child only panics and exits
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => run_child(|| panic!("boom")),
            ForkResult::Parent { child } => {
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 1));
            }
        }
    }

    #[test]
    #[serial_test::serial]
    fn child_status_is_exit_code() {
        use nix::sys::wait::{WaitStatus, waitpid};
        use nix::unistd::{ForkResult, fork};

        // SAFETY: the child only exits
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => run_child(|| 7),
            ForkResult::Parent { child } => {
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 7));
            }
        }
    }

    #[test]
    fn unmount_of_plain_directory_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = umount(dir.path()).unwrap_err();
        assert!(err.to_string().contains(&dir.path().display().to_string()));
    }
}
