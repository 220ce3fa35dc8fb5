//! Unix socket listener and connection supervisor

use crate::pool::WorkerPool;
use brig_core::signals::SignalLatch;
use brig_core::worker::{self, WorkerSettings};
use brig_core::{BrigError, Result};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::Signal;
use nix::sys::socket::{AddressFamily, Backlog, SockFlag, SockType, UnixAddr, bind, listen, socket};
use nix::unistd::{ForkResult, fork};
use std::io::ErrorKind;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::time::Duration;

/// Accept poll timeout, and the idle sleep when no worker slot is free
const TICK_MS: u8 = 20;

/// Create the listening socket at `path`
///
/// A stale socket file is removed first. The backlog is a single pending
/// connection and the file is world-connectable.
pub fn bind_listener(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let addr = UnixAddr::new(path)?;
    bind(fd.as_raw_fd(), &addr).map_err(|e| {
        BrigError::Protocol(format!("failed to bind {}: {e}", path.display()))
    })?;
    listen(&fd, Backlog::new(1)?)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;

    tracing::info!(socket = %path.display(), "listening");
    Ok(UnixListener::from(fd))
}

/// Accept loop forking one worker per connection
#[derive(Debug)]
pub struct Supervisor {
    listener: UnixListener,
    pool: WorkerPool,
    settings: WorkerSettings,
}

impl Supervisor {
    #[must_use]
    pub fn new(listener: UnixListener, max_workers: usize, settings: WorkerSettings) -> Self {
        Self {
            listener,
            pool: WorkerPool::new(max_workers),
            settings,
        }
    }

    /// Serve until SIGTERM or SIGINT, then stop every worker
    ///
    /// Must run in a single-threaded process; each connection is handled in
    /// a forked child that never returns here.
    pub fn serve(self) -> Result<()> {
        let Self {
            listener,
            mut pool,
            settings,
        } = self;
        let latch = SignalLatch::install(&[Signal::SIGTERM, Signal::SIGINT])?;
        tracing::info!(max_workers = pool.capacity(), "supervisor ready");

        while !latch.is_raised() {
            pool.reap();

            if !pool.has_capacity() || !readable(&listener)? {
                if !pool.has_capacity() {
                    std::thread::sleep(Duration::from_millis(u64::from(TICK_MS)));
                }
                continue;
            }

            let stream = match listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    std::thread::sleep(Duration::from_millis(u64::from(TICK_MS)));
                    continue;
                }
            };

            // SAFETY: the supervisor is single-threaded; the child only
            // handles the connection and exits
            match unsafe { fork() } {
                Ok(ForkResult::Parent { child }) => pool.admit(child),
                Ok(ForkResult::Child) => {
                    latch.release();
                    drop(listener);
                    brig_core::sys::run_child(|| worker::handle(stream, &settings))
                }
                Err(e) => tracing::warn!(error = %e, "failed to fork worker"),
            }
        }

        tracing::info!(signal = ?latch.raised(), "shutting down");
        pool.shutdown();
        latch.release();
        Ok(())
    }
}

/// Wait up to one tick for a pending connection
///
/// An interrupted wait counts as "nothing pending" so the caller re-checks
/// its shutdown state first.
fn readable(listener: &UnixListener) -> Result<bool> {
    let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::from(TICK_MS)) {
        Ok(0) | Err(Errno::EINTR) => Ok(false),
        Ok(_) => Ok(fds[0]
            .revents()
            .is_some_and(|events| events.contains(PollFlags::POLLIN))),
        Err(e) => Err(BrigError::Process(format!("listener poll failed: {e}"))),
    }
}
