//! Jail lifecycle
//!
//! A [`Jail`] stages an ephemeral tmpfs root, splits into fresh namespaces
//! and pivots the inner process into that root. The inner process then
//! reconciles its mount table, hardens itself, drops privileges and runs the
//! [`Workload`]. The outer process waits, forwards termination requests and
//! tears the root down once the inner side is gone.

use crate::config::JailConfig;
use crate::isolation::mounts;
use crate::isolation::namespace::{Inner, Outer};
use crate::isolation::{Identity, NamespaceSet, Split};
use crate::process::{self, WaitOutcome, WaitPolicy};
use crate::signals::SignalLatch;
use crate::{BrigError, Result, sys};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitPidFlag;
use nix::unistd::Pid;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Name of the receptacle for the host root inside the tmpfs
const OLD_ROOT: &str = "old_root";

/// Grace between forwarding SIGTERM to the inner process and killing it
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Poll interval of the outer wait loop
const WAIT_INTERVAL: Duration = Duration::from_millis(20);

/// What runs inside a jail
///
/// Every hook except [`Workload::run_workload`] defaults to a no-op.
pub trait Workload {
    /// Populate the staged root before any namespace exists
    fn prepare_fs(&mut self, _staging: &mut Staging<'_>) -> Result<()> {
        Ok(())
    }

    /// Undo whatever `prepare_fs` did outside the staged mounts
    ///
    /// Runs in the outer process, with `root` still mounted.
    fn teardown_fs(&mut self, _root: &Path) -> Result<()> {
        Ok(())
    }

    /// Extra hardening, after the capability drop and before the read-only
    /// remount and privilege drop
    fn harden(&mut self) -> Result<()> {
        Ok(())
    }

    /// Body of the jail; the return value becomes the jail's exit status
    fn run_workload(&mut self) -> i32;
}

/// A tmpfs at a fresh temporary directory, with the `old_root` receptacle
///
/// Owned by the process that staged it: teardown is a no-op anywhere else,
/// so a copy inherited across the namespace split can never unmount it.
#[derive(Debug)]
pub struct EphemeralRoot {
    path: PathBuf,
    staged: Vec<PathBuf>,
    owner: Pid,
    torn_down: bool,
}

impl EphemeralRoot {
    /// Create the directory, mount the tmpfs and create `old_root`
    pub fn stage(size_kb: u64) -> Result<Self> {
        let template = std::env::temp_dir().join("brig.XXXXXX");
        let path = nix::unistd::mkdtemp(&template)
            .map_err(|e| BrigError::Mount(format!("mkdtemp failed: {e}")))?;

        if let Err(e) = mounts::mount_tmpfs(size_kb, &path, nix::mount::MsFlags::empty()) {
            let _ = std::fs::remove_dir(&path);
            return Err(e);
        }

        // From here on Drop cleans up
        let root = Self {
            path,
            staged: Vec::new(),
            owner: sys::raw_getpid(),
            torn_down: false,
        };
        mounts::try_mkdir(&root.old_root())?;

        tracing::debug!(path = %root.path.display(), size_kb, "ephemeral root staged");
        Ok(root)
    }

    /// Host path of the root
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Host path of the receptacle the old root is pivoted into
    #[must_use]
    pub fn old_root(&self) -> PathBuf {
        self.path.join(OLD_ROOT)
    }

    /// Host path of `jail_path` inside this root
    #[must_use]
    pub fn host_path(&self, jail_path: &Path) -> PathBuf {
        self.path
            .join(jail_path.strip_prefix("/").unwrap_or(jail_path))
    }

    /// Unmount staged mounts in reverse, then the tmpfs, then remove the
    /// directory
    ///
    /// Failures are logged; teardown always runs to completion.
    pub fn teardown(&mut self) {
        if self.torn_down || sys::raw_getpid() != self.owner {
            return;
        }
        self.torn_down = true;

        for target in self.staged.iter().rev() {
            if let Err(e) = sys::umount(target) {
                tracing::warn!(error = %e, "staged mount left behind");
            }
        }

        if let Err(e) = sys::umount(&self.path) {
            tracing::warn!(error = %e, "tmpfs busy, detaching");
            if let Err(e) = sys::umount_detach(&self.path) {
                tracing::warn!(error = %e, "tmpfs could not be detached");
            }
        }

        match std::fs::remove_dir(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "ephemeral root removed"),
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "failed to remove root"),
        }
    }
}

impl Drop for EphemeralRoot {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Filesystem preparation handle given to [`Workload::prepare_fs`]
///
/// Paths named `jail_path` are as seen from inside the jail, e.g. `/usr`.
#[derive(Debug)]
pub struct Staging<'a> {
    root: &'a mut EphemeralRoot,
    preserve: Vec<PathBuf>,
}

impl<'a> Staging<'a> {
    fn new(root: &'a mut EphemeralRoot) -> Self {
        Self {
            root,
            preserve: Vec::new(),
        }
    }

    /// Host path of the staged root
    #[must_use]
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Bind `src` read-only at `jail_path`
    ///
    /// The mount survives reconciliation inside the jail and is unmounted by
    /// the outer process at teardown.
    pub fn bind_readonly(&mut self, src: &Path, jail_path: impl AsRef<Path>) -> Result<()> {
        let jail_path = jail_path.as_ref();
        let target = self.root.host_path(jail_path);
        std::fs::create_dir_all(&target).map_err(|e| {
            BrigError::Mount(format!("failed to create {}: {e}", target.display()))
        })?;

        mounts::bind_readonly(src, &target).inspect_err(|_| {
            let _ = sys::umount(&target);
        })?;

        self.root.staged.push(target);
        self.preserve.push(jail_path.to_path_buf());
        Ok(())
    }

    /// Keep whatever is mounted at `jail_path` during reconciliation
    pub fn preserve(&mut self, jail_path: impl Into<PathBuf>) {
        self.preserve.push(jail_path.into());
    }

    /// Create a symlink at `jail_path` pointing to `target`
    ///
    /// `target` is resolved inside the jail.
    pub fn symlink(&self, target: impl AsRef<Path>, jail_path: impl AsRef<Path>) -> Result<()> {
        let link = self.root.host_path(jail_path.as_ref());
        std::os::unix::fs::symlink(target.as_ref(), &link).map_err(|e| {
            BrigError::Mount(format!("failed to create symlink {}: {e}", link.display()))
        })
    }

    fn into_preserved(self) -> Vec<PathBuf> {
        self.preserve
    }
}

/// A configured jail, ready to run one workload
#[derive(Debug, Clone)]
pub struct Jail {
    config: JailConfig,
    namespaces: NamespaceSet,
    kill_grace: Duration,
}

impl Jail {
    #[must_use]
    pub fn new(config: JailConfig) -> Self {
        Self {
            config,
            namespaces: NamespaceSet::default(),
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    #[must_use]
    pub fn namespaces(mut self, namespaces: NamespaceSet) -> Self {
        self.namespaces = namespaces;
        self
    }

    #[must_use]
    pub const fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &JailConfig {
        &self.config
    }

    /// Build the jail, run `workload` in it and tear everything down
    ///
    /// Returns the workload's exit status, or `128 + n` when the inner
    /// process was killed by signal `n`. Must be called while the process is
    /// single-threaded.
    pub fn run<W: Workload>(&self, workload: &mut W) -> Result<i32> {
        let identity = Identity::resolve(self.config.user.as_deref(), self.config.group.as_deref())?;

        // Latched from here on so a termination request never skips teardown
        let latch = SignalLatch::install(&[Signal::SIGINT, Signal::SIGTERM])?;
        let mut root = match EphemeralRoot::stage(self.config.fs_size_kb) {
            Ok(root) => root,
            Err(e) => {
                latch.release();
                return Err(e);
            }
        };

        let mut staging = Staging::new(&mut root);
        let prepared = workload.prepare_fs(&mut staging);
        let preserved = staging.into_preserved();
        let split = prepared
            .inspect_err(|e| tracing::error!(error = %e, "filesystem preparation failed"))
            .and_then(|()| match latch.raised() {
                Some(signal) => Err(BrigError::Process(format!(
                    "{signal} received before the jail started"
                ))),
                None => self.namespaces.split(),
            });

        match split {
            Ok(Split::Outer(outer)) => {
                let status = self.supervise(outer, &latch);
                Self::teardown(workload, &mut root);
                latch.release();
                status
            }
            Ok(Split::Inner(inner)) => {
                latch.release();
                self.inner(&inner, &root, &preserved, identity, workload)
            }
            Err(e) => {
                Self::teardown(workload, &mut root);
                latch.release();
                Err(e)
            }
        }
    }

    /// Wait for the inner process, forwarding SIGINT/SIGTERM as SIGTERM
    fn supervise(&self, outer: Outer, latch: &SignalLatch) -> Result<i32> {
        let child = outer.child;
        let mut forwarded: Option<Instant> = None;
        let mut killed = false;

        tracing::info!(%child, "jail started");
        let result = loop {
            let outcome = process::wait_for_pid(
                child,
                WaitPolicy::polling(1, Duration::ZERO),
                WaitPidFlag::__WALL,
            );
            match outcome {
                Ok(WaitOutcome::Reaped(status)) => break Ok(process::exit_code(status)),
                Ok(WaitOutcome::Gone) => {
                    break Err(BrigError::Process(format!("jail process {child} vanished")));
                }
                Ok(WaitOutcome::Pending | WaitOutcome::Interrupted) => {}
                Err(e) => break Err(e),
            }

            if forwarded.is_none() {
                if let Some(signal) = latch.raised() {
                    tracing::info!(%signal, %child, "stopping jail");
                    if let Err(e) = process::try_kill(child, Signal::SIGTERM) {
                        tracing::warn!(error = %e, "failed to forward SIGTERM");
                    }
                    forwarded = Some(Instant::now());
                }
            }

            if !killed && forwarded.is_some_and(|at| at.elapsed() >= self.kill_grace) {
                tracing::warn!(%child, "jail ignored SIGTERM, killing");
                if let Err(e) = process::try_kill(child, Signal::SIGKILL) {
                    tracing::warn!(error = %e, "failed to kill jail");
                }
                killed = true;
            }

            std::thread::sleep(WAIT_INTERVAL);
        };

        if let Ok(code) = result {
            tracing::info!(%child, code, "jail exited");
        }
        result
    }

    fn teardown<W: Workload>(workload: &mut W, root: &mut EphemeralRoot) {
        if let Err(e) = workload.teardown_fs(root.path()) {
            tracing::warn!(error = %e, "workload teardown failed");
        }
        root.teardown();
    }

    /// Inner continuation; never returns
    fn inner<W: Workload>(
        &self,
        inner: &Inner,
        root: &EphemeralRoot,
        preserved: &[PathBuf],
        identity: Identity,
        workload: &mut W,
    ) -> ! {
        sys::run_child(|| match self.enter(inner, root, preserved, identity, workload) {
            Ok(()) => workload.run_workload(),
            Err(e) => {
                tracing::error!(error = %e, "jail setup failed");
                1
            }
        })
    }

    fn enter<W: Workload>(
        &self,
        inner: &Inner,
        root: &EphemeralRoot,
        preserved: &[PathBuf],
        identity: Identity,
        workload: &mut W,
    ) -> Result<()> {
        inner.verify()?;
        mounts::make_private()?;

        if let Some(hostname) = &self.config.hostname {
            sys::sethostname(hostname)?;
        }

        sys::pivot_root(root.path(), &root.old_root())?;
        std::env::set_current_dir("/")?;

        self.reconcile(preserved)?;
        self.harden(workload)?;

        if self.config.remount_ro {
            mounts::remount_tmpfs_readonly(self.config.fs_size_kb, Path::new("/"))?;
        }

        identity.drop_privileges()?;
        tracing::debug!("jail entered");
        Ok(())
    }

    /// Mount the jail's own filesystems and unmount everything inherited
    fn reconcile(&self, preserved: &[PathBuf]) -> Result<()> {
        let mut keep: HashSet<PathBuf> = ["/", "/proc"].iter().map(PathBuf::from).collect();
        keep.extend(preserved.iter().cloned());
        keep.extend(self.config.preserve_mounts.iter().cloned());

        mounts::mount_proc(Path::new("/proc"))?;
        if self.config.mount_cgroup {
            mounts::mount_cgroup(Path::new("/cgroup"))?;
            keep.insert(PathBuf::from("/cgroup"));
        }
        if self.config.mount_dev {
            mounts::mount_simple_dev(Path::new("/dev"))?;
            keep.insert(PathBuf::from("/dev"));
        }

        let report = mounts::umount_all(&keep, self.config.unmount_tries)?;
        tracing::debug!(
            unmounted = report.unmounted.len(),
            busy = report.busy.len(),
            "mount table reconciled"
        );

        let old_root = Path::new("/").join(OLD_ROOT);
        let leftover = mounts::unmount_order(&mounts::read_mounts()?, &keep)
            .into_iter()
            .filter(|target| target.starts_with(&old_root));
        for target in leftover {
            sys::umount_detach(&target)?;
        }

        std::fs::remove_dir(&old_root).map_err(|e| {
            BrigError::Mount(format!("failed to remove {}: {e}", old_root.display()))
        })
    }

    fn harden<W: Workload>(&self, workload: &mut W) -> Result<()> {
        sys::set_no_new_privs()?;

        if self.config.drop_capabilities {
            caps::clear(None, caps::CapSet::Bounding).map_err(|e| {
                BrigError::Privilege(format!("failed to clear capability bounding set: {e}"))
            })?;
        }

        workload.harden()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::geteuid;

    #[test]
    fn host_path_strips_leading_slash() {
        let root = EphemeralRoot {
            path: PathBuf::from("/tmp/brig.abc"),
            staged: vec![],
            owner: sys::raw_getpid(),
            torn_down: true,
        };
        assert_eq!(root.host_path(Path::new("/usr")), PathBuf::from("/tmp/brig.abc/usr"));
        assert_eq!(root.host_path(Path::new("lib")), PathBuf::from("/tmp/brig.abc/lib"));
        assert_eq!(root.old_root(), PathBuf::from("/tmp/brig.abc/old_root"));
    }

    #[test]
    fn teardown_ignores_foreign_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("root");
        std::fs::create_dir(&path).unwrap();

        let mut root = EphemeralRoot {
            path: path.clone(),
            staged: vec![],
            owner: Pid::from_raw(1),
            torn_down: false,
        };
        root.teardown();
        assert!(path.exists());
    }

    #[test]
    #[serial_test::serial]
    fn ephemeral_root_stages_and_tears_down() {
        if !geteuid().is_root() {
            eprintln!("skipping: requires root");
            return;
        }

        let mut root = EphemeralRoot::stage(512).unwrap();
        let path = root.path().to_path_buf();
        assert!(root.old_root().is_dir());

        let mounted = mounts::read_mounts()
            .unwrap()
            .into_iter()
            .any(|entry| entry.mountpoint == path && entry.fstype == "tmpfs");
        assert!(mounted);

        root.teardown();
        assert!(!path.exists());
        root.teardown();
    }

    #[test]
    #[serial_test::serial]
    fn staging_binds_and_links() {
        if !geteuid().is_root() {
            eprintln!("skipping: requires root");
            return;
        }

        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("marker"), b"x").unwrap();

        let mut root = EphemeralRoot::stage(512).unwrap();
        let mut staging = Staging::new(&mut root);
        staging.bind_readonly(source.path(), "/data").unwrap();
        staging.symlink("/data/marker", "/marker").unwrap();
        let preserved = staging.into_preserved();
        assert_eq!(preserved, vec![PathBuf::from("/data")]);

        let bound = root.host_path(Path::new("/data"));
        assert!(bound.join("marker").exists());
        assert!(std::fs::write(bound.join("new"), b"y").is_err());

        let path = root.path().to_path_buf();
        drop(root);
        assert!(!path.exists());
        assert!(source.path().join("marker").exists());
    }
}
