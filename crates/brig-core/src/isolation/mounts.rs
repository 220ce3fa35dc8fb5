//! Filesystem mounting and mount-table reconciliation

use crate::{BrigError, Result, sys};
use nix::mount::MsFlags;
use nix::sys::stat::{Mode, SFlag, makedev, mknod};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Flags every tmpfs we create carries
const TMPFS_FLAGS: MsFlags = MsFlags::MS_NODEV
    .union(MsFlags::MS_NOEXEC)
    .union(MsFlags::MS_NOSUID)
    .union(MsFlags::MS_NOATIME);

/// Flags for read-only runtime trees bound into the jail
const BIND_FLAGS: MsFlags = MsFlags::MS_NODEV
    .union(MsFlags::MS_NOSUID)
    .union(MsFlags::MS_NOATIME);

/// Pause between bulk unmount rounds that left something busy
const UNMOUNT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Create a directory, ignoring the error if it already exists
pub fn try_mkdir(path: &Path) -> Result<()> {
    match std::fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(BrigError::Mount(format!(
            "failed to create {}: {e}",
            path.display()
        ))),
    }
}

/// Mount a tmpfs of `size_kb` kilobytes at `path`
///
/// `nodev`, `noexec`, `nosuid` and `noatime` are always added on top of
/// `extra`.
pub fn mount_tmpfs(size_kb: u64, path: &Path, extra: MsFlags) -> Result<()> {
    tracing::debug!(?path, size_kb, "tmpfs mount");
    let options = format!("size={size_kb}K");
    sys::mount(
        Some("tmpfs"),
        path,
        Some("tmpfs"),
        TMPFS_FLAGS | extra,
        Some(options.as_str()),
    )
}

/// Remount an existing tmpfs read-only, keeping its quota
pub fn remount_tmpfs_readonly(size_kb: u64, path: &Path) -> Result<()> {
    mount_tmpfs(size_kb, path, MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY)
}

/// Bind mount `src` onto `dst`
pub fn mount_bind(src: &Path, dst: &Path, flags: MsFlags) -> Result<()> {
    let src = src.to_str().ok_or_else(|| {
        BrigError::Mount(format!("bind source is not valid UTF-8: {}", src.display()))
    })?;
    sys::mount(Some(src), dst, None, flags | MsFlags::MS_BIND, None)
}

/// Bind mount `src` onto `dst` and make the bind read-only
///
/// The kernel ignores `MS_RDONLY` on the initial bind, so a second
/// remount pass is needed.
pub fn bind_readonly(src: &Path, dst: &Path) -> Result<()> {
    tracing::debug!(?src, ?dst, "ro bind mount");
    mount_bind(src, dst, BIND_FLAGS)?;
    mount_bind(src, dst, BIND_FLAGS | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY)
}

/// Create `path` and mount a proc filesystem on it
pub fn mount_proc(path: &Path) -> Result<()> {
    try_mkdir(path)?;
    sys::mount(Some("proc"), path, Some("proc"), MsFlags::empty(), None)
}

/// Create `path` and mount a cgroup2 filesystem on it
pub fn mount_cgroup(path: &Path) -> Result<()> {
    try_mkdir(path)?;
    sys::mount(
        Some("cgroup2"),
        path,
        Some("cgroup2"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None,
    )
}

/// Create `path` and populate it with a minimal device filesystem
///
/// Only `null` (1:3) and `zero` (1:5) exist; nothing else is reachable.
pub fn mount_simple_dev(path: &Path) -> Result<()> {
    try_mkdir(path)?;
    sys::mount(
        Some("simple_dev"),
        path,
        Some("tmpfs"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NOATIME,
        Some("size=1024k"),
    )?;

    for (name, minor) in [("null", 3), ("zero", 5)] {
        let node = path.join(name);
        mknod(
            &node,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o666),
            makedev(1, minor),
        )
        .map_err(|e| BrigError::Mount(format!("failed to create {}: {e}", node.display())))?;
    }

    Ok(())
}

/// Stop mount events from propagating between this namespace and the host
///
/// With shared propagation (the systemd default) unmounting inside the jail
/// would unmount the same filesystems on the host.
pub fn make_private() -> Result<()> {
    sys::mount(
        None,
        Path::new("/"),
        None,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None,
    )
}

/// One line of the live mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mountpoint: PathBuf,
    pub fstype: String,
    pub options: String,
}

/// Parse the contents of `/proc/mounts`
///
/// Fields are space separated with octal escapes (`\040` for a space) in
/// paths. Malformed lines are skipped.
#[must_use]
pub fn parse_mounts(table: &str) -> Vec<MountEntry> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(' ');
            let device = unescape(fields.next()?);
            let mountpoint = PathBuf::from(unescape(fields.next()?));
            let fstype = fields.next()?.to_owned();
            let options = fields.next()?.to_owned();
            Some(MountEntry {
                device,
                mountpoint,
                fstype,
                options,
            })
        })
        .collect()
}

fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(Ok(value)) = field.get(i + 1..i + 4).map(|o| u8::from_str_radix(o, 8)) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Read the live mount table of the current mount namespace
pub fn read_mounts() -> Result<Vec<MountEntry>> {
    let table = std::fs::read_to_string("/proc/mounts")
        .map_err(|e| BrigError::Mount(format!("failed to read /proc/mounts: {e}")))?;
    Ok(parse_mounts(&table))
}

/// Mountpoints to unmount, children before parents
///
/// Every mountpoint not in `keep` is returned once per table entry (stacked
/// mounts need one unmount each), longest path first.
#[must_use]
pub fn unmount_order(entries: &[MountEntry], keep: &HashSet<PathBuf>) -> Vec<PathBuf> {
    let mut targets: Vec<PathBuf> = entries
        .iter()
        .filter(|entry| !keep.contains(&entry.mountpoint))
        .map(|entry| entry.mountpoint.clone())
        .collect();
    targets.sort_by_key(|path| std::cmp::Reverse(path.as_os_str().len()));
    targets
}

/// Outcome of a bulk unmount
#[derive(Debug, Default, Clone)]
pub struct UnmountReport {
    /// Mountpoints that were unmounted
    pub unmounted: Vec<PathBuf>,
    /// Mountpoints still busy after the last round
    pub busy: Vec<PathBuf>,
}

impl UnmountReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.busy.is_empty()
    }
}

/// Unmount every filesystem whose mountpoint is not in `keep`
///
/// Runs at most `tries` rounds; each round re-reads the mount table, so
/// parents blocked by a child in one round are retried in the next. Mounts
/// that stay busy are reported, not treated as errors.
pub fn umount_all(keep: &HashSet<PathBuf>, tries: u32) -> Result<UnmountReport> {
    let mut report = UnmountReport::default();

    for round in 0..tries.max(1) {
        let targets = unmount_order(&read_mounts()?, keep);
        if targets.is_empty() {
            report.busy.clear();
            break;
        }

        report.busy.clear();
        for target in targets {
            match sys::umount(&target) {
                Ok(()) => report.unmounted.push(target),
                Err(e) => {
                    tracing::trace!(round, error = %e, "unmount deferred");
                    report.busy.push(target);
                }
            }
        }

        if report.busy.is_empty() {
            break;
        }
        std::thread::sleep(UNMOUNT_RETRY_DELAY);
    }

    if !report.is_clean() {
        tracing::warn!(busy = ?report.busy, "mounts still busy after unmount budget");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
/dev/sda1 / ext4 rw,relatime 0 0
proc /proc proc rw,nosuid,nodev,noexec 0 0
tmpfs /old_root/tmp tmpfs rw 0 0
/dev/sda1 /old_root ext4 rw 0 0
/dev/sdb1 /old_root/media/my\\040disk vfat rw 0 0
/dev/sda1 /usr ext4 ro,nosuid,nodev 0 0
garbage
";

    fn keep(paths: &[&str]) -> HashSet<PathBuf> {
        paths.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn parses_fields_and_skips_garbage() {
        let entries = parse_mounts(TABLE);
        assert_eq!(entries.len(), 6);
        assert_eq!(entries[1].device, "proc");
        assert_eq!(entries[1].fstype, "proc");
        assert_eq!(entries[5].options, "ro,nosuid,nodev");
    }

    #[test]
    fn decodes_octal_escapes() {
        let entries = parse_mounts(TABLE);
        assert_eq!(
            entries[4].mountpoint,
            PathBuf::from("/old_root/media/my disk")
        );
    }

    #[test]
    fn order_skips_kept_and_puts_children_first() {
        let entries = parse_mounts(TABLE);
        let order = unmount_order(&entries, &keep(&["/", "/proc", "/usr"]));
        assert_eq!(
            order,
            vec![
                PathBuf::from("/old_root/media/my disk"),
                PathBuf::from("/old_root/tmp"),
                PathBuf::from("/old_root"),
            ]
        );
    }

    #[test]
    fn every_parent_comes_after_its_children() {
        let entries = parse_mounts(TABLE);
        let order = unmount_order(&entries, &keep(&[]));
        for (i, path) in order.iter().enumerate() {
            for later in &order[i + 1..] {
                assert!(
                    !later.starts_with(path) || later == path,
                    "{} unmounted before child {}",
                    path.display(),
                    later.display()
                );
            }
        }
    }

    #[test]
    fn try_mkdir_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cell");
        try_mkdir(&path).unwrap();
        try_mkdir(&path).unwrap();
        assert!(path.is_dir());
    }

    #[test]
    fn try_mkdir_reports_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing/cell");
        assert!(matches!(try_mkdir(&path), Err(BrigError::Mount(_))));
    }

    #[test]
    fn tmpfs_quota_bounds_capacity() {
        if !nix::unistd::geteuid().is_root() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        mount_tmpfs(1024, dir.path(), MsFlags::empty()).unwrap();

        let stat = nix::sys::statvfs::statvfs(dir.path()).unwrap();
        let capacity = u64::from(stat.blocks()) * stat.fragment_size();
        sys::umount(dir.path()).unwrap();

        assert!(capacity <= 1024 * 1024, "capacity {capacity} above quota");
    }
}
