//! Jail configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for a jail instance
///
/// Immutable once handed to [`crate::jail::Jail`]. User and group names are
/// resolved to numeric ids before any namespace is created, because name
/// services are unreachable once the root has been pivoted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JailConfig {
    /// Size quota of the tmpfs root in kilobytes
    pub fs_size_kb: u64,

    /// User to switch to before running the workload
    pub user: Option<String>,

    /// Group to switch to before running the workload
    pub group: Option<String>,

    /// Hostname inside the UTS namespace
    pub hostname: Option<String>,

    /// Extra mountpoints (as seen inside the jail) kept during reconciliation
    pub preserve_mounts: Vec<PathBuf>,

    /// Remount the tmpfs root read-only once setup is done
    pub remount_ro: bool,

    /// Mount a cgroup2 filesystem at /cgroup
    pub mount_cgroup: bool,

    /// Mount a minimal /dev with null and zero
    pub mount_dev: bool,

    /// Clear the capability bounding set before dropping privileges
    pub drop_capabilities: bool,

    /// Rounds of bulk unmounting before busy mounts are tolerated
    pub unmount_tries: u32,
}

impl Default for JailConfig {
    fn default() -> Self {
        Self {
            fs_size_kb: 2000,
            user: None,
            group: None,
            hostname: None,
            preserve_mounts: vec![],
            remount_ro: true,
            mount_cgroup: false,
            mount_dev: false,
            drop_capabilities: true,
            unmount_tries: 5,
        }
    }
}

impl JailConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> JailConfigBuilder {
        JailConfigBuilder::default()
    }
}

/// Builder for JailConfig
#[derive(Debug, Default)]
pub struct JailConfigBuilder {
    config: JailConfig,
}

impl JailConfigBuilder {
    #[must_use]
    pub fn fs_size_kb(mut self, kb: u64) -> Self {
        self.config.fs_size_kb = kb;
        self
    }

    #[must_use]
    pub fn user(mut self, name: impl Into<String>) -> Self {
        self.config.user = Some(name.into());
        self
    }

    #[must_use]
    pub fn group(mut self, name: impl Into<String>) -> Self {
        self.config.group = Some(name.into());
        self
    }

    #[must_use]
    pub fn hostname(mut self, name: impl Into<String>) -> Self {
        self.config.hostname = Some(name.into());
        self
    }

    #[must_use]
    pub fn preserve(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.preserve_mounts.push(path.into());
        self
    }

    #[must_use]
    pub fn remount_ro(mut self, enabled: bool) -> Self {
        self.config.remount_ro = enabled;
        self
    }

    #[must_use]
    pub fn mount_cgroup(mut self, enabled: bool) -> Self {
        self.config.mount_cgroup = enabled;
        self
    }

    #[must_use]
    pub fn mount_dev(mut self, enabled: bool) -> Self {
        self.config.mount_dev = enabled;
        self
    }

    #[must_use]
    pub fn drop_capabilities(mut self, enabled: bool) -> Self {
        self.config.drop_capabilities = enabled;
        self
    }

    #[must_use]
    pub fn unmount_tries(mut self, tries: u32) -> Self {
        self.config.unmount_tries = tries.max(1);
        self
    }

    #[must_use]
    pub fn build(self) -> JailConfig {
        self.config
    }
}

/// Get default socket path from BRIG_SOCKET env var or system default
///
/// Returns:
/// - `$BRIG_SOCKET` if set (for development)
/// - `/run/brig/brig.sock` otherwise (production)
pub fn default_socket_path() -> PathBuf {
    std::env::var("BRIG_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/brig/brig.sock"))
}
