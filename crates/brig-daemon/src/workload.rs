//! The daemon's jail workload: a runtime tree and the supervisor

use crate::server::Supervisor;
use brig_core::jail::{Staging, Workload};
use brig_core::{Result, WorkerSettings};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;

/// Runs the supervisor as PID 1 of the jail
///
/// The listener is bound on the host before the jail exists and reaches the
/// jail through the inherited descriptor table.
#[derive(Debug)]
pub struct DaemonWorkload {
    usr_path: PathBuf,
    listener: Option<UnixListener>,
    max_workers: usize,
    settings: WorkerSettings,
}

impl DaemonWorkload {
    #[must_use]
    pub const fn new(
        usr_path: PathBuf,
        listener: UnixListener,
        max_workers: usize,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            usr_path,
            listener: Some(listener),
            max_workers,
            settings,
        }
    }
}

impl Workload for DaemonWorkload {
    fn prepare_fs(&mut self, staging: &mut Staging<'_>) -> Result<()> {
        staging.bind_readonly(&self.usr_path, "/usr")?;

        let lib64 = if self.usr_path.join("lib64").is_dir() {
            "/usr/lib64"
        } else {
            "/usr/lib"
        };
        staging.symlink("/usr/lib", "/lib")?;
        staging.symlink(lib64, "/lib64")?;
        staging.symlink("/usr/bin", "/bin")
    }

    fn run_workload(&mut self) -> i32 {
        let Some(listener) = self.listener.take() else {
            tracing::error!("supervisor started twice");
            return 1;
        };

        let supervisor = Supervisor::new(listener, self.max_workers, self.settings.clone());
        match supervisor.serve() {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!(error = %e, "supervisor failed");
                1
            }
        }
    }
}
