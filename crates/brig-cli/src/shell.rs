//! Interactive jail

use brig_core::jail::{Staging, Workload};
use brig_core::{BrigError, Result};
use nix::sys::resource::{Resource, setrlimit};
use std::ffi::CString;
use std::path::PathBuf;

/// Runs a command on the caller's terminal inside the jail
#[derive(Debug)]
pub struct ShellWorkload {
    usr_path: PathBuf,
    command: Vec<String>,
    max_processes: Option<u64>,
}

impl ShellWorkload {
    #[must_use]
    pub const fn new(usr_path: PathBuf, command: Vec<String>, max_processes: Option<u64>) -> Self {
        Self {
            usr_path,
            command,
            max_processes,
        }
    }

    /// Program path and argv; `/bin/sh` when no command was given
    fn argv(&self) -> Result<Vec<CString>> {
        let words: Vec<&str> = if self.command.is_empty() {
            vec!["/bin/sh"]
        } else {
            self.command.iter().map(String::as_str).collect()
        };
        words
            .into_iter()
            .map(|word| {
                CString::new(word.as_bytes())
                    .map_err(|_| BrigError::Config(format!("argument contains NUL: {word:?}")))
            })
            .collect()
    }

    fn exec(&self) -> BrigError {
        let argv = match self.argv() {
            Ok(argv) => argv,
            Err(e) => return e,
        };
        // Cleared environment apart from a search path into the bound tree
        let env = [c"PATH=/usr/bin"];

        if let Some(limit) = self.max_processes {
            if let Err(e) = setrlimit(Resource::RLIMIT_NPROC, limit, limit) {
                return BrigError::Limits(format!("failed to set process limit: {e}"));
            }
        }

        match nix::unistd::execve(&argv[0], &argv, &env) {
            Ok(never) => match never {},
            Err(e) => BrigError::Process(format!("failed to execute {:?}: {e}", argv[0])),
        }
    }
}

impl Workload for ShellWorkload {
    fn prepare_fs(&mut self, staging: &mut Staging<'_>) -> Result<()> {
        staging.bind_readonly(&self.usr_path, "/usr")?;
        staging.symlink("/usr/lib", "/lib")?;
        if self.usr_path.join("lib64").is_dir() {
            staging.symlink("/usr/lib64", "/lib64")?;
        }
        staging.symlink("/usr/bin", "/bin")
    }

    fn run_workload(&mut self) -> i32 {
        tracing::debug!(
            command = ?self.command,
            usr = %self.usr_path.display(),
            "starting shell"
        );
        let error = self.exec();
        tracing::error!(error = %error, "shell did not start");
        127
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_runs_sh() {
        let shell = ShellWorkload::new(PathBuf::from("/usr"), vec![], Some(1));
        let argv = shell.argv().unwrap();
        assert_eq!(argv, vec![CString::new("/bin/sh").unwrap()]);
    }

    #[test]
    fn command_words_become_argv() {
        let shell = ShellWorkload::new(
            PathBuf::from("/usr"),
            vec!["/usr/bin/python3".into(), "-q".into()],
            None,
        );
        let argv = shell.argv().unwrap();
        assert_eq!(argv.len(), 2);
        assert_eq!(argv[1].as_bytes(), b"-q");
    }

    #[test]
    fn nul_in_argument_is_rejected() {
        let shell = ShellWorkload::new(PathBuf::from("/usr"), vec!["a\0b".into()], None);
        assert!(shell.argv().is_err());
    }
}
