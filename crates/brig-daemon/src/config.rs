//! Daemon configuration

use brig_core::{BrigError, JailConfig, WorkerSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Core(#[from] BrigError),
}

/// Account payloads run as unless configured otherwise
pub const DEFAULT_PAYLOAD_USER: &str = "nobody";

/// Configuration for the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path to Unix socket
    pub socket_path: PathBuf,

    /// Ceiling on concurrently running workers
    pub max_workers: usize,

    /// Host runtime tree bound read-only at /usr inside the jail
    pub usr_path: PathBuf,

    /// Jail the supervisor runs in
    pub jail: JailConfig,

    /// What each worker runs
    pub worker: WorkerSettings,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: brig_core::config::default_socket_path(),
            max_workers: 5,
            usr_path: PathBuf::from("/usr"),
            jail: JailConfig::default(),
            worker: WorkerSettings {
                user: Some(DEFAULT_PAYLOAD_USER.into()),
                ..WorkerSettings::default()
            },
        }
    }
}

impl DaemonConfig {
    /// Load a JSON file; missing fields keep their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if !self.usr_path.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "usr_path {} is not a directory",
                self.usr_path.display()
            )));
        }
        self.worker.validate()?;

        // Workers switch to the payload user, so they must stay privileged
        if self.worker.user.is_none() {
            return Err(ConfigError::Invalid(
                "worker.user must name the account payloads run as".into(),
            ));
        }
        if self.jail.user.as_deref().is_some_and(|user| user != "root") {
            return Err(ConfigError::Invalid(
                "jail.user must stay unset when payloads run under their own user".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the payload identity on the host
    ///
    /// Payloads never share a uid with the supervisor and its workers.
    pub fn resolve(&mut self) -> Result<(), ConfigError> {
        self.worker.resolve_identity()?;
        let uid = self.worker.identity.and_then(|identity| identity.uid);
        if uid.is_some_and(|uid| uid.is_root()) {
            return Err(ConfigError::Invalid("payloads must not run as root".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.max_workers, 5);
        assert_eq!(config.usr_path, PathBuf::from("/usr"));
        assert_eq!(config.worker.wall_clock_secs, 6);
    }

    #[test]
    fn loads_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_workers": 2, "jail": {{"hostname": "brig"}}, "worker": {{"command": "/bin/sh"}}}}"#
        )
        .unwrap();

        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.jail.hostname.as_deref(), Some("brig"));
        assert_eq!(config.jail.fs_size_kb, 2000);
        assert_eq!(config.worker.command, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn parse_error_names_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();

        let err = DaemonConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn default_runs_payloads_as_nobody() {
        let config = DaemonConfig::default();
        assert_eq!(config.worker.user.as_deref(), Some(DEFAULT_PAYLOAD_USER));
        assert!(config.jail.user.is_none());
    }

    #[test]
    fn payload_user_is_required() {
        let config = DaemonConfig {
            worker: WorkerSettings::default(),
            ..DaemonConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("worker.user"));
    }

    #[test]
    fn unprivileged_supervisor_is_invalid() {
        let mut config = DaemonConfig::default();
        config.jail.user = Some("nobody".into());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("jail.user"));
    }

    #[test]
    fn root_payload_user_is_refused() {
        let mut config = DaemonConfig::default();
        config.worker.user = Some("root".into());
        let err = config.resolve().unwrap_err();
        assert!(err.to_string().contains("must not run as root"));
    }

    #[test]
    fn zero_workers_is_invalid() {
        let config = DaemonConfig {
            max_workers: 0,
            ..DaemonConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
