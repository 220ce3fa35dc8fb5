//! Target identity resolution and privilege drop

use crate::{BrigError, Result};
use nix::unistd::{Gid, Group, Uid, User, setgid, setgroups, setuid};

/// Numeric ids the jail switches to before running its workload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Identity {
    pub gid: Option<Gid>,
    pub uid: Option<Uid>,
}

impl Identity {
    /// Resolve user and group names through the host's name services
    ///
    /// Has to run before the root pivot: afterwards `/etc/passwd` and
    /// friends are gone.
    pub fn resolve(user: Option<&str>, group: Option<&str>) -> Result<Self> {
        let gid = group
            .map(|name| {
                Group::from_name(name)
                    .map_err(|e| BrigError::Identity(format!("lookup of group {name:?} failed: {e}")))?
                    .map(|g| g.gid)
                    .ok_or_else(|| BrigError::Identity(format!("unknown group {name:?}")))
            })
            .transpose()?;

        let uid = user
            .map(|name| {
                User::from_name(name)
                    .map_err(|e| BrigError::Identity(format!("lookup of user {name:?} failed: {e}")))?
                    .map(|u| u.uid)
                    .ok_or_else(|| BrigError::Identity(format!("unknown user {name:?}")))
            })
            .transpose()?;

        Ok(Self { gid, uid })
    }

    /// Switch group then user; irreversible
    ///
    /// Supplementary groups are replaced by the target group so nothing of
    /// the original identity survives. When the target uid is not root, the
    /// drop is verified by checking that uid 0 can no longer be regained.
    pub fn drop_privileges(&self) -> Result<()> {
        if let Some(gid) = self.gid {
            setgroups(&[gid])
                .map_err(|e| BrigError::Privilege(format!("setgroups({gid}) failed: {e}")))?;
            setgid(gid).map_err(|e| BrigError::Privilege(format!("setgid({gid}) failed: {e}")))?;
        }

        if let Some(uid) = self.uid {
            setuid(uid).map_err(|e| BrigError::Privilege(format!("setuid({uid}) failed: {e}")))?;

            if !uid.is_root() && setuid(Uid::from_raw(0)).is_ok() {
                return Err(BrigError::Privilege(
                    "privileges could be regained after drop".into(),
                ));
            }
        }

        tracing::debug!(gid = ?self.gid, uid = ?self.uid, "privileges dropped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::{ForkResult, fork, getuid};

    #[test]
    fn nothing_configured_resolves_to_nothing() {
        assert_eq!(Identity::resolve(None, None).unwrap(), Identity::default());
    }

    #[test]
    fn root_resolves_to_zero() {
        let identity = Identity::resolve(Some("root"), None).unwrap();
        assert_eq!(identity.uid, Some(Uid::from_raw(0)));
        assert_eq!(identity.gid, None);
    }

    #[test]
    fn unknown_names_are_fatal() {
        let err = Identity::resolve(Some("no-such-user-brig"), None).unwrap_err();
        assert!(matches!(err, BrigError::Identity(_)));

        let err = Identity::resolve(None, Some("no-such-group-brig")).unwrap_err();
        assert!(matches!(err, BrigError::Identity(_)));
    }

    #[test]
    #[serial_test::serial]
    fn drop_is_one_way() {
        if !getuid().is_root() {
            return;
        }
        let Ok(identity) = Identity::resolve(Some("nobody"), None) else {
            return;
        };

        // SAFETY: the child only changes ids and exits
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let ok = identity.drop_privileges().is_ok() && setuid(Uid::from_raw(0)).is_err();
                crate::sys::exit_now(i32::from(!ok));
            }
            ForkResult::Parent { child } => {
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
            }
        }
    }
}
