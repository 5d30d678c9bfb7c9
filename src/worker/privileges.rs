//! Switching a worker to the configured user and group after it has bound its socket.

use crate::config::ProcessConfig;

#[derive(Debug, thiserror::Error)]
pub enum PrivilegeError {
    #[error("Unknown user '{0}'")]
    UnknownUser(String),
    #[error("Unknown group '{0}'")]
    UnknownGroup(String),
    #[error("Failed to switch identity: {0}")]
    Os(String),
    #[error("Switching user or group is not supported on this platform")]
    Unsupported,
}

/// Switch to `process.group` then `process.user`. A no-op when neither is set.
#[cfg(unix)]
pub fn drop_privileges(process: &ProcessConfig) -> Result<(), PrivilegeError> {
    use nix::unistd::{setgid, setuid};

    if let Some(group) = &process.group {
        let gid = resolve_gid(group)?;
        setgid(gid).map_err(|e| PrivilegeError::Os(format!("setgid({gid}): {e}")))?;
        tracing::debug!(group = %group, gid = %gid, "Switched group");
    }

    if let Some(user) = &process.user {
        let uid = resolve_uid(user)?;
        setuid(uid).map_err(|e| PrivilegeError::Os(format!("setuid({uid}): {e}")))?;
        tracing::debug!(user = %user, uid = %uid, "Switched user");
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn drop_privileges(process: &ProcessConfig) -> Result<(), PrivilegeError> {
    if process.user.is_some() || process.group.is_some() {
        return Err(PrivilegeError::Unsupported);
    }
    Ok(())
}

/// Numeric ids are taken as-is, anything else is looked up by name.
#[cfg(unix)]
fn resolve_uid(name: &str) -> Result<nix::unistd::Uid, PrivilegeError> {
    use nix::unistd::{Uid, User};

    if let Ok(id) = name.parse::<u32>() {
        return Ok(Uid::from_raw(id));
    }
    User::from_name(name)
        .map_err(|e| PrivilegeError::Os(e.to_string()))?
        .map(|user| user.uid)
        .ok_or_else(|| PrivilegeError::UnknownUser(name.to_string()))
}

#[cfg(unix)]
fn resolve_gid(name: &str) -> Result<nix::unistd::Gid, PrivilegeError> {
    use nix::unistd::{Gid, Group};

    if let Ok(id) = name.parse::<u32>() {
        return Ok(Gid::from_raw(id));
    }
    Group::from_name(name)
        .map_err(|e| PrivilegeError::Os(e.to_string()))?
        .map(|group| group.gid)
        .ok_or_else(|| PrivilegeError::UnknownGroup(name.to_string()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_no_identity_is_noop() {
        assert!(drop_privileges(&ProcessConfig::default()).is_ok());
    }

    #[test]
    fn test_numeric_ids_are_not_looked_up() {
        assert_eq!(resolve_uid("4242").unwrap().as_raw(), 4242);
        assert_eq!(resolve_gid("4242").unwrap().as_raw(), 4242);
    }

    #[test]
    fn test_unknown_user_rejected() {
        assert!(matches!(
            resolve_uid("storefront-no-such-user"),
            Err(PrivilegeError::UnknownUser(_))
        ));
    }

    #[test]
    fn test_unknown_group_rejected() {
        assert!(matches!(
            resolve_gid("storefront-no-such-group"),
            Err(PrivilegeError::UnknownGroup(_))
        ));
    }
}
