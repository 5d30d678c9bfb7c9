//! Process-level settings applied by the supervisor: umask, daemon mode and pidfile.

use std::io;
use std::path::{Path, PathBuf};

use crate::config::ProcessConfig;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to write pidfile {path}: {source}")]
    Pidfile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to daemonize: {0}")]
    Daemon(String),
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

/// Apply `process.umask` to the current process; returns the previous mask.
#[cfg(unix)]
pub fn apply_umask(process: &ProcessConfig) -> Option<u32> {
    use nix::sys::stat::{umask, Mode};

    let mask = process.umask?;
    let previous = umask(Mode::from_bits_truncate(mask as _));
    tracing::debug!(umask = format!("{:#o}", mask), "Applied umask");
    Some(previous.bits() as u32)
}

#[cfg(not(unix))]
pub fn apply_umask(process: &ProcessConfig) -> Option<u32> {
    if process.umask.is_some() {
        tracing::warn!("umask is not supported on this platform, ignoring");
    }
    None
}

/// Detach from the controlling terminal when `process.daemon` is set.
///
/// Must run before any async runtime or thread is started.
#[cfg(unix)]
pub fn daemonize(process: &ProcessConfig) -> Result<(), ProcessError> {
    if !process.daemon {
        return Ok(());
    }
    nix::unistd::daemon(true, false).map_err(|e| ProcessError::Daemon(e.to_string()))
}

#[cfg(not(unix))]
pub fn daemonize(process: &ProcessConfig) -> Result<(), ProcessError> {
    if process.daemon {
        return Err(ProcessError::Unsupported("Daemon mode"));
    }
    Ok(())
}

/// Holds the supervisor's pid on disk; the file is removed on drop.
#[derive(Debug)]
pub struct Pidfile {
    path: PathBuf,
}

impl Pidfile {
    pub fn create(path: &Path) -> Result<Self, ProcessError> {
        std::fs::write(path, format!("{}\n", std::process::id())).map_err(|source| {
            ProcessError::Pidfile {
                path: path.to_path_buf(),
                source,
            }
        })?;
        tracing::debug!(path = %path.display(), "Wrote pidfile");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Pidfile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove pidfile");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pidfile_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storefront.pid");

        let pidfile = Pidfile::create(&path).unwrap();
        let contents = std::fs::read_to_string(pidfile.path()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        drop(pidfile);
        assert!(!path.exists());
    }

    #[test]
    fn test_pidfile_in_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("storefront.pid");
        assert!(matches!(
            Pidfile::create(&path),
            Err(ProcessError::Pidfile { .. })
        ));
    }

    #[test]
    fn test_unset_umask_is_left_alone() {
        assert_eq!(apply_umask(&ProcessConfig::default()), None);
    }

    #[test]
    fn test_daemon_disabled_is_noop() {
        assert!(daemonize(&ProcessConfig::default()).is_ok());
    }
}
