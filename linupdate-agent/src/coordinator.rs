//! Restart coordination through advisory lock and trigger files
//!
//! A lock file marks an in-flight request; the supervisor must not restart
//! while one exists. The trigger file asks the supervisor to restart itself.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Lock held by the control agent while it processes a request.
pub const REQUEST_LOCK: &str = "reposerver.request";

pub const TRIGGER_FILE: &str = "linupdate.restart-needed";

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("could not create {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not remove {path}: {source}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct RestartCoordinator {
    runtime_dir: PathBuf,
}

impl RestartCoordinator {
    pub fn new<P: AsRef<Path>>(runtime_dir: P) -> Self {
        Self {
            runtime_dir: runtime_dir.as_ref().to_path_buf(),
        }
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.runtime_dir.join(format!("linupdate.{name}.lock"))
    }

    pub fn trigger_path(&self) -> PathBuf {
        self.runtime_dir.join(TRIGGER_FILE)
    }

    fn touch(path: &Path) -> Result<(), CoordinatorError> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map(|_| ())
            .map_err(|source| CoordinatorError::Create {
                path: path.to_path_buf(),
                source,
            })
    }

    fn remove(path: &Path) -> Result<(), CoordinatorError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CoordinatorError::Remove {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Create the lock file if absent.
    pub fn acquire(&self, name: &str) -> Result<(), CoordinatorError> {
        Self::touch(&self.lock_path(name))
    }

    /// Remove the lock file if present.
    pub fn release(&self, name: &str) -> Result<(), CoordinatorError> {
        Self::remove(&self.lock_path(name))
    }

    /// Acquire a lock released when the guard drops.
    pub fn guard(&self, name: &str) -> Result<LockGuard, CoordinatorError> {
        self.acquire(name)?;
        Ok(LockGuard {
            path: self.lock_path(name),
        })
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.lock_path(name).exists()
    }

    pub fn any_held(&self, names: &[&str]) -> bool {
        names.iter().any(|name| self.is_held(name))
    }

    pub fn held(&self, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|name| self.lock_path(name))
            .filter(|path| path.exists())
            .collect()
    }

    pub fn request_restart(&self) -> Result<(), CoordinatorError> {
        Self::touch(&self.trigger_path())
    }

    pub fn restart_requested(&self) -> bool {
        self.trigger_path().exists()
    }

    pub fn consume_trigger(&self) -> Result<(), CoordinatorError> {
        Self::remove(&self.trigger_path())
    }

    /// Poll until none of the named locks exist.
    pub async fn wait_until_released(&self, names: &[&str], poll: Duration) {
        loop {
            let held = self.held(names);
            if held.is_empty() {
                return;
            }
            for path in held {
                info!("Lock file {} is present, waiting...", path.display());
            }
            tokio::time::sleep(poll).await;
        }
    }
}

/// Removes its lock file on drop, whatever the outcome of the guarded work.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = RestartCoordinator::remove(&self.path) {
            warn!("Failed to release lock: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_release() {
        let dir = TempDir::new().unwrap();
        let coordinator = RestartCoordinator::new(dir.path());

        assert!(!coordinator.any_held(&[REQUEST_LOCK]));
        coordinator.acquire(REQUEST_LOCK).unwrap();
        coordinator.acquire(REQUEST_LOCK).unwrap();
        assert!(dir.path().join("linupdate.reposerver.request.lock").exists());
        assert!(coordinator.any_held(&["other", REQUEST_LOCK]));

        coordinator.release(REQUEST_LOCK).unwrap();
        coordinator.release(REQUEST_LOCK).unwrap();
        assert!(!coordinator.is_held(REQUEST_LOCK));
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        let coordinator = RestartCoordinator::new(dir.path());
        {
            let guard = coordinator.guard(REQUEST_LOCK).unwrap();
            assert!(guard.path().exists());
        }
        assert!(!coordinator.is_held(REQUEST_LOCK));
    }

    #[test]
    fn test_trigger_lifecycle() {
        let dir = TempDir::new().unwrap();
        let coordinator = RestartCoordinator::new(dir.path());
        assert!(!coordinator.restart_requested());
        coordinator.request_restart().unwrap();
        assert!(coordinator.restart_requested());
        coordinator.consume_trigger().unwrap();
        assert!(!coordinator.restart_requested());
    }

    #[tokio::test]
    async fn test_wait_returns_once_released() {
        let dir = TempDir::new().unwrap();
        let coordinator = RestartCoordinator::new(dir.path());
        coordinator.acquire(REQUEST_LOCK).unwrap();

        let releaser = coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            releaser.release(REQUEST_LOCK).unwrap();
        });

        tokio::time::timeout(
            Duration::from_secs(2),
            coordinator.wait_until_released(&[REQUEST_LOCK], Duration::from_millis(10)),
        )
        .await
        .unwrap();
    }
}
