//! Readiness marker.
//!
//! Follows the operator-sdk convention of a ready file that a readiness probe
//! can `stat`, and mirrors the same flag into the `/readyz` endpoint. The
//! marker is held through a [`ReadyGuard`]; dropping the guard unsets it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::health::HealthState;

/// Default ready file used by operator-sdk based probes.
pub const DEFAULT_READY_FILE: &str = "/tmp/operator-sdk-ready";

/// Something that can mark the process ready.
pub trait ReadyMarker: Send + Sync {
    fn set(&self) -> Result<ReadyGuard>;
}

/// Keeps the ready marker set until dropped.
pub struct ReadyGuard {
    unset: Option<Box<dyn FnOnce() + Send>>,
}

impl ReadyGuard {
    pub fn new(unset: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unset: Some(Box::new(unset)),
        }
    }
}

impl Drop for ReadyGuard {
    fn drop(&mut self) {
        if let Some(unset) = self.unset.take() {
            unset();
        }
    }
}

/// Ready file on disk plus the health server's readiness flag.
pub struct ReadyFile {
    path: PathBuf,
    health: HealthState,
}

impl ReadyFile {
    pub fn new(path: impl Into<PathBuf>, health: HealthState) -> Self {
        Self {
            path: path.into(),
            health,
        }
    }
}

impl ReadyMarker for ReadyFile {
    fn set(&self) -> Result<ReadyGuard> {
        std::fs::File::create(&self.path)
            .with_context(|| format!("Failed to create ready file {}", self.path.display()))?;
        self.health.set_ready(true);
        debug!(path = %self.path.display(), "Ready marker set");

        let path = self.path.clone();
        let health = self.health.clone();
        Ok(ReadyGuard::new(move || {
            health.set_ready(false);
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Ready marker unset"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove ready file"),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_file_set_and_unset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ready");
        let health = HealthState::new();
        let marker = ReadyFile::new(&path, health.clone());

        let guard = marker.set().unwrap();
        assert!(path.exists());
        assert!(health.is_ready());

        drop(guard);
        assert!(!path.exists());
        assert!(!health.is_ready());
    }

    #[test]
    fn test_ready_file_unwritable_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let marker = ReadyFile::new(dir.path().join("missing/ready"), HealthState::new());
        assert!(marker.set().is_err());
    }

    #[test]
    fn test_guard_tolerates_file_already_gone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ready");
        let guard = ReadyFile::new(&path, HealthState::new()).set().unwrap();
        std::fs::remove_file(&path).unwrap();
        drop(guard);
    }
}
