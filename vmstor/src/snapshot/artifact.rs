//! RAII guard for files a workflow is still writing.

use std::path::{Path, PathBuf};

/// A destination file that is removed on drop unless [`PartialArtifact::persist`]
/// is called.
///
/// Every multi-step snapshot or copy creates its output through one of these,
/// so an early return or `?` never leaves a half-written file behind.
pub struct PartialArtifact {
    path: PathBuf,
    persisted: bool,
}

impl PartialArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            persisted: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file; returns its path.
    pub fn persist(mut self) -> PathBuf {
        self.persisted = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for PartialArtifact {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }

        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!("Failed to remove partial artifact {}: {}", self.path.display(), e);
            } else {
                tracing::debug!("Removed partial artifact: {}", self.path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_dropped_artifact_is_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snap-1");
        {
            let artifact = PartialArtifact::new(&path);
            std::fs::write(artifact.path(), b"partial").unwrap();
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_persisted_artifact_is_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snap-2");
        let artifact = PartialArtifact::new(&path);
        std::fs::write(artifact.path(), b"done").unwrap();
        assert_eq!(artifact.persist(), path);
        assert!(path.exists());
    }

    #[test]
    fn test_missing_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        drop(PartialArtifact::new(dir.path().join("never-written")));
    }
}
