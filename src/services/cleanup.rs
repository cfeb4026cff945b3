// Artifact Cleanup
// Deletes transient media files once their item is done with them

use std::io::ErrorKind;
use std::path::Path;

/// Removes an item's cleanup file. Failures are logged, never surfaced.
pub trait ArtifactCleaner: Send + Sync {
    fn remove(&self, path: &Path);
}

/// Deletes files from the local filesystem
#[derive(Debug, Default, Clone)]
pub struct FsCleaner;

impl ArtifactCleaner for FsCleaner {
    fn remove(&self, path: &Path) {
        match std::fs::remove_file(path) {
            Ok(()) => log::debug!("Removed transient file {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("Transient file already gone: {}", path.display());
            }
            Err(e) => log::warn!("Failed to remove transient file {}: {e}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fs_cleaner_removes_file() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("download.mp3");
        std::fs::write(&file, b"data").unwrap();

        FsCleaner.remove(&file);
        assert!(!file.exists());
    }

    #[test]
    fn test_fs_cleaner_tolerates_missing_file() {
        let temp = TempDir::new().unwrap();
        FsCleaner.remove(&temp.path().join("missing.mp3"));
    }
}
