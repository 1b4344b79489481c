// src/filesystem/autodir.rs

//! Lazy directory creation and cleanup
//!
//! [`AutoDir`] is told about each pathname as it is visited. It creates the
//! directories needed to reach the new pathname and tries to delete the
//! directories that led to the previous one but not to the new one. Only
//! empty directories are deleted, so anything still in use stays put.

use crate::error::{Error, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Default)]
pub struct AutoDir {
    last: Option<PathBuf>,
    floors: Vec<PathBuf>,
}

impl AutoDir {
    /// Create a helper that never deletes any of `floors` or their ancestors
    pub fn new(floors: Vec<PathBuf>) -> Self {
        Self { last: None, floors }
    }

    /// Visit `path`: prune what led to the previous path, create what leads here
    pub fn visit(&mut self, path: &Path) -> Result<()> {
        if let Some(last) = self.last.take() {
            self.prune(&last, Some(path));
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::IoError(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        self.last = Some(path.to_path_buf());
        Ok(())
    }

    /// Note that `path` was just vacated without creating anything for it
    ///
    /// Its empty ancestors are pruned on the next visit or at finish.
    pub fn release(&mut self, path: &Path) {
        if let Some(last) = self.last.take() {
            self.prune(&last, Some(path));
        }
        self.last = Some(path.to_path_buf());
    }

    /// Prune what led to the previous path and forget it
    pub fn finish(&mut self) {
        if let Some(last) = self.last.take() {
            self.prune(&last, None);
        }
    }

    fn prune(&self, old: &Path, new: Option<&Path>) {
        let mut dir = old.parent();
        while let Some(d) = dir {
            if d.as_os_str().is_empty() || self.is_floor(d) {
                break;
            }
            if new.is_some_and(|n| n.starts_with(d)) {
                break;
            }

            match fs::remove_dir(d) {
                Ok(()) => debug!("Removed empty directory {}", d.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                // Not empty (or not ours to delete): everything above is in use too
                Err(_) => break,
            }
            dir = d.parent();
        }
    }

    fn is_floor(&self, dir: &Path) -> bool {
        self.floors.iter().any(|floor| floor.starts_with(dir))
    }
}

impl Drop for AutoDir {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_visit_creates_parents() {
        let dir = tempdir().unwrap();
        let mut auto = AutoDir::new(vec![dir.path().to_path_buf()]);

        let target = dir.path().join("a/b/c/file");
        auto.visit(&target).unwrap();
        assert!(dir.path().join("a/b/c").is_dir());
    }

    #[test]
    fn test_moving_on_prunes_empty_directories() {
        let dir = tempdir().unwrap();
        let mut auto = AutoDir::new(vec![dir.path().to_path_buf()]);

        auto.visit(&dir.path().join("a/b/file")).unwrap();
        auto.visit(&dir.path().join("a/c/file")).unwrap();

        // a/b was never filled, so it goes; a is shared with the new path
        assert!(!dir.path().join("a/b").exists());
        assert!(dir.path().join("a/c").is_dir());
    }

    #[test]
    fn test_non_empty_directories_survive() {
        let dir = tempdir().unwrap();
        let mut auto = AutoDir::new(vec![dir.path().to_path_buf()]);

        let first = dir.path().join("a/b/file");
        auto.visit(&first).unwrap();
        fs::write(&first, "x").unwrap();
        auto.finish();

        assert!(first.exists());
    }

    #[test]
    fn test_floor_is_never_removed() {
        let dir = tempdir().unwrap();
        let floor = dir.path().join("Apps");
        fs::create_dir_all(&floor).unwrap();
        let mut auto = AutoDir::new(vec![floor.clone()]);

        auto.visit(&floor.join("Foo/!Run")).unwrap();
        auto.finish();

        assert!(!floor.join("Foo").exists());
        assert!(floor.is_dir());
    }

    #[test]
    fn test_release_prunes_vacated_directories() {
        let dir = tempdir().unwrap();
        let mut auto = AutoDir::new(vec![dir.path().to_path_buf()]);

        let backup = dir.path().join("a/~backup~/file");
        fs::create_dir_all(backup.parent().unwrap()).unwrap();
        fs::write(&backup, "old").unwrap();
        fs::remove_file(&backup).unwrap();

        auto.release(&backup);
        assert!(dir.path().join("a/~backup~").exists());
        auto.finish();
        assert!(!dir.path().join("a").exists());
    }

    #[test]
    fn test_file_in_the_way_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), "file").unwrap();
        let mut auto = AutoDir::new(vec![dir.path().to_path_buf()]);

        assert!(auto.visit(&dir.path().join("a/b")).is_err());
    }
}
