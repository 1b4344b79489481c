// src/filesystem/mod.rs

//! Filesystem primitives shared by the unpack engine and the metadata stores
//!
//! Every durable file replacement goes through the same four steps:
//! write `<file>.new`, move the old file to `<file>.old`, move `<file>.new`
//! to `<file>`, delete `<file>.old`. A crash between any two steps leaves
//! exactly one recoverable artifact, which [`recover`] resolves.
//!
//! Destination objects being installed or removed get sibling staging and
//! backup locations: a reserved directory component inserted immediately
//! before the leaf name.

mod autodir;

pub use autodir::AutoDir;

use crate::error::{Error, Result};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory component holding staged copies of files being unpacked
pub const STAGE_TAG: &str = "~stevedore-stage~";

/// Directory component holding backups of files being removed or replaced
pub const BACKUP_TAG: &str = "~stevedore-backup~";

const TEMP_SUFFIX: &str = ".new";
const OLD_SUFFIX: &str = ".old";

/// Staging location for destination `dest`
pub fn staging_path(dest: &Path) -> PathBuf {
    tagged_path(dest, STAGE_TAG)
}

/// Backup location for destination `dest`
pub fn backup_path(dest: &Path) -> PathBuf {
    tagged_path(dest, BACKUP_TAG)
}

fn tagged_path(dest: &Path, tag: &str) -> PathBuf {
    let parent = dest.parent().unwrap_or_else(|| Path::new(""));
    match dest.file_name() {
        Some(leaf) => parent.join(tag).join(leaf),
        None => parent.join(tag),
    }
}

/// Temp name used while a replacement for `path` is being prepared
pub fn temp_path(path: &Path) -> PathBuf {
    with_suffix(path, TEMP_SUFFIX)
}

/// Name the current version of `path` is parked under during promotion
pub fn old_path(path: &Path) -> PathBuf {
    with_suffix(path, OLD_SUFFIX)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// True if anything (file, directory or dangling link) exists at `path`
pub fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// True if a directory exists at `path`
pub fn is_dir(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Write `contents` to the temp name of `path` without touching `path`
pub fn stage(path: &Path, contents: &[u8]) -> Result<()> {
    let temp = temp_path(path);
    if let Some(parent) = temp.parent() {
        fs::create_dir_all(parent).map_err(|e| persistence(parent, e))?;
    }

    let mut file = File::create(&temp).map_err(|e| persistence(&temp, e))?;
    file.write_all(contents).map_err(|e| persistence(&temp, e))?;
    file.sync_all().map_err(|e| persistence(&temp, e))?;
    Ok(())
}

/// True if a staged replacement for `path` exists
pub fn is_staged(path: &Path) -> bool {
    exists(&temp_path(path))
}

/// Promote the staged replacement of `path` to the canonical name
pub fn promote(path: &Path) -> Result<()> {
    let temp = temp_path(path);
    let old = old_path(path);

    if exists(path) {
        fs::rename(path, &old).map_err(|e| persistence(path, e))?;
    }
    fs::rename(&temp, path).map_err(|e| persistence(&temp, e))?;
    remove_file_if_exists(&old).map_err(|e| persistence(&old, e))?;

    debug!("Promoted {}", path.display());
    Ok(())
}

/// Delete a staged replacement of `path`, if any
pub fn discard(path: &Path) -> Result<()> {
    let temp = temp_path(path);
    remove_file_if_exists(&temp).map_err(|e| persistence(&temp, e))
}

/// Replace `path` with `contents` using the full write/backup/promote idiom
pub fn write_replace(path: &Path, contents: &[u8]) -> Result<()> {
    stage(path, contents)?;
    promote(path)
}

/// Resolve a promotion interrupted by a crash
///
/// If the canonical file is missing but a parked old version exists, the
/// crash happened between parking and promoting: the old version comes back.
/// If both exist, the crash happened after promotion and the parked copy is
/// stale. Staged temp files are left alone; they belong to an uncommitted
/// transaction.
pub fn recover(path: &Path) -> Result<()> {
    let old = old_path(path);
    if !exists(&old) {
        return Ok(());
    }

    if exists(path) {
        debug!("Removing stale {}", old.display());
        fs::remove_file(&old).map_err(|e| persistence(&old, e))?;
    } else {
        warn!("Restoring {} from interrupted replacement", path.display());
        fs::rename(&old, path).map_err(|e| persistence(&old, e))?;
    }
    Ok(())
}

/// Delete `path` and any parked old version, the plain (non-replacing) removal
pub fn remove_all_versions(path: &Path) -> Result<()> {
    remove_file_if_exists(path).map_err(|e| persistence(path, e))?;
    let old = old_path(path);
    remove_file_if_exists(&old).map_err(|e| persistence(&old, e))
}

/// Read `path` after resolving any interrupted replacement
pub fn read_recovered(path: &Path) -> Result<Option<String>> {
    recover(path)?;
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::IoError(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Remove a file, treating "already gone" as success
pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Remove `path` if it is an empty directory
///
/// A directory that is missing or still holds entries is left alone; any
/// other failure is logged.
pub fn remove_dir_if_empty(path: &Path) {
    match fs::remove_dir(path) {
        Ok(()) => debug!("Removed empty directory {}", path.display()),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::DirectoryNotEmpty
            ) => {}
        Err(e) => warn!("Failed to remove directory {}: {}", path.display(), e),
    }
}

/// Rename with the paths folded into the error
pub fn move_path(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).map_err(|e| {
        Error::IoError(format!(
            "Failed to move {} to {}: {}",
            from.display(),
            to.display(),
            e
        ))
    })
}

/// True if `path` is a directory with no entries
pub fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

fn persistence(path: &Path, e: io::Error) -> Error {
    Error::PersistenceError(format!("{}: {}", path.display(), e))
}
