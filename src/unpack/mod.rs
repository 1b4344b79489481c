// src/unpack/mod.rs

//! The unpack engine
//!
//! Given a batch of package names, the engine compares each package's
//! current and selected status, then unpacks what must be installed or
//! upgraded and removes what must go, as one recoverable transaction.
//!
//! The engine is a state machine advanced by [`UnpackEngine::poll`]; each
//! call does one bounded unit of work (one package, one file, one trigger
//! check). Every destination object moves through disjoint sets as it is
//! staged, placed, backed up and finally committed, so at any instant the
//! engine knows exactly what an unwind has to reverse.
//!
//! There are two points of no return. Nothing on disk changes until the
//! conflict and compatibility check after `PreRemove` passes, so failing
//! there only reverts in-memory status. Once `PostRemove` starts deleting
//! backups nothing can be unwound; later failures are reported as they are.

mod objects;
#[cfg(test)]
mod tests;

pub use objects::{DestObject, DestSet};

use crate::environment;
use crate::error::{Error, Result};
use crate::filesystem::{self, AutoDir};
use crate::manifest::Manifest;
use crate::packages::{self, ArchiveEntry, Control, EntryKind, PackageArchive};
use crate::paths::PathResolver;
use crate::pkgbase::PackageBase;
use crate::progress::ProgressItem;
use crate::status::{self, State, Status};
use crate::triggers::{Trigger, TriggerHandle, TriggerPoint, TriggerRunner, TriggerState};
use crate::version;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Control field recording that a package's module was already resident
pub const MODULE_RESIDENT_FIELD: &str = "Module-Resident";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnpackState {
    PreUnpack,
    PreRemove,
    CopyPostRemove,
    RunPreRemoveTriggers,
    RemoveFilesReplacedByDirs,
    Unpack,
    RunPreInstallTriggers,
    Replace,
    Remove,
    PostRemove,
    CreateEmptyDirs,
    PostUnpack,
    Done,
    UnwindCreateEmptyDirs,
    UnwindReplace,
    UnwindRemove,
    UnwindPreInstallTriggers,
    UnwindUnpack,
    UnwindRemoveFilesReplacedByDirs,
    UnwindPreRemoveTriggers,
    UnwindCopyPostRemove,
    UnwindPreRemove,
    UnwindPreUnpack,
    Fail,
}

impl UnpackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnpackState::PreUnpack => "pre_unpack",
            UnpackState::PreRemove => "pre_remove",
            UnpackState::CopyPostRemove => "copy_post_remove",
            UnpackState::RunPreRemoveTriggers => "run_pre_remove_triggers",
            UnpackState::RemoveFilesReplacedByDirs => "remove_files_replaced_by_dirs",
            UnpackState::Unpack => "unpack",
            UnpackState::RunPreInstallTriggers => "run_pre_install_triggers",
            UnpackState::Replace => "replace",
            UnpackState::Remove => "remove",
            UnpackState::PostRemove => "post_remove",
            UnpackState::CreateEmptyDirs => "create_empty_dirs",
            UnpackState::PostUnpack => "post_unpack",
            UnpackState::Done => "done",
            UnpackState::UnwindCreateEmptyDirs => "unwind_create_empty_dirs",
            UnpackState::UnwindReplace => "unwind_replace",
            UnpackState::UnwindRemove => "unwind_remove",
            UnpackState::UnwindPreInstallTriggers => "unwind_pre_install_triggers",
            UnpackState::UnwindUnpack => "unwind_unpack",
            UnpackState::UnwindRemoveFilesReplacedByDirs => "unwind_remove_files_replaced_by_dirs",
            UnpackState::UnwindPreRemoveTriggers => "unwind_pre_remove_triggers",
            UnpackState::UnwindCopyPostRemove => "unwind_copy_post_remove",
            UnpackState::UnwindPreRemove => "unwind_pre_remove",
            UnpackState::UnwindPreUnpack => "unwind_pre_unpack",
            UnpackState::Fail => "fail",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UnpackState::Done | UnpackState::Fail)
    }

    pub fn is_unwinding(&self) -> bool {
        matches!(
            self,
            UnpackState::UnwindCreateEmptyDirs
                | UnpackState::UnwindReplace
                | UnpackState::UnwindRemove
                | UnpackState::UnwindPreInstallTriggers
                | UnpackState::UnwindUnpack
                | UnpackState::UnwindRemoveFilesReplacedByDirs
                | UnpackState::UnwindPreRemoveTriggers
                | UnpackState::UnwindCopyPostRemove
                | UnpackState::UnwindPreRemove
                | UnpackState::UnwindPreUnpack
        )
    }
}

impl fmt::Display for UnpackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A package being unpacked
struct Incoming {
    archive: Box<dyn PackageArchive>,
    control: Control,
    /// Control record as it will be stored, possibly rewritten
    control_text: String,
    manifest: Manifest,
    files: u64,
    bytes: u64,
}

/// A package whose current build is being removed
struct Outgoing {
    manifest: Manifest,
}

struct ActiveTrigger {
    trigger: Trigger,
    handle: Box<dyn TriggerHandle>,
}

pub struct UnpackEngine {
    state: UnpackState,
    queue: VecDeque<String>,

    to_unpack: BTreeSet<String>,
    to_remove: BTreeSet<String>,
    incoming: BTreeMap<String, Incoming>,
    outgoing: BTreeMap<String, Outgoing>,
    original_status: BTreeMap<String, Status>,
    status_committed: bool,
    metadata_staged: bool,
    past_no_return: bool,

    files_to_unpack: DestSet,
    files_being_unpacked: DestSet,
    files_unpacked: DestSet,
    files_to_remove: DestSet,
    files_being_removed: DestSet,
    files_removed: DestSet,
    dirs_to_remove: DestSet,
    dirs_being_removed: DestSet,
    dirs_removed: DestSet,
    parent_conflicts: DestSet,
    files_replaced_by_dirs: DestSet,
    files_being_replaced_by_dirs: DestSet,
    empty_dirs_to_create: DestSet,
    empty_dirs_created: DestSet,

    files_that_conflict: DestSet,
    cannot_process: BTreeSet<String>,

    pre_remove_run: Vec<String>,
    pre_install_run: Vec<String>,
    active_trigger: Option<ActiveTrigger>,
    post_remove_copies: BTreeMap<String, PathBuf>,

    files_done: u64,
    files_total: u64,
    bytes_done: u64,
    bytes_total: u64,
    /// Share of the totals contributed by files being removed
    removal_files: u64,
    removal_bytes: u64,
    progress: BTreeMap<String, ProgressItem>,

    autodir: AutoDir,
    message: Option<String>,

    #[cfg(test)]
    fail_at: Option<UnpackState>,
}

impl UnpackEngine {
    /// Classify `packages` by comparing current and selected status
    pub fn new<I, S>(pb: &PackageBase, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut to_unpack = BTreeSet::new();
        let mut to_remove = BTreeSet::new();
        for name in packages {
            let name = name.as_ref();
            let cur = pb.current.get(name);
            let sel = pb.selected.get(name);
            if status::unpack_req(&cur, &sel) {
                to_unpack.insert(name.to_string());
            }
            if status::remove_req(&cur, &sel) {
                to_remove.insert(name.to_string());
            }
        }

        info!(
            "Unpack engine: {} to unpack, {} to remove",
            to_unpack.len(),
            to_remove.len()
        );

        Self {
            state: UnpackState::PreUnpack,
            queue: to_unpack.iter().cloned().collect(),
            to_unpack,
            to_remove,
            incoming: BTreeMap::new(),
            outgoing: BTreeMap::new(),
            original_status: BTreeMap::new(),
            status_committed: false,
            metadata_staged: false,
            past_no_return: false,
            files_to_unpack: DestSet::new(),
            files_being_unpacked: DestSet::new(),
            files_unpacked: DestSet::new(),
            files_to_remove: DestSet::new(),
            files_being_removed: DestSet::new(),
            files_removed: DestSet::new(),
            dirs_to_remove: DestSet::new(),
            dirs_being_removed: DestSet::new(),
            dirs_removed: DestSet::new(),
            parent_conflicts: DestSet::new(),
            files_replaced_by_dirs: DestSet::new(),
            files_being_replaced_by_dirs: DestSet::new(),
            empty_dirs_to_create: DestSet::new(),
            empty_dirs_created: DestSet::new(),
            files_that_conflict: DestSet::new(),
            cannot_process: BTreeSet::new(),
            pre_remove_run: Vec::new(),
            pre_install_run: Vec::new(),
            active_trigger: None,
            post_remove_copies: BTreeMap::new(),
            files_done: 0,
            files_total: 0,
            bytes_done: 0,
            bytes_total: 0,
            removal_files: 0,
            removal_bytes: 0,
            progress: BTreeMap::new(),
            autodir: AutoDir::new(pb.paths.roots()),
            message: None,
            #[cfg(test)]
            fail_at: None,
        }
    }

    pub fn state(&self) -> UnpackState {
        self.state
    }

    /// True if the batch needs neither unpacking nor removal
    pub fn is_empty(&self) -> bool {
        self.to_unpack.is_empty() && self.to_remove.is_empty()
    }

    pub fn packages_to_unpack(&self) -> &BTreeSet<String> {
        &self.to_unpack
    }

    pub fn packages_to_remove(&self) -> &BTreeSet<String> {
        &self.to_remove
    }

    /// Failure description, once something went wrong
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Existing objects that blocked installation
    pub fn files_that_conflict(&self) -> Vec<PathBuf> {
        self.files_that_conflict.paths()
    }

    /// Packages with an unsupported standards version or environment
    pub fn packages_cannot_process(&self) -> Vec<String> {
        self.cannot_process.iter().cloned().collect()
    }

    pub fn files_done(&self) -> u64 {
        self.files_done
    }

    pub fn files_total(&self) -> u64 {
        self.files_total
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total
    }

    /// Byte progress of each package being unpacked
    pub fn progress(&self) -> Vec<ProgressItem> {
        self.to_unpack
            .iter()
            .map(|name| self.progress.get(name).copied().unwrap_or_default())
            .collect()
    }

    /// Saved post-remove scripts, by package
    pub fn post_remove_copies(&self) -> &BTreeMap<String, PathBuf> {
        &self.post_remove_copies
    }

    pub fn past_point_of_no_return(&self) -> bool {
        self.past_no_return
    }

    #[cfg(test)]
    pub(crate) fn fail_at(&mut self, state: UnpackState) {
        self.fail_at = Some(state);
    }

    /// Advance by one unit of work and return the new state
    pub fn poll(&mut self, pb: &mut PackageBase, runner: &mut dyn TriggerRunner) -> UnpackState {
        if self.state.is_terminal() {
            return self.state;
        }

        if let Some(injected) = self.injected_failure() {
            self.handle_error(pb, injected);
            return self.state;
        }

        if let Err(e) = self.step(pb, runner) {
            self.handle_error(pb, e);
        }
        self.state
    }

    #[cfg(test)]
    fn injected_failure(&mut self) -> Option<Error> {
        if self.fail_at != Some(self.state) {
            return None;
        }
        self.fail_at = None;
        Some(Error::IoError(format!("injected failure in {}", self.state)))
    }

    #[cfg(not(test))]
    fn injected_failure(&mut self) -> Option<Error> {
        None
    }

    fn handle_error(&mut self, pb: &mut PackageBase, error: Error) {
        if self.state.is_unwinding() {
            warn!("Error while unwinding ({}): {}", self.state, error);
            return;
        }

        let message = error.to_string();
        if self.message.is_none() {
            self.message = Some(message.clone());
        }
        self.active_trigger = None;

        if self.past_no_return {
            warn!("Unpack failed in {} past the point of no return: {}", self.state, message);
            if let Err(e) = pb.current.commit() {
                warn!("Failed to record status after failure: {}", e);
            }
            self.autodir.finish();
            self.state = UnpackState::Fail;
        } else {
            warn!("Unpack failed in {}: {}; unwinding", self.state, message);
            self.transition(UnpackState::UnwindCreateEmptyDirs);
        }
    }

    fn transition(&mut self, next: UnpackState) {
        info!("Unpack: {} -> {}", self.state, next);
        self.queue = match next {
            UnpackState::PreUnpack
            | UnpackState::RunPreInstallTriggers
            | UnpackState::PostUnpack
            | UnpackState::UnwindPreUnpack => self.to_unpack.iter().cloned().collect(),
            UnpackState::PreRemove
            | UnpackState::CopyPostRemove
            | UnpackState::RunPreRemoveTriggers
            | UnpackState::PostRemove
            | UnpackState::UnwindPreRemove => self.to_remove.iter().cloned().collect(),
            UnpackState::UnwindPreInstallTriggers => {
                self.pre_install_run.iter().rev().cloned().collect()
            }
            UnpackState::UnwindPreRemoveTriggers => {
                self.pre_remove_run.iter().rev().cloned().collect()
            }
            _ => VecDeque::new(),
        };
        if next == UnpackState::PostRemove {
            self.past_no_return = true;
        }
        self.state = next;
    }

    fn step(&mut self, pb: &mut PackageBase, runner: &mut dyn TriggerRunner) -> Result<()> {
        match self.state {
            UnpackState::PreUnpack => match self.queue.pop_front() {
                Some(name) => self.pre_unpack(pb, &name)?,
                None => self.transition(UnpackState::PreRemove),
            },
            UnpackState::PreRemove => match self.queue.pop_front() {
                Some(name) => self.pre_remove(pb, &name)?,
                None => {
                    self.check(pb)?;
                    self.transition(UnpackState::CopyPostRemove);
                }
            },
            UnpackState::CopyPostRemove => match self.queue.pop_front() {
                Some(name) => self.copy_post_remove(pb, &name)?,
                None => self.transition(UnpackState::RunPreRemoveTriggers),
            },
            UnpackState::RunPreRemoveTriggers => {
                if self.drive_trigger(pb, runner, TriggerPoint::PreRemove)? {
                    self.transition(UnpackState::RemoveFilesReplacedByDirs);
                }
            }
            UnpackState::RemoveFilesReplacedByDirs => match self.files_replaced_by_dirs.pop_first() {
                Some(object) => self.evacuate(object)?,
                None => self.transition(UnpackState::Unpack),
            },
            UnpackState::Unpack => {
                if !self.metadata_staged {
                    self.stage_metadata(pb)?;
                } else {
                    match self.files_to_unpack.pop_first() {
                        Some(object) => self.unpack(object)?,
                        None => self.transition(UnpackState::RunPreInstallTriggers),
                    }
                }
            }
            UnpackState::RunPreInstallTriggers => {
                if self.drive_trigger(pb, runner, TriggerPoint::PreInstall)? {
                    self.transition(UnpackState::Replace);
                }
            }
            UnpackState::Replace => match self.files_being_unpacked.pop_first() {
                Some(object) => self.replace(object)?,
                None => {
                    self.resolve_empty_dirs();
                    self.transition(UnpackState::Remove);
                }
            },
            UnpackState::Remove => self.remove()?,
            UnpackState::PostRemove => self.post_remove(pb)?,
            UnpackState::CreateEmptyDirs => match self.empty_dirs_to_create.pop_first() {
                Some(dir) => {
                    fs::create_dir_all(&dir.dest).map_err(|e| {
                        Error::IoError(format!("Failed to create {}: {}", dir.dest.display(), e))
                    })?;
                    debug!("Created empty directory {}", dir.dest.display());
                    self.empty_dirs_created.insert(dir);
                }
                None => self.transition(UnpackState::PostUnpack),
            },
            UnpackState::PostUnpack => match self.queue.pop_front() {
                Some(name) => self.post_unpack(pb, &name)?,
                None => {
                    pb.current.commit()?;
                    self.autodir.finish();
                    info!("Unpack complete: {} files, {} bytes", self.files_done, self.bytes_done);
                    self.transition(UnpackState::Done);
                }
            },
            UnpackState::UnwindCreateEmptyDirs => match self.empty_dirs_created.pop_last() {
                Some(dir) => {
                    let result = if filesystem::is_empty_dir(&dir.dest) {
                        fs::remove_dir(&dir.dest).map_err(Error::from)
                    } else {
                        Ok(())
                    };
                    self.empty_dirs_to_create.insert(dir);
                    result?;
                }
                None => self.transition(UnpackState::UnwindReplace),
            },
            UnpackState::UnwindReplace => match self.files_unpacked.pop_last() {
                Some(object) => self.unwind_replace(object)?,
                None => self.transition(UnpackState::UnwindRemove),
            },
            UnpackState::UnwindRemove => self.unwind_remove()?,
            UnpackState::UnwindPreInstallTriggers => {
                if self.drive_abort(pb, runner, TriggerPoint::AbortPreInstall) {
                    self.pre_install_run.clear();
                    self.transition(UnpackState::UnwindUnpack);
                }
            }
            UnpackState::UnwindUnpack => self.unwind_unpack(pb)?,
            UnpackState::UnwindRemoveFilesReplacedByDirs => {
                match self.files_being_replaced_by_dirs.pop_last() {
                    Some(object) => self.unwind_evacuate(object)?,
                    None => self.transition(UnpackState::UnwindPreRemoveTriggers),
                }
            }
            UnpackState::UnwindPreRemoveTriggers => {
                if self.drive_abort(pb, runner, TriggerPoint::AbortPreRemove) {
                    self.pre_remove_run.clear();
                    self.transition(UnpackState::UnwindCopyPostRemove);
                }
            }
            UnpackState::UnwindCopyPostRemove => match self.post_remove_copies.pop_first() {
                Some((name, copy)) => {
                    debug!("Deleting saved post-remove script of {}", name);
                    filesystem::remove_file_if_exists(&copy)?;
                    if let Some(parent) = copy.parent() {
                        filesystem::remove_dir_if_empty(parent);
                    }
                }
                None => self.transition(UnpackState::UnwindPreRemove),
            },
            UnpackState::UnwindPreRemove => match self.queue.pop_front() {
                Some(name) => self.restore_status(pb, &name),
                None => {
                    self.files_total -= std::mem::take(&mut self.removal_files);
                    self.bytes_total -= std::mem::take(&mut self.removal_bytes);
                    self.transition(UnpackState::UnwindPreUnpack);
                }
            },
            UnpackState::UnwindPreUnpack => match self.queue.pop_front() {
                Some(name) => {
                    self.restore_status(pb, &name);
                    if let Some(incoming) = self.incoming.remove(&name) {
                        self.files_total -= incoming.files;
                        self.bytes_total -= incoming.bytes;
                    }
                    self.progress.remove(&name);
                    self.files_to_unpack.clear();
                }
                None => self.finish_unwind(pb),
            },
            UnpackState::Done | UnpackState::Fail => {}
        }
        Ok(())
    }

    // ---- forward steps ----

    fn pre_unpack(&mut self, pb: &mut PackageBase, name: &str) -> Result<()> {
        let current = pb.current.get(name);
        let selected = pb.selected.get(name);
        self.original_status
            .entry(name.to_string())
            .or_insert_with(|| current.clone());
        pb.current.insert(
            name,
            Status {
                state: State::HalfUnpacked,
                flags: current.flags.clone(),
                version: selected.version.clone(),
                environment_id: selected.environment_id.clone(),
            },
        );

        let mut archive = packages::archive::open(&pb.archive_path(name, &selected.version))?;
        let control = archive.control()?;
        if !control.package.eq_ignore_ascii_case(name) {
            return Err(Error::ParseError(format!(
                "Archive for {} contains package {}",
                name, control.package
            )));
        }

        if !control.standards_supported() || !pb.environments.is_compatible(&control) {
            warn!(
                "Cannot process {} {} (standards {:?}, environment {:?})",
                name, control.version, control.standards_version, control.environment
            );
            self.cannot_process.insert(name.to_string());
            return Ok(());
        }

        let mut manifest = build_manifest(archive.entries());
        let mut control_text = control.raw().to_string();
        if let Some((module_file, resident)) = module_shortcut(pb, &control, archive.entries()) {
            info!(
                "{}: module {} already resident at version {}; skipping unpack",
                name, module_file, resident
            );
            manifest.remove(&module_file);
            control_text = control.with_field(MODULE_RESIDENT_FIELD, &resident);
        }

        let sizes: HashMap<&str, u64> = archive
            .entries()
            .iter()
            .map(|e| (e.path.as_str(), e.size))
            .collect();

        let mut files = 0;
        let mut bytes = 0;
        for entry in manifest.iter() {
            let is_dir = entry.ends_with('/');
            let logical = entry.trim_end_matches('/');
            let dest = pb.paths.resolve(logical, name)?;
            let object = if is_dir {
                DestObject::dir(name, logical, dest.clone())
            } else {
                DestObject::file(name, logical, dest.clone(), sizes.get(logical).copied().unwrap_or(0))
            };

            if let Some(other) = self.files_to_unpack.get(&dest) {
                if !(other.is_dir && is_dir) {
                    debug!("{} claimed by both {} and {}", dest.display(), other.package, name);
                    self.files_that_conflict.insert(object);
                }
                continue;
            }

            if filesystem::exists(&dest) && !(is_dir && filesystem::is_dir(&dest)) {
                debug!("{} already exists", dest.display());
                self.files_that_conflict.insert(object.clone());
            }

            let components: Vec<&str> = logical.split('/').collect();
            for depth in 1..components.len() {
                let prefix = components[..depth].join("/");
                let Ok(parent) = pb.paths.resolve(&prefix, name) else {
                    continue;
                };
                if filesystem::exists(&parent) && !filesystem::is_dir(&parent) {
                    self.parent_conflicts
                        .insert(DestObject::file(name, &prefix, parent, 0));
                }
            }

            if !is_dir {
                files += 1;
                bytes += object.size;
            }
            self.files_to_unpack.insert(object);
        }

        self.files_total += files;
        self.bytes_total += bytes;
        self.progress.insert(
            name.to_string(),
            ProgressItem {
                done: 0,
                total: Some(bytes),
                estimate: control.installed_size,
            },
        );
        self.incoming.insert(
            name.to_string(),
            Incoming {
                archive,
                control,
                control_text,
                manifest,
                files,
                bytes,
            },
        );
        Ok(())
    }

    fn pre_remove(&mut self, pb: &mut PackageBase, name: &str) -> Result<()> {
        let current = pb.current.get(name);
        self.original_status
            .entry(name.to_string())
            .or_insert_with(|| current.clone());
        if current.state != State::HalfUnpacked {
            pb.current.insert(name, current.with_state(State::HalfUnpacked));
        }

        let manifest = pb.manifest(name)?.unwrap_or_default();
        for entry in manifest.iter() {
            let is_dir = entry.ends_with('/');
            let logical = entry.trim_end_matches('/');
            let dest = match pb.paths.resolve(logical, name) {
                Ok(dest) => dest,
                Err(e) => {
                    warn!("Skipping {} of {}: {}", logical, name, e);
                    continue;
                }
            };

            if is_dir {
                if filesystem::is_dir(&dest) {
                    self.files_that_conflict.remove(&dest);
                    self.dirs_to_remove.insert(DestObject::dir(name, logical, dest));
                }
            } else if filesystem::exists(&dest) {
                let size = fs::symlink_metadata(&dest).map(|m| m.len()).unwrap_or(0);
                self.files_that_conflict.remove(&dest);
                self.files_to_remove
                    .insert(DestObject::file(name, logical, dest, size));
            }
        }

        debug!("{}: {} manifest entries to remove", name, manifest.len());
        self.outgoing.insert(name.to_string(), Outgoing { manifest });
        Ok(())
    }

    /// First point of no return: nothing on disk has changed yet
    fn check(&mut self, pb: &mut PackageBase) -> Result<()> {
        while let Some(parent) = self.parent_conflicts.pop_first() {
            match self.files_to_remove.remove(&parent.dest) {
                Some(object) => {
                    debug!("{} will be replaced by a directory", object.dest.display());
                    self.files_replaced_by_dirs.insert(object);
                }
                None => {
                    self.files_that_conflict.insert(parent);
                }
            }
        }

        if !self.cannot_process.is_empty() {
            return Err(Error::CannotProcess(self.packages_cannot_process()));
        }
        if !self.files_that_conflict.is_empty() {
            return Err(Error::FileConflict(self.files_that_conflict()));
        }

        for object in self.files_to_remove.iter().chain(self.files_replaced_by_dirs.iter()) {
            self.removal_files += 1;
            self.removal_bytes += object.size;
        }
        self.files_total += self.removal_files;
        self.bytes_total += self.removal_bytes;

        pb.current.commit()?;
        self.status_committed = true;
        info!(
            "No conflicts: {} files ({} bytes) to unpack, {} ({} bytes) to remove",
            self.files_total - self.removal_files,
            self.bytes_total - self.removal_bytes,
            self.removal_files,
            self.removal_bytes
        );
        Ok(())
    }

    fn copy_post_remove(&mut self, pb: &PackageBase, name: &str) -> Result<()> {
        let logical = TriggerPoint::PostRemove.script_logical();
        if !self
            .outgoing
            .get(name)
            .is_some_and(|o| o.manifest.contains(&logical))
        {
            return Ok(());
        }

        let script = pb.paths.resolve(&logical, name)?;
        if !filesystem::exists(&script) {
            return Ok(());
        }

        let copy = pb.layout().post_remove_copy(name);
        if let Some(parent) = copy.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::IoError(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        fs::copy(&script, &copy).map_err(|e| {
            Error::IoError(format!(
                "Failed to save post-remove script {}: {}",
                script.display(),
                e
            ))
        })?;

        debug!("Saved post-remove script of {} to {}", name, copy.display());
        self.post_remove_copies.insert(name.to_string(), copy);
        Ok(())
    }

    fn evacuate(&mut self, object: DestObject) -> Result<()> {
        let backup = filesystem::backup_path(&object.dest);
        let result = self
            .autodir
            .visit(&backup)
            .and_then(|_| filesystem::move_path(&object.dest, &backup));
        match result {
            Ok(()) => {
                debug!("Moved {} aside for a directory", object.dest.display());
                self.count_done(&object);
                self.files_being_replaced_by_dirs.insert(object);
                Ok(())
            }
            Err(e) => {
                self.files_replaced_by_dirs.insert(object);
                Err(e)
            }
        }
    }

    fn stage_metadata(&mut self, pb: &PackageBase) -> Result<()> {
        self.metadata_staged = true;
        for (name, incoming) in &self.incoming {
            pb.metadata.stage_manifest(name, &incoming.manifest)?;
            pb.metadata.stage_control(name, &incoming.control_text)?;
        }
        Ok(())
    }

    fn unpack(&mut self, object: DestObject) -> Result<()> {
        if object.is_dir {
            self.empty_dirs_to_create.insert(object);
            return Ok(());
        }

        let staging = filesystem::staging_path(&object.dest);
        let result = self.extract(&object, &staging);
        match result {
            Ok(()) => {
                self.count_done(&object);
                if let Some(item) = self.progress.get_mut(&object.package) {
                    item.done += object.size;
                }
                debug!("Staged {}", staging.display());
                self.files_being_unpacked.insert(object);
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = filesystem::remove_file_if_exists(&staging) {
                    warn!("Failed to delete {}: {}", staging.display(), cleanup);
                }
                self.autodir.release(&staging);
                self.files_to_unpack.insert(object);
                Err(e)
            }
        }
    }

    fn extract(&mut self, object: &DestObject, staging: &Path) -> Result<()> {
        self.autodir.visit(staging)?;
        let incoming = self.incoming.get_mut(&object.package).ok_or_else(|| {
            Error::NotFoundError(format!("No archive open for {}", object.package))
        })?;
        incoming
            .archive
            .extract(&object.logical, staging)
            .map_err(|e| match e {
                Error::FileInfoNotFound { path, .. } => Error::FileInfoNotFound {
                    package: object.package.clone(),
                    path,
                },
                other => other,
            })?;
        Ok(())
    }

    fn replace(&mut self, object: DestObject) -> Result<()> {
        if filesystem::exists(&object.dest) {
            if let Some(old) = self.files_to_remove.remove(&object.dest) {
                let backup = filesystem::backup_path(&old.dest);
                let result = self
                    .autodir
                    .visit(&backup)
                    .and_then(|_| filesystem::move_path(&old.dest, &backup));
                if let Err(e) = result {
                    self.files_to_remove.insert(old);
                    self.files_being_unpacked.insert(object);
                    return Err(e);
                }
                debug!("Backed up {}", old.dest.display());
                self.count_done(&old);
                self.files_being_removed.insert(old);
            } else if let Some(dir) = self.dirs_to_remove.remove(&object.dest) {
                if let Err(e) = fs::remove_dir(&dir.dest) {
                    self.dirs_to_remove.insert(dir);
                    self.files_being_unpacked.insert(object);
                    return Err(e.into());
                }
                debug!("Removed directory {} to make way for a file", dir.dest.display());
                self.dirs_being_removed.insert(dir);
            } else {
                let dest = object.dest.clone();
                self.files_being_unpacked.insert(object);
                return Err(Error::FileConflict(vec![dest]));
            }
        }

        let staging = filesystem::staging_path(&object.dest);
        let result = self
            .autodir
            .visit(&object.dest)
            .and_then(|_| filesystem::move_path(&staging, &object.dest));
        match result {
            Ok(()) => {
                debug!("Placed {}", object.dest.display());
                self.autodir.release(&staging);
                self.files_unpacked.insert(object);
                Ok(())
            }
            Err(e) => {
                self.files_being_unpacked.insert(object);
                Err(e)
            }
        }
    }

    /// Drop empty directories that already exist or survive a removal
    fn resolve_empty_dirs(&mut self) {
        let mut pending = Vec::new();
        while let Some(dir) = self.empty_dirs_to_create.pop_first() {
            pending.push(dir);
        }
        for dir in pending {
            if self.dirs_to_remove.remove(&dir.dest).is_some() {
                debug!("Keeping {} for its new owner", dir.dest.display());
            } else if !filesystem::is_dir(&dir.dest) {
                self.empty_dirs_to_create.insert(dir);
            }
        }
    }

    fn remove(&mut self) -> Result<()> {
        if let Some(object) = self.files_to_remove.pop_first() {
            let backup = filesystem::backup_path(&object.dest);
            let result = self
                .autodir
                .visit(&backup)
                .and_then(|_| filesystem::move_path(&object.dest, &backup));
            return match result {
                Ok(()) => {
                    debug!("Backed up {} for removal", object.dest.display());
                    self.count_done(&object);
                    self.files_being_removed.insert(object);
                    Ok(())
                }
                Err(e) => {
                    self.files_to_remove.insert(object);
                    Err(e)
                }
            };
        }

        if let Some(dir) = self.dirs_to_remove.pop_last() {
            if filesystem::is_empty_dir(&dir.dest) {
                if let Err(e) = fs::remove_dir(&dir.dest) {
                    self.dirs_to_remove.insert(dir);
                    return Err(e.into());
                }
                self.autodir.release(&dir.dest);
                self.dirs_being_removed.insert(dir);
            } else {
                debug!("Keeping non-empty directory {}", dir.dest.display());
            }
            return Ok(());
        }

        self.transition(UnpackState::PostRemove);
        Ok(())
    }

    /// Second point of no return: backups are deleted for good
    fn post_remove(&mut self, pb: &mut PackageBase) -> Result<()> {
        let next = self
            .files_being_removed
            .pop_first()
            .or_else(|| self.files_being_replaced_by_dirs.pop_first());
        if let Some(object) = next {
            let backup = filesystem::backup_path(&object.dest);
            filesystem::remove_file_if_exists(&backup).map_err(|e| {
                Error::IoError(format!("Failed to delete {}: {}", backup.display(), e))
            })?;
            self.autodir.release(&backup);
            self.files_removed.insert(object);
            return Ok(());
        }

        while let Some(dir) = self.dirs_being_removed.pop_first() {
            self.dirs_removed.insert(dir);
        }

        match self.queue.pop_front() {
            Some(name) => {
                if !self.to_unpack.contains(&name) {
                    let current = pb.current.get(&name);
                    pb.current.insert(&name, current.with_state(State::Removed));
                    pb.metadata.remove_manifest(&name)?;
                    pb.metadata.remove_control(&name)?;
                    info!("Removed {} {}", name, current.version);
                }
            }
            None => {
                pb.current.commit()?;
                info!("Removed {} files", self.files_removed.len());
                self.transition(UnpackState::CreateEmptyDirs);
            }
        }
        Ok(())
    }

    fn post_unpack(&mut self, pb: &mut PackageBase, name: &str) -> Result<()> {
        pb.metadata.activate_manifest(name)?;
        pb.metadata.activate_control(name)?;
        let current = pb.current.get(name);
        pb.current.insert(name, current.with_state(State::Unpacked));
        info!("Unpacked {} {}", name, current.version);
        Ok(())
    }

    // ---- unwind steps ----

    fn unwind_replace(&mut self, object: DestObject) -> Result<()> {
        let staging = filesystem::staging_path(&object.dest);
        let result = self
            .autodir
            .visit(&staging)
            .and_then(|_| filesystem::move_path(&object.dest, &staging));
        self.autodir.release(&object.dest);
        self.files_being_unpacked.insert(object);
        result
    }

    fn unwind_remove(&mut self) -> Result<()> {
        if let Some(object) = self.files_being_removed.pop_last() {
            let backup = filesystem::backup_path(&object.dest);
            let result = self
                .autodir
                .visit(&object.dest)
                .and_then(|_| filesystem::move_path(&backup, &object.dest));
            self.autodir.release(&backup);
            debug!("Restored {}", object.dest.display());
            self.count_undone(&object);
            self.files_to_remove.insert(object);
            return result;
        }

        if let Some(dir) = self.dirs_being_removed.pop_last() {
            let result = fs::create_dir_all(&dir.dest).map_err(|e| {
                Error::IoError(format!("Failed to restore {}: {}", dir.dest.display(), e))
            });
            self.dirs_to_remove.insert(dir);
            return result;
        }

        self.transition(UnpackState::UnwindPreInstallTriggers);
        Ok(())
    }

    fn unwind_unpack(&mut self, pb: &PackageBase) -> Result<()> {
        if let Some(object) = self.files_being_unpacked.pop_last() {
            let staging = filesystem::staging_path(&object.dest);
            let result = filesystem::remove_file_if_exists(&staging).map_err(|e| {
                Error::IoError(format!("Failed to delete {}: {}", staging.display(), e))
            });
            self.autodir.release(&staging);
            self.count_undone(&object);
            if let Some(item) = self.progress.get_mut(&object.package) {
                item.done = item.done.saturating_sub(object.size);
            }
            self.files_to_unpack.insert(object);
            return result;
        }

        if self.metadata_staged {
            self.metadata_staged = false;
            for name in self.incoming.keys() {
                if let Err(e) = pb.metadata.discard_manifest(name) {
                    warn!("Failed to discard staged manifest of {}: {}", name, e);
                }
                if let Err(e) = pb.metadata.discard_control(name) {
                    warn!("Failed to discard staged control of {}: {}", name, e);
                }
            }
            return Ok(());
        }

        self.autodir.finish();
        self.transition(UnpackState::UnwindRemoveFilesReplacedByDirs);
        Ok(())
    }

    fn unwind_evacuate(&mut self, object: DestObject) -> Result<()> {
        // The directory that took the file's place must be gone first
        self.autodir.finish();
        if filesystem::is_dir(&object.dest) {
            filesystem::remove_dir_if_empty(&object.dest);
        }

        let backup = filesystem::backup_path(&object.dest);
        let result = self
            .autodir
            .visit(&object.dest)
            .and_then(|_| filesystem::move_path(&backup, &object.dest));
        self.autodir.release(&backup);
        self.count_undone(&object);
        self.files_replaced_by_dirs.insert(object);
        result
    }

    fn count_done(&mut self, object: &DestObject) {
        self.files_done += 1;
        self.bytes_done += object.size;
    }

    fn count_undone(&mut self, object: &DestObject) {
        self.files_done = self.files_done.saturating_sub(1);
        self.bytes_done = self.bytes_done.saturating_sub(object.size);
    }

    fn restore_status(&mut self, pb: &mut PackageBase, name: &str) {
        if let Some(original) = self.original_status.get(name) {
            pb.current.insert(name, original.clone());
        }
    }

    fn finish_unwind(&mut self, pb: &mut PackageBase) {
        if self.status_committed {
            if let Err(e) = pb.current.commit() {
                warn!("Failed to record restored status: {}", e);
            }
        }
        self.autodir.finish();
        info!(
            "Unwound: {}",
            self.message.as_deref().unwrap_or("no error recorded")
        );
        self.transition(UnpackState::Fail);
    }

    // ---- triggers ----

    /// Drive one trigger step; `Ok(true)` once every queued package is done
    fn drive_trigger(
        &mut self,
        pb: &PackageBase,
        runner: &mut dyn TriggerRunner,
        point: TriggerPoint,
    ) -> Result<bool> {
        if let Some(mut active) = self.active_trigger.take() {
            match active.handle.poll() {
                TriggerState::Running => {
                    self.active_trigger = Some(active);
                }
                TriggerState::Success => {
                    debug!(
                        "{} trigger of {} succeeded: {}",
                        point,
                        active.trigger.package,
                        active.handle.output().trim()
                    );
                    match point {
                        TriggerPoint::PreRemove => self.pre_remove_run.push(active.trigger.package),
                        TriggerPoint::PreInstall => self.pre_install_run.push(active.trigger.package),
                        _ => {}
                    }
                }
                TriggerState::Error(message) => {
                    let output = active.handle.output().trim();
                    let message = if output.is_empty() {
                        message
                    } else {
                        format!("{}: {}", message, output)
                    };
                    return Err(active.trigger.failed(message));
                }
            }
            return Ok(false);
        }

        let Some(name) = self.queue.pop_front() else {
            return Ok(true);
        };
        let Some(script) = self.trigger_script(pb, &name, point)? else {
            return Ok(false);
        };

        let trigger = self.trigger_for(pb, &name, point);
        let handle = runner.start(&script, &trigger)?;
        self.active_trigger = Some(ActiveTrigger { trigger, handle });
        Ok(false)
    }

    /// Abort triggers only warn on failure; returns true when done
    fn drive_abort(
        &mut self,
        pb: &PackageBase,
        runner: &mut dyn TriggerRunner,
        point: TriggerPoint,
    ) -> bool {
        match self.drive_trigger(pb, runner, point) {
            Ok(done) => done,
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    fn trigger_script(
        &self,
        pb: &PackageBase,
        name: &str,
        point: TriggerPoint,
    ) -> Result<Option<PathBuf>> {
        let logical = point.script_logical();
        let incoming = matches!(point, TriggerPoint::PreInstall | TriggerPoint::AbortPreInstall);
        let shipped = if incoming {
            self.incoming
                .get(name)
                .is_some_and(|i| i.manifest.contains(&logical))
        } else {
            self.outgoing
                .get(name)
                .is_some_and(|o| o.manifest.contains(&logical))
        };
        if !shipped {
            return Ok(None);
        }

        let dest = pb.paths.resolve(&logical, name)?;
        let script = if incoming {
            filesystem::staging_path(&dest)
        } else {
            dest
        };
        Ok(filesystem::exists(&script).then_some(script))
    }

    fn trigger_for(&self, pb: &PackageBase, name: &str, point: TriggerPoint) -> Trigger {
        let old_version = self
            .original_status
            .get(name)
            .filter(|s| s.state > State::Removed)
            .map(|s| s.version.clone());
        let new_version = self
            .to_unpack
            .contains(name)
            .then(|| pb.selected.get(name).version);

        let mut trigger =
            Trigger::new(name, point).versions(old_version.as_deref(), new_version.as_deref());

        let components = match self.incoming.get(name) {
            Some(incoming) => incoming.control.components(),
            None => pb
                .control(name)
                .ok()
                .flatten()
                .map(|c| c.components())
                .unwrap_or_default(),
        };
        trigger.paths = components
            .iter()
            .filter_map(|c| pb.paths.resolve(&c.logical, name).ok())
            .collect();
        trigger
    }
}

/// Manifest of an archive: every file, plus directories with no children
fn build_manifest(entries: &[ArchiveEntry]) -> Manifest {
    let mut parents = HashSet::new();
    for entry in entries {
        let mut path = entry.path.as_str();
        while let Some((head, _)) = path.rsplit_once('/') {
            parents.insert(head.to_string());
            path = head;
        }
    }

    let mut manifest = Manifest::new();
    for entry in entries {
        match entry.kind {
            EntryKind::File => manifest.insert_file(&entry.path),
            EntryKind::Directory if !parents.contains(&entry.path) => {
                manifest.insert_empty_dir(&entry.path)
            }
            EntryKind::Directory => {}
        }
    }
    manifest
}

/// Module file and resident version, if the package's only payload is a
/// system module already resident at the same or a newer version
fn module_shortcut(
    pb: &PackageBase,
    control: &Control,
    entries: &[ArchiveEntry],
) -> Option<(String, String)> {
    let mut payload = entries
        .iter()
        .filter(|e| e.kind == EntryKind::File && !e.is_metadata());
    let only = payload.next()?;
    if payload.next().is_some() {
        return None;
    }

    let module = environment::module_name(&only.path)?;
    let wanted = control
        .module_version
        .clone()
        .unwrap_or_else(|| version::upstream(&control.version).to_string());
    if !pb.modules.satisfies(module, &wanted) {
        return None;
    }

    let resident = pb.modules.resident_version(module)?.to_string();
    Some((only.path.clone(), resident))
}
