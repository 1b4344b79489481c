// src/commit.rs

//! Commit orchestrator
//!
//! A [`Commit`] drives one install/remove session from the selected status
//! table to reality: component path moves, downloads, the unpack engine,
//! configuration, purging, host integration and the remaining triggers.
//! Like the unpack engine it is polled; each [`Commit::poll`] does one
//! bounded unit of work and never blocks on the network or a script.
//!
//! Until the unpack engine passes its point of no return, a failure puts
//! everything back: `current` is restored from the `previous` snapshot
//! taken when the commit started, and component moves are reversed. After
//! that point failures are recorded and the session stops, but nothing that
//! already happened on disk is undone.

use crate::db::models::{AvailablePackage, Changeset, ChangesetStatus, ComponentUpdate};
use crate::error::{Error, Result};
use crate::filesystem;
use crate::integration::{Registration, SystemIntegration};
use crate::packages::ComponentOption;
use crate::paths::PathResolver;
use crate::pkgbase::PackageBase;
use crate::progress::{self, ProgressItem};
use crate::repository::{self, Download, DownloadState, Downloader};
use crate::status::{self, State, Status, Subscription, TableEvent};
use crate::triggers::{Trigger, TriggerHandle, TriggerPoint, TriggerRunner, TriggerState};
use crate::unpack::{UnpackEngine, UnpackState};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitState {
    Paths,
    PreDownload,
    Download,
    Unpack,
    Configure,
    Purge,
    UpdateSysvars,
    UpdateSprites,
    UpdateBootOptions,
    BootFiles,
    RunFiles,
    AddFilesToApps,
    PostRemoveTriggers,
    PostInstallTriggers,
    CleanupTriggers,
    Done,
    Fail,
}

impl CommitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitState::Paths => "paths",
            CommitState::PreDownload => "pre_download",
            CommitState::Download => "download",
            CommitState::Unpack => "unpack",
            CommitState::Configure => "configure",
            CommitState::Purge => "purge",
            CommitState::UpdateSysvars => "update_sysvars",
            CommitState::UpdateSprites => "update_sprites",
            CommitState::UpdateBootOptions => "update_boot_options",
            CommitState::BootFiles => "boot_files",
            CommitState::RunFiles => "run_files",
            CommitState::AddFilesToApps => "add_files_to_apps",
            CommitState::PostRemoveTriggers => "post_remove_triggers",
            CommitState::PostInstallTriggers => "post_install_triggers",
            CommitState::CleanupTriggers => "cleanup_triggers",
            CommitState::Done => "done",
            CommitState::Fail => "fail",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CommitState::Done | CommitState::Fail)
    }
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External collaborators a commit drives
pub struct Services<'a> {
    pub downloader: &'a mut dyn Downloader,
    pub triggers: &'a mut dyn TriggerRunner,
    pub integration: &'a mut dyn SystemIntegration,
}

/// A component directory moved by the `paths` step
struct ComponentMove {
    logical: String,
    old_mapping: Option<String>,
    from: PathBuf,
    to: PathBuf,
    moved: bool,
}

struct ActiveDownload {
    package: AvailablePackage,
    dest: PathBuf,
    handle: Box<dyn Download>,
}

struct ActiveTrigger {
    trigger: Trigger,
    handle: Box<dyn TriggerHandle>,
    /// Saved script to delete once the trigger is over
    copy: Option<PathBuf>,
}

pub struct Commit {
    state: CommitState,
    packages: BTreeSet<String>,
    queue: VecDeque<String>,

    changeset: Changeset,
    subscription: Option<Subscription>,
    changed: BTreeSet<String>,

    pending_updates: VecDeque<ComponentUpdate>,
    component_moves: Vec<ComponentMove>,

    to_download: VecDeque<AvailablePackage>,
    download: Option<ActiveDownload>,
    download_progress: BTreeMap<String, ProgressItem>,

    engine: Option<UnpackEngine>,
    past_no_return: bool,
    items: Vec<ProgressItem>,
    files_done: u64,
    files_total: u64,
    files_that_conflict: Vec<PathBuf>,
    cannot_process: Vec<String>,

    configured: Vec<String>,
    registrations: Vec<Registration>,
    post_remove_copies: BTreeMap<String, PathBuf>,
    trigger: Option<ActiveTrigger>,

    warnings: Vec<String>,
    message: Option<String>,
}

impl Commit {
    /// Start a session: snapshot `current` into `previous` and open a changeset
    pub fn new(pb: &mut PackageBase, description: &str) -> Result<Self> {
        let packages: BTreeSet<String> = pb
            .current
            .names()
            .into_iter()
            .chain(pb.selected.names())
            .collect();

        pb.previous.copy_from(&pb.current);
        pb.previous.commit()?;
        let subscription = pb.current.subscribe();

        let mut changeset = Changeset::new(description.to_string());
        changeset.insert(pb.conn())?;

        let pending_updates: VecDeque<ComponentUpdate> =
            ComponentUpdate::list_all(pb.conn())?.into_iter().collect();

        info!(
            "Commit started: {} packages, {} component updates",
            packages.len(),
            pending_updates.len()
        );

        Ok(Self {
            state: CommitState::Paths,
            packages,
            queue: VecDeque::new(),
            changeset,
            subscription: Some(subscription),
            changed: BTreeSet::new(),
            pending_updates,
            component_moves: Vec::new(),
            to_download: VecDeque::new(),
            download: None,
            download_progress: BTreeMap::new(),
            engine: None,
            past_no_return: false,
            items: Vec::new(),
            files_done: 0,
            files_total: 0,
            files_that_conflict: Vec::new(),
            cannot_process: Vec::new(),
            configured: Vec::new(),
            registrations: Vec::new(),
            post_remove_copies: BTreeMap::new(),
            trigger: None,
            warnings: Vec::new(),
            message: None,
        })
    }

    pub fn state(&self) -> CommitState {
        self.state
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Non-fatal problems met after the point of no return
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn files_that_conflict(&self) -> &[PathBuf] {
        &self.files_that_conflict
    }

    pub fn packages_cannot_process(&self) -> &[String] {
        &self.cannot_process
    }

    /// Packages whose current status changed during the commit
    pub fn changed_packages(&self) -> &BTreeSet<String> {
        &self.changed
    }

    pub fn changeset_id(&self) -> Option<i64> {
        self.changeset.id
    }

    pub fn files_done(&self) -> u64 {
        self.files_done
    }

    pub fn files_total(&self) -> u64 {
        self.files_total
    }

    /// Bytes transferred or unpacked in the current phase
    pub fn bytes_done(&self) -> u64 {
        progress::total_done(&self.items)
    }

    /// Estimated byte total of the current phase, if any size is known
    pub fn bytes_total(&self) -> Option<u64> {
        progress::estimate_total(&self.items)
    }

    /// Package being downloaded, if any
    pub fn downloading(&self) -> Option<&str> {
        self.download.as_ref().map(|d| d.package.name.as_str())
    }

    /// Advance by one unit of work and return the new state
    pub fn poll(&mut self, pb: &mut PackageBase, services: &mut Services<'_>) -> CommitState {
        if self.state.is_terminal() {
            return self.state;
        }

        if let Err(e) = self.step(pb, services) {
            self.fail(pb, services, e.to_string());
        }
        self.collect_changes();
        if self.state == CommitState::Done {
            self.finish(pb, ChangesetStatus::Applied);
        }
        self.state
    }

    fn transition(&mut self, next: CommitState) {
        info!("Commit: {} -> {}", self.state, next);
        self.queue = match next {
            CommitState::PreDownload | CommitState::Configure | CommitState::Purge => {
                self.packages.iter().cloned().collect()
            }
            CommitState::PostInstallTriggers => self.configured.iter().cloned().collect(),
            _ => VecDeque::new(),
        };
        self.state = next;
    }

    fn step(&mut self, pb: &mut PackageBase, services: &mut Services<'_>) -> Result<()> {
        match self.state {
            CommitState::Paths => self.paths(pb)?,
            CommitState::PreDownload => match self.queue.pop_front() {
                Some(name) => self.pre_download(pb, &name)?,
                None => {
                    self.items = self.download_progress.values().copied().collect();
                    self.transition(CommitState::Download);
                }
            },
            CommitState::Download => self.download(pb, services)?,
            CommitState::Unpack => self.unpack(pb, services)?,
            CommitState::Configure => match self.queue.pop_front() {
                Some(name) => self.configure(pb, &name),
                None => {
                    pb.current.commit()?;
                    self.transition(CommitState::Purge);
                }
            },
            CommitState::Purge => match self.queue.pop_front() {
                Some(name) => self.purge(pb, &name)?,
                None => {
                    pb.current.commit()?;
                    self.collect_changes();
                    if self.changed.is_empty() && self.component_moves.is_empty() {
                        debug!("Nothing changed; skipping host integration");
                        self.transition(CommitState::PostRemoveTriggers);
                    } else {
                        self.transition(CommitState::UpdateSysvars);
                    }
                }
            },
            CommitState::UpdateSysvars => {
                if let Err(e) = services.integration.update_sysvars(pb) {
                    self.warn(format!("Failed to update system variables: {}", e));
                }
                self.transition(CommitState::UpdateSprites);
            }
            CommitState::UpdateSprites => {
                if let Err(e) = services.integration.update_sprites(pb) {
                    self.warn(format!("Failed to update sprite pool: {}", e));
                }
                self.transition(CommitState::UpdateBootOptions);
            }
            CommitState::UpdateBootOptions => {
                match services.integration.update_boot_options(pb) {
                    Ok(registrations) => self.registrations = registrations,
                    Err(e) => self.warn(format!("Failed to update boot options: {}", e)),
                }
                self.transition(CommitState::BootFiles);
            }
            CommitState::BootFiles => {
                self.register_next(services, ComponentOption::LookAt, CommitState::RunFiles)
            }
            CommitState::RunFiles => {
                self.register_next(services, ComponentOption::Run, CommitState::AddFilesToApps)
            }
            CommitState::AddFilesToApps => self.register_next(
                services,
                ComponentOption::AddToApps,
                CommitState::PostRemoveTriggers,
            ),
            CommitState::PostRemoveTriggers => {
                if self.drive_trigger() {
                    return Ok(());
                }
                match self.post_remove_copies.pop_first() {
                    Some((name, copy)) => self.start_post_remove(pb, services, name, copy),
                    None => self.transition(CommitState::PostInstallTriggers),
                }
            }
            CommitState::PostInstallTriggers => {
                if self.drive_trigger() {
                    return Ok(());
                }
                match self.queue.pop_front() {
                    Some(name) => self.start_post_install(pb, services, &name),
                    None => self.transition(CommitState::CleanupTriggers),
                }
            }
            CommitState::CleanupTriggers => {
                if let Err(e) = services.triggers.cleanup() {
                    self.warn(format!("Failed to clean up trigger state: {}", e));
                }
                info!("Commit complete");
                self.transition(CommitState::Done);
            }
            CommitState::Done | CommitState::Fail => {}
        }
        Ok(())
    }

    // ---- paths ----

    fn paths(&mut self, pb: &mut PackageBase) -> Result<()> {
        let Some(update) = self.pending_updates.pop_front() else {
            self.transition(CommitState::PreDownload);
            return Ok(());
        };

        let from = pb.paths.resolve(&update.logical, "")?;
        let old_mapping = pb.paths.get(&update.logical).map(str::to_string);
        pb.paths.set(&update.logical, &update.physical);
        let to = pb.paths.resolve(&update.logical, "")?;

        let mut record = ComponentMove {
            logical: update.logical.clone(),
            old_mapping,
            from,
            to,
            moved: false,
        };

        if record.from != record.to && filesystem::exists(&record.from) {
            if filesystem::exists(&record.to) {
                self.component_moves.push(record);
                return Err(Error::ConflictError(format!(
                    "Cannot move {} to {}: destination exists",
                    update.logical, update.physical
                )));
            }
            if let Some(parent) = record.to.parent() {
                fs::create_dir_all(parent)?;
            }
            filesystem::move_path(&record.from, &record.to)?;
            record.moved = true;
            info!(
                "Moved component {} from {} to {}",
                record.logical,
                record.from.display(),
                record.to.display()
            );
        }
        self.component_moves.push(record);
        Ok(())
    }

    fn revert_component_moves(&mut self, pb: &mut PackageBase) {
        while let Some(record) = self.component_moves.pop() {
            if record.moved {
                if let Err(e) = filesystem::move_path(&record.to, &record.from) {
                    warn!("Failed to move {} back: {}", record.logical, e);
                }
            }
            debug!(
                "Reverted component {} (was {:?})",
                record.logical, record.old_mapping
            );
        }
        if let Err(e) = pb.rollback_paths() {
            warn!("Failed to roll back path table: {}", e);
        }
    }

    fn persist_component_moves(&mut self, pb: &mut PackageBase) -> Result<()> {
        if self.component_moves.is_empty() {
            return Ok(());
        }
        pb.commit_paths()?;
        ComponentUpdate::clear(pb.conn())?;
        info!("Recorded {} component moves", self.component_moves.len());
        Ok(())
    }

    // ---- download ----

    fn pre_download(&mut self, pb: &PackageBase, name: &str) -> Result<()> {
        let cur = pb.current.get(name);
        let sel = pb.selected.get(name);
        if !status::unpack_req(&cur, &sel) {
            return Ok(());
        }

        let archive = pb.archive_path(name, &sel.version);
        match pb.available(name, &sel.version, &sel.environment_id)? {
            Some(package) if repository::is_cached(&archive, &package) => {
                debug!("{} {} already cached", name, sel.version);
            }
            Some(package) => {
                self.download_progress.insert(
                    name.to_string(),
                    ProgressItem {
                        done: 0,
                        total: None,
                        estimate: package.size,
                    },
                );
                self.to_download.push_back(package);
            }
            None if archive.is_file() => {
                debug!("{} {} supplied locally", name, sel.version);
            }
            None => {
                return Err(Error::NotFoundError(format!(
                    "No package list entry for {} {}",
                    name, sel.version
                )));
            }
        }
        Ok(())
    }

    fn download(&mut self, pb: &PackageBase, services: &mut Services<'_>) -> Result<()> {
        if let Some(mut active) = self.download.take() {
            let state = active.handle.poll();
            if let Some(item) = self.download_progress.get_mut(&active.package.name) {
                item.done = active.handle.bytes_done();
                item.total = active.handle.bytes_total();
            }
            self.items = self.download_progress.values().copied().collect();

            match state {
                DownloadState::InProgress => {
                    self.download = Some(active);
                }
                DownloadState::Done => {
                    if let Some(expected) = &active.package.sha256 {
                        if let Err(e) = repository::verify_checksum(&active.dest, expected) {
                            let _ = filesystem::remove_file_if_exists(&active.dest);
                            return Err(e);
                        }
                    }
                    info!("Downloaded {} {}", active.package.name, active.package.version);
                }
                DownloadState::Failed(message) => {
                    return Err(Error::DownloadError(format!(
                        "{} {}: {}",
                        active.package.name, active.package.version, message
                    )));
                }
            }
            return Ok(());
        }

        let Some(package) = self.to_download.pop_front() else {
            self.transition(CommitState::Unpack);
            return Ok(());
        };
        let dest = pb.archive_path(&package.name, &package.version);
        let handle = services.downloader.start(&package.url, &dest)?;
        self.download = Some(ActiveDownload {
            package,
            dest,
            handle,
        });
        Ok(())
    }

    // ---- unpack ----

    fn unpack(&mut self, pb: &mut PackageBase, services: &mut Services<'_>) -> Result<()> {
        if self.engine.is_none() {
            let engine = UnpackEngine::new(pb, &self.packages);
            if engine.is_empty() {
                debug!("Nothing to unpack or remove");
                self.persist_component_moves(pb)?;
                self.transition(CommitState::Configure);
                return Ok(());
            }
            self.engine = Some(engine);
        }
        let Some(engine) = self.engine.as_mut() else {
            return Ok(());
        };

        let state = engine.poll(pb, &mut *services.triggers);
        self.items = engine.progress();
        self.files_done = engine.files_done();
        self.files_total = engine.files_total();
        self.past_no_return = engine.past_point_of_no_return();

        match state {
            UnpackState::Done => {
                self.post_remove_copies = engine.post_remove_copies().clone();
                self.engine = None;
                self.persist_component_moves(pb)?;
                self.transition(CommitState::Configure);
            }
            UnpackState::Fail => {
                self.files_that_conflict = engine.files_that_conflict();
                self.cannot_process = engine.packages_cannot_process();
                self.post_remove_copies = engine.post_remove_copies().clone();
                let message = engine
                    .message()
                    .unwrap_or("unpack failed")
                    .to_string();
                self.engine = None;
                return Err(Error::IoError(message));
            }
            _ => {}
        }
        Ok(())
    }

    // ---- status ----

    fn configure(&mut self, pb: &mut PackageBase, name: &str) {
        let cur = pb.current.get(name);
        let sel = pb.selected.get(name);
        if !status::config_req(&cur, &sel)
            || status::unpack_req(&cur, &sel)
            || cur.state < State::Unpacked
        {
            return;
        }

        pb.current.insert(
            name,
            Status {
                state: State::Installed,
                flags: sel.flags.clone(),
                version: cur.version.clone(),
                environment_id: cur.environment_id.clone(),
            },
        );
        info!("Configured {} {}", name, cur.version);
        self.configured.push(name.to_string());
    }

    fn purge(&mut self, pb: &mut PackageBase, name: &str) -> Result<()> {
        let cur = pb.current.get(name);
        let sel = pb.selected.get(name);
        if !status::purge_req(&cur, &sel) || cur.state > State::Removed {
            return Ok(());
        }

        pb.metadata.remove_manifest(name)?;
        pb.metadata.remove_control(name)?;
        pb.current.insert(name, Status::default());
        info!("Purged {}", name);
        Ok(())
    }

    // ---- host integration ----

    fn register_next(
        &mut self,
        services: &mut Services<'_>,
        option: ComponentOption,
        next: CommitState,
    ) {
        let Some(index) = self.registrations.iter().position(|r| r.option == option) else {
            self.transition(next);
            return;
        };
        let registration = self.registrations.remove(index);
        if let Err(e) = services.integration.register(&registration) {
            self.warn(format!(
                "Failed to register {} of {}: {}",
                registration.path.display(),
                registration.package,
                e
            ));
        }
    }

    // ---- triggers ----

    /// Poll the running trigger; true while one is still running
    fn drive_trigger(&mut self) -> bool {
        let Some(mut active) = self.trigger.take() else {
            return false;
        };

        match active.handle.poll() {
            TriggerState::Running => {
                self.trigger = Some(active);
                return true;
            }
            TriggerState::Success => {
                debug!(
                    "{} trigger of {} succeeded",
                    active.trigger.point, active.trigger.package
                );
            }
            TriggerState::Error(message) => {
                let error = active.trigger.failed(message);
                self.warn(error.to_string());
            }
        }

        if let Some(copy) = active.copy.take() {
            self.delete_copy(&copy);
        }
        false
    }

    fn start_post_remove(
        &mut self,
        pb: &PackageBase,
        services: &mut Services<'_>,
        name: String,
        copy: PathBuf,
    ) {
        let trigger = Trigger::new(&name, TriggerPoint::PostRemove)
            .versions(known_version(&pb.previous.get(&name)), known_version(&pb.current.get(&name)));

        match services.triggers.start(&copy, &trigger) {
            Ok(handle) => {
                self.trigger = Some(ActiveTrigger {
                    trigger,
                    handle,
                    copy: Some(copy),
                });
            }
            Err(e) => {
                self.warn(trigger.failed(e.to_string()).to_string());
                self.delete_copy(&copy);
            }
        }
    }

    fn start_post_install(&mut self, pb: &PackageBase, services: &mut Services<'_>, name: &str) {
        let logical = TriggerPoint::PostInstall.script_logical();
        let shipped = pb
            .manifest(name)
            .ok()
            .flatten()
            .is_some_and(|m| m.contains(&logical));
        if !shipped {
            return;
        }
        let script = match pb.paths.resolve(&logical, name) {
            Ok(script) if filesystem::exists(&script) => script,
            _ => return,
        };

        let mut trigger = Trigger::new(name, TriggerPoint::PostInstall)
            .versions(known_version(&pb.previous.get(name)), known_version(&pb.current.get(name)));
        if let Ok(Some(control)) = pb.control(name) {
            trigger.paths = control
                .components()
                .iter()
                .filter_map(|c| pb.paths.resolve(&c.logical, name).ok())
                .collect();
        }

        match services.triggers.start(&script, &trigger) {
            Ok(handle) => {
                self.trigger = Some(ActiveTrigger {
                    trigger,
                    handle,
                    copy: None,
                });
            }
            Err(e) => self.warn(trigger.failed(e.to_string()).to_string()),
        }
    }

    fn delete_copy(&mut self, copy: &Path) {
        if let Err(e) = filesystem::remove_file_if_exists(copy) {
            self.warn(format!("Failed to delete {}: {}", copy.display(), e));
        }
        if let Some(parent) = copy.parent() {
            filesystem::remove_dir_if_empty(parent);
        }
    }

    // ---- termination ----

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }

    fn fail(&mut self, pb: &mut PackageBase, services: &mut Services<'_>, message: String) {
        warn!("Commit failed in {}: {}", self.state, message);
        if self.message.is_none() {
            self.message = Some(message);
        }
        self.download = None;
        self.engine = None;
        self.trigger = None;

        if self.past_no_return {
            if let Err(e) = self.persist_component_moves(pb) {
                warn!("Failed to record component moves: {}", e);
            }
        } else {
            let names: BTreeSet<String> = pb
                .current
                .names()
                .into_iter()
                .chain(pb.previous.names())
                .collect();
            for name in names {
                let previous = pb.previous.get(&name);
                pb.current.insert(&name, previous);
            }
            if let Err(e) = pb.current.commit() {
                warn!("Failed to restore status: {}", e);
            }
            self.revert_component_moves(pb);
        }

        let copies: Vec<PathBuf> = std::mem::take(&mut self.post_remove_copies)
            .into_values()
            .collect();
        for copy in copies {
            self.delete_copy(&copy);
        }
        if let Err(e) = services.triggers.cleanup() {
            warn!("Failed to clean up trigger state: {}", e);
        }

        self.state = CommitState::Fail;
        self.collect_changes();
        self.finish(pb, ChangesetStatus::Failed);
    }

    fn collect_changes(&mut self) {
        if let Some(subscription) = &self.subscription {
            for event in subscription.drain() {
                if let TableEvent::Changed(name) = event {
                    self.changed.insert(name);
                }
            }
        }
    }

    fn finish(&mut self, pb: &mut PackageBase, status: ChangesetStatus) {
        if let Some(subscription) = self.subscription.take() {
            pb.current.unsubscribe(subscription);
        }
        let packages: Vec<String> = self.changed.iter().cloned().collect();
        if let Err(e) = self
            .changeset
            .finish(pb.conn(), status, &packages, self.message.as_deref())
        {
            warn!("Failed to record changeset: {}", e);
        }
    }
}

fn known_version(status: &Status) -> Option<&str> {
    (status.state > State::Removed).then_some(status.version.as_str())
}
