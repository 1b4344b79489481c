// src/integration.rs

//! Operating system integration
//!
//! After files change, the host's derived artifacts are regenerated from
//! the installed package set: system variables, the sprite (icon) pool and
//! the boot options list. Boot options that appear for the first time are
//! returned as [`Registration`]s so the commit orchestrator can run the
//! matching host command for each.

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::filesystem;
use crate::packages::ComponentOption;
use crate::paths::PathResolver;
use crate::pkgbase::PackageBase;
use crate::status::State;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, info, warn};

/// A component newly flagged for boot-time handling
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Registration {
    pub option: ComponentOption,
    pub package: String,
    pub path: PathBuf,
}

impl Registration {
    fn to_line(&self) -> String {
        format!("{}\t{}\t{}", option_name(self.option), self.package, self.path.display())
    }
}

fn option_name(option: ComponentOption) -> &'static str {
    match option {
        ComponentOption::LookAt => "LookAt",
        ComponentOption::Run => "Run",
        ComponentOption::AddToApps => "AddToApps",
        ComponentOption::Movable => "Movable",
    }
}

/// Side effects the commit orchestrator performs on the host
pub trait SystemIntegration {
    fn update_sysvars(&mut self, pb: &PackageBase) -> Result<()>;

    fn update_sprites(&mut self, pb: &PackageBase) -> Result<()>;

    /// Rewrite the boot options list, returning entries not present before
    fn update_boot_options(&mut self, pb: &PackageBase) -> Result<Vec<Registration>>;

    /// Run the host command for one new registration
    fn register(&mut self, registration: &Registration) -> Result<()>;
}

/// Writes integration files into the state directory and runs the
/// configured host commands
pub struct HostIntegration {
    settings: Settings,
}

impl HostIntegration {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    fn installed(pb: &PackageBase) -> Vec<String> {
        pb.current
            .iter()
            .filter(|(_, status)| status.state == State::Installed)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl SystemIntegration for HostIntegration {
    fn update_sysvars(&mut self, pb: &PackageBase) -> Result<()> {
        let mut payload = String::new();
        for name in Self::installed(pb) {
            if let Some(control) = pb.control(&name)? {
                for (var, value) in control.sysvars() {
                    payload.push_str(&format!("{}={}\n", var, value));
                }
            }
        }
        filesystem::write_replace(&pb.layout().sysvars_path(), payload.as_bytes())?;
        debug!("Regenerated system variables");
        Ok(())
    }

    fn update_sprites(&mut self, pb: &PackageBase) -> Result<()> {
        let mut payload = String::new();
        for name in Self::installed(pb) {
            if let Some(control) = pb.control(&name)? {
                for sprite in control.sprites() {
                    let path = pb.paths.resolve(&sprite, &name)?;
                    payload.push_str(&format!("{}\n", path.display()));
                }
            }
        }
        filesystem::write_replace(&pb.layout().sprites_path(), payload.as_bytes())?;
        debug!("Regenerated sprite pool");
        Ok(())
    }

    fn update_boot_options(&mut self, pb: &PackageBase) -> Result<Vec<Registration>> {
        let path = pb.layout().boot_options_path();
        let before: BTreeSet<String> = filesystem::read_recovered(&path)?
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect();

        let mut entries = BTreeSet::new();
        for name in Self::installed(pb) {
            let Some(control) = pb.control(&name)? else {
                continue;
            };
            for component in control.components() {
                let resolved = pb.paths.resolve(&component.logical, &name)?;
                for option in &component.options {
                    if *option == ComponentOption::Movable {
                        continue;
                    }
                    entries.insert(Registration {
                        option: *option,
                        package: name.clone(),
                        path: resolved.clone(),
                    });
                }
            }
        }

        let payload: String = entries.iter().map(|r| r.to_line() + "\n").collect();
        filesystem::write_replace(&path, payload.as_bytes())?;

        let added: Vec<Registration> = entries
            .into_iter()
            .filter(|r| !before.contains(&r.to_line()))
            .collect();
        info!("Boot options updated; {} new registrations", added.len());
        Ok(added)
    }

    fn register(&mut self, registration: &Registration) -> Result<()> {
        let command = match registration.option {
            ComponentOption::LookAt => &self.settings.boot_command,
            ComponentOption::Run => &self.settings.run_command,
            ComponentOption::AddToApps => &self.settings.apps_command,
            ComponentOption::Movable => &None,
        };
        let Some(command) = command else {
            debug!(
                "No command configured for {} of {}",
                option_name(registration.option),
                registration.path.display()
            );
            return Ok(());
        };

        let mut words = command.split_whitespace();
        let Some(program) = words.next() else {
            return Ok(());
        };

        let status = Command::new(program)
            .args(words)
            .arg(&registration.path)
            .status()
            .map_err(|e| Error::IoError(format!("Failed to run {}: {}", program, e)))?;

        if !status.success() {
            warn!("{} {} exited with {}", program, registration.path.display(), status);
            return Err(Error::IoError(format!(
                "{} failed for {}: {}",
                program,
                registration.path.display(),
                status
            )));
        }
        Ok(())
    }
}
