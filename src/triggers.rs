// src/triggers.rs

//! Package lifecycle triggers
//!
//! A package may ship scripts under `Package/Triggers/<Point>`. The engines
//! never run scripts themselves: they hand a [`Trigger`] descriptor and the
//! script path to a [`TriggerRunner`] and poll the returned handle until it
//! reaches a terminal state.

use crate::error::{Error, Result};
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};

/// Lifecycle point a trigger is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerPoint {
    PreRemove,
    PostRemove,
    PreInstall,
    PostInstall,
    /// Undo of a pre-install trigger that already ran
    AbortPreInstall,
    /// Undo of a pre-remove trigger that already ran
    AbortPreRemove,
}

impl TriggerPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerPoint::PreRemove => "PreRemove",
            TriggerPoint::PostRemove => "PostRemove",
            TriggerPoint::PreInstall => "PreInstall",
            TriggerPoint::PostInstall => "PostInstall",
            TriggerPoint::AbortPreInstall => "AbortPreInstall",
            TriggerPoint::AbortPreRemove => "AbortPreRemove",
        }
    }

    /// Script that implements this point
    ///
    /// Abort points reuse the opposite script: undoing a pre-install runs
    /// the incoming package's post-remove script, undoing a pre-remove runs
    /// the outgoing package's post-install script.
    pub fn script_point(&self) -> TriggerPoint {
        match self {
            TriggerPoint::AbortPreInstall => TriggerPoint::PostRemove,
            TriggerPoint::AbortPreRemove => TriggerPoint::PostInstall,
            other => *other,
        }
    }

    /// Logical path of the script inside a package
    pub fn script_logical(&self) -> String {
        format!("Package/Triggers/{}", self.script_point().as_str())
    }
}

impl fmt::Display for TriggerPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a trigger script is told about the change it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub package: String,
    pub point: TriggerPoint,
    pub old_version: Option<String>,
    pub new_version: Option<String>,
    pub paths: Vec<PathBuf>,
}

impl Trigger {
    pub fn new(package: &str, point: TriggerPoint) -> Self {
        Self {
            package: package.to_string(),
            point,
            old_version: None,
            new_version: None,
            paths: Vec::new(),
        }
    }

    pub fn versions(mut self, old: Option<&str>, new: Option<&str>) -> Self {
        self.old_version = old.filter(|v| !v.is_empty()).map(str::to_string);
        self.new_version = new.filter(|v| !v.is_empty()).map(str::to_string);
        self
    }

    pub fn failed(&self, message: impl Into<String>) -> Error {
        Error::TriggerFailed {
            package: self.package.clone(),
            point: self.point.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerState {
    Running,
    Success,
    Error(String),
}

/// An in-flight trigger
pub trait TriggerHandle {
    /// Check progress without blocking
    fn poll(&mut self) -> TriggerState;

    /// Output captured so far
    fn output(&self) -> &str;
}

/// Starts trigger scripts
pub trait TriggerRunner {
    fn start(&mut self, script: &Path, trigger: &Trigger) -> Result<Box<dyn TriggerHandle>>;

    /// Delete state shared by the triggers of one session
    fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Runs trigger scripts with a shell
///
/// The descriptor is passed in `STEVEDORE_*` environment variables. Scripts
/// of one session share a scratch directory, removed by [`cleanup`].
///
/// [`cleanup`]: TriggerRunner::cleanup
pub struct CommandTriggerRunner {
    shell: String,
    scratch: PathBuf,
}

impl CommandTriggerRunner {
    pub fn new(shell: impl Into<String>, scratch: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            scratch: scratch.into(),
        }
    }
}

impl TriggerRunner for CommandTriggerRunner {
    fn start(&mut self, script: &Path, trigger: &Trigger) -> Result<Box<dyn TriggerHandle>> {
        info!(
            "Running {} trigger for {} ({})",
            trigger.point,
            trigger.package,
            script.display()
        );

        fs::create_dir_all(&self.scratch).map_err(|e| {
            Error::IoError(format!(
                "Failed to create trigger scratch directory {}: {}",
                self.scratch.display(),
                e
            ))
        })?;

        let capture = tempfile::tempfile()?;
        let paths = trigger
            .paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join("\n");

        let child = Command::new(&self.shell)
            .arg(script)
            .env("STEVEDORE_PACKAGE", &trigger.package)
            .env("STEVEDORE_TRIGGER", trigger.point.as_str())
            .env("STEVEDORE_OLD_VERSION", trigger.old_version.as_deref().unwrap_or(""))
            .env("STEVEDORE_NEW_VERSION", trigger.new_version.as_deref().unwrap_or(""))
            .env("STEVEDORE_PATHS", paths)
            .env("STEVEDORE_SCRATCH", &self.scratch)
            .stdin(Stdio::null())
            .stdout(Stdio::from(capture.try_clone()?))
            .stderr(Stdio::from(capture.try_clone()?))
            .spawn()
            .map_err(|e| trigger.failed(format!("Failed to start {}: {}", self.shell, e)))?;

        Ok(Box::new(CommandTrigger {
            child,
            capture,
            output: String::new(),
            finished: None,
        }))
    }

    fn cleanup(&mut self) -> Result<()> {
        match fs::remove_dir_all(&self.scratch) {
            Ok(()) => {
                debug!("Removed trigger scratch directory {}", self.scratch.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::IoError(format!(
                "Failed to remove {}: {}",
                self.scratch.display(),
                e
            ))),
        }
    }
}

struct CommandTrigger {
    child: Child,
    capture: File,
    output: String,
    finished: Option<TriggerState>,
}

impl CommandTrigger {
    fn collect_output(&mut self) {
        let mut output = String::new();
        let read = self
            .capture
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.capture.read_to_string(&mut output));
        match read {
            Ok(_) => self.output = output,
            Err(e) => warn!("Failed to read trigger output: {}", e),
        }
    }
}

impl TriggerHandle for CommandTrigger {
    fn poll(&mut self) -> TriggerState {
        if let Some(state) = &self.finished {
            return state.clone();
        }

        let state = match self.child.try_wait() {
            Ok(None) => return TriggerState::Running,
            Ok(Some(status)) if status.success() => TriggerState::Success,
            Ok(Some(status)) => TriggerState::Error(format!("script exited with {}", status)),
            Err(e) => TriggerState::Error(format!("failed to wait for script: {}", e)),
        };

        self.collect_output();
        self.finished = Some(state.clone());
        state
    }

    fn output(&self) -> &str {
        &self.output
    }
}
